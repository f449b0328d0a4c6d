//! Queue observers and error policy.

use serde_json::Value;

use super::MutationRequest;
use crate::Error;

/// Notifications about queue activity. Every method defaults to a no-op.
pub trait QueueListener: Send + Sync {
    /// A new request was persisted.
    fn on_enqueued(&self, _request: &MutationRequest) {}

    /// A persisted request was restored on startup.
    fn on_requeued(&self, _request: &MutationRequest) {}

    /// The remote accepted a request.
    fn on_success(&self, _request: &MutationRequest, _result: &Value) {}

    /// A request was dropped after a terminal error.
    fn on_failure(&self, _request: &MutationRequest, _error: &Error) {}

    /// A drain emptied the queue.
    fn on_cleared(&self) {}
}

/// What to do with a request whose delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Keep the request and stop draining until the next trigger.
    Retry,
    /// Remove the request and report the error.
    Drop,
}

/// Per-model policy for failed deliveries.
pub trait ErrorHandler: Send + Sync {
    fn decide(&self, request: &MutationRequest, error: &Error) -> ErrorDecision;
}

impl<F> ErrorHandler for F
where
    F: Fn(&MutationRequest, &Error) -> ErrorDecision + Send + Sync,
{
    fn decide(&self, request: &MutationRequest, error: &Error) -> ErrorDecision {
        self(request, error)
    }
}

/// Transport failures retry, everything else is terminal.
pub fn default_decision(error: &Error) -> ErrorDecision {
    if error.is_network() {
        ErrorDecision::Retry
    } else {
        ErrorDecision::Drop
    }
}
