//! Queued mutation requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{events::EventType, QueueEntryId, Record, StoreName};

/// Prefix of queue entry ids.
pub const QUEUE_ENTRY_PREFIX: &str = "queue:";

/// A pending outbound mutation.
///
/// The remote operation name is resolved when the request is created so a
/// later change to the model's operations does not alter queued requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub id: QueueEntryId,
    pub store_name: StoreName,
    pub event_type: EventType,
    pub operation: String,
    pub data: Record,
    /// Server-confirmed snapshot the edit was based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Record>,
    pub enqueued_at: DateTime<Utc>,
    /// Times the request was re-sent after a conflict resolution.
    #[serde(default)]
    pub conflict_attempts: u32,
}

impl MutationRequest {
    pub fn new(
        store_name: impl Into<StoreName>,
        event_type: EventType,
        operation: impl Into<String>,
        data: Record,
        base: Option<Record>,
    ) -> Self {
        Self {
            id: format!("{}{}", QUEUE_ENTRY_PREFIX, uuid::Uuid::new_v4()),
            store_name: store_name.into(),
            event_type,
            operation: operation.into(),
            data,
            base,
            enqueued_at: Utc::now(),
            conflict_attempts: 0,
        }
    }
}
