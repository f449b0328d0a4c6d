//! Conflict detection and resolution.
//!
//! When the remote rejects a mutation because the record moved on, the
//! handler diffs the client's attempt and the server's state against the
//! common base, lets a strategy merge them, and returns what to send again.
//!
//! # Algorithm
//!
//! 1. `client_diff`: base fields the client changed
//! 2. `server_diff`: base fields the server changed
//! 3. Conflicted if a field is in both diffs with different values
//! 4. Merge with the strategy (client wins by default)
//! 5. Force the merged version to the server's version
//! 6. Filter the result to the fields the client supplied
//! 7. Notify the listener
//!
//! State fields (version, primary key) never take part in a diff.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{state::ObjectState, Record};

/// What the strategy sees.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
    pub base: &'a Record,
    pub server: &'a Record,
    pub client: &'a Record,
    pub server_diff: &'a Record,
    pub client_diff: &'a Record,
    pub operation: &'a str,
}

/// Produces the merged record from a conflict.
pub trait ResolutionStrategy: Send + Sync {
    fn resolve(&self, ctx: &ResolutionContext<'_>) -> Record;
}

impl<F> ResolutionStrategy for F
where
    F: Fn(&ResolutionContext<'_>) -> Record + Send + Sync,
{
    fn resolve(&self, ctx: &ResolutionContext<'_>) -> Record {
        self(ctx)
    }
}

/// `{...base, ...server_diff, ...client_diff}`
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWins;

impl ResolutionStrategy for ClientWins {
    fn resolve(&self, ctx: &ResolutionContext<'_>) -> Record {
        overlay(ctx.base, &[ctx.server_diff, ctx.client_diff])
    }
}

/// `{...base, ...client_diff, ...server_diff}`
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerWins;

impl ResolutionStrategy for ServerWins {
    fn resolve(&self, ctx: &ResolutionContext<'_>) -> Record {
        overlay(ctx.base, &[ctx.client_diff, ctx.server_diff])
    }
}

fn overlay(base: &Record, layers: &[&Record]) -> Record {
    let mut out = base.clone();
    for layer in layers {
        for (key, value) in layer.iter() {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Observer of resolved conflicts and clean merges.
pub trait ConflictListener: Send + Sync {
    /// Both sides changed the same field.
    fn conflict_occurred(&self, operation: &str, resolved: &Record, server: &Record, client: &Record);

    /// Both sides changed the record but no field overlapped.
    fn merge_occurred(
        &self,
        _operation: &str,
        _resolved: &Record,
        _server: &Record,
        _client: &Record,
    ) {
    }
}

/// Input of one resolution.
#[derive(Debug, Clone, Copy)]
pub struct ConflictInput<'a> {
    /// Last server-confirmed snapshot before the client's edit.
    pub base: Option<&'a Record>,
    /// What the client tried to send.
    pub client: &'a Record,
    /// The server's current state.
    pub server: &'a Record,
    pub operation: &'a str,
    pub primary_key: &'a str,
}

/// Result of a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Full merged record, with the server's version.
    pub merged: Record,
    /// Merged record restricted to client fields plus key and version.
    pub filtered: Record,
    pub conflicted: bool,
    pub client_diff: Record,
    pub server_diff: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    /// No base snapshot; detection skipped.
    NoBase,
    Resolved(Resolution),
}

/// Three-way diff plus strategy.
#[derive(Clone)]
pub struct ConflictHandler {
    state: Arc<dyn ObjectState>,
    strategy: Arc<dyn ResolutionStrategy>,
    listener: Option<Arc<dyn ConflictListener>>,
}

impl std::fmt::Debug for ConflictHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictHandler")
            .field("state", &self.state)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl ConflictHandler {
    /// Handler with the client-wins strategy and no listener.
    pub fn new(state: Arc<dyn ObjectState>) -> Self {
        Self {
            state,
            strategy: Arc::new(ClientWins),
            listener: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ResolutionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ConflictListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn object_state(&self) -> &Arc<dyn ObjectState> {
        &self.state
    }

    /// Resolve a conflict. Pure apart from the listener call.
    pub fn resolve(&self, input: ConflictInput<'_>) -> ConflictOutcome {
        let Some(base) = input.base else {
            tracing::debug!(operation = %input.operation, "no conflict base, skipping resolution");
            return ConflictOutcome::NoBase;
        };

        let mut ignored = self.state.state_fields();
        ignored.push(input.primary_key.to_string());
        let changed = |side: &Record| -> Record {
            base.iter()
                .filter(|(key, _)| !ignored.contains(*key))
                .filter_map(|(key, value)| match side.get(key) {
                    Some(v) if v != value => Some((key.clone(), v.clone())),
                    _ => None,
                })
                .collect()
        };

        let client_diff = changed(input.client);
        let server_diff = changed(input.server);
        let conflicted = client_diff
            .iter()
            .any(|(key, value)| server_diff.get(key).map_or(false, |s| s != value));

        let mut merged = self.strategy.resolve(&ResolutionContext {
            base,
            server: input.server,
            client: input.client,
            server_diff: &server_diff,
            client_diff: &client_diff,
            operation: input.operation,
        });
        self.state.assign_server_state(&mut merged, input.server);

        if let Some(listener) = &self.listener {
            if conflicted {
                listener.conflict_occurred(input.operation, &merged, input.server, input.client);
            } else {
                listener.merge_occurred(input.operation, &merged, input.server, input.client);
            }
        }

        let version_fields = self.state.state_fields();
        let filtered = merged
            .iter()
            .filter(|(key, _)| {
                input.client.contains_key(*key)
                    || key.as_str() == input.primary_key
                    || version_fields.contains(*key)
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        tracing::debug!(
            operation = %input.operation,
            conflicted,
            client_fields = client_diff.len(),
            server_fields = server_diff.len(),
            "conflict resolved"
        );

        ConflictOutcome::Resolved(Resolution {
            merged,
            filtered,
            conflicted,
            client_diff,
            server_diff,
        })
    }
}
