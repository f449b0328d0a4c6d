//! Replication configuration.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    conflict::{ConflictHandler, ConflictListener, ResolutionStrategy},
    queue::{ErrorHandler, QueueModel},
    remote::ModelOperations,
    schema::ModelSchema,
    state::{ObjectState, VersionedState},
    Predicate,
};

/// Pushing queued local changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    pub enabled: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Polling the remote for changes since the last sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaConfig {
    pub enabled: bool,
    pub pull_interval_ms: u64,
    /// Maximum items per fetch.
    pub limit: usize,
}

impl DeltaConfig {
    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pull_interval_ms: 60_000,
            limit: 100,
        }
    }
}

/// Subscribing to remote change streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConfig {
    pub enabled: bool,
    /// Pause before re-subscribing after a stream ends.
    pub resubscribe_delay_ms: u64,
}

impl LiveConfig {
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resubscribe_delay_ms: 1_000,
        }
    }
}

/// Global replication settings, inherited by every model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConfig {
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
    #[serde(default)]
    pub live: LiveConfig,
}

impl ReplicationConfig {
    /// Load configuration from `FERRY_*` environment variables.
    ///
    /// Missing variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_bool(&lookup, "FERRY_PUSH_ENABLED")? {
            config.push.enabled = v;
        }
        if let Some(v) = parse_bool(&lookup, "FERRY_DELTA_ENABLED")? {
            config.delta.enabled = v;
        }
        if let Some(v) = parse_number(&lookup, "FERRY_DELTA_PULL_INTERVAL_MS")? {
            if v == 0 {
                return Err(ConfigError::ZeroInterval("FERRY_DELTA_PULL_INTERVAL_MS"));
            }
            config.delta.pull_interval_ms = v;
        }
        if let Some(v) = parse_number(&lookup, "FERRY_DELTA_LIMIT")? {
            config.delta.limit = v as usize;
        }
        if let Some(v) = parse_bool(&lookup, "FERRY_LIVE_ENABLED")? {
            config.live.enabled = v;
        }
        if let Some(v) = parse_number(&lookup, "FERRY_LIVE_RESUBSCRIBE_DELAY_MS")? {
            config.live.resubscribe_delay_ms = v;
        }

        Ok(config)
    }

    pub fn with_push(mut self, enabled: bool) -> Self {
        self.push.enabled = enabled;
        self
    }

    pub fn with_delta(mut self, delta: DeltaConfig) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_live(mut self, live: LiveConfig) -> Self {
        self.live = live;
        self
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidBool { var, value }),
        },
    }
}

fn parse_number(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a boolean, got '{value}'")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Per-model overrides on top of [`ReplicationConfig`].
#[derive(Clone, Default)]
pub struct ModelReplicationConfig {
    pub push_enabled: Option<bool>,
    pub delta: Option<DeltaConfig>,
    pub live: Option<LiveConfig>,
    /// Scope delta and live replication to matching records.
    pub filter: Option<Predicate>,
    pub operations: Option<ModelOperations>,
    pub object_state: Option<Arc<dyn ObjectState>>,
    pub strategy: Option<Arc<dyn ResolutionStrategy>>,
    pub conflict_listener: Option<Arc<dyn ConflictListener>>,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl std::fmt::Debug for ModelReplicationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelReplicationConfig")
            .field("push_enabled", &self.push_enabled)
            .field("delta", &self.delta)
            .field("live", &self.live)
            .field("filter", &self.filter)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

impl ModelReplicationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_push(mut self, enabled: bool) -> Self {
        self.push_enabled = Some(enabled);
        self
    }

    pub fn with_delta(mut self, delta: DeltaConfig) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn with_live(mut self, live: LiveConfig) -> Self {
        self.live = Some(live);
        self
    }

    pub fn with_filter(mut self, filter: Predicate) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_operations(mut self, operations: ModelOperations) -> Self {
        self.operations = Some(operations);
        self
    }

    pub fn with_object_state(mut self, state: Arc<dyn ObjectState>) -> Self {
        self.object_state = Some(state);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ResolutionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_conflict_listener(mut self, listener: Arc<dyn ConflictListener>) -> Self {
        self.conflict_listener = Some(listener);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn push_enabled(&self, global: &ReplicationConfig) -> bool {
        self.push_enabled.unwrap_or(global.push.enabled)
    }

    pub fn delta(&self, global: &ReplicationConfig) -> DeltaConfig {
        self.delta.unwrap_or(global.delta)
    }

    pub fn live(&self, global: &ReplicationConfig) -> LiveConfig {
        self.live.unwrap_or(global.live)
    }

    pub fn operations_for(&self, schema: &ModelSchema) -> ModelOperations {
        self.operations
            .clone()
            .unwrap_or_else(|| ModelOperations::for_schema(schema))
    }

    /// Object state of the model; versioned by default.
    pub fn object_state_for(&self, schema: &ModelSchema) -> Arc<dyn ObjectState> {
        self.object_state.clone().unwrap_or_else(|| {
            Arc::new(VersionedState::new(
                VersionedState::DEFAULT_VERSION_FIELD,
                schema.primary_key(),
            ))
        })
    }

    /// Queue registration for the model.
    pub fn queue_model(&self, schema: Arc<ModelSchema>) -> QueueModel {
        let mut conflicts = ConflictHandler::new(self.object_state_for(&schema));
        if let Some(strategy) = &self.strategy {
            conflicts = conflicts.with_strategy(Arc::clone(strategy));
        }
        if let Some(listener) = &self.conflict_listener {
            conflicts = conflicts.with_listener(Arc::clone(listener));
        }

        let mut model = QueueModel::new(Arc::clone(&schema))
            .with_operations(self.operations_for(&schema))
            .with_conflict_handler(conflicts);
        if let Some(handler) = &self.error_handler {
            model = model.with_error_handler(Arc::clone(handler));
        }
        model
    }
}
