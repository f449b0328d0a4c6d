//! Delta replication: polling the remote for changes since a checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

use super::{apply_remote, wait_online, DeltaConfig, ReplicatorContext, TaskSlot};
use crate::{
    error::Result,
    network::NetworkStatus,
    queue::OfflineStore,
    record::into_record,
    remote::{ModelOperations, RemoteClient},
    schema::ModelSchema,
    storage::LocalStorage,
    Error, Predicate, StoreName,
};

/// Offline store key of a store's delta checkpoint.
pub fn checkpoint_key(store: &str) -> String {
    format!("delta:{}", store)
}

/// Periodic catch-up of one model.
///
/// While online a fetch runs every pull interval, plus once immediately on
/// start and on every reconnect. Going offline drops the timer. At most one
/// fetch is in flight; failed fetches are logged and the timer keeps going.
pub struct DeltaReplicator {
    inner: Arc<DeltaInner>,
    task: TaskSlot,
}

struct DeltaInner {
    schema: Arc<ModelSchema>,
    store: StoreName,
    storage: Arc<LocalStorage>,
    remote: Arc<dyn RemoteClient>,
    network: Arc<dyn NetworkStatus>,
    offline: Arc<dyn OfflineStore>,
    operation: String,
    filter: Value,
    config: DeltaConfig,
    in_flight: Mutex<()>,
    last_sync: Mutex<Option<Value>>,
    stopped: AtomicBool,
}

impl DeltaReplicator {
    /// Fails when the filter uses an operator the remote cannot express or
    /// the pull interval is zero.
    pub fn new(
        context: &ReplicatorContext,
        schema: Arc<ModelSchema>,
        operations: &ModelOperations,
        filter: Option<&Predicate>,
        config: DeltaConfig,
    ) -> Result<Self> {
        if config.pull_interval_ms == 0 {
            return Err(Error::InvalidConfig(format!(
                "delta pull interval of {} must be positive",
                schema.store_name()
            )));
        }
        let filter = match filter {
            Some(p) => p.to_remote_filter(&context.dialect)?,
            None => json!({}),
        };
        Ok(Self {
            inner: Arc::new(DeltaInner {
                store: schema.store_name(),
                schema,
                storage: Arc::clone(&context.storage),
                remote: Arc::clone(&context.remote),
                network: Arc::clone(&context.network),
                offline: Arc::clone(&context.offline),
                operation: operations.sync.clone(),
                filter,
                config,
                in_flight: Mutex::new(()),
                last_sync: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
            task: TaskSlot::default(),
        })
    }

    pub fn store_name(&self) -> &str {
        &self.inner.store
    }

    /// Current checkpoint, if any fetch completed.
    pub async fn last_sync(&self) -> Option<Value> {
        self.inner.last_sync.lock().await.clone()
    }

    /// Load the checkpoint and start polling. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.task.is_running().await {
            return Ok(());
        }
        self.inner.load_checkpoint().await?;
        self.inner.stopped.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let online = inner.network.subscribe();
        if self.task.start(move |shutdown| inner.run(online, shutdown)).await {
            tracing::info!(store = %self.inner.store, "delta replication started");
        }
        Ok(())
    }

    /// Stop polling. A fetch already in flight is discarded when it returns.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if self.task.stop().await {
            tracing::info!(store = %self.inner.store, "delta replication stopped");
        }
    }

    /// Fetch and apply one delta now.
    ///
    /// Returns the number of applied items; zero when another fetch is in
    /// flight.
    pub async fn perform(&self) -> Result<usize> {
        self.inner.perform().await
    }
}

impl DeltaInner {
    async fn run(self: Arc<Self>, mut online: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.pull_interval();

        'connected: loop {
            if !wait_online(&mut online, &mut shutdown).await {
                break;
            }
            self.perform_logged().await;

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.perform_logged().await,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break 'connected;
                        }
                        if !*online.borrow_and_update() {
                            tracing::debug!(store = %self.store, "offline, delta suspended");
                            continue 'connected;
                        }
                    }
                    _ = shutdown.changed() => break 'connected,
                }
            }
        }
        tracing::debug!(store = %self.store, "delta task exited");
    }

    async fn perform_logged(&self) {
        if let Err(err) = self.perform().await {
            tracing::warn!(store = %self.store, error = %err, "delta fetch failed");
        }
    }

    async fn perform(&self) -> Result<usize> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::trace!(store = %self.store, "delta fetch already in flight");
            return Ok(0);
        };

        let last_sync = self.last_sync.lock().await.clone().unwrap_or(Value::Null);
        let variables = json!({
            "lastSync": last_sync,
            "filter": self.filter,
            "limit": self.config.limit,
        });
        let payload = self
            .remote
            .query(&self.operation, variables)
            .await?
            .into_payload(&self.operation)?;
        let (items, next) = self.parse(payload)?;

        if self.stopped.load(Ordering::Acquire) {
            tracing::debug!(store = %self.store, "delta stopped, discarding fetched items");
            return Ok(0);
        }

        let applied = self.apply(&items).await?;
        if let Some(next) = next {
            self.offline
                .set_item(&checkpoint_key(&self.store), next.clone())
                .await?;
            *self.last_sync.lock().await = Some(next);
        }

        tracing::debug!(store = %self.store, applied, "delta applied");
        Ok(applied)
    }

    fn parse(&self, payload: Value) -> Result<(Vec<Value>, Option<Value>)> {
        let Value::Object(mut payload) = payload else {
            return Err(Error::Application(format!(
                "{} returned a malformed delta",
                self.operation
            )));
        };
        let items = match payload.remove("items") {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => Vec::new(),
            Some(_) => {
                return Err(Error::Application(format!(
                    "{} returned non-list items",
                    self.operation
                )))
            }
        };
        let next = payload.remove("lastSync").filter(|v| !v.is_null());
        Ok((items, next))
    }

    /// Apply every item in one transaction.
    async fn apply(&self, items: &[Value]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let tx = self.storage.create_transaction().await?;
        match self.apply_items(&tx, items).await {
            Ok(applied) => {
                tx.commit().await?;
                Ok(applied)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(store = %self.store, error = %rollback, "delta rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn apply_items(&self, tx: &LocalStorage, items: &[Value]) -> Result<usize> {
        let mut applied = 0;
        for item in items {
            let Some(record) = into_record(item.clone()) else {
                tracing::warn!(store = %self.store, "skipping non-object delta item");
                continue;
            };
            apply_remote(tx, &self.schema, &record, false).await?;
            applied += 1;
        }
        Ok(applied)
    }

    async fn load_checkpoint(&self) -> Result<()> {
        let stored = self.offline.get_item(&checkpoint_key(&self.store)).await?;
        if let Some(checkpoint) = &stored {
            tracing::debug!(store = %self.store, checkpoint = %checkpoint, "delta checkpoint loaded");
        }
        *self.last_sync.lock().await = stored;
        Ok(())
    }
}
