//! Replication between local storage and the remote.
//!
//! Three sub-engines share one [`NetworkStatus`] signal:
//!
//! - [`PushReplicator`] forwards the mutation queue while online.
//! - [`DeltaReplicator`] polls for remote changes since the last checkpoint.
//! - [`LiveReplicator`] applies changes pushed over remote subscriptions.
//!
//! Each runs as one background task with its own shutdown channel. Stopping
//! is idempotent and drops timers and subscriptions at the task's next
//! suspension point.

mod config;
mod delta;
mod live;
mod push;

pub use config::{
    ConfigError, DeltaConfig, LiveConfig, ModelReplicationConfig, PushConfig, ReplicationConfig,
};
pub use delta::{checkpoint_key, DeltaReplicator};
pub use live::LiveReplicator;
pub use push::PushReplicator;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::{
    error::Result,
    events::EventSource,
    network::NetworkStatus,
    predicate::FilterDialect,
    queue::{MutationQueue, OfflineStore},
    record::is_deleted,
    remote::{from_remote, RemoteClient},
    schema::ModelSchema,
    storage::LocalStorage,
    Record,
};

/// Collaborators shared by the delta and live replicators.
#[derive(Clone)]
pub struct ReplicatorContext {
    pub storage: Arc<LocalStorage>,
    pub remote: Arc<dyn RemoteClient>,
    pub network: Arc<dyn NetworkStatus>,
    pub offline: Arc<dyn OfflineStore>,
    /// Operators the remote accepts in delta and live filters.
    pub dialect: FilterDialect,
}

/// Push, delta and live replication for every registered model.
pub struct ReplicationEngine {
    context: ReplicatorContext,
    config: ReplicationConfig,
    push: PushReplicator,
    delta: RwLock<Vec<DeltaReplicator>>,
    live: RwLock<Vec<LiveReplicator>>,
    running: AtomicBool,
}

impl ReplicationEngine {
    pub fn new(context: ReplicatorContext, queue: MutationQueue, config: ReplicationConfig) -> Self {
        let push = PushReplicator::new(queue, Arc::clone(&context.network));
        Self {
            context,
            config,
            push,
            delta: RwLock::new(Vec::new()),
            live: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn queue(&self) -> &MutationQueue {
        self.push.queue()
    }

    /// Set up replication of one model.
    ///
    /// Models added while the engine runs start replicating immediately.
    pub async fn add_model(
        &self,
        schema: Arc<ModelSchema>,
        model: &ModelReplicationConfig,
    ) -> Result<()> {
        let store = schema.store_name();
        let operations = model.operations_for(&schema);

        if model.push_enabled(&self.config) {
            self.queue().register_model(model.queue_model(Arc::clone(&schema)));
        }

        let delta = model.delta(&self.config);
        if delta.enabled {
            let replicator = DeltaReplicator::new(
                &self.context,
                Arc::clone(&schema),
                &operations,
                model.filter.as_ref(),
                delta,
            )?;
            if self.is_running() {
                replicator.start().await?;
            }
            self.delta.write().await.push(replicator);
        }

        let live = model.live(&self.config);
        if live.enabled {
            let replicator = LiveReplicator::new(
                &self.context,
                Arc::clone(&schema),
                &operations,
                model.filter.as_ref(),
                live,
            )?;
            if self.is_running() {
                replicator.start().await;
            }
            self.live.write().await.push(replicator);
        }

        tracing::debug!(
            store = %store,
            push = model.push_enabled(&self.config),
            delta = delta.enabled,
            live = live.enabled,
            "model added to replication"
        );
        Ok(())
    }

    /// Start every sub-engine. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.push.start().await;
        for replicator in self.delta.read().await.iter() {
            replicator.start().await?;
        }
        for replicator in self.live.read().await.iter() {
            replicator.start().await;
        }
        tracing::info!("replication started");
        Ok(())
    }

    /// Stop every sub-engine. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.push.stop().await;
        for replicator in self.delta.read().await.iter() {
            replicator.stop().await;
        }
        for replicator in self.live.read().await.iter() {
            replicator.stop().await;
        }
        tracing::info!("replication stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one delta fetch for the store now.
    ///
    /// Returns the number of applied items; zero when the store has no delta
    /// replicator.
    pub async fn sync(&self, store: &str) -> Result<usize> {
        for replicator in self.delta.read().await.iter() {
            if replicator.store_name() == store {
                return replicator.perform().await;
            }
        }
        Ok(0)
    }
}

/// Slot holding at most one background task and its shutdown channel.
#[derive(Default)]
pub(crate) struct TaskSlot {
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskSlot {
    /// Spawn `task` unless one is already running. Returns whether it spawned.
    pub(crate) async fn start<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }
        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(task(receiver));
        *running = Some(Running { shutdown, handle });
        true
    }

    /// Signal shutdown. Returns whether a task was running.
    pub(crate) async fn stop(&self) -> bool {
        match self.running.lock().await.take() {
            Some(running) => {
                let _ = running.shutdown.send(true);
                true
            }
            None => false,
        }
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

/// Wait until the network is online. Returns `false` on shutdown.
pub(crate) async fn wait_online(
    online: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *online.borrow_and_update() {
            return true;
        }
        tokio::select! {
            changed = online.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = shutdown.changed() => return false,
        }
    }
}

/// Sleep for `delay`. Returns `false` on shutdown.
pub(crate) async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// Apply one remote record locally: remove it when `deleted`, upsert otherwise.
pub(crate) async fn apply_remote(
    storage: &LocalStorage,
    schema: &ModelSchema,
    remote: &Record,
    deleted: bool,
) -> Result<()> {
    let store = schema.store_name();
    let record = from_remote(schema, remote);
    if deleted || is_deleted(&record) {
        let predicate = schema.primary_key_predicate(&record)?;
        storage
            .remove(&store, Some(&predicate), EventSource::Replication)
            .await?;
    } else {
        storage
            .save_or_update(&store, record, EventSource::Replication)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventType};
    use crate::record::into_record;
    use crate::registry::ModelRegistry;
    use crate::schema::{FieldDef, FieldType};
    use crate::storage::MemoryAdapter;
    use serde_json::json;

    async fn storage() -> (LocalStorage, Arc<ModelSchema>) {
        let storage = LocalStorage::new(
            Arc::new(MemoryAdapter::new()),
            ModelRegistry::new_shared(),
        );
        let schema = storage
            .add_store(
                ModelSchema::builder("Note")
                    .field(FieldDef::primary("id").remote_key("noteId"))
                    .field(FieldDef::optional("title", FieldType::String))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        storage.create_stores().await.unwrap();
        (storage, schema)
    }

    #[tokio::test]
    async fn apply_remote_upserts_and_removes() {
        let (storage, schema) = storage().await;
        let mut events = storage.events().subscribe(EventFilter::all());
        let item = |v| into_record(v).unwrap();

        apply_remote(&storage, &schema, &item(json!({"noteId": "1", "title": "a"})), false)
            .await
            .unwrap();
        apply_remote(&storage, &schema, &item(json!({"noteId": "1", "title": "b"})), false)
            .await
            .unwrap();
        let stored = storage.query_by_id("user_Note", "1").await.unwrap().unwrap();
        assert_eq!(stored["title"], "b");

        apply_remote(&storage, &schema, &item(json!({"noteId": "1", "_deleted": true})), false)
            .await
            .unwrap();
        assert!(storage.query("user_Note", None).await.unwrap().is_empty());

        let kinds: Vec<_> = events
            .drain()
            .into_iter()
            .map(|e| {
                assert_eq!(e.event_source, EventSource::Replication);
                e.event_type
            })
            .collect();
        assert_eq!(kinds, vec![EventType::Add, EventType::Update, EventType::Delete]);
    }

    #[tokio::test]
    async fn task_slot_runs_one_task() {
        let slot = TaskSlot::default();
        let started = slot
            .start(|mut shutdown| async move {
                let _ = shutdown.changed().await;
            })
            .await;
        assert!(started);
        assert!(!slot.start(|_| async {}).await);
        assert!(slot.is_running().await);

        assert!(slot.stop().await);
        assert!(!slot.stop().await);
        assert!(!slot.is_running().await);
    }
}
