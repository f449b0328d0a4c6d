//! Top-level wiring of storage, queue and replication.

use std::sync::Arc;

use crate::{
    error::Result,
    model::Model,
    network::NetworkStatus,
    predicate::FilterDialect,
    queue::{MutationQueue, OfflineStore},
    registry::ModelRegistry,
    remote::RemoteClient,
    replication::{ModelReplicationConfig, ReplicationConfig, ReplicationEngine, ReplicatorContext},
    schema::ModelSchema,
    storage::{LocalStorage, StorageAdapter},
};

/// An offline-first data store.
///
/// Create every model first, then call [`init`](Self::init) to create the
/// stores and replay the persisted queue, then
/// [`start_replication`](Self::start_replication).
///
/// ```no_run
/// use std::sync::Arc;
/// use ferry_engine::{
///     DataStore, FieldDef, FieldType, ManualNetworkStatus, MemoryAdapter,
///     MemoryOfflineStore, ModelSchema, RemoteClient, ReplicationConfig,
/// };
/// use serde_json::json;
///
/// # async fn run(remote: Arc<dyn RemoteClient>) -> ferry_engine::Result<()> {
/// let store = DataStore::new(
///     Arc::new(MemoryAdapter::new()),
///     Arc::new(MemoryOfflineStore::new()),
///     remote,
///     Arc::new(ManualNetworkStatus::new(true)),
///     ReplicationConfig::default(),
/// );
/// let notes = store
///     .create_model(
///         ModelSchema::builder("Note")
///             .field(FieldDef::primary("id"))
///             .field(FieldDef::required("title", FieldType::String))
///             .build()?,
///     )
///     .await?;
/// store.init().await?;
/// store.start_replication().await?;
///
/// let note = json!({"title": "groceries"}).as_object().cloned().unwrap_or_default();
/// notes.save(note).await?;
/// # Ok(())
/// # }
/// ```
pub struct DataStore {
    storage: Arc<LocalStorage>,
    queue: MutationQueue,
    replication: ReplicationEngine,
}

impl DataStore {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        offline: Arc<dyn OfflineStore>,
        remote: Arc<dyn RemoteClient>,
        network: Arc<dyn NetworkStatus>,
        config: ReplicationConfig,
    ) -> Self {
        Self::with_dialect(
            adapter,
            offline,
            remote,
            network,
            config,
            FilterDialect::graphql_crud(),
        )
    }

    /// Like [`new`](Self::new) for remotes with a restricted filter language.
    pub fn with_dialect(
        adapter: Arc<dyn StorageAdapter>,
        offline: Arc<dyn OfflineStore>,
        remote: Arc<dyn RemoteClient>,
        network: Arc<dyn NetworkStatus>,
        config: ReplicationConfig,
        dialect: FilterDialect,
    ) -> Self {
        let storage = Arc::new(LocalStorage::new(adapter, ModelRegistry::new_shared()));
        let queue = MutationQueue::new(
            Arc::clone(&storage),
            Arc::clone(&remote),
            Arc::clone(&offline),
        );
        let context = ReplicatorContext {
            storage: Arc::clone(&storage),
            remote,
            network,
            offline,
            dialect,
        };
        let replication = ReplicationEngine::new(context, queue.clone(), config);
        Self {
            storage,
            queue,
            replication,
        }
    }

    /// Create a model with the global replication settings.
    pub async fn create_model(&self, schema: ModelSchema) -> Result<Model> {
        self.create_model_with(schema, ModelReplicationConfig::default())
            .await
    }

    /// Create a model with per-model replication overrides.
    pub async fn create_model_with(
        &self,
        schema: ModelSchema,
        config: ModelReplicationConfig,
    ) -> Result<Model> {
        let schema = self.storage.add_store(schema).await?;
        self.replication
            .add_model(Arc::clone(&schema), &config)
            .await?;
        tracing::info!(store = %schema.store_name(), "model created");
        Ok(Model::new(
            Arc::clone(&schema),
            Arc::clone(&self.storage),
            self.queue.clone(),
            config.object_state_for(&schema),
        ))
    }

    /// Create the stores and restore the persisted queue.
    ///
    /// Returns the number of restored requests.
    pub async fn init(&self) -> Result<usize> {
        self.storage.create_stores().await?;
        self.queue.restore().await
    }

    pub async fn start_replication(&self) -> Result<()> {
        self.replication.start().await
    }

    pub async fn stop_replication(&self) {
        self.replication.stop().await
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn storage(&self) -> &Arc<LocalStorage> {
        &self.storage
    }

    pub fn replication(&self) -> &ReplicationEngine {
        &self.replication
    }
}
