//! Offline mutation queue.
//!
//! User writes are turned into [`MutationRequest`]s, persisted, and forwarded
//! to the remote in enqueue order once online.
//!
//! # Lifecycle of a request
//!
//! ```text
//! Enqueued -> Persisted -> Forwarding -> Completed   (removed)
//!                 ^             |
//!                 +---- retry --+------> Rejected    (removed, reported)
//! ```
//!
//! Only one drain runs at a time. A drain stops as soon as the queue goes
//! offline or a delivery fails with a retryable error, leaving the request at
//! the head so nothing is reordered.

mod id_swap;
mod listener;
mod persist;
mod request;

pub use id_swap::rewrite_ids;
pub use listener::{default_decision, ErrorDecision, ErrorHandler, QueueListener};
pub use persist::{entry_key, MemoryOfflineStore, OfflineStore, META_KEY};
pub use request::{MutationRequest, QUEUE_ENTRY_PREFIX};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::{
    conflict::{ConflictHandler, ConflictInput, ConflictOutcome},
    error::Result,
    events::{EventSource, EventType},
    record::{into_record, is_client_id, key_to_id},
    remote::{from_remote, to_remote, ModelOperations, RemoteClient},
    schema::ModelSchema,
    state::VersionedState,
    storage::LocalStorage,
    Error, QueueEntryId, Record, RecordId, StoreName,
};
use persist::QueueStore;

/// Conflict resolutions re-sent for one request before it is rejected.
pub const MAX_CONFLICT_RESENDS: u32 = 3;

/// Replication settings of one model as seen by the queue.
#[derive(Clone)]
pub struct QueueModel {
    pub schema: Arc<ModelSchema>,
    pub operations: ModelOperations,
    pub conflicts: ConflictHandler,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl QueueModel {
    /// GraphQLCRUD operations, versioned state and client-wins resolution.
    pub fn new(schema: Arc<ModelSchema>) -> Self {
        let state = VersionedState::new(VersionedState::DEFAULT_VERSION_FIELD, schema.primary_key());
        Self {
            operations: ModelOperations::for_schema(&schema),
            conflicts: ConflictHandler::new(Arc::new(state)),
            error_handler: None,
            schema,
        }
    }

    pub fn with_operations(mut self, operations: ModelOperations) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_conflict_handler(mut self, conflicts: ConflictHandler) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    fn operation_for(&self, event_type: EventType) -> Result<&str> {
        match event_type {
            EventType::Add => Ok(&self.operations.create),
            EventType::Update => Ok(&self.operations.update),
            EventType::Delete => Ok(&self.operations.delete),
            EventType::IdSwap => Err(Error::UnreplicableEvent(event_type)),
        }
    }

    fn decide(&self, request: &MutationRequest, error: &Error) -> ErrorDecision {
        match &self.error_handler {
            Some(handler) => handler.decide(request, error),
            None => default_decision(error),
        }
    }
}

/// Resolves with the remote's answer once the request leaves the queue.
#[derive(Debug)]
pub struct MutationTicket {
    id: QueueEntryId,
    receiver: oneshot::Receiver<Result<Value>>,
}

impl MutationTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Server payload on success, or the terminal error.
    pub async fn outcome(self) -> Result<Value> {
        self.receiver.await.map_err(|_| Error::QueueClosed)?
    }
}

/// How a drain step ended.
enum Step {
    Next,
    Halt,
}

struct Inner {
    storage: Arc<LocalStorage>,
    remote: Arc<dyn RemoteClient>,
    persist: QueueStore,
    models: DashMap<StoreName, QueueModel>,
    entries: Mutex<VecDeque<MutationRequest>>,
    tickets: DashMap<QueueEntryId, oneshot::Sender<Result<Value>>>,
    /// Client ids already confirmed by the remote, per store.
    confirmed: DashMap<(StoreName, RecordId), Value>,
    listeners: RwLock<Vec<Arc<dyn QueueListener>>>,
    processing: AtomicBool,
    online: AtomicBool,
    enabled: AtomicBool,
}

/// Durable FIFO of outbound mutations.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("online", &self.is_online())
            .field("enabled", &self.is_enabled())
            .field("models", &self.inner.models.len())
            .finish()
    }
}

impl MutationQueue {
    /// Create an offline, enabled queue.
    pub fn new(
        storage: Arc<LocalStorage>,
        remote: Arc<dyn RemoteClient>,
        offline: Arc<dyn OfflineStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                remote,
                persist: QueueStore::new(offline),
                models: DashMap::new(),
                entries: Mutex::new(VecDeque::new()),
                tickets: DashMap::new(),
                confirmed: DashMap::new(),
                listeners: RwLock::new(Vec::new()),
                processing: AtomicBool::new(false),
                online: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn register_model(&self, model: QueueModel) {
        let store = model.schema.store_name();
        tracing::debug!(store = %store, "model registered for push replication");
        self.inner.models.insert(store, model);
    }

    pub fn is_registered(&self, store: &str) -> bool {
        self.inner.models.contains_key(store)
    }

    pub async fn register_event_listener(&self, listener: Arc<dyn QueueListener>) {
        self.inner.listeners.write().await.push(listener);
    }

    pub(crate) fn offline_store(&self) -> &Arc<dyn OfflineStore> {
        self.inner.persist.offline_store()
    }

    /// Rebuild the in-memory queue from durable storage.
    ///
    /// Returns the number of restored requests.
    pub async fn restore(&self) -> Result<usize> {
        let restored = self.inner.persist.load().await?;
        let count = restored.len();
        {
            let mut entries = self.inner.entries.lock().await;
            entries.clear();
            entries.extend(restored.iter().cloned());
        }
        for request in &restored {
            self.notify(|l| l.on_requeued(request)).await;
        }
        tracing::info!(entries = count, "mutation queue restored");
        self.trigger();
        Ok(count)
    }

    /// Alias of [`restore`](Self::restore).
    pub async fn init(&self) -> Result<usize> {
        self.restore().await
    }

    /// Persist a request for the store and kick the drain.
    pub async fn enqueue(
        &self,
        store: &str,
        event_type: EventType,
        data: Record,
        base: Option<Record>,
    ) -> Result<MutationTicket> {
        let (operation, pk) = {
            let model = self
                .inner
                .models
                .get(store)
                .ok_or_else(|| Error::ModelNotRegistered(store.to_string()))?;
            (
                model.operation_for(event_type)?.to_string(),
                model.schema.primary_key().to_string(),
            )
        };
        let mut request = MutationRequest::new(store, event_type, operation, data, base);

        let (sender, receiver) = oneshot::channel();
        {
            let mut entries = self.inner.entries.lock().await;
            // The record may have been read under its client id before the
            // remote confirmed it.
            let confirmed = request
                .data
                .get(&pk)
                .filter(|k| is_client_id(k))
                .and_then(key_to_id)
                .and_then(|client_id| {
                    let key = (store.to_string(), client_id);
                    self.inner
                        .confirmed
                        .get(&key)
                        .map(|server_key| (key.1, server_key.value().clone()))
                });
            if let Some((client_id, server_key)) = confirmed {
                rewrite_ids(
                    std::iter::once(&mut request),
                    self.inner.storage.models(),
                    &client_id,
                    &server_key,
                );
            }
            let mut ids: Vec<_> = entries.iter().map(|e| e.id.clone()).collect();
            ids.push(request.id.clone());
            self.inner.persist.append(&request, &ids).await?;
            entries.push_back(request.clone());
        }
        self.inner.tickets.insert(request.id.clone(), sender);

        tracing::debug!(
            entry = %request.id,
            store = %store,
            event_type = ?event_type,
            "mutation enqueued"
        );
        self.notify(|l| l.on_enqueued(&request)).await;
        self.trigger();

        Ok(MutationTicket {
            id: request.id,
            receiver,
        })
    }

    /// Snapshot of queued requests in order.
    pub async fn pending(&self) -> Vec<MutationRequest> {
        self.inner.entries.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.lock().await.is_empty()
    }

    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::AcqRel);
        if was != online {
            tracing::info!(online, "mutation queue connectivity changed");
        }
        if online {
            self.trigger();
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Toggle forwarding. Disabled queues still persist new requests.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
        if enabled {
            self.trigger();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    fn can_forward(&self) -> bool {
        self.is_online() && self.is_enabled()
    }

    /// Run a drain in the background.
    fn trigger(&self) {
        if !self.can_forward() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                handle.spawn(async move { queue.process().await });
            }
            Err(_) => tracing::warn!("no async runtime, queue drain deferred"),
        }
    }

    /// Drain the queue until it is empty, offline, or a delivery must be retried.
    ///
    /// Returns immediately when another drain is running.
    pub async fn process(&self) {
        loop {
            if !self.can_forward() {
                tracing::trace!("queue offline or disabled, not draining");
                return;
            }
            if self
                .inner
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                tracing::trace!("queue drain already running");
                return;
            }

            let halted = self.drain().await;
            self.inner.processing.store(false, Ordering::Release);

            // A request enqueued while the flag was still set found the drain
            // busy and returned; pick it up here.
            if halted || !self.can_forward() || self.is_empty().await {
                return;
            }
        }
    }

    /// Returns true when the drain halted on a retryable failure.
    async fn drain(&self) -> bool {
        let mut forwarded = 0usize;
        loop {
            if !self.can_forward() {
                tracing::debug!("queue went offline, halting drain");
                return false;
            }
            let head = self.inner.entries.lock().await.front().cloned();
            let Some(head) = head else {
                if forwarded > 0 {
                    tracing::debug!(forwarded, "mutation queue cleared");
                    self.notify(|l| l.on_cleared()).await;
                }
                return false;
            };

            match self.forward(head).await {
                Step::Next => forwarded += 1,
                Step::Halt => return true,
            }
        }
    }

    async fn forward(&self, request: MutationRequest) -> Step {
        let model = self
            .inner
            .models
            .get(&request.store_name)
            .map(|m| m.value().clone());
        let model = match model {
            Some(model) => model,
            None => {
                let err = Error::ModelNotRegistered(request.store_name.clone());
                return self.reject(&request, err).await;
            }
        };

        tracing::debug!(
            entry = %request.id,
            store = %request.store_name,
            operation = %request.operation,
            "forwarding mutation"
        );

        let variables = json!({ "input": to_remote(&model.schema, &request.data) });
        let response = match self
            .inner
            .remote
            .mutate(&request.operation, variables)
            .await
        {
            Ok(response) => response,
            Err(err) => return self.fail(&model, &request, err).await,
        };

        if let Some(server) = response.conflict_state() {
            let server = from_remote(&model.schema, server);
            return self.resolve_conflict(&model, request, server).await;
        }

        let payload = match response.into_payload(&request.operation) {
            Ok(payload) => payload,
            Err(err) => return self.fail(&model, &request, err).await,
        };

        // Still queued when this fails, so the delivery is retried.
        if let Err(err) = self.dequeue(&request.id).await {
            tracing::error!(entry = %request.id, error = %err, "failed to dequeue completed mutation");
            return Step::Halt;
        }

        match self.complete(&model, &request, &payload).await {
            Ok(()) => {
                tracing::debug!(entry = %request.id, store = %request.store_name, "mutation completed");
                self.notify(|l| l.on_success(&request, &payload)).await;
                self.settle(&request.id, Ok(payload));
            }
            Err(err) => {
                tracing::error!(
                    entry = %request.id,
                    error = %err,
                    "mutation delivered but the local write-back failed"
                );
                self.notify(|l| l.on_failure(&request, &err)).await;
                self.settle(&request.id, Err(err));
            }
        }
        Step::Next
    }

    /// Write the server's answer back to local storage.
    async fn complete(
        &self,
        model: &QueueModel,
        request: &MutationRequest,
        payload: &Value,
    ) -> Result<()> {
        let pk = model.schema.primary_key();
        let Some(server) = into_record(payload.clone()).map(|r| from_remote(&model.schema, &r))
        else {
            return Ok(());
        };

        match request.event_type {
            EventType::Add => {
                let client_id = request
                    .data
                    .get(pk)
                    .filter(|k| is_client_id(k))
                    .and_then(key_to_id);
                let swap = match (client_id, server.get(pk)) {
                    (Some(client_id), Some(server_key))
                        if server_key.as_str() != Some(client_id.as_str()) =>
                    {
                        Some((client_id, server_key.clone()))
                    }
                    _ => None,
                };
                match swap {
                    Some((client_id, server_key)) => {
                        self.reconcile_id(model, &client_id, server_key, &server)
                            .await
                    }
                    None => self.write_back(model, server).await,
                }
            }
            EventType::Update => self.write_back(model, server).await,
            EventType::Delete | EventType::IdSwap => Ok(()),
        }
    }

    /// Apply a server record to the local record with the same key.
    ///
    /// Records deleted locally stay deleted. When later requests for the same
    /// record are still queued only the state fields are taken, so newer
    /// local edits are not reverted.
    async fn write_back(&self, model: &QueueModel, server: Record) -> Result<()> {
        let schema = &model.schema;
        let predicate = schema.primary_key_predicate(&server)?;
        let superseded = {
            let entries = self.inner.entries.lock().await;
            entries.iter().any(|e| {
                e.store_name == schema.store_name()
                    && e.data.get(schema.primary_key()) == server.get(schema.primary_key())
            })
        };

        let input: Record = if superseded {
            let state = model.conflicts.object_state();
            let mut fields = state.state_fields();
            fields.push(schema.primary_key().to_string());
            server
                .into_iter()
                .filter(|(field, _)| fields.contains(field))
                .collect()
        } else {
            server
        };

        self.inner
            .storage
            .update(&schema.store_name(), input, Some(&predicate), EventSource::Replication)
            .await?;
        Ok(())
    }

    /// Swap a confirmed client id everywhere: queued requests and local storage.
    ///
    /// Holds the queue lock throughout so no request is enqueued against the
    /// client id in between.
    async fn reconcile_id(
        &self,
        model: &QueueModel,
        client_id: &str,
        server_key: Value,
        server: &Record,
    ) -> Result<()> {
        let store = model.schema.store_name();
        let mut entries = self.inner.entries.lock().await;
        let rewritten = rewrite_ids(
            entries.iter_mut(),
            self.inner.storage.models(),
            client_id,
            &server_key,
        );
        for request in entries.iter().filter(|e| rewritten.contains(&e.id)) {
            self.inner.persist.put(request).await?;
        }
        self.inner
            .confirmed
            .insert((store.clone(), client_id.to_string()), server_key);
        tracing::debug!(
            store = %store,
            client_id = %client_id,
            rewritten = rewritten.len(),
            "client id reconciled in queue"
        );

        let carried = model.conflicts.object_state().state_fields();
        self.inner
            .storage
            .swap_id(&store, client_id, server, &carried)
            .await?;
        Ok(())
    }

    async fn resolve_conflict(
        &self,
        model: &QueueModel,
        mut request: MutationRequest,
        server: Record,
    ) -> Step {
        let conflict_error = || Error::Conflict {
            id: key_to_id(request.data.get(model.schema.primary_key()).unwrap_or(&Value::Null))
                .unwrap_or_default(),
            attempted: model.conflicts.object_state().current(&request.data),
            current: model.conflicts.object_state().current(&server),
        };

        if request.conflict_attempts >= MAX_CONFLICT_RESENDS {
            tracing::warn!(entry = %request.id, "conflict persisted after re-sends, rejecting");
            let err = conflict_error();
            return self.fail(model, &request, err).await;
        }

        let outcome = model.conflicts.resolve(ConflictInput {
            base: request.base.as_ref(),
            client: &request.data,
            server: &server,
            operation: &request.operation,
            primary_key: model.schema.primary_key(),
        });

        let resolution = match outcome {
            ConflictOutcome::Resolved(resolution) => resolution,
            ConflictOutcome::NoBase => {
                let err = Error::Application(format!(
                    "{} rejected by the remote and no base is available to resolve it",
                    request.operation
                ));
                return self.fail(model, &request, err).await;
            }
        };

        request.data = resolution.filtered;
        request.base = Some(server);
        request.conflict_attempts += 1;

        if let Err(err) = self.replace_head(&request).await {
            tracing::error!(entry = %request.id, error = %err, "failed to persist conflict resolution");
            return Step::Halt;
        }
        // Update only: a record deleted locally in the meantime stays deleted.
        let stored = match model.schema.primary_key_predicate(&resolution.merged) {
            Ok(predicate) => self
                .inner
                .storage
                .update(
                    &request.store_name,
                    resolution.merged,
                    Some(&predicate),
                    EventSource::Replication,
                )
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = stored {
            tracing::error!(entry = %request.id, error = %err, "failed to store merged record");
            return Step::Halt;
        }

        tracing::info!(
            entry = %request.id,
            conflicted = resolution.conflicted,
            "conflict resolved, re-sending"
        );
        Step::Next
    }

    async fn fail(&self, model: &QueueModel, request: &MutationRequest, err: Error) -> Step {
        match model.decide(request, &err) {
            ErrorDecision::Retry => {
                tracing::warn!(
                    entry = %request.id,
                    store = %request.store_name,
                    error = %err,
                    "mutation failed, will retry"
                );
                Step::Halt
            }
            ErrorDecision::Drop => self.reject(request, err).await,
        }
    }

    async fn reject(&self, request: &MutationRequest, err: Error) -> Step {
        tracing::warn!(
            entry = %request.id,
            store = %request.store_name,
            error = %err,
            "mutation rejected"
        );
        if let Err(persist_err) = self.dequeue(&request.id).await {
            tracing::error!(entry = %request.id, error = %persist_err, "failed to dequeue rejected mutation");
            return Step::Halt;
        }
        self.notify(|l| l.on_failure(request, &err)).await;
        self.settle(&request.id, Err(err));
        Step::Next
    }

    async fn dequeue(&self, id: &str) -> Result<()> {
        let mut entries = self.inner.entries.lock().await;
        let ids: Vec<_> = entries
            .iter()
            .filter(|e| e.id != id)
            .map(|e| e.id.clone())
            .collect();
        self.inner.persist.remove(id, &ids).await?;
        entries.retain(|e| e.id != id);
        Ok(())
    }

    async fn replace_head(&self, request: &MutationRequest) -> Result<()> {
        let mut entries = self.inner.entries.lock().await;
        self.inner.persist.put(request).await?;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == request.id) {
            *entry = request.clone();
        }
        Ok(())
    }

    fn settle(&self, id: &str, outcome: Result<Value>) {
        if let Some((_, sender)) = self.inner.tickets.remove(id) {
            let _ = sender.send(outcome);
        }
    }

    async fn notify(&self, f: impl Fn(&dyn QueueListener)) {
        for listener in self.inner.listeners.read().await.iter() {
            f(listener.as_ref());
        }
    }
}
