//! Local storage: schema-checked CRUD over a [`StorageAdapter`] with change events.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::StorageAdapter;
use crate::{
    error::Result,
    events::{ChangeEventStream, EventSource, EventType, StoreChangeEvent},
    record::{generate_client_id, key_to_id},
    registry::ModelRegistry,
    schema::ModelSchema,
    Error, Predicate, Record,
};

/// CRUD front door for every store.
///
/// Writes are validated against the registered schema when they come from the
/// application (`EventSource::User`). Writes coming from the remote
/// (`EventSource::Replication`) are projected onto the declared fields
/// instead, so server-side extras such as `_deleted` never reach the store.
///
/// A handle from [`create_transaction`](Self::create_transaction) buffers its
/// events and publishes them in order on [`commit`](Self::commit).
pub struct LocalStorage {
    adapter: Arc<dyn StorageAdapter>,
    models: Arc<ModelRegistry>,
    events: ChangeEventStream,
    /// Present only on transaction handles.
    buffered: Option<Mutex<Vec<StoreChangeEvent>>>,
}

impl std::fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorage")
            .field("models", &self.models.store_names())
            .field("transaction", &self.is_transaction())
            .finish()
    }
}

impl LocalStorage {
    pub fn new(adapter: Arc<dyn StorageAdapter>, models: Arc<ModelRegistry>) -> Self {
        Self {
            adapter,
            models,
            events: ChangeEventStream::new(),
            buffered: None,
        }
    }

    /// The stream every committed change is published on.
    pub fn events(&self) -> &ChangeEventStream {
        &self.events
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub fn schema(&self, store: &str) -> Result<Arc<ModelSchema>> {
        self.models.require(store)
    }

    /// Register a model and declare its store on the adapter.
    pub async fn add_store(&self, schema: ModelSchema) -> Result<Arc<ModelSchema>> {
        let schema = self.models.register(schema)?;
        self.adapter.add_store(&schema).await?;
        Ok(schema)
    }

    pub async fn create_stores(&self) -> Result<()> {
        self.adapter.create_stores().await
    }

    /// Insert a record, assigning a client id when the primary key is absent.
    pub async fn save(&self, store: &str, record: Record, source: EventSource) -> Result<Record> {
        let schema = self.schema(store)?;
        let mut record = record;
        let pk = schema.primary_key();
        if record.get(pk).map_or(true, Value::is_null) {
            record.insert(pk.to_string(), Value::String(generate_client_id()));
        }
        let record = self.prepare(&schema, record, source, false)?;

        let saved = self.adapter.save(store, record).await?;
        self.emit(EventType::Add, store, json!([saved.clone()]), source)
            .await;
        Ok(saved)
    }

    pub async fn query(&self, store: &str, predicate: Option<&Predicate>) -> Result<Vec<Record>> {
        if let Some(p) = predicate {
            p.validate()?;
        }
        self.adapter.query(store, predicate).await
    }

    pub async fn query_by_id(&self, store: &str, id: &str) -> Result<Option<Record>> {
        let schema = self.schema(store)?;
        let predicate = Predicate::field(schema.primary_key()).eq(id);
        let mut found = self.adapter.query(store, Some(&predicate)).await?;
        Ok(found.pop())
    }

    /// Merge `input` into matching records (all records without a predicate).
    ///
    /// No event is published when nothing matched.
    pub async fn update(
        &self,
        store: &str,
        input: Record,
        predicate: Option<&Predicate>,
        source: EventSource,
    ) -> Result<Vec<Record>> {
        let schema = self.schema(store)?;
        let input = self.prepare(&schema, input, source, true)?;
        if let Some(p) = predicate {
            p.validate()?;
        }

        let updated = self.adapter.update(store, &input, predicate).await?;
        if !updated.is_empty() {
            self.emit(EventType::Update, store, json!(updated), source)
                .await;
        }
        Ok(updated)
    }

    /// Delete matching records (all records without a predicate).
    ///
    /// No event is published when nothing matched.
    pub async fn remove(
        &self,
        store: &str,
        predicate: Option<&Predicate>,
        source: EventSource,
    ) -> Result<Vec<Record>> {
        if let Some(p) = predicate {
            p.validate()?;
        }
        let removed = self.adapter.remove(store, predicate).await?;
        if !removed.is_empty() {
            self.emit(EventType::Delete, store, json!(removed), source)
                .await;
        }
        Ok(removed)
    }

    /// Update the record with the same primary key, or save it when absent.
    pub async fn save_or_update(
        &self,
        store: &str,
        record: Record,
        source: EventSource,
    ) -> Result<Record> {
        let schema = self.schema(store)?;
        let predicate = schema.primary_key_predicate(&record)?;
        let mut updated = self
            .update(store, record.clone(), Some(&predicate), source)
            .await?;
        match updated.pop() {
            Some(existing) => Ok(existing),
            None => self.save(store, record, source).await,
        }
    }

    /// Re-key the record stored under `previous` to the server's primary key.
    ///
    /// The local record keeps its own fields. Only the server's primary key
    /// and the `carried` state fields are taken from `server`, plus any field
    /// the local record does not have. Runs in one adapter transaction and
    /// publishes a single `ID_SWAP` event with `{previous, current}`.
    ///
    /// Returns `None` without writing when no record is stored under
    /// `previous` (it was deleted locally). When the server key already
    /// exists locally (it arrived through delta or live first) the stale
    /// record is removed, a `DELETE` is published and `None` is returned.
    pub async fn swap_id(
        &self,
        store: &str,
        previous: &str,
        server: &Record,
        carried: &[String],
    ) -> Result<Option<Record>> {
        let schema = self.schema(store)?;

        let owned_tx = if self.is_transaction() {
            None
        } else {
            Some(self.create_transaction().await?)
        };
        let target = owned_tx.as_ref().unwrap_or(self);

        let result = target
            .replace_record(&schema, previous, server, carried)
            .await;

        if let Some(tx) = owned_tx {
            match result {
                Ok(_) => tx.commit().await?,
                Err(_) => tx.rollback().await?,
            }
        }
        result
    }

    async fn replace_record(
        &self,
        schema: &ModelSchema,
        previous: &str,
        server: &Record,
        carried: &[String],
    ) -> Result<Option<Record>> {
        let store = schema.store_name();
        let pk = schema.primary_key();
        let stale = Predicate::field(pk).eq(previous);

        let removed = self.adapter.remove(&store, Some(&stale)).await?;
        let Some(local) = removed.first() else {
            tracing::debug!(
                store = %store,
                previous = %previous,
                "client record no longer stored, nothing to swap"
            );
            return Ok(None);
        };

        let mut current = schema.project(server);
        for (field, value) in local {
            if field != pk && !carried.contains(field) {
                current.insert(field.clone(), value.clone());
            }
        }

        match self.adapter.save(&store, current).await {
            Ok(saved) => {
                let data = json!({
                    "previous": local.clone(),
                    "current": saved.clone(),
                });
                self.emit(EventType::IdSwap, &store, data, EventSource::Replication)
                    .await;
                Ok(Some(saved))
            }
            Err(Error::DuplicateKey { .. }) => {
                tracing::debug!(
                    store = %store,
                    previous = %previous,
                    "server record already present, dropping client record"
                );
                self.emit(
                    EventType::Delete,
                    &store,
                    json!(removed),
                    EventSource::Replication,
                )
                .await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Open a transaction handle.
    pub async fn create_transaction(&self) -> Result<LocalStorage> {
        if self.is_transaction() {
            return Err(Error::NestedTransaction);
        }
        let adapter = self.adapter.create_transaction().await?;
        tracing::trace!("local storage transaction opened");
        Ok(LocalStorage {
            adapter: Arc::from(adapter),
            models: Arc::clone(&self.models),
            events: self.events.clone(),
            buffered: Some(Mutex::new(Vec::new())),
        })
    }

    /// Commit the adapter transaction, then publish the buffered events in order.
    pub async fn commit(&self) -> Result<()> {
        let buffered = self.buffered.as_ref().ok_or(Error::NotInTransaction)?;
        self.adapter.commit().await?;
        let events: Vec<_> = buffered.lock().await.drain(..).collect();
        for event in &events {
            self.events.publish(event);
        }
        tracing::trace!(events = events.len(), "local storage transaction committed");
        Ok(())
    }

    /// Roll back the adapter transaction and drop the buffered events.
    pub async fn rollback(&self) -> Result<()> {
        let buffered = self.buffered.as_ref().ok_or(Error::NotInTransaction)?;
        self.adapter.rollback().await?;
        let dropped = {
            let mut events = buffered.lock().await;
            let n = events.len();
            events.clear();
            n
        };
        tracing::trace!(events = dropped, "local storage transaction rolled back");
        Ok(())
    }

    pub fn is_transaction(&self) -> bool {
        self.buffered.is_some()
    }

    fn prepare(
        &self,
        schema: &ModelSchema,
        record: Record,
        source: EventSource,
        partial: bool,
    ) -> Result<Record> {
        match source {
            EventSource::User => {
                schema.validate_record(&record, partial)?;
                Ok(record)
            }
            EventSource::Replication => Ok(schema.project(&record)),
        }
    }

    async fn emit(&self, event_type: EventType, store: &str, data: Value, source: EventSource) {
        let event = StoreChangeEvent::new(event_type, store, data, source);
        match &self.buffered {
            Some(buffer) => buffer.lock().await.push(event),
            None => {
                self.events.publish(&event);
            }
        }
    }
}

/// Primary key of a record as a string, if present.
pub(crate) fn primary_id(schema: &ModelSchema, record: &Record) -> Option<String> {
    record.get(schema.primary_key()).and_then(key_to_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::record::{into_record, is_client_id};
    use crate::schema::{FieldDef, FieldType};
    use crate::storage::MemoryAdapter;

    fn rec(value: Value) -> Record {
        into_record(value).unwrap()
    }

    async fn storage() -> LocalStorage {
        let storage = LocalStorage::new(
            Arc::new(MemoryAdapter::new()),
            ModelRegistry::new_shared(),
        );
        let schema = ModelSchema::builder("Note")
            .field(FieldDef::primary("id"))
            .field(FieldDef::required("title", FieldType::String))
            .field(FieldDef::optional("version", FieldType::Int))
            .build()
            .unwrap();
        storage.add_store(schema).await.unwrap();
        storage.create_stores().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn save_assigns_client_id_and_emits() {
        let storage = storage().await;
        let mut sub = storage.events().subscribe(EventFilter::all());

        let saved = storage
            .save("user_Note", rec(json!({"title": "a"})), EventSource::User)
            .await
            .unwrap();
        assert!(is_client_id(&saved["id"]));

        let event = sub.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::Add);
        assert_eq!(event.event_source, EventSource::User);
        assert_eq!(event.data[0]["title"], "a");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn user_writes_are_validated() {
        let storage = storage().await;
        let unknown = storage
            .save(
                "user_Note",
                rec(json!({"title": "a", "color": "red"})),
                EventSource::User,
            )
            .await;
        assert!(matches!(unknown, Err(Error::UnknownField { .. })));

        let missing = storage
            .save("user_Note", rec(json!({})), EventSource::User)
            .await;
        assert!(matches!(missing, Err(Error::MissingRequiredField(_))));

        let projected = storage
            .save(
                "user_Note",
                rec(json!({"id": "1", "title": "a", "_deleted": false, "__typename": "Note"})),
                EventSource::Replication,
            )
            .await
            .unwrap();
        assert_eq!(projected, rec(json!({"id": "1", "title": "a"})));
    }

    #[tokio::test]
    async fn update_remove_and_upsert() {
        let storage = storage().await;
        let mut sub = storage.events().subscribe(EventFilter::all());
        storage
            .save("user_Note", rec(json!({"id": "1", "title": "a"})), EventSource::User)
            .await
            .unwrap();

        let by_id = Predicate::field("id").eq("1");
        let updated = storage
            .update(
                "user_Note",
                rec(json!({"title": "b"})),
                Some(&by_id),
                EventSource::User,
            )
            .await
            .unwrap();
        assert_eq!(updated[0]["title"], "b");

        let none = storage
            .update(
                "user_Note",
                rec(json!({"title": "c"})),
                Some(&Predicate::field("id").eq("nope")),
                EventSource::User,
            )
            .await
            .unwrap();
        assert!(none.is_empty());

        storage
            .save_or_update(
                "user_Note",
                rec(json!({"id": "2", "title": "z"})),
                EventSource::Replication,
            )
            .await
            .unwrap();
        storage
            .save_or_update(
                "user_Note",
                rec(json!({"id": "2", "title": "y"})),
                EventSource::Replication,
            )
            .await
            .unwrap();
        assert_eq!(
            storage.query_by_id("user_Note", "2").await.unwrap().unwrap()["title"],
            "y"
        );

        let removed = storage
            .remove("user_Note", None, EventSource::User)
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);

        let kinds: Vec<_> = sub.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::Add,
                EventType::Update,
                EventType::Add,
                EventType::Update,
                EventType::Delete
            ]
        );
    }

    #[tokio::test]
    async fn transaction_rollback_fires_nothing() {
        let storage = storage().await;
        let mut sub = storage.events().subscribe(EventFilter::all());

        let tx = storage.create_transaction().await.unwrap();
        for title in ["a", "b", "c"] {
            tx.save("user_Note", rec(json!({"title": title})), EventSource::User)
                .await
                .unwrap();
        }
        assert_eq!(tx.query("user_Note", None).await.unwrap().len(), 3);
        assert!(sub.try_recv().is_none());

        tx.rollback().await.unwrap();
        assert!(storage.query("user_Note", None).await.unwrap().is_empty());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn transaction_commit_flushes_in_order() {
        let storage = storage().await;
        let mut sub = storage.events().subscribe(EventFilter::all());

        let tx = storage.create_transaction().await.unwrap();
        tx.save("user_Note", rec(json!({"id": "1", "title": "a"})), EventSource::User)
            .await
            .unwrap();
        tx.remove("user_Note", None, EventSource::User).await.unwrap();
        assert!(sub.try_recv().is_none());

        tx.commit().await.unwrap();
        let kinds: Vec<_> = sub.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::Add, EventType::Delete]);
    }

    #[tokio::test]
    async fn transaction_misuse() {
        let storage = storage().await;
        assert!(matches!(storage.commit().await, Err(Error::NotInTransaction)));
        assert!(matches!(storage.rollback().await, Err(Error::NotInTransaction)));

        let tx = storage.create_transaction().await.unwrap();
        assert!(matches!(
            tx.create_transaction().await,
            Err(Error::NestedTransaction)
        ));
    }

    fn carried() -> Vec<String> {
        vec!["version".to_string()]
    }

    #[tokio::test]
    async fn swap_id_emits_single_event() {
        let storage = storage().await;
        storage
            .save(
                "user_Note",
                rec(json!({"id": "client.abc", "title": "a"})),
                EventSource::User,
            )
            .await
            .unwrap();
        let mut sub = storage.events().subscribe(EventFilter::all());

        let swapped = storage
            .swap_id(
                "user_Note",
                "client.abc",
                &rec(json!({"id": "srv-1", "title": "a", "version": 1})),
                &carried(),
            )
            .await
            .unwrap();
        assert_eq!(swapped, Some(rec(json!({"id": "srv-1", "title": "a", "version": 1}))));

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::IdSwap);
        assert_eq!(events[0].data["previous"]["id"], "client.abc");
        assert_eq!(events[0].data["current"]["id"], "srv-1");

        let all = storage.query("user_Note", None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["id"], "srv-1");
    }

    #[tokio::test]
    async fn swap_id_keeps_local_edits() {
        let storage = storage().await;
        storage
            .save(
                "user_Note",
                rec(json!({"id": "client.abc", "title": "edited", "version": 7})),
                EventSource::User,
            )
            .await
            .unwrap();

        storage
            .swap_id(
                "user_Note",
                "client.abc",
                &rec(json!({"id": "srv-1", "title": "original", "version": 1})),
                &carried(),
            )
            .await
            .unwrap();

        let stored = storage.query_by_id("user_Note", "srv-1").await.unwrap().unwrap();
        assert_eq!(stored, rec(json!({"id": "srv-1", "title": "edited", "version": 1})));
    }

    #[tokio::test]
    async fn swap_id_skips_records_deleted_locally() {
        let storage = storage().await;
        let mut sub = storage.events().subscribe(EventFilter::all());

        let swapped = storage
            .swap_id(
                "user_Note",
                "client.gone",
                &rec(json!({"id": "srv-1", "title": "a", "version": 1})),
                &carried(),
            )
            .await
            .unwrap();

        assert!(swapped.is_none());
        assert!(storage.query("user_Note", None).await.unwrap().is_empty());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn swap_id_degrades_to_delete() {
        let storage = storage().await;
        for id in ["client.abc", "srv-1"] {
            storage
                .save("user_Note", rec(json!({"id": id, "title": "a"})), EventSource::User)
                .await
                .unwrap();
        }
        let mut sub = storage.events().subscribe(EventFilter::all());

        let swapped = storage
            .swap_id(
                "user_Note",
                "client.abc",
                &rec(json!({"id": "srv-1", "title": "a"})),
                &carried(),
            )
            .await
            .unwrap();
        assert!(swapped.is_none());

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Delete);
        assert_eq!(events[0].data[0]["id"], "client.abc");
        assert_eq!(storage.query("user_Note", None).await.unwrap().len(), 1);
    }
}
