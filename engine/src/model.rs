//! Application-facing model handle.

use std::sync::Arc;

use crate::{
    error::Result,
    events::{EventFilter, EventSource, EventType, Subscription},
    queue::{MutationQueue, MutationTicket},
    record::key_to_id,
    schema::ModelSchema,
    state::ObjectState,
    storage::LocalStorage,
    Error, Predicate, Record, StoreName,
};

/// CRUD on one store. Writes land locally first, then queue for the remote
/// when the model replicates.
#[derive(Clone)]
pub struct Model {
    schema: Arc<ModelSchema>,
    store: StoreName,
    storage: Arc<LocalStorage>,
    queue: MutationQueue,
    state: Arc<dyn ObjectState>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("store", &self.store)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Model {
    pub(crate) fn new(
        schema: Arc<ModelSchema>,
        storage: Arc<LocalStorage>,
        queue: MutationQueue,
        state: Arc<dyn ObjectState>,
    ) -> Self {
        Self {
            store: schema.store_name(),
            schema,
            storage,
            queue,
            state,
        }
    }

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub fn store_name(&self) -> &str {
        &self.store
    }

    /// Insert a record. A missing primary key gets a client id.
    pub async fn save(&self, record: Record) -> Result<Record> {
        let (saved, _) = self.save_tracked(record).await?;
        Ok(saved)
    }

    /// Like [`save`](Self::save), also returning the ticket of the queued
    /// create when the model replicates.
    pub async fn save_tracked(&self, record: Record) -> Result<(Record, Option<MutationTicket>)> {
        let saved = self
            .storage
            .save(&self.store, record, EventSource::User)
            .await?;
        let ticket = self.replicate(EventType::Add, saved.clone(), None).await?;
        Ok((saved, ticket))
    }

    pub async fn query(&self, predicate: Option<&Predicate>) -> Result<Vec<Record>> {
        self.storage.query(&self.store, predicate).await
    }

    pub async fn query_by_id(&self, id: &str) -> Result<Option<Record>> {
        self.storage.query_by_id(&self.store, id).await
    }

    /// Merge `input` into matching records.
    ///
    /// Without a predicate the record keyed by `input`'s primary key is
    /// updated. When `input` carries a state marker that differs from a
    /// stored record the call fails with [`Error::Conflict`] and nothing is
    /// written or queued.
    pub async fn update(&self, input: Record, predicate: Option<&Predicate>) -> Result<Vec<Record>> {
        let predicate = match predicate {
            Some(p) => p.clone(),
            None => self.schema.primary_key_predicate(&input)?,
        };

        let before = self.storage.query(&self.store, Some(&predicate)).await?;
        if let Some(stale) = before.iter().find(|r| self.state.has_conflict(&input, r)) {
            let id = stale
                .get(self.schema.primary_key())
                .and_then(key_to_id)
                .unwrap_or_default();
            tracing::debug!(store = %self.store, id = %id, "update rejected, local state moved on");
            return Err(Error::Conflict {
                id,
                attempted: self.state.current(&input),
                current: self.state.current(stale),
            });
        }

        let updated = self
            .storage
            .update(&self.store, input, Some(&predicate), EventSource::User)
            .await?;

        let pk = self.schema.primary_key();
        for record in &updated {
            let base = before
                .iter()
                .find(|b| b.get(pk).is_some() && b.get(pk) == record.get(pk))
                .cloned();
            self.replicate(EventType::Update, record.clone(), base).await?;
        }
        Ok(updated)
    }

    /// Delete matching records (all records without a predicate).
    pub async fn remove(&self, predicate: Option<&Predicate>) -> Result<Vec<Record>> {
        let removed = self
            .storage
            .remove(&self.store, predicate, EventSource::User)
            .await?;
        for record in &removed {
            self.replicate(EventType::Delete, record.clone(), Some(record.clone()))
                .await?;
        }
        Ok(removed)
    }

    /// Change events of this model, optionally of one type only.
    pub fn subscribe(&self, event_type: Option<EventType>) -> Subscription {
        let mut filter = EventFilter::store(self.store.clone());
        if let Some(event_type) = event_type {
            filter = filter.with_event_type(event_type);
        }
        self.storage.events().subscribe(filter)
    }

    async fn replicate(
        &self,
        event_type: EventType,
        data: Record,
        base: Option<Record>,
    ) -> Result<Option<MutationTicket>> {
        if !self.queue.is_registered(&self.store) {
            return Ok(None);
        }
        let ticket = self
            .queue
            .enqueue(&self.store, event_type, data, base)
            .await?;
        Ok(Some(ticket))
    }
}
