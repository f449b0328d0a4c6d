//! In-memory storage adapter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::StorageAdapter;
use crate::{
    error::Result, record::record_id, schema::ModelSchema, Error, Predicate, Record, RecordId,
    StoreName,
};

/// One row-level write recorded by a transaction.
#[derive(Debug, Clone)]
enum RowChange {
    Put(RecordId, Record),
    Delete(RecordId),
}

/// Rows of one store, keyed by primary key.
#[derive(Debug, Clone)]
struct Table {
    primary_key: String,
    rows: BTreeMap<RecordId, Record>,
    /// Set on transaction working copies only.
    journal: Option<Vec<RowChange>>,
}

impl Table {
    fn new(primary_key: &str) -> Self {
        Self {
            primary_key: primary_key.to_string(),
            rows: BTreeMap::new(),
            journal: None,
        }
    }

    /// Working copy for a transaction, journaling every row it writes.
    fn working_copy(&self) -> Self {
        Self {
            primary_key: self.primary_key.clone(),
            rows: self.rows.clone(),
            journal: Some(Vec::new()),
        }
    }

    fn record(&mut self, change: RowChange) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(change);
        }
    }

    /// Replay a transaction's row writes. Rows it never touched are kept.
    fn replay(&mut self, journal: Vec<RowChange>) {
        for change in journal {
            match change {
                RowChange::Put(id, row) => {
                    self.rows.insert(id, row);
                }
                RowChange::Delete(id) => {
                    self.rows.remove(&id);
                }
            }
        }
    }

    fn save(&mut self, store: &str, record: Record) -> Result<Record> {
        let id = record_id(&record, &self.primary_key).ok_or_else(|| {
            Error::Storage(format!(
                "record for {} has no primary key '{}'",
                store, self.primary_key
            ))
        })?;
        if self.rows.contains_key(&id) {
            return Err(Error::DuplicateKey {
                store: store.to_string(),
                id,
            });
        }
        self.rows.insert(id.clone(), record.clone());
        self.record(RowChange::Put(id, record.clone()));
        Ok(record)
    }

    fn query(&self, predicate: Option<&Predicate>) -> Vec<Record> {
        match predicate {
            Some(p) => p.filter(self.rows.values()),
            None => self.rows.values().cloned().collect(),
        }
    }

    fn update(&mut self, input: &Record, predicate: Option<&Predicate>) -> Vec<Record> {
        let mut updated = Vec::new();
        for (id, row) in self.rows.iter_mut() {
            if predicate.map_or(true, |p| p.evaluate(row)) {
                for (field, value) in input {
                    if *field != self.primary_key {
                        row.insert(field.clone(), value.clone());
                    }
                }
                updated.push((id.clone(), row.clone()));
            }
        }
        for (id, row) in &updated {
            self.record(RowChange::Put(id.clone(), row.clone()));
        }
        updated.into_iter().map(|(_, row)| row).collect()
    }

    fn remove(&mut self, predicate: Option<&Predicate>) -> Vec<Record> {
        let doomed: Vec<RecordId> = self
            .rows
            .iter()
            .filter(|(_, row)| predicate.map_or(true, |p| p.evaluate(row)))
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(row) = self.rows.remove(&id) {
                self.record(RowChange::Delete(id));
                removed.push(row);
            }
        }
        removed
    }
}

#[derive(Debug, Default)]
struct Shared {
    /// Declared stores and their primary keys.
    declared: RwLock<HashMap<StoreName, String>>,
    /// Committed state.
    tables: RwLock<HashMap<StoreName, Table>>,
}

/// Working set of an open transaction. Tables are copied on first touch and
/// every row write is journaled for replay on commit.
#[derive(Debug, Default)]
struct Transaction {
    working: Mutex<HashMap<StoreName, Table>>,
    open: AtomicBool,
}

/// In-memory [`StorageAdapter`].
///
/// Cloning shares the same data. A transaction reads from a copy of each
/// store it touches. On commit its row writes are replayed onto the live
/// stores under one write lock, so readers never observe a partially applied
/// transaction and rows written outside the transaction are kept.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdapter {
    shared: Arc<Shared>,
    tx: Option<Arc<Transaction>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn transaction(&self) -> Result<&Transaction> {
        let tx = self.tx.as_deref().ok_or(Error::NotInTransaction)?;
        if tx.open.load(Ordering::Acquire) {
            Ok(tx)
        } else {
            Err(Error::TransactionClosed)
        }
    }

    async fn read<F, R>(&self, store: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Table) -> R + Send,
    {
        if self.tx.is_some() {
            let tx = self.transaction()?;
            let working = tx.working.lock().await;
            if let Some(table) = working.get(store) {
                return Ok(f(table));
            }
        }
        let tables = self.shared.tables.read().await;
        let table = tables
            .get(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
        Ok(f(table))
    }

    async fn write<F, R>(&self, store: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Table) -> Result<R> + Send,
    {
        if self.tx.is_some() {
            let tx = self.transaction()?;
            let mut working = tx.working.lock().await;
            if !working.contains_key(store) {
                let tables = self.shared.tables.read().await;
                let table = tables
                    .get(store)
                    .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
                working.insert(store.to_string(), table.working_copy());
            }
            let table = working
                .get_mut(store)
                .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
            return f(table);
        }

        let mut tables = self.shared.tables.write().await;
        let table = tables
            .get_mut(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
        f(table)
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn add_store(&self, schema: &ModelSchema) -> Result<()> {
        self.shared
            .declared
            .write()
            .await
            .insert(schema.store_name(), schema.primary_key().to_string());
        Ok(())
    }

    async fn create_stores(&self) -> Result<()> {
        let declared = self.shared.declared.read().await;
        let mut tables = self.shared.tables.write().await;
        for (store, primary_key) in declared.iter() {
            if !tables.contains_key(store) {
                tracing::debug!(store = %store, "creating memory store");
                tables.insert(store.clone(), Table::new(primary_key));
            }
        }
        Ok(())
    }

    async fn save(&self, store: &str, record: Record) -> Result<Record> {
        self.write(store, |table| table.save(store, record)).await
    }

    async fn query(&self, store: &str, predicate: Option<&Predicate>) -> Result<Vec<Record>> {
        self.read(store, |table| table.query(predicate)).await
    }

    async fn update(
        &self,
        store: &str,
        input: &Record,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<Record>> {
        self.write(store, |table| Ok(table.update(input, predicate)))
            .await
    }

    async fn remove(&self, store: &str, predicate: Option<&Predicate>) -> Result<Vec<Record>> {
        self.write(store, |table| Ok(table.remove(predicate))).await
    }

    async fn create_transaction(&self) -> Result<Box<dyn StorageAdapter>> {
        if self.tx.is_some() {
            return Err(Error::NestedTransaction);
        }
        let tx = Transaction {
            working: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        };
        Ok(Box::new(MemoryAdapter {
            shared: Arc::clone(&self.shared),
            tx: Some(Arc::new(tx)),
        }))
    }

    async fn commit(&self) -> Result<()> {
        let tx = self.transaction()?;
        let mut working = tx.working.lock().await;
        let mut tables = self.shared.tables.write().await;
        if let Some(missing) = working.keys().find(|store| !tables.contains_key(*store)) {
            return Err(Error::StoreNotFound(missing.clone()));
        }
        let touched = working.len();
        for (store, table) in working.drain() {
            if let Some(live) = tables.get_mut(&store) {
                live.replay(table.journal.unwrap_or_default());
            }
        }
        tx.open.store(false, Ordering::Release);
        tracing::trace!(stores = touched, "memory transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self.transaction()?;
        tx.working.lock().await.clear();
        tx.open.store(false, Ordering::Release);
        tracing::trace!("memory transaction rolled back");
        Ok(())
    }

    fn is_transaction_open(&self) -> bool {
        self.tx
            .as_ref()
            .map_or(false, |tx| tx.open.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::into_record;
    use crate::schema::{FieldDef, FieldType};
    use serde_json::json;

    fn rec(value: serde_json::Value) -> Record {
        into_record(value).unwrap()
    }

    async fn adapter() -> MemoryAdapter {
        let schema = ModelSchema::builder("Note")
            .field(FieldDef::primary("id"))
            .field(FieldDef::optional("title", FieldType::String))
            .build()
            .unwrap();
        let adapter = MemoryAdapter::new();
        adapter.add_store(&schema).await.unwrap();
        adapter.create_stores().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn crud() {
        let adapter = adapter().await;
        adapter
            .save("user_Note", rec(json!({"id": "1", "title": "a"})))
            .await
            .unwrap();
        adapter
            .save("user_Note", rec(json!({"id": "2", "title": "b"})))
            .await
            .unwrap();

        let updated = adapter
            .update(
                "user_Note",
                &rec(json!({"id": "ignored", "title": "c"})),
                Some(&Predicate::field("id").eq("1")),
            )
            .await
            .unwrap();
        assert_eq!(updated, vec![rec(json!({"id": "1", "title": "c"}))]);

        let removed = adapter.remove("user_Note", None).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(adapter.query("user_Note", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_and_missing() {
        let adapter = adapter().await;
        adapter
            .save("user_Note", rec(json!({"id": "1"})))
            .await
            .unwrap();

        let dup = adapter.save("user_Note", rec(json!({"id": "1"}))).await;
        assert!(matches!(dup, Err(Error::DuplicateKey { .. })));

        let unknown = adapter.query("user_Task", None).await;
        assert!(matches!(unknown, Err(Error::StoreNotFound(_))));

        let keyless = adapter.save("user_Note", rec(json!({"title": "x"}))).await;
        assert!(matches!(keyless, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn transaction_isolation_and_commit() {
        let adapter = adapter().await;
        let tx = adapter.create_transaction().await.unwrap();
        assert!(tx.is_transaction_open());
        assert!(!adapter.is_transaction_open());

        tx.save("user_Note", rec(json!({"id": "1"}))).await.unwrap();
        assert_eq!(tx.query("user_Note", None).await.unwrap().len(), 1);
        assert!(adapter.query("user_Note", None).await.unwrap().is_empty());

        tx.commit().await.unwrap();
        assert!(!tx.is_transaction_open());
        assert_eq!(adapter.query("user_Note", None).await.unwrap().len(), 1);
        assert!(matches!(tx.commit().await, Err(Error::TransactionClosed)));
    }

    #[tokio::test]
    async fn commit_keeps_rows_written_outside_the_transaction() {
        let adapter = adapter().await;
        adapter
            .save("user_Note", rec(json!({"id": "old", "title": "a"})))
            .await
            .unwrap();

        let tx = adapter.create_transaction().await.unwrap();
        tx.save("user_Note", rec(json!({"id": "r1"}))).await.unwrap();
        tx.update(
            "user_Note",
            &rec(json!({"title": "b"})),
            Some(&Predicate::field("id").eq("old")),
        )
        .await
        .unwrap();

        adapter
            .save("user_Note", rec(json!({"id": "u1", "title": "user"})))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let ids: Vec<_> = adapter
            .query("user_Note", None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("old"), json!("r1"), json!("u1")]);
        let old = adapter
            .query("user_Note", Some(&Predicate::field("id").eq("old")))
            .await
            .unwrap();
        assert_eq!(old[0]["title"], "b");
    }

    #[tokio::test]
    async fn committed_delete_does_not_touch_other_rows() {
        let adapter = adapter().await;
        adapter.save("user_Note", rec(json!({"id": "1"}))).await.unwrap();

        let tx = adapter.create_transaction().await.unwrap();
        tx.remove("user_Note", None).await.unwrap();
        adapter.save("user_Note", rec(json!({"id": "2"}))).await.unwrap();
        tx.commit().await.unwrap();

        let rows = adapter.query("user_Note", None).await.unwrap();
        assert_eq!(rows, vec![rec(json!({"id": "2"}))]);
    }

    #[tokio::test]
    async fn rollback_discards() {
        let adapter = adapter().await;
        let tx = adapter.create_transaction().await.unwrap();
        tx.save("user_Note", rec(json!({"id": "1"}))).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(adapter.query("user_Note", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transaction_misuse() {
        let adapter = adapter().await;
        assert!(matches!(adapter.commit().await, Err(Error::NotInTransaction)));
        assert!(matches!(
            adapter.rollback().await,
            Err(Error::NotInTransaction)
        ));

        let tx = adapter.create_transaction().await.unwrap();
        assert!(matches!(
            tx.create_transaction().await,
            Err(Error::NestedTransaction)
        ));
    }
}
