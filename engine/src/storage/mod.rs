//! Storage layer.
//!
//! [`StorageAdapter`] is the contract a durable backend implements.
//! [`LocalStorage`] sits on top of an adapter, validates writes against the
//! registered schemas and publishes change events. [`MemoryAdapter`] is the
//! bundled in-process backend.

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryAdapter;

use async_trait::async_trait;

use crate::{error::Result, schema::ModelSchema, Predicate, Record};

/// Durable key-addressed record store with transactions.
///
/// A handle returned by [`create_transaction`](StorageAdapter::create_transaction)
/// sees its own writes immediately; other handles see them only after
/// [`commit`](StorageAdapter::commit) returns. Commit applies the
/// transaction's row writes and keeps rows other handles wrote meanwhile.
///
/// # Errors
/// - [`Error::StoreNotFound`](crate::Error::StoreNotFound) for unknown stores
/// - [`Error::DuplicateKey`](crate::Error::DuplicateKey) when saving an existing key
/// - [`Error::NotInTransaction`](crate::Error::NotInTransaction) for commit/rollback
///   on a non-transactional handle
/// - [`Error::NestedTransaction`](crate::Error::NestedTransaction) when a
///   transaction handle tries to open another one
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Register a store. Takes effect on [`create_stores`](Self::create_stores).
    async fn add_store(&self, schema: &ModelSchema) -> Result<()>;

    /// Create every registered store that does not exist yet.
    async fn create_stores(&self) -> Result<()>;

    /// Insert a record. The record must carry its primary key.
    async fn save(&self, store: &str, record: Record) -> Result<Record>;

    /// Records matching the predicate, or all records.
    async fn query(&self, store: &str, predicate: Option<&Predicate>) -> Result<Vec<Record>>;

    /// Merge `input` into every matching record and return the results.
    ///
    /// The primary key of a stored record is never changed by an update.
    async fn update(
        &self,
        store: &str,
        input: &Record,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<Record>>;

    /// Delete matching records, or all records, and return them.
    async fn remove(&self, store: &str, predicate: Option<&Predicate>) -> Result<Vec<Record>>;

    /// Open a transaction handle sharing this adapter's medium.
    async fn create_transaction(&self) -> Result<Box<dyn StorageAdapter>>;

    /// Make the transaction's writes durable and visible.
    async fn commit(&self) -> Result<()>;

    /// Discard the transaction's writes.
    async fn rollback(&self) -> Result<()>;

    fn is_transaction_open(&self) -> bool;
}
