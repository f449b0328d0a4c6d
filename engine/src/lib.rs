//! # Ferry Engine
//!
//! An offline-first synchronization engine.
//!
//! Application writes land in local storage first. Writes to replicated
//! models are captured in a durable mutation queue and forwarded to a remote
//! in order once the network is available. Remote changes flow back through
//! polling (delta) and subscriptions (live) and are applied locally without
//! re-entering the queue.
//!
//! ## Core Concepts
//!
//! ### Records and schemas
//!
//! A [`Record`] is a JSON object validated against a [`ModelSchema`]. Records
//! created offline get a client id (`client.<uuid>`) that is swapped for the
//! server id once the create is confirmed.
//!
//! ### Local storage
//!
//! [`LocalStorage`] wraps a [`StorageAdapter`] and publishes a
//! [`StoreChangeEvent`] for every write. Transactions buffer their events and
//! publish them only on commit.
//!
//! ### Mutation queue
//!
//! The [`MutationQueue`] persists every outbound change to an
//! [`OfflineStore`] and drains strictly in enqueue order. Transport failures
//! leave the request queued; remote conflicts run through the
//! [`ConflictHandler`].
//!
//! ### Replication
//!
//! The [`ReplicationEngine`] runs push, delta and live replication for every
//! model, driven by a shared [`NetworkStatus`].
//!
//! ## Quick Start
//!
//! ```rust
//! use ferry_engine::{
//!     EventSource, FieldDef, FieldType, LocalStorage, MemoryAdapter, ModelRegistry,
//!     ModelSchema, Predicate,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test_block(async {
//! let storage = LocalStorage::new(Arc::new(MemoryAdapter::new()), ModelRegistry::new_shared());
//! storage
//!     .add_store(
//!         ModelSchema::builder("Note")
//!             .field(FieldDef::primary("id"))
//!             .field(FieldDef::required("title", FieldType::String))
//!             .build()
//!             .unwrap(),
//!     )
//!     .await
//!     .unwrap();
//! storage.create_stores().await.unwrap();
//!
//! let note = json!({"title": "groceries"}).as_object().cloned().unwrap();
//! let saved = storage.save("user_Note", note, EventSource::User).await.unwrap();
//! assert!(saved["id"].as_str().unwrap().starts_with("client."));
//!
//! let found = storage
//!     .query("user_Note", Some(&Predicate::field("title").starts_with("groc")))
//!     .await
//!     .unwrap();
//! assert_eq!(found.len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod conflict;
pub mod datastore;
pub mod error;
pub mod events;
pub mod model;
pub mod network;
pub mod predicate;
pub mod queue;
pub mod record;
pub mod registry;
pub mod remote;
pub mod replication;
pub mod schema;
pub mod state;
pub mod storage;

// Re-export main types at crate root
pub use conflict::{
    ClientWins, ConflictHandler, ConflictListener, ConflictOutcome, Resolution,
    ResolutionContext, ResolutionStrategy, ServerWins,
};
pub use datastore::DataStore;
pub use error::{Error, Result};
pub use events::{
    ChangeEventStream, EventFilter, EventSource, EventType, StoreChangeEvent, Subscription,
};
pub use model::Model;
pub use network::{ManualNetworkStatus, NetworkStatus};
pub use predicate::{FilterDialect, Operator, Predicate};
pub use queue::{
    ErrorDecision, ErrorHandler, MemoryOfflineStore, MutationQueue, MutationRequest,
    MutationTicket, OfflineStore, QueueListener, QueueModel,
};
pub use record::Record;
pub use registry::ModelRegistry;
pub use remote::{ModelOperations, RemoteClient, RemoteError, RemoteResponse, RemoteStream};
pub use replication::{
    ConfigError, DeltaConfig, LiveConfig, ModelReplicationConfig, ReplicationConfig,
    ReplicationEngine,
};
pub use schema::{FieldDef, FieldType, ModelSchema};
pub use state::{ObjectState, VersionedState};
pub use storage::{LocalStorage, MemoryAdapter, StorageAdapter};

/// Type aliases for clarity
pub type StoreName = String;
pub type RecordId = String;
pub type QueueEntryId = String;
