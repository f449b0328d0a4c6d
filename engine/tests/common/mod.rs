//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ferry_engine::{
    DataStore, FieldDef, FieldType, ManualNetworkStatus, MemoryAdapter, MemoryOfflineStore,
    ModelSchema, Record, RemoteClient, RemoteResponse, RemoteStream, ReplicationConfig, Result,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test subscriber once. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("record must be a JSON object")
}

/// `Note {id, title, description, version}` in the default namespace.
pub fn note_schema() -> ModelSchema {
    ModelSchema::builder("Note")
        .field(FieldDef::primary("id"))
        .field(FieldDef::optional("title", FieldType::String))
        .field(FieldDef::optional("description", FieldType::String))
        .field(FieldDef::optional("version", FieldType::Int))
        .build()
        .unwrap()
}

pub fn comment_schema() -> ModelSchema {
    ModelSchema::builder("Comment")
        .field(FieldDef::primary("id"))
        .field(FieldDef::optional("text", FieldType::String))
        .field(FieldDef::optional("version", FieldType::Int))
        .build()
        .unwrap()
}

/// In-memory stand-in for a GraphQL backend.
///
/// Unscripted creates assign sequential server ids (`"1"`, `"2"`, ...) and
/// version 1; unscripted updates bump the version; deletes echo the input.
/// Scripted replies are served first, in order.
#[derive(Default)]
pub struct FakeRemote {
    replies: Mutex<VecDeque<Result<RemoteResponse>>>,
    mutations: Mutex<Vec<(String, Value)>>,
    pages: Mutex<VecDeque<Value>>,
    queries: Mutex<Vec<(String, Value)>>,
    feeds: Mutex<Vec<(String, mpsc::UnboundedSender<RemoteResponse>)>>,
    next_id: AtomicU64,
    unreachable: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `reply` to the next mutation.
    pub fn reply(&self, reply: Result<RemoteResponse>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Serve `payload` to the next delta query.
    pub fn page(&self, payload: Value) {
        self.pages.lock().unwrap().push_back(payload);
    }

    /// Fail every call with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn mutations(&self) -> Vec<(String, Value)> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<(String, Value)> {
        self.queries.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .map(|(op, _)| op.clone())
            .collect()
    }

    /// Deliver `data` on the newest live subscription of `operation`.
    pub fn push(&self, operation: &str, data: Value) -> bool {
        let feeds = self.feeds.lock().unwrap();
        match feeds.iter().rev().find(|(op, _)| op == operation) {
            Some((_, feed)) => feed
                .send(RemoteResponse::data(json!({ operation: data })))
                .is_ok(),
            None => false,
        }
    }

    fn answer(&self, operation: &str, input: &Value) -> Value {
        let mut record = input.clone();
        if operation.starts_with("create") {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            record["id"] = json!(id.to_string());
            record["version"] = json!(1);
        } else if operation.starts_with("update") {
            let version = record["version"].as_i64().unwrap_or(0);
            record["version"] = json!(version + 1);
        }
        json!({ operation: record })
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(ferry_engine::Error::Network("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn mutate(&self, operation: &str, variables: Value) -> Result<RemoteResponse> {
        self.check_reachable()?;
        self.mutations
            .lock()
            .unwrap()
            .push((operation.to_string(), variables.clone()));
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        Ok(RemoteResponse::data(self.answer(operation, &variables["input"])))
    }

    async fn query(&self, operation: &str, variables: Value) -> Result<RemoteResponse> {
        self.check_reachable()?;
        self.queries
            .lock()
            .unwrap()
            .push((operation.to_string(), variables));
        let page = self
            .pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| json!({"items": []}));
        Ok(RemoteResponse::data(json!({ operation: page })))
    }

    async fn subscribe(&self, operation: &str, _variables: Value) -> Result<RemoteStream> {
        self.check_reachable()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .unwrap()
            .push((operation.to_string(), tx));
        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }
}

/// Everything a scenario needs to drive a [`DataStore`].
pub struct Harness {
    pub adapter: MemoryAdapter,
    pub offline: MemoryOfflineStore,
    pub remote: Arc<FakeRemote>,
    pub network: Arc<ManualNetworkStatus>,
}

impl Harness {
    pub fn new(online: bool) -> Self {
        init_tracing();
        Self {
            adapter: MemoryAdapter::new(),
            offline: MemoryOfflineStore::new(),
            remote: FakeRemote::new(),
            network: Arc::new(ManualNetworkStatus::new(online)),
        }
    }

    /// A data store over this harness. Calling it again simulates a restart
    /// that keeps local and offline storage.
    pub fn datastore(&self, config: ReplicationConfig) -> DataStore {
        DataStore::new(
            Arc::new(self.adapter.clone()),
            Arc::new(self.offline.clone()),
            self.remote.clone(),
            self.network.clone(),
            config,
        )
    }
}

/// Push only; delta and live off so scenarios control every remote call.
pub fn push_only() -> ReplicationConfig {
    let mut config = ReplicationConfig::default();
    config.delta.enabled = false;
    config.live.enabled = false;
    config
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
