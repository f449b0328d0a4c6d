//! Live replication over remote subscriptions.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;

use super::{apply_remote, pause, wait_online, LiveConfig, ReplicatorContext, TaskSlot};
use crate::{
    error::Result,
    network::NetworkStatus,
    record::into_record,
    remote::{ModelOperations, RemoteClient, RemoteResponse},
    schema::ModelSchema,
    storage::LocalStorage,
    Error, Predicate, StoreName,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Created,
    Updated,
    Deleted,
}

/// `None` marks the end of one subscription.
type ChangeStream = BoxStream<'static, (Change, Option<RemoteResponse>)>;

/// Applies remote create/update/delete notifications of one model.
///
/// Subscribes while online and re-subscribes after reconnecting or after any
/// of the subscriptions ends.
pub struct LiveReplicator {
    inner: Arc<LiveInner>,
    task: TaskSlot,
}

struct LiveInner {
    schema: Arc<ModelSchema>,
    store: StoreName,
    storage: Arc<LocalStorage>,
    remote: Arc<dyn RemoteClient>,
    network: Arc<dyn NetworkStatus>,
    operations: ModelOperations,
    filter: Value,
    config: LiveConfig,
}

impl LiveReplicator {
    pub fn new(
        context: &ReplicatorContext,
        schema: Arc<ModelSchema>,
        operations: &ModelOperations,
        filter: Option<&Predicate>,
        config: LiveConfig,
    ) -> Result<Self> {
        let filter = match filter {
            Some(p) => p.to_remote_filter(&context.dialect)?,
            None => json!({}),
        };
        Ok(Self {
            inner: Arc::new(LiveInner {
                store: schema.store_name(),
                schema,
                storage: Arc::clone(&context.storage),
                remote: Arc::clone(&context.remote),
                network: Arc::clone(&context.network),
                operations: operations.clone(),
                filter,
                config,
            }),
            task: TaskSlot::default(),
        })
    }

    pub fn store_name(&self) -> &str {
        &self.inner.store
    }

    /// Idempotent.
    pub async fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let online = inner.network.subscribe();
        if self.task.start(move |shutdown| inner.run(online, shutdown)).await {
            tracing::info!(store = %self.inner.store, "live replication started");
        }
    }

    /// Drops the subscriptions. Idempotent.
    pub async fn stop(&self) {
        if self.task.stop().await {
            tracing::info!(store = %self.inner.store, "live replication stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.is_running().await
    }
}

impl LiveInner {
    fn operation(&self, change: Change) -> &str {
        match change {
            Change::Created => &self.operations.on_create,
            Change::Updated => &self.operations.on_update,
            Change::Deleted => &self.operations.on_delete,
        }
    }

    async fn run(self: Arc<Self>, mut online: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if !wait_online(&mut online, &mut shutdown).await {
                break;
            }

            match self.subscribe_all().await {
                Ok(mut changes) => {
                    tracing::debug!(store = %self.store, "live subscriptions open");
                    let keep_running = loop {
                        tokio::select! {
                            next = changes.next() => match next {
                                Some((change, Some(response))) => {
                                    if let Err(err) = self.apply(change, response).await {
                                        tracing::warn!(
                                            store = %self.store,
                                            error = %err,
                                            "failed to apply live update"
                                        );
                                    }
                                }
                                Some((change, None)) => {
                                    tracing::warn!(
                                        store = %self.store,
                                        operation = %self.operation(change),
                                        "subscription ended"
                                    );
                                    break true;
                                }
                                None => break true,
                            },
                            changed = online.changed() => {
                                if changed.is_err() {
                                    break false;
                                }
                                if !*online.borrow_and_update() {
                                    tracing::debug!(store = %self.store, "offline, live updates suspended");
                                    break true;
                                }
                            }
                            _ = shutdown.changed() => break false,
                        }
                    };
                    drop(changes);
                    if !keep_running {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(store = %self.store, error = %err, "live subscription failed");
                }
            }

            if !pause(self.config.resubscribe_delay(), &mut shutdown).await {
                break;
            }
        }
        tracing::debug!(store = %self.store, "live task exited");
    }

    /// Open the three subscriptions as one stream.
    async fn subscribe_all(&self) -> Result<ChangeStream> {
        let variables = json!({ "filter": self.filter });
        let mut streams = Vec::with_capacity(3);
        for change in [Change::Created, Change::Updated, Change::Deleted] {
            let subscription = self
                .remote
                .subscribe(self.operation(change), variables.clone())
                .await?;
            let ended = stream::once(async move { (change, None) });
            streams.push(
                subscription
                    .map(move |response| (change, Some(response)))
                    .chain(ended)
                    .boxed(),
            );
        }
        Ok(stream::select_all(streams).boxed())
    }

    async fn apply(&self, change: Change, response: RemoteResponse) -> Result<()> {
        let operation = self.operation(change);
        let payload = response.into_payload(operation)?;
        let record = into_record(payload).ok_or_else(|| {
            Error::Application(format!("{} delivered a non-object payload", operation))
        })?;
        apply_remote(&self.storage, &self.schema, &record, change == Change::Deleted).await
    }
}
