//! Push replication: forwards the mutation queue while online.

use std::sync::Arc;

use tokio::sync::watch;

use super::TaskSlot;
use crate::{network::NetworkStatus, queue::MutationQueue};

/// Keeps the queue's connectivity in step with the network signal.
pub struct PushReplicator {
    queue: MutationQueue,
    network: Arc<dyn NetworkStatus>,
    task: TaskSlot,
}

impl PushReplicator {
    pub fn new(queue: MutationQueue, network: Arc<dyn NetworkStatus>) -> Self {
        Self {
            queue,
            network,
            task: TaskSlot::default(),
        }
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Enable forwarding and follow network transitions. Idempotent.
    pub async fn start(&self) {
        let queue = self.queue.clone();
        let online = self.network.subscribe();
        let started = self
            .task
            .start(move |shutdown| follow_network(queue, online, shutdown))
            .await;
        if started {
            self.queue.set_online(self.network.is_online());
            self.queue.set_enabled(true);
            tracing::info!("push replication started");
        }
    }

    /// Disable forwarding. Requests enqueued meanwhile stay persisted.
    pub async fn stop(&self) {
        if self.task.stop().await {
            self.queue.set_enabled(false);
            tracing::info!("push replication stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.is_running().await
    }
}

async fn follow_network(
    queue: MutationQueue,
    mut online: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_online = *online.borrow_and_update();
                queue.set_online(is_online);
            }
            _ = shutdown.changed() => break,
        }
    }
}
