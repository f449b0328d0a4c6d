//! Network status signal.

use std::sync::Arc;

use tokio::sync::watch;

/// Source of online/offline transitions.
///
/// Consumers either poll [`is_online`](Self::is_online) or hold the watch
/// receiver and await changes.
pub trait NetworkStatus: Send + Sync {
    fn is_online(&self) -> bool;

    /// Receiver that observes every transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Network status driven by the host application.
///
/// Useful in tests and on platforms where connectivity is reported through
/// callbacks that the host forwards here.
#[derive(Debug, Clone)]
pub struct ManualNetworkStatus {
    sender: Arc<watch::Sender<bool>>,
}

impl ManualNetworkStatus {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Report connectivity. Subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "network status changed");
        }
    }
}

impl Default for ManualNetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStatus for ManualNetworkStatus {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}
