use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Process-wide online/offline flag.
///
/// Clones share one state. Subscribers are woken only on real edges:
/// reporting `online` while already online is swallowed.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

/// Runtime source of the initial connectivity sample.
pub trait NetworkStatusSource {
    fn is_online(&self) -> bool;
}

impl ConnectivityMonitor {
    pub fn new(initial_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initial_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn from_source(source: &dyn NetworkStatusSource) -> Self {
        Self::new(source.is_online())
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Applies a runtime signal. Returns `true` if it was an edge.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    /// Zero-argument runtime `online` event.
    pub fn went_online(&self) -> bool {
        self.set_online(true)
    }

    /// Zero-argument runtime `offline` event.
    pub fn went_offline(&self) -> bool {
        self.set_online(false)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
