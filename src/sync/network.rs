// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connectivity signal for the sync adapters.
//!
//! The engine never probes the network itself; the host tells it. Adapters
//! take a [`NetworkStatusObserver`] and react to transitions through the
//! watch channel, so a browser shell, a desktop tray app, and a test can
//! all drive the same machinery.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub trait NetworkStatusObserver: Send + Sync {
    fn is_online(&self) -> bool;

    /// Receiver that yields on every online/offline transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Host-driven observer: call [`set_online`](ManualNetworkStatus::set_online)
/// when connectivity changes.
pub struct ManualNetworkStatus {
    tx: watch::Sender<bool>,
}

impl ManualNetworkStatus {
    #[must_use]
    pub fn new(online: bool) -> Arc<Self> {
        let (tx, _) = watch::channel(online);
        Arc::new(Self { tx })
    }

    pub fn set_online(&self, online: bool) {
        if self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        }) {
            info!(online, "network status changed");
            crate::metrics::set_online(online);
        }
    }
}

impl NetworkStatusObserver for ManualNetworkStatus {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_reach_subscribers() {
        let status = ManualNetworkStatus::new(false);
        let mut rx = status.subscribe();
        assert!(!status.is_online());

        status.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(status.is_online());
    }

    #[tokio::test]
    async fn test_redundant_set_does_not_wake() {
        let status = ManualNetworkStatus::new(true);
        let mut rx = status.subscribe();
        status.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
