//! Connectivity sources
//!
//! The orchestrator only needs a current reading and a change stream. Both
//! are served from a `watch` channel so late subscribers see the latest value.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use super::remote::HttpRemote;

#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Probe now and return whether the server is reachable
    async fn check(&self) -> bool;

    /// Stream of online/offline transitions
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven by the embedding application (OS network callbacks)
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(initial: bool) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.tx.send_replace(online);
        if previous != online {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

#[async_trait]
impl Connectivity for ManualConnectivity {
    async fn check(&self) -> bool {
        self.is_online()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Connectivity derived from polling the server's health endpoint
pub struct HealthProbe {
    remote: Arc<HttpRemote>,
    tx: watch::Sender<bool>,
}

impl HealthProbe {
    /// Starts pessimistic: offline until the first successful probe
    pub fn new(remote: Arc<HttpRemote>) -> Self {
        let (tx, _) = watch::channel(false);
        Self { remote, tx }
    }

    /// Start background probe task
    pub fn start(self: &Arc<Self>, check_interval: Duration) -> tokio::task::JoinHandle<()> {
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                probe.check().await;
            }
        })
    }
}

#[async_trait]
impl Connectivity for HealthProbe {
    async fn check(&self) -> bool {
        let online = self.remote.health().await;
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                server = %self.remote.base_url(),
                "Server is {}",
                if online { "reachable" } else { "unreachable" }
            );
        }
        online
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
