use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

/// Cooperative stop flag for the daemon loop.
///
/// Built on a `watch` channel so a receiver obtained after `trigger()` still
/// observes the stop. The loop `select!`s on [`ShutdownSignal::wait`]
/// between sweeps; a sweep already running is allowed to finish.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn trigger(&self) {
        if self.tx.send_replace(true) {
            warn!("shutdown already triggered");
        } else {
            info!("shutdown signal triggered");
        }
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // An Err means every sender is gone, which cannot happen while
        // `self` holds one.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Trigger on ctrl-c. Runs until the signal arrives.
    pub async fn listen_for_ctrl_c(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received");
                self.trigger();
            }
            Err(e) => warn!(error = %e, "unable to listen for ctrl-c"),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
