//! Process-wide shutdown signalling.
//!
//! A single [`ShutdownController`] owns the root signal; every concurrent
//! root (HTTP server, ingestion consumer, syncer ticker, OTLP server,
//! catalog flusher) holds a [`Shutdown`] subscription and exits when
//! signalled. Subsystems that need a drain phase (the ingestion consumer)
//! bound it with their own grace deadline after observing the signal.

use tokio::sync::watch;

/// Owner of the root shutdown signal.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);

        Self { tx }
    }

    /// Creates a new subscription to the shutdown signal.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    /// Fires the shutdown signal. Idempotent.
    pub fn signal(&self) {
        // NOTE: send_replace rather than send so signalling doesn't fail
        // when every subscriber has already exited.
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription to the root shutdown signal.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Completes when the shutdown signal fires.
    ///
    /// Immediately completes if the signal has already fired or the
    /// controller is gone.
    pub async fn signalled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the shutdown signal has already fired.
    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_the_signal() {
        let controller = ShutdownController::new();
        let mut shutdown = controller.subscribe();

        assert!(!shutdown.is_signalled());

        controller.signal();

        shutdown.signalled().await;
        assert!(shutdown.is_signalled());
    }

    #[tokio::test]
    async fn dropped_controller_releases_subscribers() {
        let controller = ShutdownController::new();
        let mut shutdown = controller.subscribe();

        drop(controller);

        // Must not hang.
        shutdown.signalled().await;
    }
}
