//! Shutdown signalling for the worker.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable trigger for a graceful worker shutdown.
///
/// Every clone talks to the same worker; triggering twice is harmless.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
        }
    }

    /// Asks the worker to stop consuming, drain and close.
    pub fn trigger(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.signal.borrow()
    }

    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once shutdown has been requested. Never resolves if every
/// handle is dropped without triggering.
pub(crate) async fn requested(receiver: &mut watch::Receiver<bool>) {
    if receiver.wait_for(|triggered| *triggered).await.is_err() {
        std::future::pending::<()>().await;
    }
}
