use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide stop signal
///
/// Triggered by Ctrl-C, by the end of a replay, or by a sink that ran out
/// of storage. In the last case the run ends with an error after draining.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    fatal: Arc<AtomicBool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn trigger_fatal(&self) {
        self.fatal.store(true, Ordering::SeqCst);
        self.trigger();
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once triggered
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // the sender lives in self, so this only ends on a trigger
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
