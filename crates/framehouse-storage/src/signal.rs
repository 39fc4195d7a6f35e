//! One-shot latch
//!
//! A `Signal` starts unresolved and can be resolved exactly once; every
//! waiter, past or future, then completes. Clones share the same latch.
//! Used for "record written", "more records coming" index slots, read
//! cancellation, and read completion.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A latch that is already resolved
    pub fn resolved() -> Self {
        let signal = Self::new();
        signal.resolve();
        signal
    }

    /// Resolve the latch. Later calls are no-ops.
    pub fn resolve(&self) {
        self.tx.send_if_modified(|value| {
            let changed = !*value;
            *value = true;
            changed
        });
    }

    pub fn is_resolved(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is resolved.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the only exit is resolution.
        let _ = rx.wait_for(|resolved| *resolved).await;
    }

    /// Two handles to the same latch
    pub fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}
