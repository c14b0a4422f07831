//! One-shot barrier used to order a physical request's setup work before anything else happens on
//! that request.
use std::sync::Arc;

use tokio::sync::watch;

/// A gate starts closed and is opened exactly once.  Waiting on an open gate returns immediately,
/// and opening it releases every current waiter.  It never closes again.
///
/// Clones share the same gate.
#[derive(Clone, Debug)]
pub struct InitGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InitGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the gate.
    ///
    /// Returns `true` if this call opened it, `false` if it was already open.
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();

        // `wait_for` checks the current value first, so a gate that's already open doesn't
        // suspend.  It can only fail if the sender is dropped, which can't happen while `self`
        // holds it.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Return a guard that opens the gate when dropped.
    ///
    /// Used to guarantee the gate opens even if the work it's guarding fails or panics.
    pub fn open_on_drop(&self) -> OpenOnDrop {
        OpenOnDrop(self.clone())
    }
}

/// See [`InitGate::open_on_drop`]
#[must_use = "the gate opens as soon as this guard is dropped"]
pub struct OpenOnDrop(InitGate);

impl Drop for OpenOnDrop {
    fn drop(&mut self) {
        self.0.open();
    }
}
