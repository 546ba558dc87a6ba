//! Cooperative cancellation shared by the producer and scan workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

struct Inner {
    cancelled: AtomicBool,
    // Held only so the receiver stays connected; dropped on cancel so that
    // every blocked `recv` on `rx` wakes immediately.
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// A one-shot cancellation token.
///
/// Clones share state. Polling via [`is_cancelled`](Self::is_cancelled) is
/// cheap; blocked channel operations observe cancellation by including
/// [`observe`](Self::observe) in a `crossbeam_channel::select!`, whose arm
/// fires (with a disconnect error) the moment [`cancel`](Self::cancel) runs.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.tx.lock().take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Channel endpoint that disconnects when the token fires; for use in
    /// `select!` arms alongside data channels.
    pub fn observe(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
