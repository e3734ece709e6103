//! Cooperative cancellation for the receive loop.
//!
//! The token is shared between the signal hook and the multiplexer. Cancelling
//! sets a flag and wakes the poller; the loop only looks at the flag around
//! its readiness wait, never in the middle of a read.

use mio::Waker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Some(waker) = self.inner.waker.lock().as_ref() {
            let _ = waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Route future cancellations to `waker`. A cancellation that already
    /// happened wakes it immediately.
    pub fn attach_waker(&self, waker: Arc<Waker>) {
        let mut slot = self.inner.waker.lock();
        if self.is_cancelled() {
            let _ = waker.wake();
        }
        *slot = Some(waker);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancel `token` on SIGINT/SIGTERM. Only one hook may exist per process.
pub fn install_interrupt_hook(token: CancellationToken) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Shutting down...");
        token.cancel();
    })
}
