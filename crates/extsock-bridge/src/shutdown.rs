use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::error;

/// Cooperative cancellation shared by every part of one device instance.
///
/// Cancelling is one-way. A fault also cancels, and keeps the message of the
/// first fatal error so the owner can report why the device stopped.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopping: AtomicBool,
    fault: OnceLock<String>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown.
    pub fn cancel(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Record a fatal error and cancel. Only the first fault is kept.
    pub fn fail(&self, reason: impl fmt::Display) {
        let reason = reason.to_string();
        if self.inner.fault.set(reason.clone()).is_ok() {
            error!(reason = %reason, "device fault");
        }
        self.cancel();
    }

    /// The first recorded fault, if any.
    pub fn fault(&self) -> Option<&str> {
        self.inner.fault.get().map(String::as_str)
    }
}

impl fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("cancelled", &self.is_cancelled())
            .field("fault", &self.fault())
            .finish()
    }
}
