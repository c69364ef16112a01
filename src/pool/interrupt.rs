//! Cooperative cancellation for blocking pool operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cloneable cancellation token.
///
/// An acquirer blocked inside [`crate::pool::Pool::get`] polls its token at
/// every wake-up; once interrupted, the operation unwinds with
/// [`crate::error::Error::Interrupted`] and any counter increments it
/// performed are rolled back. Shutdown paths interrupt their in-flight
/// acquisitions and silently absorb the resulting error.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
