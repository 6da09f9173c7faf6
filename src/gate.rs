//! Admission control for proxied streams.
//!
//! A [`ConcurrencyGate`] counts active streams and refuses new ones once the
//! configured maximum is reached. Admission hands out a [`Permit`]; the slot
//! is released exactly when the permit is dropped, so every exit path of a
//! session gives its slot back.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A held slot. Dropping it frees the slot.
pub type Permit = OwnedSemaphorePermit;

/// Process-wide limit on admitted streams.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyGate {
    /// Creates a gate admitting up to `max` streams at once.
    ///
    /// `max` is capped at [`Semaphore::MAX_PERMITS`].
    #[must_use]
    pub fn new(max: usize) -> Self {
        let max = max.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Takes a slot if one is free. Never waits.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Permit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.max.saturating_sub(self.semaphore.available_permits())
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
