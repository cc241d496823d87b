//! Concurrency limiter
//!
//! A fixed-capacity token pool bounding how many expensive operations run at
//! once. The manager keeps two independent instances: one gating archive
//! open/staging, one gating page extraction. Permits release on drop, so a
//! slot is returned on every exit path including panic and task cancellation.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub(crate) struct Limiter {
    semaphore: Arc<Semaphore>,
}

/// A held slot. Dropping it frees the slot.
pub(crate) struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Limiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Wait for a free slot. Suspends the caller; never busy-waits.
    pub async fn acquire(&self) -> Permit {
        let permit = Semaphore::acquire_owned(self.semaphore.clone())
            .await
            // The semaphore is never closed; failure here is a programming error.
            .expect("limiter semaphore closed");
        Permit { _permit: permit }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
