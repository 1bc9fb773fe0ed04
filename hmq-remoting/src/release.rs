//! Release-exactly-once wrapper for bounded permits.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OwnedSemaphorePermit;

/// Returns a semaphore permit at most once, however many paths race to do it.
#[derive(Debug)]
pub struct ReleaseOnce {
    released: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl ReleaseOnce {
    pub fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            released: AtomicBool::new(false),
            permit: Mutex::new(Some(permit)),
        }
    }

    /// Releases the permit. Returns `true` only for the call that released it.
    pub fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            drop(self.permit.lock().take());
            true
        } else {
            false
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
