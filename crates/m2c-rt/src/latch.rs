//! ---
//! m2c_section: "01-core-functionality"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Non-reentrant guard around the control dispatcher."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Boolean latch: at most one holder at a time, released when the guard drops.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyLatch {
    held: Arc<AtomicBool>,
}

impl ReentrancyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the latch, or `None` if someone already holds it. Never blocks.
    pub fn try_acquire(&self) -> Option<LatchGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LatchGuard {
                held: Arc::clone(&self.held),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the latch on drop, including during unwinding.
#[derive(Debug)]
pub struct LatchGuard {
    held: Arc<AtomicBool>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
