//! The subscriber's copy of the most recent payload.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use relay_core::Payload;

/// Last payload received from the hub. Each update replaces the whole
/// document; there is no merge.
#[derive(Debug, Default)]
pub struct LocalState {
    current: RwLock<Payload>,
    updates: AtomicU64,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored payload.
    pub fn apply(&self, payload: Payload) {
        *self.current.write() = payload;
        let _ = self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the stored payload.
    pub fn get(&self) -> Payload {
        self.current.read().clone()
    }

    /// Payloads applied since start.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}
