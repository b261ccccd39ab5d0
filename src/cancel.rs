//! Cooperative cancellation shared by the engine, the uploader and the orchestrator

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raised once (e.g. on Ctrl+C); checked at segment and part boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
