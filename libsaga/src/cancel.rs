use crate::error::{SagaError, SagaResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// cooperative cancellation signal checked by the long-running driver loops
/// (scan, materialize, merge)
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// bails with `Cancelled` if the signal has been raised
    pub fn check(&self) -> SagaResult<()> {
        if self.is_cancelled() {
            bail!(SagaError::Cancelled);
        }
        Ok(())
    }
}
