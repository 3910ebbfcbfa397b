//! Shared "recent API write" timestamp.
//!
//! Every engine mutation stamps the clock before touching disk; the watcher
//! backends drop file-system reactions that arrive inside their window.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct ApiWriteClock {
    last: Arc<Mutex<Option<Instant>>>,
}

impl ApiWriteClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn last_write(&self) -> Option<Instant> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if the last write happened less than `window` ago.
    pub fn within(&self, window: Duration) -> bool {
        self.last_write()
            .is_some_and(|at| at.elapsed() < window)
    }
}
