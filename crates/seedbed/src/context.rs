//! Plan-wide row accounting and cooperative stop.

use std::sync::atomic::{AtomicU64, Ordering};

/// Row counter shared by every node of one plan, with an optional cap.
///
/// Producers call [`ExecutionContext::keep_running`] between flush passes and
/// for every fetched row; once the cap is reached all of them stop.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    rows: AtomicU64,
    cap: Option<u64>,
}

impl ExecutionContext {
    /// Context stopping after `cap` rows, or never
    pub fn new(cap: Option<u64>) -> Self {
        Self {
            rows: AtomicU64::new(0),
            cap,
        }
    }

    /// Whether producers may continue
    #[inline]
    pub fn keep_running(&self) -> bool {
        self.cap.map_or(true, |cap| self.rows() < cap)
    }

    /// Count one captured row
    #[inline]
    pub fn record_row(&self) {
        self.rows.fetch_add(1, Ordering::Relaxed);
    }

    /// Rows captured so far
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Configured cap
    pub fn cap(&self) -> Option<u64> {
        self.cap
    }
}
