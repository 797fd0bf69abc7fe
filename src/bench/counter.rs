//! Shared tally of successful, validated calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Top bit of the cell marks the counter as sealed.
const SEALED: u64 = 1 << 63;

/// Why an increment was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refused {
    /// A fatal error was detected; nothing may be counted any more.
    Sealed,
    /// The configured request limit has been reached.
    Limit,
}

/// Monotonic counter shared by every Worker (writers) and the Monitor
/// (reader).
///
/// Cloning yields another handle to the same cell. The value only ever
/// grows. Once [`seal`](Self::seal)ed, or once it reaches its limit, it
/// refuses further increments.
#[derive(Debug, Clone)]
pub struct ThroughputCounter {
    cell: Arc<AtomicU64>,
    limit: Option<u64>,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(AtomicU64::new(0)),
            limit: None,
        }
    }

    /// A counter that stops accepting increments at `limit`.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            cell: Arc::new(AtomicU64::new(0)),
            limit: Some(limit.min(SEALED - 1)),
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Count one call. Returns the new total.
    ///
    /// Lock-free; concurrent increments are never lost.
    pub fn increment(&self) -> Result<u64, Refused> {
        self.cell
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current & SEALED != 0 {
                    return None;
                }
                match self.limit {
                    Some(limit) if current >= limit => None,
                    _ => Some(current + 1),
                }
            })
            .map(|previous| previous + 1)
            .map_err(|current| {
                if current & SEALED != 0 {
                    Refused::Sealed
                } else {
                    Refused::Limit
                }
            })
    }

    /// Current total. Never blocks writers.
    pub fn read(&self) -> u64 {
        self.cell.load(Ordering::Acquire) & !SEALED
    }

    /// Refuse every later increment. Returns the total at the moment of
    /// sealing.
    pub fn seal(&self) -> u64 {
        self.cell.fetch_or(SEALED, Ordering::AcqRel) & !SEALED
    }

    pub fn is_sealed(&self) -> bool {
        self.cell.load(Ordering::Acquire) & SEALED != 0
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}
