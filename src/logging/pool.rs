//! Concurrent pool of reusable [`LogRecord`]s.

use std::sync::{Arc, Mutex};

use crate::logging::record::LogRecord;

/// Shared pool of log records.
///
/// Any task may acquire and release records concurrently. Released records
/// are reset before being pooled; reset drops oversized buffers, so the
/// pool never retains storage past the record cap.
#[derive(Clone, Default)]
pub struct RecordPool {
    inner: Arc<Mutex<Vec<LogRecord>>>,
}

impl RecordPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a blank record with `time` stamped.
    pub fn acquire(&self) -> LogRecord {
        let popped = match self.inner.lock() {
            Ok(mut pool) => pool.pop(),
            Err(_) => None,
        };
        match popped {
            Some(mut rec) => {
                rec.reset();
                rec
            }
            None => LogRecord::new(),
        }
    }

    /// Resets `rec` and returns it to the pool.
    pub fn release(&self, mut rec: LogRecord) {
        rec.reset();
        if let Ok(mut pool) = self.inner.lock() {
            pool.push(rec);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|p| p.len()).unwrap_or(0)
    }
}
