//! Reusable log record with a bounded inline buffer.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::ser::Serializer;
use serde::Serialize;

/// Message buffers larger than this are not retained across reuse.
pub const MAX_BUFFER_SIZE: usize = 4_000;

/// Which child stream a record was scanned from.
///
/// Serialized as `0` (stdout) / `1` (stderr).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout = 0,
    Stderr = 1,
}

impl Serialize for StreamKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// One log line attributed to a process and stream.
///
/// Records are owned by a [`RecordPool`](crate::logging::RecordPool) and
/// reused; [`LogRecord::reset`] restores the blank state and stamps the
/// current wall clock.
#[derive(Debug, Serialize)]
pub struct LogRecord {
    /// Originating process name (`"internal"` for the supervisor itself).
    pub process: String,
    /// Unix timestamp in seconds.
    pub time: i64,
    /// Source stream.
    pub stream: StreamKind,
    /// Raw line bytes, emitted as a (lossy) UTF-8 string.
    #[serde(serialize_with = "serialize_lossy")]
    pub message: Vec<u8>,
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

impl LogRecord {
    pub fn new() -> Self {
        Self {
            process: String::new(),
            time: unix_now(),
            stream: StreamKind::Stdout,
            message: Vec::new(),
        }
    }

    /// Clears process/stream/message and stamps `time` with the current
    /// wall clock. Oversized message storage is dropped rather than kept.
    pub fn reset(&mut self) {
        self.process.clear();
        self.stream = StreamKind::Stdout;
        self.time = unix_now();
        if self.message.capacity() > MAX_BUFFER_SIZE {
            self.message = Vec::new();
        } else {
            self.message.clear();
        }
    }

    /// Re-stamps `time` with the current wall clock.
    pub fn stamp(&mut self) {
        self.time = unix_now();
    }
}

impl Default for LogRecord {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_fields_and_stamps_time() {
        let mut rec = LogRecord::new();
        rec.process.push_str("worker");
        rec.stream = StreamKind::Stderr;
        rec.message.extend_from_slice(b"boom");

        rec.reset();
        assert!(rec.process.is_empty());
        assert_eq!(rec.stream, StreamKind::Stdout);
        assert!(rec.message.is_empty());
        assert!(rec.time > 0);
    }

    #[test]
    fn reset_keeps_small_buffers() {
        let mut rec = LogRecord::new();
        rec.message.reserve(1_000);
        let cap = rec.message.capacity();
        rec.reset();
        assert_eq!(rec.message.capacity(), cap);
    }

    #[test]
    fn reset_discards_oversized_buffers() {
        let mut rec = LogRecord::new();
        rec.message.reserve(MAX_BUFFER_SIZE + 1);
        rec.reset();
        assert_eq!(rec.message.capacity(), 0);
    }

    #[test]
    fn serializes_as_flat_json_object() {
        let mut rec = LogRecord::new();
        rec.process.push_str("web");
        rec.time = 1700000000;
        rec.stream = StreamKind::Stderr;
        rec.message.extend_from_slice(b"listen failed");

        let value: serde_json::Value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["process"], "web");
        assert_eq!(value["time"], 1700000000);
        assert_eq!(value["stream"], 1);
        assert_eq!(value["message"], "listen failed");
    }
}
