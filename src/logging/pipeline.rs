//! Line scanner and encoder tasks around the shared log channel.
//!
//! [`pump_stream`] runs once per child stream and turns newline-separated
//! output into pooled [`LogRecord`]s. Submission to the channel is
//! non-blocking: when the channel is full the record is dropped, which is
//! the backpressure bound for log volume. Blocking the pumps instead would
//! eventually block the child on its stdout write.
//!
//! [`stdout_writer`] is the single sink task: it serializes each record as
//! one JSON object per line and returns the record to the pool.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::logging::pool::RecordPool;
use crate::logging::record::{LogRecord, StreamKind};

/// Capacity of the shared log channel.
pub const LOG_CHANNEL_CAPACITY: usize = 100;

/// Process name used for the supervisor's own diagnostics.
const INTERNAL_PROCESS: &str = "internal";

/// Producer handle for the shared log channel.
///
/// Cloned into every log pump and into the control loop, which uses
/// [`Logger::log`] for its own diagnostics.
#[derive(Clone)]
pub struct Logger {
    tx: mpsc::Sender<LogRecord>,
    pool: RecordPool,
}

impl Logger {
    /// Creates the shared channel; the receiver half belongs to the sink.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                pool: RecordPool::new(),
            },
            rx,
        )
    }

    /// The record pool shared with the pumps and the sink.
    pub fn pool(&self) -> &RecordPool {
        &self.pool
    }

    /// Logs a supervisor diagnostic as `process="internal"`.
    ///
    /// Internal messages wait for channel space instead of dropping.
    pub async fn log(&self, message: impl AsRef<str>) {
        let mut rec = self.pool.acquire();
        rec.process.push_str(INTERNAL_PROCESS);
        rec.message.extend_from_slice(message.as_ref().as_bytes());
        if let Err(unsent) = self.tx.send(rec).await {
            self.pool.release(unsent.0);
        }
    }

    /// Submits a record without blocking. Returns `false` (and recycles
    /// the record) when the channel is full or closed.
    pub fn submit(&self, rec: LogRecord) -> bool {
        match self.tx.try_send(rec) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(rec))
            | Err(mpsc::error::TrySendError::Closed(rec)) => {
                self.pool.release(rec);
                false
            }
        }
    }
}

/// Scans a child stream as newline-separated records until EOF or
/// cancellation.
pub async fn pump_stream<R>(
    stream: R,
    name: String,
    kind: StreamKind,
    logger: Logger,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);

    loop {
        let mut rec = logger.pool().acquire();
        rec.process.push_str(&name);
        rec.stream = kind;

        let done = tokio::select! {
            res = reader.read_until(b'\n', &mut rec.message) => {
                !matches!(res, Ok(n) if n > 0)
            }
            _ = token.cancelled() => true,
        };
        if done {
            logger.pool().release(rec);
            return;
        }

        while matches!(rec.message.last(), Some(b'\n' | b'\r')) {
            rec.message.pop();
        }
        rec.stamp();
        logger.submit(rec);
    }
}

/// Single sink task: serializes records from the shared channel to `out`.
///
/// On cancellation the already-buffered records are drained before the
/// task returns, so fatal diagnostics are not lost.
pub async fn stdout_writer<W>(
    mut logs: mpsc::Receiver<LogRecord>,
    pool: RecordPool,
    token: CancellationToken,
    mut out: W,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(256);

    loop {
        tokio::select! {
            maybe = logs.recv() => match maybe {
                Some(rec) => write_record(&mut out, &mut buf, rec, &pool).await,
                None => break,
            },
            _ = token.cancelled() => {
                while let Ok(rec) = logs.try_recv() {
                    write_record(&mut out, &mut buf, rec, &pool).await;
                }
                break;
            }
        }
    }
    let _ = out.flush().await;
}

async fn write_record<W>(out: &mut W, buf: &mut Vec<u8>, rec: LogRecord, pool: &RecordPool)
where
    W: AsyncWrite + Unpin,
{
    buf.clear();
    if serde_json::to_writer(&mut *buf, &rec).is_ok() {
        buf.push(b'\n');
        let _ = out.write_all(buf).await;
    }
    pool.release(rec);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn pump_emits_one_record_per_line() {
        let (logger, mut rx) = Logger::new(8);
        let (mut writer, reader) = tokio::io::duplex(1024);
        let token = CancellationToken::new();

        let pump = tokio::spawn(pump_stream(
            reader,
            "web".to_string(),
            StreamKind::Stderr,
            logger.clone(),
            token,
        ));

        writer.write_all(b"first line\nsecond\n").await.unwrap();
        drop(writer);
        pump.await.unwrap();

        let rec = rx.recv().await.unwrap();
        assert_eq!(rec.process, "web");
        assert_eq!(rec.stream, StreamKind::Stderr);
        assert_eq!(rec.message, b"first line");
        let rec = rx.recv().await.unwrap();
        assert_eq!(rec.message, b"second");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pump_stops_on_cancellation() {
        let (logger, _rx) = Logger::new(8);
        let (_writer, reader) = tokio::io::duplex(1024);
        let token = CancellationToken::new();

        let pump = tokio::spawn(pump_stream(
            reader,
            "web".to_string(),
            StreamKind::Stdout,
            logger,
            token.clone(),
        ));
        token.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn full_channel_drops_the_record() {
        let (logger, _rx) = Logger::new(1);
        assert!(logger.submit(logger.pool().acquire()));
        assert!(!logger.submit(logger.pool().acquire()));
    }

    #[tokio::test]
    async fn writer_emits_json_lines_and_recycles_records() {
        let (logger, rx) = Logger::new(8);
        let (mut read_side, write_side) = tokio::io::duplex(4096);
        let token = CancellationToken::new();

        let writer = tokio::spawn(stdout_writer(
            rx,
            logger.pool().clone(),
            token,
            write_side,
        ));

        logger.log("supervisor came up").await;
        drop(logger);
        writer.await.unwrap();

        let mut out = String::new();
        read_side.read_to_string(&mut out).await.unwrap();
        let line = out.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["process"], "internal");
        assert_eq!(value["stream"], 0);
        assert_eq!(value["message"], "supervisor came up");
        assert!(value["time"].as_i64().unwrap() > 0);
    }
}
