//! # Structured log plumbing shared by the supervisor and its children.
//!
//! Child stdout/stderr and the supervisor's own diagnostics all flow as
//! [`LogRecord`]s through one bounded channel into a single writer task
//! that emits one JSON object per line on standard output.
//!
//! ```text
//!  child stdout ──► pump ──┐
//!  child stderr ──► pump ──┤
//!                          ├──► channel ──► StdoutWriter ──► stdout
//!  control loop ── Logger ─┘        │
//!                                   └── full? record dropped (lossy)
//! ```
//!
//! Records are pooled ([`RecordPool`]) so steady-state logging does not
//! allocate; buffers that grow past [`MAX_BUFFER_SIZE`] are discarded on
//! release instead of being retained.

mod pipeline;
mod pool;
mod record;

pub use pipeline::{pump_stream, stdout_writer, Logger, LOG_CHANNEL_CAPACITY};
pub use pool::RecordPool;
pub use record::{LogRecord, StreamKind, MAX_BUFFER_SIZE};
