//! Execution policies applied by the restart controller.

mod backoff;
mod restart;

pub use backoff::BackoffPolicy;
pub use restart::RestartPolicy;
