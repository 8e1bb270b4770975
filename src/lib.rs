//! # simplevisor
//!
//! **Simplevisor** is a lightweight process supervisor meant to run as
//! PID 1 (or a sub-reaper) inside a container.
//!
//! It reads a declarative job specification, prepares a child environment
//! with secret material injected as variables, spawns children under
//! configured identities through a privilege-dropping trampoline, streams
//! their output as structured log records, proxies signals, reaps
//! zombies, and applies per-job restart policies with exponential
//! backoff.
//!
//! | Area               | Description                                                   | Key types / traits                      |
//! |--------------------|---------------------------------------------------------------|-----------------------------------------|
//! | **Configuration**  | Declarative env + job spec, read once from JSON.              | [`AppConfig`], [`Command`]              |
//! | **Environment**    | Secret replacement and templating into a `KEY=VALUE` vector.  | [`env::prepare`], [`SecretClient`]      |
//! | **Process control**| Trampoline fork/exec, signal proxying, zombie reaping.        | [`CommandRunner`], [`CommandHandle`]    |
//! | **Supervision**    | Job state machine, restart policies, backoff.                 | [`Supervisor`], [`RestartPolicy`]       |
//! | **Logging**        | Pooled records over one bounded channel to a JSON sink.       | [`Logger`], [`LogRecord`]               |
//! | **Errors**         | Typed errors with the control-loop policy for each kind.      | [`RuntimeError`], [`EnvError`]          |
//!
//! The binary runs in two modes: the default parent mode hosts the
//! supervisor; `--mode child` is the trampoline half of the spawn
//! protocol and is re-invoked by the supervisor itself.

pub mod child;
pub mod config;
pub mod env;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod policies;
pub mod reaper;
pub mod runner;
pub mod secrets;
pub mod signals;
pub mod supervisor;

pub use config::{AppConfig, Command, EnvConfig, JobsConfig};
pub use error::{ConfigError, EnvError, RuntimeError, SecretError, SpawnError};
pub use logging::{LogRecord, Logger, RecordPool, StreamKind};
pub use policies::{BackoffPolicy, RestartPolicy};
pub use runner::{CommandHandle, CommandRunner};
pub use secrets::{ClientOptions, NoopClient, SecretClient};
pub use supervisor::Supervisor;
