//! # Error types used by the supervisor runtime.
//!
//! Errors are split per domain so that each failure carries the policy the
//! control loop applies to it:
//!
//! - [`ConfigError`] problems loading or validating the job specification.
//! - [`EnvError`] failures while resolving the child environment vector.
//! - [`SecretError`] failures surfaced by the secret-store client.
//! - [`SpawnError`] per-spawn failures (fork/exec, identity lookup, IPC).
//! - [`RuntimeError`] fatal conditions raised by the control loop itself.
//!
//! [`EnvError`] and [`RuntimeError`] provide `as_label` helpers producing
//! short stable snake_case labels for log records.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised while loading or validating the application config.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read from disk.
    #[error("unable to load config {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The config file is not valid JSON for the expected schema.
    #[error("unable to parse config: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },
    /// A `kill-signal` value does not name a known Unix signal.
    #[error("invalid signal {name:?}")]
    InvalidSignal { name: String },
    /// A `run-as` value has more than two colon-separated parts.
    #[error("invalid run-as string {value:?}")]
    InvalidRunAs { value: String },
    /// An init job was configured with a restart policy other than `never`.
    #[error("init job {job:?} must use restart policy \"never\"")]
    InitRestartPolicy { job: String },
    /// A job has an empty `cmd` array.
    #[error("job {job:?} has an empty command")]
    EmptyCommand { job: String },
}

/// Errors raised while materializing the child environment vector.
///
/// Every variant names the environment variable (or secret path) that
/// triggered the failure; environment preparation is all-or-nothing.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EnvError {
    /// A replacement value does not have the `type:path:field` shape.
    #[error("error parsing vault variable {name}: expected type:path:field")]
    SecretRef { name: String },
    /// A replacement names a secret type the resolver does not know.
    #[error("invalid secret type {kind:?} for variable {name}")]
    UnknownSecretType { name: String, kind: String },
    /// A credential-backed replacement selects a field the credential does
    /// not expose.
    #[error("unknown field {field:?} for {kind} credential {name}")]
    UnknownField {
        name: String,
        kind: &'static str,
        field: String,
    },
    /// A free-form secret does not contain the requested member.
    #[error("secret {path} has no field {field:?}")]
    MissingField { path: String, field: String },
    /// The secret store failed while fetching a referenced path.
    #[error("vault error for variable {name}: {source}")]
    Store {
        name: String,
        #[source]
        source: SecretError,
    },
    /// A template variable failed to parse.
    #[error("template failed to parse for {name}: {reason}")]
    TemplateParse { name: String, reason: String },
    /// A template referenced a name that is not a configured replacement.
    #[error("error processing template {name}: {reason}")]
    TemplateRender { name: String, reason: String },
}

impl EnvError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EnvError::SecretRef { .. } => "env_secret_ref",
            EnvError::UnknownSecretType { .. } => "env_unknown_secret_type",
            EnvError::UnknownField { .. } => "env_unknown_field",
            EnvError::MissingField { .. } => "env_missing_field",
            EnvError::Store { .. } => "env_store",
            EnvError::TemplateParse { .. } => "env_template_parse",
            EnvError::TemplateRender { .. } => "env_template_render",
        }
    }
}

/// Errors surfaced by a [`SecretClient`](crate::secrets::SecretClient).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SecretError {
    /// Authentication against the store failed.
    #[error("unable to authenticate: {reason}")]
    Auth { reason: String },
    /// A credential renewal failed; critical renewals tear the supervisor
    /// down.
    #[error("error renewing secret {name}: {reason}")]
    Renewal { name: String, reason: String },
    /// The store backend rejected or could not serve a request.
    #[error("secret store error: {reason}")]
    Backend { reason: String },
}

/// Errors raised while starting a single child process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SpawnError {
    /// Creating the control pipe failed.
    #[error("unable to create control pipe: {0}")]
    ControlPipe(#[source] Errno),
    /// Forking or exec-ing the trampoline failed.
    #[error("error starting subprocess: {0}")]
    Spawn(#[source] io::Error),
    /// The configured `run-as` user does not exist.
    #[error("unable to resolve uid for user {user:?}")]
    UserLookup { user: String },
    /// The configured `run-as` group does not exist.
    #[error("unable to resolve gid for group {group:?}")]
    GroupLookup { group: String },
    /// Writing the control message to the trampoline failed.
    #[error("error writing to subprocess: {0}")]
    ControlWrite(#[source] serde_json::Error),
}

/// Fatal errors raised by the supervisor control loop.
///
/// Any of these terminates the supervisor with exit code 1 after the
/// shutdown sequence (terminate handles, drain tasks, final reap).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("error loading config: {0}")]
    Config(#[from] ConfigError),
    #[error("unable to prepare environment: {0}")]
    Env(#[from] EnvError),
    #[error("secret client error: {0}")]
    Secrets(#[from] SecretError),
    /// `PR_SET_CHILD_SUBREAPER` could not be set; running without it would
    /// leak grandchildren as zombies.
    #[error("unable to become subreaper: {0}")]
    Subreaper(#[source] Errno),
    /// The signal bridge could not be installed.
    #[error("unable to install signal handlers: {0}")]
    SignalSetup(#[source] io::Error),
    /// An init job could not be started.
    #[error("error starting init job {name}: {source}")]
    InitSpawn {
        name: String,
        #[source]
        source: SpawnError,
    },
    /// Waiting on an init job failed.
    #[error("error running init job {name}: {source}")]
    InitWait {
        name: String,
        #[source]
        source: io::Error,
    },
    /// An init job ran but exited non-zero.
    #[error("init job {name} exited non-zero: {code}")]
    InitJob { name: String, code: i32 },
    /// A critical main job could not be started or restarted.
    #[error("error starting job {name}: {source}")]
    JobStart {
        name: String,
        #[source]
        source: SpawnError,
    },
    /// A critical main job exhausted its restart budget.
    #[error("critical job {name} failed permanently")]
    JobFailed { name: String },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Config(_) => "runtime_config",
            RuntimeError::Env(_) => "runtime_env",
            RuntimeError::Secrets(_) => "runtime_secrets",
            RuntimeError::Subreaper(_) => "runtime_subreaper",
            RuntimeError::SignalSetup(_) => "runtime_signal_setup",
            RuntimeError::InitSpawn { .. } => "runtime_init_spawn",
            RuntimeError::InitWait { .. } => "runtime_init_wait",
            RuntimeError::InitJob { .. } => "runtime_init_job",
            RuntimeError::JobStart { .. } => "runtime_job_start",
            RuntimeError::JobFailed { .. } => "runtime_job_failed",
        }
    }
}
