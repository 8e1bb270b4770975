//! # Declarative job and environment configuration.
//!
//! [`AppConfig`] is read once from a JSON file at startup and is immutable
//! afterwards. Unknown fields are ignored; `env` and `jobs` are required.
//! Durations use the human form (`"5s"`, `"1m"`, `"1h"`).
//!
//! Per-section defaults are applied by [`AppConfig::validate`]: init jobs
//! default to restart policy `never` (anything else is a configuration
//! error) and `critical = true`; main jobs default to `always` and
//! `critical = false`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::policies::RestartPolicy;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Environment preparation rules shared by every job.
    pub env: EnvConfig,
    /// Init and main job lists.
    pub jobs: JobsConfig,
}

impl AppConfig {
    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: PathBuf::from(path),
            source,
        })?;
        let mut cfg: AppConfig =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse { source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies per-section defaults and rejects inconsistent job specs.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for job in &mut self.jobs.init {
            if job.command.is_empty() {
                return Err(ConfigError::EmptyCommand {
                    job: job.name.clone(),
                });
            }
            match job.restart_policy {
                None => job.restart_policy = Some(RestartPolicy::Never),
                Some(RestartPolicy::Never) => {}
                Some(_) => {
                    return Err(ConfigError::InitRestartPolicy {
                        job: job.name.clone(),
                    })
                }
            }
            job.critical.get_or_insert(true);
        }
        for job in &mut self.jobs.main {
            if job.command.is_empty() {
                return Err(ConfigError::EmptyCommand {
                    job: job.name.clone(),
                });
            }
            job.restart_policy.get_or_insert(RestartPolicy::Always);
            job.critical.get_or_insert(false);
        }
        Ok(())
    }
}

/// Rules for building the child environment vector.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvConfig {
    /// Pass every variable from the supervisor environment through to the
    /// subprocess. Replacements and templates are still applied. When set,
    /// `pass` is ignored.
    #[serde(rename = "pass-all", default)]
    pub pass_all_variables: bool,

    /// Variables from the supervisor environment to pass through, in order.
    /// Only these are exported when `pass-all` is false.
    #[serde(rename = "pass", default)]
    pub pass_variables: Vec<String>,

    /// Export `VAULT_TOKEN` with the login token the supervisor obtained.
    /// Implies `VAULT_ADDR` is also passed through when present.
    #[serde(rename = "vault-token", default)]
    pub set_vault_token: bool,

    /// Variables whose values are secret references of the form
    /// `type:path:field`, where `type` is one of `db`, `secret`, or
    /// `aws-user`. The referenced secret is fetched once per path and its
    /// field is exported under the same variable name. Membership here does
    /// not imply membership in `pass`.
    #[serde(rename = "vault-replace", default)]
    pub vault_replacements: Vec<String>,

    /// Variables whose values are `{{.NAME}}` templates referring to
    /// expanded replacements, for example a connection string assembled
    /// from a fetched username and password. Referring to a variable that
    /// is not a replacement is an error. Membership here does not imply
    /// membership in `pass`.
    #[serde(rename = "vault-template", default)]
    pub vault_template_variables: Vec<String>,
}

/// Init and main job lists.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobsConfig {
    /// Jobs run serially to completion before any main job starts. A
    /// non-zero exit from any of these aborts startup.
    #[serde(default)]
    pub init: Vec<Command>,

    /// Long-lived foreground jobs run in parallel after the init jobs,
    /// subject to the restart policy.
    #[serde(default)]
    pub main: Vec<Command>,
}

/// One job specification.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawCommand")]
pub struct Command {
    /// Display name used in log records. Defaults to the basename of the
    /// first command element.
    pub name: String,

    /// Command name and arguments. A command name without a path prefix is
    /// searched in the PATH of the prepared environment.
    pub command: Vec<String>,

    /// Per-job override of the pass-through whitelist. Parsed and retained;
    /// the resolved environment vector is currently shared by all jobs.
    pub pass_variables: Option<Vec<String>>,

    /// Declares that the process already emits JSON log lines. Currently
    /// has no effect.
    pub logs_json: bool,

    /// User to run the job as, from the `run-as` stanza (`user` or
    /// `user:group`, default `root:root`).
    pub run_as_user: String,
    /// Group to run the job as.
    pub run_as_group: String,

    /// Signal delivered on clean termination. Default `SIGKILL`.
    pub kill_signal: Signal,

    /// Restart policy; resolved to a per-section default by
    /// [`AppConfig::validate`].
    pub(crate) restart_policy: Option<RestartPolicy>,

    /// Failed restart attempts allowed before the job is considered failed.
    /// `-1` means unlimited. The counter resets after each successful
    /// start.
    pub restart_max_retries: i64,

    /// Total time allowed for restart attempts before the job is
    /// considered failed. Default 1 hour.
    pub restart_max_time: Duration,

    /// Continuous runtime after which the job counts as successfully
    /// started and the retry counter resets. Default 1 minute.
    pub success_lifetime: Duration,

    /// Whether permanent failure of this job tears the supervisor down;
    /// resolved to a per-section default by [`AppConfig::validate`].
    pub(crate) critical: Option<bool>,
}

impl Command {
    /// Restart policy, resolved during config validation.
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy.unwrap_or(RestartPolicy::Never)
    }

    /// Criticality, resolved during config validation.
    pub fn critical(&self) -> bool {
        self.critical.unwrap_or(false)
    }
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(default)]
    name: String,
    #[serde(default)]
    cmd: Vec<String>,
    #[serde(default)]
    pass: Option<Vec<String>>,
    #[serde(rename = "logs-json", default)]
    logs_json: bool,
    #[serde(rename = "run-as", default)]
    run_as: String,
    #[serde(rename = "kill-signal", default)]
    kill_signal: String,
    #[serde(rename = "restart-policy", default)]
    restart_policy: Option<RestartPolicy>,
    #[serde(rename = "restart-max-retries", default)]
    restart_max_retries: Option<i64>,
    #[serde(rename = "restart-max-time", default, with = "humantime_serde::option")]
    restart_max_time: Option<Duration>,
    #[serde(rename = "success-lifetime", default, with = "humantime_serde::option")]
    success_lifetime: Option<Duration>,
    #[serde(default)]
    critical: Option<bool>,
}

impl TryFrom<RawCommand> for Command {
    type Error = ConfigError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let kill_signal = if raw.kill_signal.is_empty() {
            Signal::SIGKILL
        } else {
            parse_signal(&raw.kill_signal)?
        };

        let (run_as_user, run_as_group) = parse_run_as(&raw.run_as)?;

        let name = if raw.name.is_empty() {
            raw.cmd.first().map(|argv0| basename(argv0)).unwrap_or_default()
        } else {
            raw.name
        };

        Ok(Command {
            name,
            command: raw.cmd,
            pass_variables: raw.pass,
            logs_json: raw.logs_json,
            run_as_user,
            run_as_group,
            kill_signal,
            restart_policy: raw.restart_policy,
            restart_max_retries: raw.restart_max_retries.unwrap_or(-1),
            restart_max_time: raw
                .restart_max_time
                .unwrap_or_else(|| Duration::from_secs(3600)),
            success_lifetime: raw
                .success_lifetime
                .unwrap_or_else(|| Duration::from_secs(60)),
            critical: raw.critical,
        })
    }
}

/// Parses a signal name without the `SIG` prefix (`"KILL"`, `"TERM"`).
/// Prefixed names are accepted as well.
fn parse_signal(name: &str) -> Result<Signal, ConfigError> {
    let full = if name.starts_with("SIG") {
        name.to_owned()
    } else {
        format!("SIG{name}")
    };
    full.parse().map_err(|_| ConfigError::InvalidSignal {
        name: name.to_owned(),
    })
}

/// Splits a `run-as` stanza into `(user, group)`, defaulting to
/// `root:root`.
fn parse_run_as(value: &str) -> Result<(String, String), ConfigError> {
    let parts: Vec<&str> = value.split(':').collect();
    match parts.as_slice() {
        [""] => Ok(("root".to_owned(), "root".to_owned())),
        [user] => Ok(((*user).to_owned(), "root".to_owned())),
        [user, group] => Ok(((*user).to_owned(), (*group).to_owned())),
        _ => Err(ConfigError::InvalidRunAs {
            value: value.to_owned(),
        }),
    }
}

fn basename(argv0: &str) -> String {
    Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv0.to_owned())
}

// Human-readable Duration fields ("5s", "1m", "1h").
mod humantime_serde {
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let value: Option<String> = Option::deserialize(deserializer)?;
            value
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
