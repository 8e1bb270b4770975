//! # Restart policies for supervised jobs.
//!
//! [`RestartPolicy`] determines whether a job is restarted after its child
//! process terminates.
//!
//! - [`RestartPolicy::Always`] restart unconditionally, regardless of exit
//!   status.
//! - [`RestartPolicy::Never`] the job runs once and is never restarted.
//! - [`RestartPolicy::UnlessSuccess`] restart only when the exit status is
//!   non-zero.
//!
//! The config layer applies per-section defaults: main jobs default to
//! `always`, init jobs to `never` (and may not use anything else).

use serde::Deserialize;

/// Policy controlling whether a job is restarted after its child exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Always restart the job if it stops running.
    Always,
    /// Never restart: the job runs once and exits permanently.
    Never,
    /// Restart only when the exit status is non-zero.
    UnlessSuccess,
}

impl RestartPolicy {
    /// Returns whether a child that exited with `status` should be
    /// restarted under this policy.
    pub fn should_restart(self, status: i32) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::UnlessSuccess => status != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_holds_regardless_of_status() {
        assert!(!RestartPolicy::Never.should_restart(0));
        assert!(!RestartPolicy::Never.should_restart(7));
    }

    #[test]
    fn always_restarts_even_on_success() {
        assert!(RestartPolicy::Always.should_restart(0));
        assert!(RestartPolicy::Always.should_restart(137));
    }

    #[test]
    fn unless_success_checks_the_status() {
        assert!(!RestartPolicy::UnlessSuccess.should_restart(0));
        assert!(RestartPolicy::UnlessSuccess.should_restart(1));
    }

    #[test]
    fn deserializes_kebab_case_names() {
        let p: RestartPolicy = serde_json::from_str("\"unless-success\"").unwrap();
        assert_eq!(p, RestartPolicy::UnlessSuccess);
        let p: RestartPolicy = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(p, RestartPolicy::Always);
        assert!(serde_json::from_str::<RestartPolicy>("\"sometimes\"").is_err());
    }
}
