//! # Job state machine and restart controller.
//!
//! One [`JobState`] per main job, owned exclusively by the control loop.
//!
//! ```text
//!            spawn ok                  child exit
//!  (new) ──► Running ──────────────────────┬──► Exited   (policy: stay down)
//!              ▲                           ├──► Backoff  (restart scheduled)
//!              │ backoff elapsed, spawn ok │
//!              └───────────────────────────┘──► Failed   (budget exhausted)
//! ```
//!
//! The controller applies the job's restart policy and budgets on every
//! exit: running continuously for `success-lifetime` closes the current
//! restart burst (the attempt counter and backoff clock reset), and a
//! burst that exceeds `restart-max-retries` attempts or `restart-max-time`
//! wall time fails the job. Failed critical jobs tear the supervisor
//! down; non-critical ones are abandoned.

use std::time::{Duration, Instant};

use crate::config::Command;
use crate::policies::BackoffPolicy;
use crate::runner::CommandHandle;

/// Lifecycle phase of one main job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// A child is running under this job.
    Running,
    /// The child exited and the policy keeps the job down.
    Exited,
    /// A restart is scheduled on the backoff clock.
    Backoff,
    /// The restart budget is exhausted; the job stays down for good.
    Failed,
}

/// Outcome of applying the restart policy to a child exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// A restart was scheduled after `delay`.
    Restart { delay: Duration },
    /// The policy does not restart this exit; the job rests in `Exited`.
    Stay,
    /// The retry budget is exhausted; the job is `Failed`.
    Fail,
}

/// Control-loop-owned state for one main job.
pub struct JobState {
    pub spec: Command,
    pub handle: Option<CommandHandle>,
    phase: JobPhase,
    started_at: Instant,
    attempts: i64,
    first_attempt_at: Option<Instant>,
    prev_delay: Option<Duration>,
    next_attempt_at: Option<Instant>,
    backoff: BackoffPolicy,
}

impl JobState {
    pub fn new(spec: Command) -> Self {
        Self {
            spec,
            handle: None,
            phase: JobPhase::Exited,
            started_at: Instant::now(),
            attempts: 0,
            first_attempt_at: None,
            prev_delay: None,
            next_attempt_at: None,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Attaches a freshly spawned child and starts its uptime clock.
    pub fn mark_running(&mut self, handle: CommandHandle) {
        self.handle = Some(handle);
        self.phase = JobPhase::Running;
        self.started_at = Instant::now();
        self.next_attempt_at = None;
    }

    /// Marks a failed (re)start attempt; the job stays down for good.
    pub fn mark_failed(&mut self) {
        self.phase = JobPhase::Failed;
        self.next_attempt_at = None;
    }

    /// Applies the restart policy to a child exit with `status`.
    pub fn on_exit(&mut self, status: i32) -> RestartDecision {
        self.phase = JobPhase::Exited;

        // A long enough run closes the current restart burst.
        if self.started_at.elapsed() >= self.spec.success_lifetime {
            self.attempts = 0;
            self.first_attempt_at = None;
            self.prev_delay = None;
        }

        if !self.spec.restart_policy().should_restart(status) {
            return RestartDecision::Stay;
        }

        let now = Instant::now();
        self.attempts += 1;
        let first = *self.first_attempt_at.get_or_insert(now);

        let retries_exhausted = self.spec.restart_max_retries >= 0
            && self.attempts > self.spec.restart_max_retries;
        let window_exhausted = now.duration_since(first) > self.spec.restart_max_time;
        if retries_exhausted || window_exhausted {
            self.mark_failed();
            return RestartDecision::Fail;
        }

        let delay = self.backoff.next(self.prev_delay);
        self.prev_delay = Some(delay);
        self.next_attempt_at = Some(now + delay);
        self.phase = JobPhase::Backoff;
        RestartDecision::Restart { delay }
    }

    /// Whether a scheduled restart has come due.
    pub fn due(&self, now: Instant) -> bool {
        self.phase == JobPhase::Backoff
            && self.next_attempt_at.is_some_and(|at| at <= now)
    }
}
