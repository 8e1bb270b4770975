//! # Supervisor control loop.
//!
//! One task owns all job state and multiplexes every event source the
//! supervisor reacts to:
//!
//! ```text
//!  signal bridge ──┐
//!  secret failures ─┤
//!  reaper drain ────┼──► control loop ──► CommandRunner ──► children
//!  1 s ticker ──────┤         │
//!  root cancel ─────┘         └──► restart controller (JobState)
//! ```
//!
//! ## Startup order
//! 1. signal bridge, 2. log sink, 3. config, 4. secret client,
//! 5. authenticate + background renewal, 6. environment vector,
//! 7. `PR_SET_CHILD_SUBREAPER` (strictly before any spawn),
//! 8. renewal watcher, 9. serial init jobs, 10. main jobs, 11. loop.
//!
//! ## Shutdown
//! Every exit path funnels through the same sequence: terminate each
//! handle at most once, cancel the root token, drain the task tracker
//! (pumps, sink, renewal tasks), and reap a final time. `SIGTERM`/
//! `SIGINT` exit 0; every fatal error exits 1.

use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::prctl;
use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::AppConfig;
use crate::error::{RuntimeError, SecretError};
use crate::jobs::{JobState, RestartDecision};
use crate::logging::{stdout_writer, Logger, LOG_CHANNEL_CAPACITY};
use crate::reaper;
use crate::runner::{exit_status_code, CommandHandle, CommandRunner};
use crate::secrets::{self, ClientOptions};
use crate::signals::{self, SignalSource};

/// Owns the runtime scaffolding shared by every supervisor task.
pub struct Supervisor {
    root: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Runs the supervisor to completion and returns the process exit
    /// code.
    pub async fn run(self, config_path: &Path, opts: &ClientOptions) -> i32 {
        let mut signal_source = match signals::setup() {
            Ok(source) => source,
            Err(err) => {
                // The log sink does not exist yet.
                eprintln!("simplevisor: {}", RuntimeError::SignalSetup(err));
                return 1;
            }
        };

        let (logger, log_rx) = Logger::new(LOG_CHANNEL_CAPACITY);
        self.tracker.spawn(stdout_writer(
            log_rx,
            logger.pool().clone(),
            self.root.clone(),
            tokio::io::stdout(),
        ));

        let code = match self
            .supervise(&mut signal_source, &logger, config_path, opts)
            .await
        {
            Ok(code) => code,
            Err(err) => {
                logger
                    .log(format!("supervisor: fatal [{}]: {err}", err.as_label()))
                    .await;
                1
            }
        };

        // Common teardown: stop every task, flush the sink, reap once
        // more so nothing is left as a zombie.
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let _ = reaper::reap_children();
        code
    }

    async fn supervise(
        &self,
        signal_source: &mut SignalSource,
        logger: &Logger,
        config_path: &Path,
        opts: &ClientOptions,
    ) -> Result<i32, RuntimeError> {
        let cfg = AppConfig::load(config_path)?;

        let client = secrets::connect(opts).await?;
        client
            .authenticate()
            .await
            .map_err(RuntimeError::Secrets)?;
        {
            let client = client.clone();
            let token = self.root.clone();
            self.tracker.spawn(async move { client.run(token).await });
        }

        let vault_token = client.token().unwrap_or_default();
        let environment = crate::env::prepare(&cfg.env, client.as_ref(), &vault_token).await?;

        // Strictly before any spawn: grandchildren reparent to us, not to
        // pid 1 of the outer world.
        prctl::set_child_subreaper(true).map_err(RuntimeError::Subreaper)?;

        let (failure_tx, mut failures) = mpsc::channel::<SecretError>(1);
        self.tracker.spawn(secrets::watch_renewals(
            client.notifications(),
            logger.clone(),
            failure_tx,
            self.root.clone(),
        ));

        let runner = CommandRunner {
            logger: logger.clone(),
            tracker: self.tracker.clone(),
            base: self.root.clone(),
            environment,
        };

        self.run_init_jobs(&cfg, &runner, logger).await?;

        let mut jobs = Vec::with_capacity(cfg.jobs.main.len());
        for spec in cfg.jobs.main.iter().cloned() {
            let mut job = JobState::new(spec);
            logger
                .log(format!("starting main job {}", job.spec.name))
                .await;
            match runner.run(&job.spec) {
                Ok(handle) => job.mark_running(handle),
                Err(err) => {
                    if job.spec.critical() {
                        let name = job.spec.name.clone();
                        jobs.push(job);
                        Self::terminate_all(&mut jobs, logger).await;
                        return Err(RuntimeError::JobStart { name, source: err });
                    }
                    logger
                        .log(format!(
                            "error starting non-critical job {}: {err}",
                            job.spec.name
                        ))
                        .await;
                    job.mark_failed();
                }
            }
            jobs.push(job);
        }

        let result = self
            .steady_loop(signal_source, &mut failures, &mut jobs, &runner, logger)
            .await;
        Self::terminate_all(&mut jobs, logger).await;
        result
    }

    /// Runs each init job serially to successful completion.
    async fn run_init_jobs(
        &self,
        cfg: &AppConfig,
        runner: &CommandRunner,
        logger: &Logger,
    ) -> Result<(), RuntimeError> {
        for spec in &cfg.jobs.init {
            logger
                .log(format!("attempting to start init job {}", spec.name))
                .await;

            let mut handle = runner.run(spec).map_err(|source| RuntimeError::InitSpawn {
                name: spec.name.clone(),
                source,
            })?;
            let status = match handle.wait().await {
                Ok(status) => status,
                Err(source) => {
                    let _ = handle.terminate();
                    return Err(RuntimeError::InitWait {
                        name: spec.name.clone(),
                        source,
                    });
                }
            };
            handle.cleanup();

            let code = exit_status_code(&status);
            if code != 0 {
                return Err(RuntimeError::InitJob {
                    name: spec.name.clone(),
                    code,
                });
            }
        }
        Ok(())
    }

    /// The steady-state select loop. Returns the process exit code for
    /// orderly shutdowns and an error for fatal conditions; the caller
    /// terminates the remaining handles either way.
    async fn steady_loop(
        &self,
        signal_source: &mut SignalSource,
        failures: &mut mpsc::Receiver<SecretError>,
        jobs: &mut Vec<JobState>,
        runner: &CommandRunner,
        logger: &Logger,
    ) -> Result<i32, RuntimeError> {
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match reaper::reap_children() {
                Ok(exits) => {
                    for exit in exits {
                        self.handle_exit(jobs, exit, logger).await?;
                    }
                }
                Err(err) => {
                    logger.log(format!("error reaping children: {err}")).await;
                }
            }

            tokio::select! {
                maybe_sig = signal_source.recv() => match maybe_sig {
                    Some(sig @ (Signal::SIGTERM | Signal::SIGINT)) => {
                        logger
                            .log(format!("received {sig}, shutting down"))
                            .await;
                        return Ok(0);
                    }
                    Some(sig) => self.proxy_signal(jobs, sig, logger).await,
                    None => return Ok(0),
                },
                maybe_failure = failures.recv() => match maybe_failure {
                    Some(err) => {
                        logger
                            .log(format!("critical secret failure: {err}"))
                            .await;
                        return Ok(1);
                    }
                    // The watcher only goes away during cancellation.
                    None => return Ok(0),
                },
                _ = self.root.cancelled() => return Ok(0),
                _ = tick.tick() => {
                    self.service_restarts(jobs, runner, logger).await?;
                }
            }
        }
    }

    /// Routes one reaped exit to its owning job and applies the restart
    /// policy. Exits of adopted orphans are logged and dropped.
    async fn handle_exit(
        &self,
        jobs: &mut [JobState],
        exit: reaper::ChildExit,
        logger: &Logger,
    ) -> Result<(), RuntimeError> {
        logger
            .log(format!("reaped child {} with exit {}", exit.pid, exit.status))
            .await;

        let owner = jobs
            .iter_mut()
            .find(|job| job.handle.as_ref().map(CommandHandle::pid) == Some(exit.pid));
        let Some(job) = owner else {
            return Ok(());
        };

        if let Some(handle) = job.handle.take() {
            handle.cleanup();
        }

        match job.on_exit(exit.status) {
            RestartDecision::Restart { delay } => {
                logger
                    .log(format!(
                        "job {} exited with {}; restarting in {}s",
                        job.spec.name,
                        exit.status,
                        delay.as_secs(),
                    ))
                    .await;
            }
            RestartDecision::Stay => {
                logger
                    .log(format!(
                        "job {} exited with {}; policy keeps it down",
                        job.spec.name, exit.status,
                    ))
                    .await;
            }
            RestartDecision::Fail => {
                if job.spec.critical() {
                    return Err(RuntimeError::JobFailed {
                        name: job.spec.name.clone(),
                    });
                }
                logger
                    .log(format!(
                        "non-critical job {} failed permanently; abandoning",
                        job.spec.name,
                    ))
                    .await;
            }
        }
        Ok(())
    }

    /// Forwards a non-shutdown signal to every running main job.
    async fn proxy_signal(&self, jobs: &[JobState], sig: Signal, logger: &Logger) {
        for job in jobs {
            if let Some(handle) = &job.handle {
                if let Err(err) = handle.signal(sig) {
                    logger
                        .log(format!(
                            "error proxying {sig} to job {}: {err}",
                            job.spec.name
                        ))
                        .await;
                }
            }
        }
    }

    /// Respawns every job whose backoff timer has elapsed.
    async fn service_restarts(
        &self,
        jobs: &mut [JobState],
        runner: &CommandRunner,
        logger: &Logger,
    ) -> Result<(), RuntimeError> {
        let now = Instant::now();
        for job in jobs.iter_mut() {
            if !job.due(now) {
                continue;
            }
            logger
                .log(format!("restarting job {}", job.spec.name))
                .await;
            match runner.run(&job.spec) {
                Ok(handle) => job.mark_running(handle),
                Err(err) => {
                    if job.spec.critical() {
                        return Err(RuntimeError::JobStart {
                            name: job.spec.name.clone(),
                            source: err,
                        });
                    }
                    logger
                        .log(format!(
                            "error restarting non-critical job {}: {err}",
                            job.spec.name
                        ))
                        .await;
                    job.mark_failed();
                }
            }
        }
        Ok(())
    }

    /// Delivers each handle's kill signal exactly once and releases it.
    async fn terminate_all(jobs: &mut [JobState], logger: &Logger) {
        for job in jobs.iter_mut() {
            if let Some(handle) = job.handle.take() {
                if let Err(err) = handle.terminate() {
                    logger
                        .log(format!(
                            "error terminating job {}: {err}",
                            job.spec.name
                        ))
                        .await;
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
