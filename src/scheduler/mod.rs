//! Per-endpoint jobs and the loop that fires them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::{Config, UpdatePolicy};
use crate::engine::{
    ContainerMode, EngineError, ModeKind, ServiceMode, Shared, UpdateContext, UpdateMode,
};
use crate::runtime::RuntimeClient;

pub mod trigger;

pub use trigger::{Trigger, coalesce, next_run};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    SelfCheck,
    RunOnce,
    IntervalUpdate,
    CronUpdate,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::SelfCheck => "self-check",
            JobKind::RunOnce => "run-once",
            JobKind::IntervalUpdate => "interval",
            JobKind::CronUpdate => "cron",
        };
        f.write_str(s)
    }
}

impl JobKind {
    fn for_policy(policy: &UpdatePolicy) -> Self {
        match policy {
            UpdatePolicy::RunOnce => JobKind::RunOnce,
            UpdatePolicy::Interval(_) => JobKind::IntervalUpdate,
            UpdatePolicy::Cron(_) => JobKind::CronUpdate,
        }
    }
}

/// Wall clock driven by tokio's monotonic clock, so paused-time tests and
/// real runs see the same arithmetic.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    mono: tokio::time::Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: tokio::time::Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall + self.mono.elapsed()
    }
}

/// A unit of scheduled work bound to one endpoint.
pub struct Job {
    pub kind: JobKind,
    pub trigger: Trigger,
    pub grace: Option<Duration>,
    mode: Arc<dyn UpdateMode>,
}

impl Job {
    pub fn endpoint(&self) -> &str {
        self.mode.endpoint()
    }

    async fn execute(&self) {
        let endpoint = self.endpoint();
        if self.kind == JobKind::SelfCheck {
            if let Err(e) = self.mode.self_check().await {
                log::error!("Self check on {endpoint} failed: {e}");
            }
            return;
        }
        match self.mode.update().await {
            Ok(report) => log::info!(
                "Pass on {endpoint} done: {} monitored, {} updated, {} detected, {} failed",
                report.monitored,
                report.updated.len(),
                report.detected.len(),
                report.failures.len()
            ),
            Err(e) => log::error!("Pass on {endpoint} failed: {e}"),
        }
    }

    /// Fire until the trigger runs out or shutdown is requested. A run in
    /// progress always completes; fires missed meanwhile are coalesced.
    async fn run(self, clock: Clock, mut shutdown: watch::Receiver<bool>) {
        let Some(mut due) = self.trigger.first_fire(clock.now()) else {
            log::warn!("{} job on {} never fires", self.kind, self.endpoint());
            return;
        };
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = (due - clock.now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }

            let firing = coalesce(&self.trigger, due, clock.now(), self.grace);
            if firing.coalesced > 0 {
                log::debug!(
                    "{} job on {} coalesced {} missed runs",
                    self.kind,
                    self.endpoint(),
                    firing.coalesced
                );
            }
            if firing.run {
                self.execute().await;
            } else {
                log::warn!(
                    "Skipping {} job on {}: {}s late, beyond the grace period",
                    self.kind,
                    self.endpoint(),
                    firing.lateness.as_secs()
                );
            }
            match firing.next {
                Some(next) => due = next,
                None => break,
            }
        }
        log::debug!("{} job on {} finished", self.kind, self.endpoint());
    }
}

pub struct Scheduler {
    config: Arc<Config>,
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            jobs: Vec::new(),
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Check the endpoint answers, then register its jobs. An unreachable
    /// endpoint gets no jobs.
    pub async fn register_endpoint(
        &mut self,
        runtime: Arc<dyn RuntimeClient>,
        shared: &Shared,
    ) -> Result<(), EngineError> {
        let endpoint = runtime.endpoint().to_string();
        runtime
            .ping()
            .await
            .map_err(|source| EngineError::EndpointUnreachable {
                endpoint: endpoint.clone(),
                source,
            })?;

        let ctx = UpdateContext::new(runtime, shared.clone());
        let config = &self.config;
        let mode: Arc<dyn UpdateMode> = if config.swarm {
            Arc::new(ServiceMode::new(ctx))
        } else {
            Arc::new(ContainerMode::new(ctx))
        };

        // Self checks only accompany recurring passes.
        if mode.kind() == ModeKind::Container && config.policy != UpdatePolicy::RunOnce {
            self.jobs.push(Job {
                kind: JobKind::SelfCheck,
                trigger: Trigger::Once,
                grace: None,
                mode: mode.clone(),
            });
        }
        let kind = JobKind::for_policy(&config.policy);
        log::info!("Scheduling {kind} updates on {endpoint}");
        self.jobs.push(Job {
            kind,
            trigger: Trigger::from_policy(&config.policy, config.timezone),
            grace: config.grace,
            mode,
        });
        Ok(())
    }

    /// When the next update pass happens, as of `now`.
    pub fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_run(&self.config.policy, now, self.config.timezone)
    }

    /// Run every job until all have finished or shutdown is requested.
    /// Jobs on different endpoints run concurrently.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let clock = Clock::start();
        let mut tasks: JoinSet<()> = self
            .jobs
            .into_iter()
            .map(|job| job.run(clock, shutdown.clone()))
            .collect();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::error!("Job aborted: {e}");
            }
        }
        log::info!("No jobs left to run");
    }
}
