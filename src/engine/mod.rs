//! Update engines: one pass over an endpoint's workloads.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Config;
use crate::detector::{DetectError, UpdateDecision};
use crate::metrics::DataManager;
use crate::notify::{NotificationEvent, NotificationManager};
use crate::runtime::{RuntimeClient, RuntimeError};

pub mod container;
pub mod swarm;

pub use container::{ContainerMode, Stage};
pub use swarm::ServiceMode;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Endpoint {endpoint} is unreachable: {source}")]
    EndpointUnreachable {
        endpoint: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Failed to recreate {name} while {stage}: {source}")]
    Recreation {
        name: String,
        stage: Stage,
        #[source]
        source: RuntimeError,
    },
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Process wide collaborators every engine reports to.
#[derive(Clone)]
pub struct Shared {
    pub config: Arc<Config>,
    pub data: Arc<DataManager>,
    pub notifier: Arc<NotificationManager>,
}

/// Everything a pass over one endpoint needs.
pub struct UpdateContext {
    pub runtime: Arc<dyn RuntimeClient>,
    pub shared: Shared,
    /// Held for the whole of a pass so jobs on one endpoint never overlap.
    pass_lock: tokio::sync::Mutex<()>,
}

impl UpdateContext {
    pub fn new(runtime: Arc<dyn RuntimeClient>, shared: Shared) -> Self {
        Self {
            runtime,
            shared,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.runtime.endpoint()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub(crate) async fn lock_pass(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.pass_lock.lock().await
    }

    /// Record counters, notify and export metrics for a finished pass.
    pub(crate) fn finish_pass(&self, report: &PassReport) {
        let data = &self.shared.data;
        data.set_monitored(&report.endpoint, report.monitored);
        let total = data.total_updated(&report.endpoint);
        if let Some(event) = report.event(total, self.config().monitor_only) {
            self.shared.notifier.send(event);
        }
        data.export(&report.endpoint);
    }
}

/// A workload replaced (or found replaceable) during a pass. Images are
/// canonical digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatedWorkload {
    pub name: String,
    pub old_image: String,
    pub new_image: String,
}

impl From<&UpdateDecision> for UpdatedWorkload {
    fn from(decision: &UpdateDecision) -> Self {
        Self {
            name: decision.container.name.clone(),
            old_image: decision.old_digest.clone(),
            new_image: decision.new_digest.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub endpoint: String,
    pub monitored: usize,
    pub updated: Vec<UpdatedWorkload>,
    /// Stale workloads left alone because of dry-run or monitor-only.
    pub detected: Vec<UpdatedWorkload>,
    pub failures: Vec<String>,
}

impl PassReport {
    pub fn new(endpoint: &str, monitored: usize) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            monitored,
            ..Default::default()
        }
    }

    /// The notification this pass produces, if any.
    pub fn event(&self, total_updated: u64, monitor_only: bool) -> Option<NotificationEvent> {
        if !self.updated.is_empty() {
            Some(NotificationEvent::Updated {
                endpoint: self.endpoint.clone(),
                monitored: self.monitored,
                total_updated,
                updates: self.updated.clone(),
            })
        } else if monitor_only && !self.detected.is_empty() {
            Some(NotificationEvent::DetectedUpdates {
                endpoint: self.endpoint.clone(),
                monitored: self.monitored,
                total_updated,
                updates: self.detected.clone(),
            })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Container,
    Service,
}

#[async_trait]
pub trait UpdateMode: Send + Sync {
    fn kind(&self) -> ModeKind;

    fn endpoint(&self) -> &str;

    /// Run one update pass over the endpoint.
    async fn update(&self) -> Result<PassReport, EngineError>;

    /// Clean up after a self update.
    async fn self_check(&self) -> Result<(), EngineError>;
}

/// Apply `f` to every item, one at a time with `wait` in between when
/// `single` is set, otherwise concurrently.
pub(crate) async fn apply_all<'a, T, F, Fut>(
    items: &'a [T],
    single: bool,
    wait: Duration,
    f: F,
) -> Vec<Fut::Output>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future,
{
    if !single {
        return futures::future::join_all(items.iter().map(f)).await;
    }
    let mut outputs = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        if i > 0 && !wait.is_zero() {
            log::info!("Waiting {wait:?} before the next update");
            tokio::time::sleep(wait).await;
        }
        outputs.push(f(item).await);
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updated(name: &str) -> UpdatedWorkload {
        UpdatedWorkload {
            name: name.to_string(),
            old_image: "abc123".to_string(),
            new_image: "def456".to_string(),
        }
    }

    #[test]
    fn test_event_for_updates() {
        let mut report = PassReport::new("unix:///var/run/docker.sock", 3);
        report.updated.push(updated("web"));
        match report.event(4, false) {
            Some(NotificationEvent::Updated {
                monitored,
                total_updated,
                updates,
                ..
            }) => {
                assert_eq!(monitored, 3);
                assert_eq!(total_updated, 4);
                assert_eq!(updates, vec![updated("web")]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_detected_only_notifies_in_monitor_only() {
        let mut report = PassReport::new("unix:///var/run/docker.sock", 1);
        report.detected.push(updated("web"));
        assert!(report.event(0, false).is_none());
        assert!(matches!(
            report.event(0, true),
            Some(NotificationEvent::DetectedUpdates { .. })
        ));
    }

    #[test]
    fn test_quiet_pass_has_no_event() {
        let report = PassReport::new("unix:///var/run/docker.sock", 1);
        assert!(report.event(0, true).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_all_single_waits_between_items() {
        let started = tokio::time::Instant::now();
        let items = [1, 2, 3];
        let out = apply_all(&items, true, Duration::from_secs(5), |i| async move { *i * 2 }).await;
        assert_eq!(out, vec![2, 4, 6]);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_apply_all_parallel_keeps_order() {
        let items = [1, 2, 3];
        let out = apply_all(&items, false, Duration::from_secs(5), |i| async move { *i + 1 }).await;
        assert_eq!(out, vec![2, 3, 4]);
    }
}
