//! Swarm mode: repoint services at the newest digest of their tag and let
//! the orchestrator roll them.

use async_trait::async_trait;
use bollard::models::{ServiceSpec, TaskSpec, TaskSpecContainerSpec};

use super::{EngineError, ModeKind, PassReport, UpdateContext, UpdateMode, UpdatedWorkload, apply_all};
use crate::detector::Detector;
use crate::digest;
use crate::image_ref::ImageRef;
use crate::runtime::{RuntimeError, Service};

/// `spec` pointing at `image`, with the force-update counter bumped so the
/// orchestrator redeploys even when nothing else changed.
pub fn updated_spec(spec: &ServiceSpec, image: &str) -> ServiceSpec {
    let mut spec = spec.clone();
    let task = spec.task_template.get_or_insert_with(TaskSpec::default);
    task.container_spec
        .get_or_insert_with(TaskSpecContainerSpec::default)
        .image = Some(image.to_string());
    task.force_update = Some(task.force_update.unwrap_or_default() + 1);
    spec
}

/// A stale service and the pinned image it should move to.
struct ServiceUpdate {
    service: Service,
    image: String,
    workload: UpdatedWorkload,
}

pub struct ServiceMode {
    ctx: UpdateContext,
}

impl ServiceMode {
    pub fn new(ctx: UpdateContext) -> Self {
        Self { ctx }
    }

    /// Digest the service runs now: the pinned one, else whatever the local
    /// engine holds for its tag.
    async fn current_digest(&self, service: &Service, reference: &ImageRef) -> Result<Option<String>, RuntimeError> {
        if let Some(pinned) = &reference.digest {
            return Ok(Some(digest::remove_sha_prefix(pinned).to_string()));
        }
        match self.ctx.runtime.inspect_image(&reference.tagged()).await {
            Ok(image) => Ok(digest::resolve(Some(&image)).ok()),
            Err(RuntimeError::NotFound(_)) => {
                log::warn!("{} has no pinned digest and no local image", service.name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn check(&self, detector: &Detector<'_>, service: &Service) -> Result<Option<ServiceUpdate>, RuntimeError> {
        let current = ImageRef::parse(&service.image);
        let Some(old_digest) = self.current_digest(service, &current).await? else {
            return Ok(None);
        };

        let reference = detector.reference_for(&service.image);
        let candidate = self.ctx.runtime.pull_image(&reference).await?;
        let Ok(new_digest) = digest::resolve(Some(&candidate)) else {
            log::warn!("No digest for {reference}, skipping {}", service.name);
            return Ok(None);
        };

        if digest::same_content(&old_digest, &new_digest) {
            log::debug!("{} is up to date", service.name);
            return Ok(None);
        }
        log::info!(
            "{} is stale: running {} but {reference} is {}",
            service.name,
            digest::short_digest(&old_digest),
            digest::short_digest(&new_digest)
        );
        Ok(Some(ServiceUpdate {
            service: service.clone(),
            image: reference.pinned(&new_digest),
            workload: UpdatedWorkload {
                name: service.name.clone(),
                old_image: old_digest,
                new_image: new_digest,
            },
        }))
    }
}

#[async_trait]
impl UpdateMode for ServiceMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Service
    }

    fn endpoint(&self) -> &str {
        self.ctx.endpoint()
    }

    async fn update(&self) -> Result<PassReport, EngineError> {
        let _pass = self.ctx.lock_pass().await;
        let config = self.ctx.config();
        let runtime = self.ctx.runtime.as_ref();
        let endpoint = runtime.endpoint().to_string();
        let detector = Detector::new(runtime, config);

        let services: Vec<Service> = runtime
            .list_services()
            .await?
            .into_iter()
            .filter(|s| config.selection.includes(&s.name, &s.labels))
            .collect();
        log::debug!("Checking {} services on {endpoint}", services.len());
        let mut report = PassReport::new(&endpoint, services.len());

        let mut stale = Vec::new();
        for service in &services {
            match self.check(&detector, service).await {
                Ok(Some(update)) => stale.push(update),
                Ok(None) => {}
                Err(e) => {
                    log::error!("{}: {e}", service.name);
                    report.failures.push(format!("{}: {e}", service.name));
                }
            }
        }

        if config.is_read_only() {
            for update in &stale {
                log::info!("Service {} would be updated to {}", update.service.name, update.image);
                report.detected.push(update.workload.clone());
            }
            self.ctx.finish_pass(&report);
            return Ok(report);
        }

        let outcomes = apply_all(&stale, config.single, config.single_wait, |update| async move {
            log::info!("Updating service {} to {}", update.service.name, update.image);
            runtime
                .update_service(
                    &update.service.id,
                    update.service.version,
                    updated_spec(&update.service.spec, &update.image),
                )
                .await
        })
        .await;

        for (update, outcome) in stale.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    self.ctx.shared.data.add_updated(&endpoint, 1);
                    report.updated.push(update.workload.clone());
                }
                Err(e) => {
                    log::error!("Failed to update service {}: {e}", update.service.name);
                    report.failures.push(format!("{}: {e}", update.service.name));
                }
            }
        }

        self.ctx.finish_pass(&report);
        Ok(report)
    }

    async fn self_check(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::engine::Shared;
    use crate::metrics::DataManager;
    use crate::notify::NotificationManager;
    use crate::runtime::fake::{FakeRuntime, Op};

    const SOCKET: &str = "unix:///var/run/docker.sock";

    fn mode(runtime: &Arc<FakeRuntime>, config: Config) -> ServiceMode {
        let shared = Shared {
            config: Arc::new(config),
            data: Arc::new(DataManager::default()),
            notifier: Arc::new(NotificationManager::default()),
        };
        ServiceMode::new(UpdateContext::new(runtime.clone(), shared))
    }

    fn swarm() -> Config {
        Config {
            swarm: true,
            ..Config::default()
        }
    }

    #[test]
    fn test_updated_spec_bumps_force_update() {
        let spec = ServiceSpec::default();
        let once = updated_spec(&spec, "web:v1@sha256:def456");
        let task = once.task_template.as_ref().unwrap();
        assert_eq!(task.force_update, Some(1));
        assert_eq!(
            task.container_spec.as_ref().unwrap().image.as_deref(),
            Some("web:v1@sha256:def456")
        );

        let twice = updated_spec(&once, "web:v1@sha256:fff999");
        assert_eq!(twice.task_template.unwrap().force_update, Some(2));
    }

    #[tokio::test]
    async fn test_stale_service_is_repinned() {
        let runtime = Arc::new(FakeRuntime::new(SOCKET));
        runtime.add_service("web", "web:v1@sha256:abc123");
        runtime.publish("web:v1", "def456");

        let report = mode(&runtime, swarm()).update().await.unwrap();
        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.updated[0].old_image, "abc123");
        assert_eq!(report.updated[0].new_image, "def456");

        let service = &runtime.services()[0];
        assert_eq!(service.image, "web:v1@sha256:def456");
        assert_eq!(service.version, 8);
    }

    #[tokio::test]
    async fn test_current_service_is_untouched() {
        let runtime = Arc::new(FakeRuntime::new(SOCKET));
        runtime.add_service("web", "web:v1@sha256:abc123");
        runtime.publish("web:v1", "abc123");

        let report = mode(&runtime, swarm()).update().await.unwrap();
        assert_eq!(report.monitored, 1);
        assert!(report.updated.is_empty());
        assert!(!runtime.mutated());
    }

    #[tokio::test]
    async fn test_dry_run_service() {
        let runtime = Arc::new(FakeRuntime::new(SOCKET));
        runtime.add_service("web", "web:v1@sha256:abc123");
        runtime.publish("web:v1", "def456");

        let config = Config {
            dry_run: true,
            ..swarm()
        };
        let report = mode(&runtime, config).update().await.unwrap();
        assert_eq!(report.detected.len(), 1);
        assert!(!runtime.mutated());
    }

    #[tokio::test]
    async fn test_failed_service_update_is_reported() {
        let runtime = Arc::new(FakeRuntime::new(SOCKET));
        runtime.add_service("web", "web:v1@sha256:abc123");
        runtime.add_service("api", "api:v2@sha256:0a0a0a");
        runtime.publish("web:v1", "def456");
        runtime.publish("api:v2", "0b0b0b");
        runtime.fail_on(Op::UpdateService, "svc-web");

        let report = mode(&runtime, swarm()).update().await.unwrap();
        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.updated[0].name, "api");
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_unpinned_service_without_local_image_is_skipped() {
        let runtime = Arc::new(FakeRuntime::new(SOCKET));
        runtime.add_service("web", "web:v1");
        runtime.publish("web:v1", "def456");

        let report = mode(&runtime, swarm()).update().await.unwrap();
        assert!(report.updated.is_empty());
        assert!(report.failures.is_empty());
    }
}
