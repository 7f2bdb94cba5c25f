//! Standalone container mode: detect stale containers and recreate them.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use async_trait::async_trait;

use super::{EngineError, ModeKind, PassReport, UpdateContext, UpdateMode, UpdatedWorkload, apply_all};
use crate::detector::{Detector, UpdateDecision};
use crate::digest;
use crate::runtime::{Container, RuntimeClient, RuntimeError};
use crate::snapshot::snapshot;

/// Progress of a single recreation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detected,
    Pulled,
    Stopped,
    Removed,
    Created,
    Started,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Detected => "detected",
            Stage::Pulled => "pulled",
            Stage::Stopped => "stopped",
            Stage::Removed => "removed",
            Stage::Created => "created",
            Stage::Started => "started",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Drives one stale container from `Detected` to `Done`. Any error moves it
/// to `Failed`, which is final.
struct Recreation<'a> {
    runtime: &'a dyn RuntimeClient,
    decision: &'a UpdateDecision,
    stage: Stage,
    new_id: Option<String>,
}

impl<'a> Recreation<'a> {
    fn new(runtime: &'a dyn RuntimeClient, decision: &'a UpdateDecision) -> Self {
        Self {
            runtime,
            decision,
            stage: Stage::Detected,
            new_id: None,
        }
    }

    async fn run(mut self) -> Result<UpdatedWorkload, EngineError> {
        let name = self.decision.container.name.clone();
        loop {
            match self.advance().await {
                Ok(Stage::Done) => {
                    log::info!("{name}: {} -> {}", self.stage, Stage::Done);
                    return Ok(UpdatedWorkload::from(self.decision));
                }
                Ok(next) => {
                    log::info!("{name}: {} -> {next}", self.stage);
                    self.stage = next;
                }
                Err(source) => {
                    let stage = self.stage;
                    self.stage = Stage::Failed;
                    match self.leftover(stage) {
                        Some(leftover) => log::error!(
                            "{name}: {stage} -> {}: {source}. {leftover}",
                            Stage::Failed
                        ),
                        None => log::error!("{name}: {stage} -> {}: {source}", Stage::Failed),
                    }
                    return Err(EngineError::Recreation {
                        name,
                        stage,
                        source,
                    });
                }
            }
        }
    }

    /// What a failure while leaving `stage` leaves behind for an operator.
    fn leftover(&self, stage: Stage) -> Option<String> {
        match stage {
            Stage::Removed => Some(format!(
                "The container is now absent, recreate it from {} by hand",
                self.decision.reference
            )),
            Stage::Created => Some(format!(
                "Container {} was created from {} but is stopped, start it by hand",
                self.new_id.as_deref().unwrap_or(self.decision.container.name.as_str()),
                self.decision.reference
            )),
            _ => None,
        }
    }

    async fn advance(&mut self) -> Result<Stage, RuntimeError> {
        let decision = self.decision;
        let container = &decision.container;
        match self.stage {
            Stage::Detected => {
                // Detection already pulled; only pull again if the image went away.
                if self.runtime.inspect_image(&decision.candidate.id).await.is_err() {
                    self.runtime.pull_image(&decision.reference).await?;
                }
                Ok(Stage::Pulled)
            }
            Stage::Pulled => {
                self.runtime.stop_container(&container.id).await?;
                Ok(Stage::Stopped)
            }
            Stage::Stopped => {
                self.runtime.remove_container(&container.id).await?;
                Ok(Stage::Removed)
            }
            Stage::Removed => {
                let spec = snapshot(container, None);
                let id = self
                    .runtime
                    .create_container(&spec, &decision.reference.tagged())
                    .await?;
                self.new_id = Some(id);
                Ok(Stage::Created)
            }
            Stage::Created => {
                let id = self.new_id.as_deref().unwrap_or(container.name.as_str());
                self.runtime.start_container(id).await?;
                Ok(Stage::Started)
            }
            Stage::Started | Stage::Done | Stage::Failed => Ok(Stage::Done),
        }
    }
}

pub struct ContainerMode {
    ctx: UpdateContext,
}

impl ContainerMode {
    pub fn new(ctx: UpdateContext) -> Self {
        Self { ctx }
    }

    fn alternate_self_name(&self) -> String {
        format!("{}-updated", self.ctx.config().self_name)
    }

    fn has_self_name(&self, name: &str) -> bool {
        name == self.ctx.config().self_name || name == self.alternate_self_name()
    }

    fn is_self(&self, container: &Container) -> bool {
        let own_id = self
            .ctx
            .config()
            .self_id
            .as_deref()
            .is_some_and(|id| container.id.starts_with(id));
        own_id || self.has_self_name(&container.name)
    }

    /// Remove superseded images no running container still uses.
    async fn cleanup(&self, superseded: BTreeSet<String>) {
        if superseded.is_empty() {
            return;
        }
        let runtime = self.ctx.runtime.as_ref();
        let in_use: HashSet<String> = match runtime.list_containers().await {
            Ok(containers) => containers.into_iter().map(|c| c.image_id).collect(),
            Err(e) => {
                log::warn!("Skipping image cleanup on {}: {e}", runtime.endpoint());
                return;
            }
        };
        for id in superseded {
            if in_use.contains(&id) {
                log::debug!("Image {} is still in use", digest::short_digest(&id));
                continue;
            }
            match runtime.remove_image(&id).await {
                Ok(()) => log::info!("Removed image {}", digest::short_digest(&id)),
                Err(e) => log::warn!("Failed to remove image {}: {e}", digest::short_digest(&id)),
            }
        }
    }

    /// Start a copy of ourselves on the new image under the other self name.
    /// The copy's self check retires this container.
    async fn update_self(&self, decision: &UpdateDecision, report: &mut PassReport) {
        let config = self.ctx.config();
        let runtime = self.ctx.runtime.as_ref();
        let data = &self.ctx.shared.data;
        let current = &decision.container.name;
        let target = if *current == config.self_name {
            self.alternate_self_name()
        } else {
            config.self_name.clone()
        };

        data.add_updated(&report.endpoint, 1);
        if config.save_counters {
            if let Err(e) = data.save(&config.counters_path) {
                log::error!("Failed to save counters before self update: {e}");
            }
        }

        log::info!("Updating own container {current} as {target}");
        let spec = snapshot(&decision.container, Some(&target));
        let started = match runtime
            .create_container(&spec, &decision.reference.tagged())
            .await
        {
            Ok(id) => runtime.start_container(&id).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(()) => report.updated.push(UpdatedWorkload::from(decision)),
            Err(e) => {
                log::error!("Self update of {current} failed: {e}");
                report.failures.push(e.to_string());
            }
        }
    }
}

#[async_trait]
impl UpdateMode for ContainerMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Container
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

        let monitored = detector.monitored().await?;
        log::debug!("Checking {} containers on {endpoint}", monitored.len());
        let mut report = PassReport::new(&endpoint, monitored.len());

        let mut stale = Vec::new();
        let mut own = None;
        for container in &monitored {
            let is_self = self.is_self(container);
            if is_self && !config.self_update {
                log::debug!("Skipping own container {}", container.name);
                continue;
            }
            match detector.check(container).await {
                Ok(decision) if decision.stale => {
                    if is_self {
                        own = Some(decision);
                    } else {
                        stale.push(decision);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let e = EngineError::from(e);
                    log::error!("{e}");
                    report.failures.push(e.to_string());
                }
            }
        }

        if config.is_read_only() {
            for decision in stale.iter().chain(own.iter()) {
                log::info!(
                    "{} would be updated from {} to {}",
                    decision.container.name,
                    digest::short_digest(&decision.old_digest),
                    digest::short_digest(&decision.new_digest)
                );
                report.detected.push(UpdatedWorkload::from(decision));
            }
            self.ctx.finish_pass(&report);
            return Ok(report);
        }

        let outcomes = apply_all(&stale, config.single, config.single_wait, |decision| {
            Recreation::new(runtime, decision).run()
        })
        .await;

        let mut superseded = BTreeSet::new();
        for (decision, outcome) in stale.iter().zip(outcomes) {
            match outcome {
                Ok(updated) => {
                    self.ctx.shared.data.add_updated(&endpoint, 1);
                    superseded.insert(decision.container.image_id.clone());
                    report.updated.push(updated);
                }
                Err(e) => report.failures.push(e.to_string()),
            }
        }

        if config.cleanup {
            self.cleanup(superseded).await;
        }

        if let Some(decision) = own {
            self.update_self(&decision, &mut report).await;
        }

        self.ctx.finish_pass(&report);
        Ok(report)
    }

    async fn self_check(&self) -> Result<(), EngineError> {
        let config = self.ctx.config();
        if !config.self_update {
            return Ok(());
        }
        let _pass = self.ctx.lock_pass().await;
        let runtime = self.ctx.runtime.as_ref();

        let containers = runtime.list_containers().await?;
        let twins: Vec<&Container> = containers
            .iter()
            .filter(|c| self.has_self_name(&c.name))
            .collect();
        if twins.len() < 2 {
            return Ok(());
        }
        let Some(own_id) = config.self_id.as_deref() else {
            log::warn!("Found {} self containers but cannot tell which one is this process", twins.len());
            return Ok(());
        };

        let mut superseded = BTreeSet::new();
        for old in twins.into_iter().filter(|c| !c.id.starts_with(own_id)) {
            log::info!("Removing previous self container {}", old.name);
            runtime.stop_container(&old.id).await?;
            runtime.remove_container(&old.id).await?;
            superseded.insert(old.image_id.clone());
        }
        if config.cleanup {
            self.cleanup(superseded).await;
        }
        Ok(())
    }
}
