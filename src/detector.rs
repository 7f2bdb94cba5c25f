//! Decide which workloads are monitored and whether their image is stale.

use std::collections::HashMap;

use crate::config::Config;
use crate::digest::{self, DigestError};
use crate::image_ref::{self, ImageRef};
use crate::runtime::{Container, Image, RuntimeClient, RuntimeError};

/// Label that opts a workload in (`true`) or out (`false`) when label
/// monitoring is enabled.
pub const ENABLE_LABEL: &str = "com.freshen.enable";

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("{name} runs the bare image id {image}, which cannot be pulled")]
    Unpullable { name: String, image: String },
    #[error("{name}: {source}")]
    Digest {
        name: String,
        #[source]
        source: DigestError,
    },
    #[error("{name}: {source}")]
    Runtime {
        name: String,
        #[source]
        source: RuntimeError,
    },
}

/// Name and label rules for including a workload in a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Names to monitor. Empty means all.
    pub monitor: Vec<String>,
    pub ignore: Vec<String>,
    pub label_enable: bool,
    pub labels_only: bool,
}

impl Selection {
    pub fn includes(&self, name: &str, labels: &HashMap<String, String>) -> bool {
        if self.label_enable {
            match labels.get(ENABLE_LABEL).map(|v| v.trim().to_ascii_lowercase()) {
                Some(v) if v == "true" => return true,
                Some(v) if v == "false" => return false,
                _ if self.labels_only => return false,
                _ => {}
            }
        }
        let monitored = self.monitor.is_empty() || self.monitor.iter().any(|m| m == name);
        monitored && !self.ignore.iter().any(|i| i == name)
    }
}

/// Staleness is digest inequality, never tag inequality.
pub fn is_stale(current_digest: &str, latest_digest: &str) -> bool {
    !digest::same_content(current_digest, latest_digest)
}

/// The outcome of checking a single container.
#[derive(Debug, Clone)]
pub struct UpdateDecision {
    pub container: Container,
    /// The reference that was pulled to find the candidate.
    pub reference: ImageRef,
    pub old_image: Option<Image>,
    pub old_digest: String,
    pub candidate: Image,
    pub new_digest: String,
    pub stale: bool,
}

pub struct Detector<'a> {
    runtime: &'a dyn RuntimeClient,
    config: &'a Config,
}

impl<'a> Detector<'a> {
    pub fn new(runtime: &'a dyn RuntimeClient, config: &'a Config) -> Self {
        Self { runtime, config }
    }

    /// Running containers that pass the selection rules.
    pub async fn monitored(&self) -> Result<Vec<Container>, RuntimeError> {
        let containers = self.runtime.list_containers().await?;
        Ok(containers
            .into_iter()
            .filter(|c| self.config.selection.includes(&c.name, &c.config.labels))
            .collect())
    }

    /// The reference to pull for a container's image.
    pub fn reference_for(&self, image: &str) -> ImageRef {
        let reference = ImageRef::parse(image);
        if self.config.latest_only {
            reference.with_latest()
        } else {
            reference.unpinned()
        }
    }

    pub async fn check(&self, container: &Container) -> Result<UpdateDecision, DetectError> {
        let name = container.name.clone();
        if image_ref::is_image_id(&container.config.image) {
            return Err(DetectError::Unpullable {
                name,
                image: container.config.image.clone(),
            });
        }

        let old_image = match self.runtime.inspect_image(&container.image_id).await {
            Ok(image) => Some(image),
            Err(RuntimeError::NotFound(_)) => None,
            Err(source) => return Err(DetectError::Runtime { name, source }),
        };
        let old_digest =
            digest::resolve(old_image.as_ref()).map_err(|source| DetectError::Digest {
                name: name.clone(),
                source,
            })?;

        let reference = self.reference_for(&container.config.image);
        log::debug!("Pulling {reference} for {name}");
        let candidate = self
            .runtime
            .pull_image(&reference)
            .await
            .map_err(|source| DetectError::Runtime {
                name: name.clone(),
                source,
            })?;
        let new_digest =
            digest::resolve(Some(&candidate)).map_err(|source| DetectError::Digest {
                name: name.clone(),
                source,
            })?;

        let stale = is_stale(&old_digest, &new_digest);
        if stale {
            log::info!(
                "{name} is stale: running {} but {reference} is {}",
                digest::short_digest(&old_digest),
                digest::short_digest(&new_digest)
            );
        } else {
            log::debug!("{name} is up to date");
        }

        Ok(UpdateDecision {
            container: container.clone(),
            reference,
            old_image,
            old_digest,
            candidate,
            new_digest,
            stale,
        })
    }
}
