//! Container runtime capability.
//!
//! Core logic never touches raw Docker responses. The adapter in [`docker`]
//! turns bollard models into the typed records declared here, and every
//! operation the update engines need goes through [`RuntimeClient`].

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::{HealthConfig, HostConfig, ServiceSpec};

use crate::image_ref::ImageRef;
use crate::snapshot::RecreationSpec;

pub mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerRuntime;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Docker API error: {0}")]
    Api(bollard::errors::Error),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;
        match err {
            Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict(message),
            Error::RequestTimeoutError => RuntimeError::Timeout,
            e @ (Error::IOError { .. } | Error::SocketNotFoundError(..)) => {
                RuntimeError::Connection(e.to_string())
            }
            other => RuntimeError::Api(other),
        }
    }
}

/// The part of a container's `Config` block that a recreation carries over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSettings {
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    /// Exposed ports as declared by the runtime, e.g. `8080/tcp`. Sorted.
    pub exposed_ports: Vec<String>,
    /// Declared volume mount points. Sorted.
    pub volumes: Vec<String>,
    pub working_dir: Option<String>,
    /// The image reference the container was created from, e.g. `nginx:1.25`.
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub healthcheck: Option<HealthConfig>,
}

/// A running standalone container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    /// Id of the image the container is running, usually `sha256:...`.
    pub image_id: String,
    pub config: ContainerSettings,
    pub host_config: HostConfig,
}

impl Container {
    pub fn network_mode(&self) -> &str {
        self.host_config.network_mode.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    /// Content descriptor digest, exposed by newer engines.
    pub descriptor_digest: Option<String>,
}

/// An orchestrator managed (swarm) service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Service {
    pub id: String,
    pub name: String,
    /// Image of the service's task template, often digest pinned.
    pub image: String,
    pub labels: HashMap<String, String>,
    /// Object version, required by the engine to accept an update.
    pub version: u64,
    pub spec: ServiceSpec,
}

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Address of the endpoint this client talks to.
    fn endpoint(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// Running containers, fully inspected.
    async fn list_containers(&self) -> Result<Vec<Container>>;

    async fn inspect_container(&self, id: &str) -> Result<Container>;

    async fn inspect_image(&self, reference: &str) -> Result<Image>;

    /// Pull `reference` from its registry and return the resulting local image.
    async fn pull_image(&self, reference: &ImageRef) -> Result<Image>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Create a container from `spec` running `image`. Returns the new id.
    async fn create_container(&self, spec: &RecreationSpec, image: &str) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn list_services(&self) -> Result<Vec<Service>>;

    async fn update_service(&self, id: &str, version: u64, spec: ServiceSpec) -> Result<()>;

    async fn remove_image(&self, id: &str) -> Result<()>;
}
