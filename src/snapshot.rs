//! Capture the configuration of a running container so it can be recreated
//! against a different image.

use std::collections::HashMap;

use bollard::models::{HealthConfig, HostConfig};

use crate::runtime::Container;

/// An exposed port split into its parts, or the raw declaration when it
/// carries no protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    Pair { port: String, protocol: String },
    Raw(String),
}

impl PortSpec {
    fn parse(declared: &str) -> Self {
        match declared.split_once('/') {
            Some((port, protocol)) => PortSpec::Pair {
                port: port.to_string(),
                protocol: protocol.to_string(),
            },
            None => PortSpec::Raw(declared.to_string()),
        }
    }

    /// Back to the runtime's `<port>/<proto>` form.
    pub fn declaration(&self) -> String {
        match self {
            PortSpec::Pair { port, protocol } => format!("{port}/{protocol}"),
            PortSpec::Raw(raw) => raw.clone(),
        }
    }
}

/// Everything needed to recreate a container, except its image.
#[derive(Debug, Clone, PartialEq)]
pub struct RecreationSpec {
    pub name: String,
    /// `None` when the container joins another container's network.
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub domainname: Option<String>,
    pub tty: bool,
    pub ports: Option<Vec<PortSpec>>,
    pub volumes: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub command: Option<Vec<String>>,
    pub host_config: HostConfig,
    pub labels: HashMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub environment: Vec<String>,
    pub healthcheck: Option<HealthConfig>,
    pub detach: bool,
}

/// `true` for a network mode of the form `container:<id>`.
pub fn is_container_network(network_mode: &str) -> bool {
    let mut parts = network_mode.split(':');
    parts.next() == Some("container") && parts.next().is_some()
}

pub fn snapshot(container: &Container, name_override: Option<&str>) -> RecreationSpec {
    let config = &container.config;
    let joined = is_container_network(container.network_mode());

    let hostname = if joined {
        None
    } else {
        config.hostname.clone()
    };

    let ports = if joined || config.exposed_ports.is_empty() {
        None
    } else {
        Some(config.exposed_ports.iter().map(|p| PortSpec::parse(p)).collect())
    };

    let volumes = if config.volumes.is_empty() {
        None
    } else {
        Some(config.volumes.clone())
    };

    RecreationSpec {
        name: name_override.unwrap_or(container.name.as_str()).to_string(),
        hostname,
        user: config.user.clone(),
        domainname: config.domainname.clone(),
        tty: config.tty,
        ports,
        volumes,
        working_dir: config.working_dir.clone(),
        command: config.cmd.clone(),
        host_config: container.host_config.clone(),
        labels: config.labels.clone(),
        entrypoint: config.entrypoint.clone(),
        environment: config.env.clone(),
        healthcheck: config.healthcheck.clone(),
        detach: true,
    }
}
