//! Docker client backed by bollard.

use std::collections::HashMap;
use std::hash::Hash;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerConfig, ContainerCreateBody, ContainerInspectResponse, ServiceSpec};
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, CreateImageOptions,
    CreateImageOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder, ListServicesOptions,
    RemoveContainerOptions, RemoveContainerOptionsBuilder, RemoveImageOptions,
    RemoveImageOptionsBuilder, StartContainerOptions, StartContainerOptionsBuilder,
    StopContainerOptions, StopContainerOptionsBuilder, UpdateServiceOptions,
    UpdateServiceOptionsBuilder,
};
use futures_util::StreamExt;

use super::{Container, ContainerSettings, Image, Result, RuntimeClient, RuntimeError, Service};
use crate::config::Config;
use crate::image_ref::ImageRef;
use crate::snapshot::RecreationSpec;

/// Seconds a container gets to exit before it is killed.
const STOP_TIMEOUT: i32 = 10;

pub struct DockerRuntime {
    endpoint: String,
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerRuntime {
    /// Build a client for `endpoint`. Nothing is sent until the first call.
    pub fn connect(endpoint: &str, config: &Config) -> Result<Self> {
        let timeout = config.docker_timeout.as_secs();
        let docker = if endpoint.starts_with("unix://") {
            Docker::connect_with_socket(endpoint, timeout, bollard::API_DEFAULT_VERSION)?
        } else if let Some(tls) = &config.tls {
            if !tls.verify {
                log::warn!(
                    "TLS verification cannot be disabled for {endpoint}, the CA in {} is still checked",
                    tls.cert_path.display()
                );
            }
            Docker::connect_with_ssl(
                endpoint,
                &tls.key(),
                &tls.cert(),
                &tls.ca(),
                timeout,
                bollard::API_DEFAULT_VERSION,
            )?
        } else {
            Docker::connect_with_http(endpoint, timeout, bollard::API_DEFAULT_VERSION)?
        };

        let credentials = config.credentials.as_ref().map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            ..Default::default()
        });

        Ok(Self {
            endpoint: endpoint.to_string(),
            docker,
            credentials,
        })
    }
}

fn sorted_keys<K: Clone + Ord + Hash, V>(map: Option<HashMap<K, V>>) -> Vec<K> {
    let mut keys: Vec<K> = map.into_iter().flat_map(|m| m.into_keys()).collect();
    keys.sort();
    keys
}

fn settings(config: ContainerConfig) -> ContainerSettings {
    ContainerSettings {
        hostname: config.hostname,
        domainname: config.domainname,
        user: config.user,
        tty: config.tty.unwrap_or(false),
        exposed_ports: sorted_keys(config.exposed_ports),
        volumes: sorted_keys(config.volumes),
        working_dir: config.working_dir.filter(|d| !d.is_empty()),
        image: config.image.unwrap_or_default(),
        cmd: config.cmd,
        entrypoint: config.entrypoint,
        env: config.env.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        healthcheck: config.healthcheck,
    }
}

fn container(inspect: ContainerInspectResponse) -> Container {
    Container {
        id: inspect.id.unwrap_or_default(),
        name: inspect
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image_id: inspect.image.unwrap_or_default(),
        config: inspect.config.map(settings).unwrap_or_default(),
        host_config: inspect.host_config.unwrap_or_default(),
    }
}

fn create_body(spec: &RecreationSpec, image: &str) -> ContainerCreateBody {
    let ports = spec.ports.as_ref().map(|ports| {
        ports
            .iter()
            .map(|p| (p.declaration(), HashMap::new()))
            .collect::<HashMap<String, HashMap<(), ()>>>()
    });
    let volumes = spec.volumes.as_ref().map(|volumes| {
        volumes
            .iter()
            .map(|v| (v.clone(), HashMap::new()))
            .collect::<HashMap<String, HashMap<(), ()>>>()
    });

    ContainerCreateBody {
        image: Some(image.to_string()),
        hostname: spec.hostname.clone(),
        domainname: spec.domainname.clone(),
        user: spec.user.clone(),
        tty: Some(spec.tty),
        attach_stdout: Some(!spec.detach),
        attach_stderr: Some(!spec.detach),
        exposed_ports: ports,
        volumes,
        working_dir: spec.working_dir.clone(),
        cmd: spec.command.clone(),
        entrypoint: spec.entrypoint.clone(),
        env: if spec.environment.is_empty() {
            None
        } else {
            Some(spec.environment.clone())
        },
        labels: Some(spec.labels.clone()),
        healthcheck: spec.healthcheck.clone(),
        host_config: Some(spec.host_config.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(false).build();
        let summaries = self.docker.list_containers(Some(options)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|s| s.id) {
            match self.inspect_container(&id).await {
                Ok(c) => containers.push(c),
                // Gone between listing and inspecting.
                Err(RuntimeError::NotFound(_)) => log::debug!("Container {id} disappeared"),
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<Container> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        let inspect = self.docker.inspect_container(id, Some(options)).await?;
        Ok(container(inspect))
    }

    async fn inspect_image(&self, reference: &str) -> Result<Image> {
        let inspect = self.docker.inspect_image(reference).await?;
        Ok(Image {
            id: inspect.id.unwrap_or_default(),
            repo_tags: inspect.repo_tags.unwrap_or_default(),
            repo_digests: inspect.repo_digests.unwrap_or_default(),
            descriptor_digest: inspect.descriptor.and_then(|d| d.digest),
        })
    }

    async fn pull_image(&self, reference: &ImageRef) -> Result<Image> {
        log::debug!("Pulling image: {}", reference.tagged());
        let options: CreateImageOptions = CreateImageOptionsBuilder::new()
            .from_image(&reference.repository)
            .tag(&reference.tag)
            .build();

        let mut stream = self
            .docker
            .create_image(Some(options), None, self.credentials.clone());

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    log::error!("Failed to pull image {}: {}", reference.tagged(), e);
                    return Err(e.into());
                }
            }
        }

        self.inspect_image(&reference.tagged()).await
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let options: StopContainerOptions =
            StopContainerOptionsBuilder::new().t(STOP_TIMEOUT).build();

        match self.docker.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::info!("Container {} already stopped", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(true).build();
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn create_container(&self, spec: &RecreationSpec, image: &str) -> Result<String> {
        let options: CreateContainerOptions =
            CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self
            .docker
            .create_container(Some(options), create_body(spec, image))
            .await?;
        for warning in &response.warnings {
            log::warn!("Creating {}: {}", spec.name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        self.docker.start_container(id, Some(options)).await?;
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let services = self
            .docker
            .list_services(None::<ListServicesOptions>)
            .await?;

        Ok(services
            .into_iter()
            .filter_map(|service| {
                let spec = service.spec?;
                let image = spec
                    .task_template
                    .as_ref()
                    .and_then(|t| t.container_spec.as_ref())
                    .and_then(|c| c.image.clone())?;
                Some(Service {
                    id: service.id.unwrap_or_default(),
                    name: spec.name.clone().unwrap_or_default(),
                    image,
                    labels: spec.labels.clone().unwrap_or_default(),
                    version: service.version.and_then(|v| v.index).unwrap_or_default(),
                    spec,
                })
            })
            .collect())
    }

    async fn update_service(&self, id: &str, version: u64, spec: ServiceSpec) -> Result<()> {
        let options: UpdateServiceOptions = UpdateServiceOptionsBuilder::new()
            .version(version as i32)
            .build();
        let response = self
            .docker
            .update_service(id, spec, options, self.credentials.clone())
            .await?;
        for warning in response.warnings.iter().flatten() {
            log::warn!("Updating service {}: {}", id, warning);
        }
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        let options: RemoveImageOptions = RemoveImageOptionsBuilder::new().build();
        self.docker.remove_image(id, Some(options), None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PortSpec;
    use bollard::models::HostConfig;

    fn spec() -> RecreationSpec {
        RecreationSpec {
            name: "web".to_string(),
            hostname: Some("web-host".to_string()),
            user: None,
            domainname: None,
            tty: false,
            ports: Some(vec![PortSpec::Pair {
                port: "8080".to_string(),
                protocol: "tcp".to_string(),
            }]),
            volumes: None,
            working_dir: None,
            command: Some(vec!["serve".to_string()]),
            host_config: HostConfig {
                network_mode: Some("bridge".to_string()),
                ..Default::default()
            },
            labels: HashMap::new(),
            entrypoint: None,
            environment: Vec::new(),
            healthcheck: None,
            detach: true,
        }
    }

    #[test]
    fn test_create_body() {
        let body = create_body(&spec(), "web:v1");
        assert_eq!(body.image.as_deref(), Some("web:v1"));
        assert_eq!(body.hostname.as_deref(), Some("web-host"));
        assert!(body.exposed_ports.unwrap().contains_key("8080/tcp"));
        assert!(body.volumes.is_none());
        assert!(body.env.is_none());
        assert_eq!(body.attach_stdout, Some(false));
        assert_eq!(
            body.host_config.unwrap().network_mode.as_deref(),
            Some("bridge")
        );
    }

    #[test]
    fn test_container_from_inspect() {
        let inspect = ContainerInspectResponse {
            id: Some("c0ffee".to_string()),
            name: Some("/web".to_string()),
            image: Some("sha256:abc123".to_string()),
            config: Some(ContainerConfig {
                image: Some("web:v1".to_string()),
                exposed_ports: Some(HashMap::from([
                    ("9090/udp".to_string(), HashMap::new()),
                    ("8080/tcp".to_string(), HashMap::new()),
                ])),
                working_dir: Some(String::new()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let container = container(inspect);
        assert_eq!(container.name, "web");
        assert_eq!(container.image_id, "sha256:abc123");
        assert_eq!(container.config.exposed_ports, vec!["8080/tcp", "9090/udp"]);
        assert_eq!(container.config.working_dir, None);
    }
}
