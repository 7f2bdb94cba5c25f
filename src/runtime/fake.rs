//! In-memory runtime that records every call, for engine and scheduler tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bollard::models::{HostConfig, ServiceSpec, TaskSpec, TaskSpecContainerSpec};

use super::{Container, ContainerSettings, Image, Result, RuntimeClient, RuntimeError, Service};
use crate::image_ref::ImageRef;
use crate::snapshot::RecreationSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    ListContainers,
    InspectImage(String),
    Pull(String),
    Stop(String),
    Remove(String),
    Create { name: String, image: String },
    Start(String),
    ListServices,
    UpdateService { id: String, image: String },
    RemoveImage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Pull,
    Stop,
    Remove,
    Create,
    Start,
    UpdateService,
}

#[derive(Default)]
struct State {
    reachable: bool,
    /// Containers with their running flag, in creation order.
    containers: Vec<(Container, bool)>,
    images: HashMap<String, Image>,
    /// `repository:tag` to the digest the registry currently serves.
    registry: HashMap<String, String>,
    services: Vec<Service>,
    calls: Vec<Call>,
    created: Vec<RecreationSpec>,
    failures: HashSet<(Op, String)>,
}

pub struct FakeRuntime {
    endpoint: String,
    state: Mutex<State>,
}

fn image_for(reference: &ImageRef, digest: &str) -> Image {
    Image {
        id: format!("sha256:{digest}"),
        repo_tags: vec![reference.tagged()],
        repo_digests: vec![format!("{}@sha256:{digest}", reference.repository)],
        descriptor_digest: None,
    }
}

impl FakeRuntime {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: Mutex::new(State {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    pub fn unreachable(endpoint: &str) -> Self {
        let runtime = Self::new(endpoint);
        runtime.state.lock().unwrap().reachable = false;
        runtime
    }

    /// Add a running container on `reference` whose local image has `digest`.
    pub fn add_running(&self, name: &str, reference: &str, digest: &str) -> Container {
        let parsed = ImageRef::parse(reference);
        let image = image_for(&parsed, digest);
        let container = Container {
            id: format!("{name}-id"),
            name: name.to_string(),
            image_id: image.id.clone(),
            config: ContainerSettings {
                hostname: Some(format!("{name}-host")),
                exposed_ports: vec!["8080/tcp".to_string()],
                volumes: vec!["/data".to_string()],
                image: reference.to_string(),
                env: vec!["MODE=prod".to_string()],
                ..Default::default()
            },
            host_config: HostConfig {
                network_mode: Some("bridge".to_string()),
                ..Default::default()
            },
        };
        let mut state = self.state.lock().unwrap();
        state.images.insert(image.id.clone(), image);
        state.containers.push((container.clone(), true));
        container
    }

    pub fn add_service(&self, name: &str, image: &str) -> Service {
        let service = Service {
            id: format!("svc-{name}"),
            name: name.to_string(),
            image: image.to_string(),
            labels: HashMap::new(),
            version: 7,
            spec: ServiceSpec {
                name: Some(name.to_string()),
                task_template: Some(TaskSpec {
                    container_spec: Some(TaskSpecContainerSpec {
                        image: Some(image.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        self.state.lock().unwrap().services.push(service.clone());
        service
    }

    /// Make the registry serve `digest` for `reference`.
    pub fn publish(&self, reference: &str, digest: &str) {
        let parsed = ImageRef::parse(reference);
        self.state
            .lock()
            .unwrap()
            .registry
            .insert(parsed.tagged(), digest.to_string());
    }

    pub fn fail_on(&self, op: Op, target: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op, target.to_string()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn created(&self) -> Vec<RecreationSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn running(&self) -> Vec<Container> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|(_, running)| *running)
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn has_image(&self, id: &str) -> bool {
        self.state.lock().unwrap().images.contains_key(id)
    }

    pub fn services(&self) -> Vec<Service> {
        self.state.lock().unwrap().services.clone()
    }

    /// Whether any mutating call was made.
    pub fn mutated(&self) -> bool {
        self.calls().iter().any(|c| {
            matches!(
                c,
                Call::Stop(_)
                    | Call::Remove(_)
                    | Call::Create { .. }
                    | Call::Start(_)
                    | Call::UpdateService { .. }
                    | Call::RemoveImage(_)
            )
        })
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn check(&self, op: Op, target: &str) -> Result<()> {
        if self
            .state
            .lock()
            .unwrap()
            .failures
            .contains(&(op, target.to_string()))
        {
            return Err(RuntimeError::Conflict(format!("{op:?} {target} failed")));
        }
        Ok(())
    }

    fn find(state: &mut State, id: &str) -> Option<usize> {
        state
            .containers
            .iter()
            .position(|(c, _)| c.id == id || c.name == id)
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<()> {
        self.record(Call::Ping);
        if self.state.lock().unwrap().reachable {
            Ok(())
        } else {
            Err(RuntimeError::Connection(format!(
                "{} refused the connection",
                self.endpoint
            )))
        }
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        self.record(Call::ListContainers);
        Ok(self.running())
    }

    async fn inspect_container(&self, id: &str) -> Result<Container> {
        let mut state = self.state.lock().unwrap();
        match Self::find(&mut state, id) {
            Some(idx) => Ok(state.containers[idx].0.clone()),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn inspect_image(&self, reference: &str) -> Result<Image> {
        self.record(Call::InspectImage(reference.to_string()));
        let state = self.state.lock().unwrap();
        if let Some(image) = state.images.get(reference) {
            return Ok(image.clone());
        }
        let tagged = ImageRef::parse(reference).tagged();
        state
            .images
            .values()
            .find(|i| i.repo_tags.contains(&tagged))
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(reference.to_string()))
    }

    async fn pull_image(&self, reference: &ImageRef) -> Result<Image> {
        let tagged = reference.tagged();
        self.record(Call::Pull(tagged.clone()));
        self.check(Op::Pull, &tagged)?;
        let mut state = self.state.lock().unwrap();
        let digest = state
            .registry
            .get(&tagged)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(tagged.clone()))?;
        let image = image_for(reference, &digest);
        // The tag moves to the freshly pulled image.
        for other in state.images.values_mut() {
            other.repo_tags.retain(|t| t != &tagged);
        }
        state
            .images
            .entry(image.id.clone())
            .and_modify(|i| i.repo_tags.push(tagged.clone()))
            .or_insert_with(|| image.clone());
        Ok(image)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.record(Call::Stop(id.to_string()));
        self.check(Op::Stop, id)?;
        let mut state = self.state.lock().unwrap();
        let idx = Self::find(&mut state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.containers[idx].1 = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(Call::Remove(id.to_string()));
        self.check(Op::Remove, id)?;
        let mut state = self.state.lock().unwrap();
        let idx = Self::find(&mut state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.containers.remove(idx);
        Ok(())
    }

    async fn create_container(&self, spec: &RecreationSpec, image: &str) -> Result<String> {
        self.record(Call::Create {
            name: spec.name.clone(),
            image: image.to_string(),
        });
        self.check(Op::Create, &spec.name)?;
        let mut state = self.state.lock().unwrap();
        if state.containers.iter().any(|(c, _)| c.name == spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "name {} is already in use",
                spec.name
            )));
        }
        let tagged = ImageRef::parse(image).tagged();
        let image_id = state
            .images
            .values()
            .find(|i| i.repo_tags.contains(&tagged))
            .map(|i| i.id.clone())
            .ok_or_else(|| RuntimeError::NotFound(image.to_string()))?;
        let id = format!("{}-new", spec.name);
        let container = Container {
            id: id.clone(),
            name: spec.name.clone(),
            image_id,
            config: ContainerSettings {
                hostname: spec.hostname.clone(),
                exposed_ports: spec
                    .ports
                    .iter()
                    .flatten()
                    .map(|p| p.declaration())
                    .collect(),
                volumes: spec.volumes.clone().unwrap_or_default(),
                image: image.to_string(),
                env: spec.environment.clone(),
                labels: spec.labels.clone(),
                ..Default::default()
            },
            host_config: spec.host_config.clone(),
        };
        state.containers.push((container, false));
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(Call::Start(id.to_string()));
        self.check(Op::Start, id)?;
        let mut state = self.state.lock().unwrap();
        let idx = Self::find(&mut state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.containers[idx].1 = true;
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.record(Call::ListServices);
        Ok(self.services())
    }

    async fn update_service(&self, id: &str, version: u64, spec: ServiceSpec) -> Result<()> {
        let image = spec
            .task_template
            .as_ref()
            .and_then(|t| t.container_spec.as_ref())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        self.record(Call::UpdateService {
            id: id.to_string(),
            image: image.clone(),
        });
        self.check(Op::UpdateService, id)?;
        let mut state = self.state.lock().unwrap();
        let service = state
            .services
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if service.version != version {
            return Err(RuntimeError::Conflict(format!(
                "update out of sequence for {id}"
            )));
        }
        service.version += 1;
        service.image = image;
        service.spec = spec;
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.record(Call::RemoveImage(id.to_string()));
        self.state.lock().unwrap().images.remove(id);
        Ok(())
    }
}
