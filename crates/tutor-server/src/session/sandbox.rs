//! Sandbox lifecycle: one resource-limited container per role.
//!
//! A [`Sandbox`] owns its runtime client connection. `stop` is idempotent and
//! always releases that connection; dropping a sandbox that was never stopped
//! schedules the same cleanup on the runtime so cancelled calls do not leak
//! containers.

use crate::config::SandboxSection;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::HostConfig;
use bollard::Docker;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use tutor_core::{Role, TutorError, TutorResult};

/// Label applied to every container started by this server.
const MANAGED_LABEL: &str = "tutor.managed";
const ROLE_LABEL: &str = "tutor.role";

/// Grace period handed to the runtime before it kills the container.
const STOP_TIMEOUT_SECS: i64 = 5;

/// CFS period used to express the CPU fraction as a quota.
const CPU_PERIOD: i64 = 100_000;

/// How to build one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub image: String,
    pub network_mode: String,
    pub memory_bytes: i64,
    /// Share of one CPU, e.g. `0.5`.
    pub cpu_fraction: f64,
    /// Ephemeral storage quota (`storage_opt.size`).
    pub storage_size: Option<String>,
    /// `KEY=value` pairs injected into the container.
    pub env: Vec<String>,
    pub role: Role,
}

impl SandboxSpec {
    /// Spec for a role's sandbox serving `port` for the given lesson.
    pub fn for_role(
        section: &SandboxSection,
        image: &str,
        role: Role,
        port: u16,
        lesson: usize,
    ) -> Self {
        Self {
            image: image.to_string(),
            network_mode: section.network_mode.clone(),
            memory_bytes: i64::try_from(section.memory_mb.saturating_mul(1024 * 1024))
                .unwrap_or(i64::MAX),
            cpu_fraction: section.cpu_fraction,
            storage_size: section.storage_size.clone(),
            env: vec![
                format!("PORT={port}"),
                format!("TIT_ROLE={role}"),
                format!("TIT_LESSON={lesson}"),
            ],
            role,
        }
    }

    /// Port the in-sandbox service is told to bind.
    pub fn port(&self) -> Option<u16> {
        self.env
            .iter()
            .find_map(|kv| kv.strip_prefix("PORT="))
            .and_then(|p| p.parse().ok())
    }
}

/// Container operations on one runtime connection.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn create(&self, name: &str, spec: &SandboxSpec) -> TutorResult<()>;
    async fn start(&self, name: &str) -> TutorResult<()>;
    /// Stop a container; one that is already stopped or gone is not an error.
    async fn stop(&self, name: &str) -> TutorResult<()>;
    /// Remove a container; one that is already gone is not an error.
    async fn remove(&self, name: &str) -> TutorResult<()>;
}

/// Opens runtime connections. Each sandbox gets its own.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    async fn connect(&self) -> TutorResult<Box<dyn ContainerApi>>;
}

/// Docker Engine API over the local socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerEngine;

#[async_trait]
impl SandboxEngine for DockerEngine {
    async fn connect(&self) -> TutorResult<Box<dyn ContainerApi>> {
        #[cfg(unix)]
        let docker = Docker::connect_with_socket_defaults();
        #[cfg(windows)]
        let docker = Docker::connect_with_named_pipe_defaults();

        let docker = docker.map_err(|e| {
            error!(error = %e, "failed to connect to docker");
            TutorError::SandboxStart(format!("docker connect failed: {e}"))
        })?;
        Ok(Box::new(DockerApi { docker }))
    }
}

struct DockerApi {
    docker: Docker,
}

impl DockerApi {
    fn to_bollard_config(spec: &SandboxSpec) -> Config<String> {
        let mut host_config = HostConfig {
            network_mode: Some(spec.network_mode.clone()),
            memory: Some(spec.memory_bytes),
            cpu_quota: Some((spec.cpu_fraction * CPU_PERIOD as f64) as i64),
            cpu_period: Some(CPU_PERIOD),
            privileged: Some(false),
            ..Default::default()
        };

        if let Some(size) = &spec.storage_size {
            host_config.storage_opt = Some(HashMap::from([("size".to_string(), size.clone())]));
        }

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (ROLE_LABEL.to_string(), spec.role.to_string()),
        ]);

        Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerApi for DockerApi {
    async fn create(&self, name: &str, spec: &SandboxSpec) -> TutorResult<()> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| TutorError::SandboxStart(format!("create {name}: {e}")))?;
        debug!(sandbox = name, id = %response.id, "container created");
        Ok(())
    }

    async fn start(&self, name: &str) -> TutorResult<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| TutorError::SandboxStart(format!("start {name}: {e}")))
    }

    async fn stop(&self, name: &str) -> TutorResult<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {
                debug!(sandbox = name, "container already stopped");
                Ok(())
            }
            Err(e) => Err(TutorError::Sandbox(format!("stop {name}: {e}"))),
        }
    }

    async fn remove(&self, name: &str) -> TutorResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(sandbox = name, "container already removed");
                Ok(())
            }
            Err(e) => Err(TutorError::Sandbox(format!("remove {name}: {e}"))),
        }
    }
}

/// Lifecycle state of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Connected to the runtime, nothing created yet.
    Pending,
    Created,
    Running,
    Stopped,
}

/// A running (or about to run) isolated environment for one role.
pub struct Sandbox {
    name: String,
    spec: SandboxSpec,
    state: SandboxState,
    api: Option<Box<dyn ContainerApi>>,
}

impl Sandbox {
    /// Open a runtime connection for a new, uniquely named sandbox.
    pub async fn connect(
        engine: &dyn SandboxEngine,
        name_prefix: &str,
        spec: SandboxSpec,
    ) -> TutorResult<Self> {
        let api = engine.connect().await?;
        let name = format!("{name_prefix}-{}-{}", spec.role, super::generate_id());
        Ok(Self {
            name,
            spec,
            state: SandboxState::Pending,
            api: Some(api),
        })
    }

    /// Connect and start in one go. A sandbox that fails to start is
    /// stopped (and its connection released) before the error is returned.
    pub async fn launch(
        engine: &dyn SandboxEngine,
        name_prefix: &str,
        spec: SandboxSpec,
    ) -> TutorResult<Self> {
        let mut sandbox = Self::connect(engine, name_prefix, spec).await?;
        if let Err(e) = sandbox.start().await {
            sandbox.stop().await;
            return Err(e);
        }
        Ok(sandbox)
    }

    /// Create and start the container.
    pub async fn start(&mut self) -> TutorResult<()> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| TutorError::SandboxStart(format!("{} already released", self.name)))?;

        api.create(&self.name, &self.spec).await?;
        self.state = SandboxState::Created;

        api.start(&self.name).await?;
        self.state = SandboxState::Running;

        info!(
            sandbox = %self.name,
            role = %self.spec.role,
            image = %self.spec.image,
            port = ?self.spec.port(),
            "sandbox started"
        );
        Ok(())
    }

    /// Stop and remove the container, then release the runtime connection.
    ///
    /// Never fails: a container that never reached a running state is
    /// tolerated, and runtime errors are logged.
    pub async fn stop(&mut self) {
        let Some(api) = self.api.take() else {
            self.state = SandboxState::Stopped;
            return;
        };

        if let Err(e) = api.stop(&self.name).await {
            debug!(sandbox = %self.name, state = ?self.state, error = %e, "stop failed");
        }
        if let Err(e) = api.remove(&self.name).await {
            warn!(sandbox = %self.name, error = %e, "remove failed");
        }
        drop(api);

        self.state = SandboxState::Stopped;
        info!(sandbox = %self.name, role = %self.spec.role, "sandbox stopped");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> Option<u16> {
        self.spec.port()
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Whether the runtime connection is still held.
    pub fn is_connected(&self) -> bool {
        self.api.is_some()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let Some(api) = self.api.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(sandbox = %name, "sandbox dropped without stop, cleaning up");
                handle.spawn(async move {
                    let _ = api.stop(&name).await;
                    let _ = api.remove(&name).await;
                });
            }
            Err(_) => {
                error!(sandbox = %name, "sandbox dropped outside the runtime, container leaked");
            }
        }
    }
}
