//! [`ContainerRegistry`] over the Docker engine API.
//!
//! Commands run through the exec API: only the standard output is attached, streamed commands
//! hand over the raw output stream, and the exit status is read back with `inspect_exec`.

use std::{collections::HashMap, io, net::Ipv4Addr};

use bollard::{
    container::{InspectContainerOptions, ListContainersOptions, LogOutput},
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerInspectResponse, ContainerSummary as DockerSummary},
    Docker,
};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, trace};
use vnt_host::{
    ContainerInfo, ContainerRegistry, ContainerSummary, Exec, ExecOptions, ExecOutput, ExecStatus,
    OutputStream, RegistryError,
};

/// A container registry backed by a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRegistry {
    docker: Docker,
    /// Only containers carrying all of these labels are listed.
    label_filters: Vec<String>,
}

impl DockerRegistry {
    /// Connects to the local daemon, honouring `DOCKER_HOST`.
    pub fn connect() -> Result<Self, RegistryError> {
        let docker = Docker::connect_with_local_defaults().map_err(backend)?;
        Ok(Self::new(docker))
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker, label_filters: Vec::new() }
    }

    /// Restricts listing to containers carrying `label`, given as `key` or `key=value`.
    pub fn with_label_filter(mut self, label: impl Into<String>) -> Self {
        self.label_filters.push(label.into());
        self
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait::async_trait]
impl ContainerRegistry for DockerRegistry {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RegistryError> {
        let mut filters = HashMap::new();
        if !self.label_filters.is_empty() {
            filters.insert("label".to_owned(), self.label_filters.clone());
        }

        let options = ListContainersOptions { all: false, filters, ..Default::default() };
        let containers = self.docker.list_containers(Some(options)).await.map_err(backend)?;

        Ok(containers.into_iter().filter_map(summary).collect())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInfo, RegistryError> {
        let response = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| not_found(e, || RegistryError::ContainerNotFound(container.to_owned())))?;

        Ok(container_info(response))
    }

    async fn exec(
        &self,
        container: &str,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> Result<Exec, RegistryError> {
        let create = CreateExecOptions {
            cmd: Some(argv),
            attach_stdout: Some(!options.detach),
            attach_stderr: Some(false),
            ..Default::default()
        };

        let id = self
            .docker
            .create_exec(container, create)
            .await
            .map_err(|e| not_found(e, || RegistryError::ContainerNotFound(container.to_owned())))?
            .id;
        trace!(container, exec_id = %id, "exec created");

        let start = StartExecOptions { detach: options.detach, ..Default::default() };
        let started = self.docker.start_exec(&id, Some(start)).await.map_err(backend)?;

        let output = match started {
            StartExecResults::Detached => ExecOutput::Detached,
            StartExecResults::Attached { output, .. } if options.stream => {
                let stdout: OutputStream = Box::pin(
                    output
                        .map_err(io::Error::other)
                        .try_filter_map(|chunk| async move { Ok(stdout_bytes(chunk)) }),
                );
                ExecOutput::Stream(stdout)
            }
            StartExecResults::Attached { mut output, .. } => {
                let mut collected = Vec::new();
                while let Some(chunk) = output.next().await {
                    if let Some(bytes) = stdout_bytes(chunk.map_err(backend)?) {
                        collected.extend_from_slice(&bytes);
                    }
                }
                ExecOutput::Collected(String::from_utf8_lossy(&collected).into_owned())
            }
        };

        debug!(container, exec_id = %id, ?options, "exec started");
        Ok(Exec { id, output })
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RegistryError> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| not_found(e, || RegistryError::ExecNotFound(exec_id.to_owned())))?;

        let running = inspect.running.unwrap_or_default();
        Ok(ExecStatus { running, exit_code: if running { None } else { inspect.exit_code } })
    }
}

fn stdout_bytes(chunk: LogOutput) -> Option<bytes::Bytes> {
    match chunk {
        LogOutput::StdOut { message } | LogOutput::Console { message } => Some(message),
        _ => None,
    }
}

fn backend(e: DockerError) -> RegistryError {
    RegistryError::Backend(Box::new(e))
}

fn not_found(e: DockerError, missing: impl FnOnce() -> RegistryError) -> RegistryError {
    match e {
        DockerError::DockerResponseServerError { status_code: 404, .. } => missing(),
        e => backend(e),
    }
}

fn summary(container: DockerSummary) -> Option<ContainerSummary> {
    Some(ContainerSummary {
        id: container.id?,
        names: container.names.unwrap_or_default(),
        labels: container.labels.unwrap_or_default().into_iter().collect(),
    })
}

/// The name of the target container of a legacy link, e.g. `midonet-api` in
/// `/midonet-api:/midonet-agent-1/api`.
fn link_target(link: &str) -> Option<&str> {
    let target = link.split(':').next()?.trim_matches('/');
    (!target.is_empty()).then_some(target)
}

fn container_info(response: ContainerInspectResponse) -> ContainerInfo {
    let config = response.config.unwrap_or_default();
    let settings = response.network_settings.unwrap_or_default();

    // The default bridge address comes first, any other network otherwise.
    let endpoints = settings.networks.unwrap_or_default();
    let mut addresses = std::iter::once((settings.ip_address, settings.mac_address))
        .chain(endpoints.into_values().map(|e| (e.ip_address, e.mac_address)))
        .filter(|(ip, _)| ip.as_deref().is_some_and(|ip| !ip.is_empty()));
    let (ip, mac) = addresses.next().unwrap_or_default();

    let links = response
        .host_config
        .and_then(|host| host.links)
        .unwrap_or_default()
        .iter()
        .filter_map(|link| link_target(link).map(str::to_owned))
        .collect();

    ContainerInfo {
        id: response.id.unwrap_or_default(),
        name: response.name.unwrap_or_default().trim_start_matches('/').to_owned(),
        hostname: config.hostname.unwrap_or_default(),
        labels: config.labels.unwrap_or_default().into_iter().collect(),
        ip: ip.and_then(|ip| ip.parse::<Ipv4Addr>().ok()),
        mac: mac.filter(|mac| !mac.is_empty()),
        links,
        env: config.env.unwrap_or_default(),
    }
}
