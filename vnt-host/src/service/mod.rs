//! Host roles and their service lifecycle.

use std::{any::Any, fmt, sync::Arc};

use tracing::{debug, info};
use vnt_command::{ip, Command};
use vnt_common::PollError;

use crate::{HostError, RemoteHost, Result};

mod agent;
pub use agent::AgentHost;

mod api;
pub use api::ApiHost;

mod plain;
pub use plain::PlainHost;

mod registry;
pub use registry::{Factory, ServiceContext, ServiceRegistry, ServiceRegistryBuilder, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Up,
    Down,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
        }
    }
}

/// A container host playing a role in the test deployment, running one service.
#[async_trait::async_trait]
pub trait ServiceHost: fmt::Debug + Send + Sync + 'static {
    fn host(&self) -> &RemoteHost;

    /// Value of the role label of the container.
    fn role(&self) -> &str;

    /// Name of the init service managed by `start`, `stop` and `restart`.
    fn service_name(&self) -> &str;

    async fn status(&self) -> Result<ServiceStatus>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// The services of the containers this one is linked to.
    fn links(&self) -> &Services;

    fn name(&self) -> &str {
        self.host().name()
    }

    /// The linked service `name`, if it plays `role`.
    fn linked(&self, role: &str, name: &str) -> Option<&Arc<dyn ServiceHost>> {
        self.links().linked(role, name)
    }

    async fn start(&self, wait: bool) -> Result<()> {
        self.service_command("start").await?;
        if wait {
            self.wait_for_status(ServiceStatus::Up).await?;
        }
        Ok(())
    }

    async fn stop(&self, wait: bool) -> Result<()> {
        self.service_command("stop").await?;
        if wait {
            self.wait_for_status(ServiceStatus::Down).await?;
        }
        Ok(())
    }

    async fn restart(&self, wait: bool) -> Result<()> {
        self.service_command("restart").await?;
        if wait {
            self.wait_for_status(ServiceStatus::Up).await?;
        }
        Ok(())
    }

    async fn service_command(&self, action: &str) -> Result<String> {
        self.host().exec(Command::new("service").arg(self.service_name()).arg(action)).await
    }

    /// Polls the service status at a fixed interval until it reaches `target`.
    async fn wait_for_status(&self, target: ServiceStatus) -> Result<()> {
        let poller = self.host().options().status_poller();

        let reached = poller
            .until(move || async move {
                let status = self.status().await?;
                debug!(service = self.name(), %status, %target, "polled service status");
                Ok::<_, HostError>((status == target).then_some(()))
            })
            .await;

        match reached {
            Ok(()) => {
                debug!(service = self.name(), "service is now {target}");
                Ok(())
            }
            Err(PollError::Inner(e)) => Err(e),
            Err(PollError::Timeout { .. }) => Err(HostError::Timeout {
                host: self.name().to_owned(),
                op: "wait_for_status",
                after: poller.timeout,
            }),
        }
    }

    /// Takes the primary link of the container down and waits for the service to be down.
    async fn inject_failure(&self) -> Result<()> {
        info!(service = self.name(), "injecting failure");
        self.host().exec(ip::link_down(&self.host().options().failure_device)).await?;
        self.wait_for_status(ServiceStatus::Down).await
    }

    /// Brings the primary link back up and waits for the service to be up.
    async fn eject_failure(&self) -> Result<()> {
        info!(service = self.name(), "ejecting failure");
        self.host().exec(ip::link_up(&self.host().options().failure_device)).await?;
        self.wait_for_status(ServiceStatus::Up).await
    }
}

/// Downcasts a loaded service to its concrete role.
pub fn downcast<T: ServiceHost>(service: Arc<dyn ServiceHost>, expected: &'static str) -> Result<Arc<T>> {
    let name = service.name().to_owned();
    service.into_any().downcast::<T>().map_err(|_| HostError::WrongRole { name, expected })
}

/// A service failure, named after the container it takes down.
#[derive(Debug, Clone)]
pub struct ServiceFailure {
    service: Arc<dyn ServiceHost>,
}

impl ServiceFailure {
    /// Loads the service running in the container `name`.
    pub async fn new(services: &ServiceRegistry, name: &str) -> Result<Self> {
        Ok(Self { service: services.load(name).await? })
    }

    pub fn name(&self) -> String {
        format!("{} failure", self.service.name())
    }

    pub async fn inject(&self) -> Result<()> {
        self.service.inject_failure().await
    }

    pub async fn eject(&self) -> Result<()> {
        self.service.eject_failure().await
    }
}
