use std::{any::Any, fmt, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tracing::{debug, error};
use vnt_command::Command;
use vnt_common::PollError;

use super::{ServiceContext, ServiceHost, ServiceStatus, Services};
use crate::{
    ApiOptions, ControllerClient, ControllerConnector, Endpoint, HostError, RemoteHost, Result,
    ROLE_LABEL,
};

/// The host serving the controller API.
pub struct ApiHost {
    host: RemoteHost,
    role: String,
    connector: Arc<dyn ControllerConnector>,
    options: ApiOptions,
    links: Services,
}

impl fmt::Debug for ApiHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiHost")
            .field("host", &self.host)
            .field("role", &self.role)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ApiHost {
    pub const SELECTOR: &'static str = "vnt.api";

    pub fn new(host: RemoteHost, connector: Arc<dyn ControllerConnector>, options: ApiOptions) -> Self {
        let role = host.label(ROLE_LABEL).unwrap_or(&options.role).to_owned();
        Self { host, role, connector, options, links: Services::default() }
    }

    pub fn with_links(mut self, links: Services) -> Self {
        self.links = links;
        self
    }

    /// The [`Factory`](super::Factory) registered for [`Self::SELECTOR`].
    pub fn factory(ctx: ServiceContext) -> BoxFuture<'static, Result<Arc<dyn ServiceHost>>> {
        async move {
            let api = Self::new(ctx.host.clone(), Arc::clone(ctx.connector()), ctx.options().api.clone())
                .with_links(ctx.links);
            Ok(Arc::new(api) as Arc<dyn ServiceHost>)
        }
        .boxed()
    }

    pub fn options(&self) -> &ApiOptions {
        &self.options
    }

    /// The API endpoint, built from the current address of the container.
    pub async fn endpoint(&self) -> Result<Endpoint> {
        let ip = self.host.current_ip().await?;
        Ok(Endpoint {
            url: format!("http://{ip}:{}{}", self.options.port, self.options.base_path),
            username: self.options.username.clone(),
            password: self.options.password.clone(),
        })
    }

    /// Connects a new controller client, retrying until the API answers a host listing or the
    /// connect timeout elapses. Clients are not cached: the API may have moved or restarted
    /// since the last call.
    pub async fn controller(&self) -> Result<Arc<dyn ControllerClient>> {
        let poller = self.options.connect_poller();

        let connected = poller
            .until(move || async move {
                let endpoint = self.endpoint().await?;
                let client = match self.connector.connect(&endpoint).await {
                    Ok(client) => client,
                    Err(e) => {
                        debug!(url = %endpoint.url, error = %e, "controller not reachable yet");
                        return Ok::<_, HostError>(None);
                    }
                };

                match client.hosts().await {
                    Ok(_) => Ok(Some(client)),
                    Err(e) => {
                        debug!(url = %endpoint.url, error = %e, "controller not ready yet");
                        Ok(None)
                    }
                }
            })
            .await;

        match connected {
            Ok(client) => Ok(client),
            Err(PollError::Inner(e)) => Err(e),
            Err(PollError::Timeout { elapsed }) => {
                error!(host = self.host.name(), ?elapsed, "timeout waiting for the controller API");
                Err(HostError::Timeout {
                    host: self.host.name().to_owned(),
                    op: "controller connect",
                    after: poller.timeout,
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl ServiceHost for ApiHost {
    fn host(&self) -> &RemoteHost {
        &self.host
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn service_name(&self) -> &str {
        &self.options.service_name
    }

    /// Up when the status command exits successfully within the status timeout.
    async fn status(&self) -> Result<ServiceStatus> {
        let handle = self.host.exec_detached(Command::script(&self.options.status_command)).await?;
        let exit = self.host.wait_exit_status(&handle, Some(self.options.status_timeout)).await?;

        Ok(if exit.success() { ServiceStatus::Up } else { ServiceStatus::Down })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn links(&self) -> &Services {
        &self.links
    }
}
