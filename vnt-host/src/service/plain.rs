use std::{any::Any, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use vnt_command::Command;

use super::{ServiceContext, ServiceHost, ServiceStatus, Services};
use crate::{RemoteHost, Result, ROLE_LABEL};

/// Label naming the init service of a plain host. Defaults to the role.
pub const SERVICE_LABEL: &str = "service";

/// Any other role of the deployment, e.g. a coordination or a database node.
#[derive(Debug)]
pub struct PlainHost {
    host: RemoteHost,
    role: String,
    service_name: String,
    links: Services,
}

impl PlainHost {
    pub const SELECTOR: &'static str = "vnt.plain";

    pub fn new(host: RemoteHost) -> Self {
        let role = host.label(ROLE_LABEL).unwrap_or_default().to_owned();
        let service_name = host.label(SERVICE_LABEL).unwrap_or(&role).to_owned();
        Self { host, role, service_name, links: Services::default() }
    }

    pub fn with_links(mut self, links: Services) -> Self {
        self.links = links;
        self
    }

    /// The [`Factory`](super::Factory) registered for [`Self::SELECTOR`].
    pub fn factory(ctx: ServiceContext) -> BoxFuture<'static, Result<Arc<dyn ServiceHost>>> {
        async move { Ok(Arc::new(Self::new(ctx.host).with_links(ctx.links)) as Arc<dyn ServiceHost>) }.boxed()
    }
}

#[async_trait::async_trait]
impl ServiceHost for PlainHost {
    fn host(&self) -> &RemoteHost {
        &self.host
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn status(&self) -> Result<ServiceStatus> {
        let output = self
            .host
            .exec_unchecked(Command::new("service").arg(&self.service_name).arg("status"))
            .await?;

        Ok(if output.success() { ServiceStatus::Up } else { ServiceStatus::Down })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn links(&self) -> &Services {
        &self.links
    }
}
