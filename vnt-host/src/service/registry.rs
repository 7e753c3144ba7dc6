use std::{fmt, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use vnt_common::WorkerPool;

use super::{downcast, AgentHost, ApiHost, PlainHost, ServiceHost};
use crate::{
    ContainerRegistry, ControllerConnector, HostError, RemoteHost, Result, ServiceOptions,
    ROLE_LABEL, SELECTOR_LABEL,
};

/// Builds the service proxying a container, from the value of its selector label.
pub type Factory = fn(ServiceContext) -> BoxFuture<'static, Result<Arc<dyn ServiceHost>>>;

/// What a [`Factory`] gets to build a service.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub services: ServiceRegistry,
    pub host: RemoteHost,
    /// The containers `host` is linked to, already loaded.
    pub links: Services,
}

impl ServiceContext {
    pub fn options(&self) -> &ServiceOptions {
        self.services.options()
    }

    pub fn pool(&self) -> &WorkerPool {
        self.services.pool()
    }

    pub fn connector(&self) -> &Arc<dyn ControllerConnector> {
        self.services.connector()
    }

    /// The linked container `name`, which must play `role`.
    pub fn linked(&self, role: &str, name: &str) -> Result<Arc<dyn ServiceHost>> {
        self.links.linked(role, name).cloned().ok_or_else(|| HostError::MissingLink {
            container: self.host.name().to_owned(),
            role: role.to_owned(),
            name: name.to_owned(),
        })
    }
}

/// Services grouped by role: those discovered in one run, or the peers a service is linked to.
#[derive(Debug, Clone, Default)]
pub struct Services {
    by_role: FxHashMap<String, Vec<Arc<dyn ServiceHost>>>,
}

impl Services {
    pub fn role(&self, role: &str) -> &[Arc<dyn ServiceHost>] {
        self.by_role.get(role).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.by_role.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ServiceHost>> {
        self.by_role.values().flatten()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn ServiceHost>> {
        self.iter().find(|service| service.name() == name)
    }

    /// The service `name`, if it plays `role`.
    pub fn linked(&self, role: &str, name: &str) -> Option<&Arc<dyn ServiceHost>> {
        self.role(role).iter().find(|service| service.name() == name)
    }

    fn insert(&mut self, service: Arc<dyn ServiceHost>) {
        self.by_role.entry(service.role().to_owned()).or_default().push(service);
    }

    pub fn len(&self) -> usize {
        self.by_role.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-run context discovering the containers of the deployment and handing out typed service
/// proxies for them.
///
/// Services are memoized by container id, so that linked services are shared. The first
/// discovery that finds services is kept until [`ServiceRegistry::reset`].
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    containers: Arc<dyn ContainerRegistry>,
    connector: Arc<dyn ControllerConnector>,
    factories: FxHashMap<String, Factory>,
    options: ServiceOptions,
    pool: WorkerPool,
    loaded: Mutex<FxHashMap<String, Arc<dyn ServiceHost>>>,
    discovered: Mutex<Option<Arc<Services>>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("selectors", &self.inner.factories.keys().collect::<Vec<_>>())
            .field("loaded", &self.inner.loaded.lock().len())
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// A registry with the agent, API and plain host implementations registered.
    pub fn new(
        containers: Arc<dyn ContainerRegistry>,
        connector: Arc<dyn ControllerConnector>,
        options: ServiceOptions,
    ) -> Self {
        Self::builder(containers, connector).with_options(options).build()
    }

    pub fn builder(
        containers: Arc<dyn ContainerRegistry>,
        connector: Arc<dyn ControllerConnector>,
    ) -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::new(containers, connector)
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.inner.options
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn connector(&self) -> &Arc<dyn ControllerConnector> {
        &self.inner.connector
    }

    pub fn containers(&self) -> &Arc<dyn ContainerRegistry> {
        &self.inner.containers
    }

    /// Loads the service running in `container` (id or name), after the services of every
    /// container it is linked to.
    pub async fn load(&self, container: &str) -> Result<Arc<dyn ServiceHost>> {
        self.load_linked(container.to_owned(), Vec::new()).await
    }

    /// `chain` holds the names of the containers whose load led here. A link back into it is a
    /// cycle and is left out of the links of the service being built.
    fn load_linked(
        &self,
        container: String,
        mut chain: Vec<String>,
    ) -> BoxFuture<'_, Result<Arc<dyn ServiceHost>>> {
        async move {
            let info = self.inner.containers.inspect(&container).await?;

            let cached = self.inner.loaded.lock().get(&info.id).cloned();
            if let Some(service) = cached {
                return Ok(service);
            }

            let selector = info
                .label(SELECTOR_LABEL)
                .ok_or_else(|| HostError::MissingLabel { container: info.name.clone(), label: SELECTOR_LABEL })?
                .to_owned();
            let factory = *self
                .inner
                .factories
                .get(&selector)
                .ok_or_else(|| HostError::UnknownImplementation(selector.clone()))?;

            chain.push(info.name.clone());
            let mut links = Services::default();
            for link in &info.links {
                if chain.contains(link) {
                    debug!(container = %info.name, %link, "link cycle, not following");
                    continue;
                }
                links.insert(self.load_linked(link.clone(), chain.clone()).await?);
            }

            let id = info.id.clone();
            let host = RemoteHost::new(Arc::clone(&self.inner.containers), info, self.inner.options.host.clone());
            debug!(container = host.name(), %selector, links = links.len(), "loading service");

            let service = factory(ServiceContext { services: self.clone(), host, links }).await?;

            Ok(Arc::clone(self.inner.loaded.lock().entry(id).or_insert(service)))
        }
        .boxed()
    }

    /// Discovers every running container carrying a role label.
    pub async fn load_all(&self) -> Result<Arc<Services>> {
        let cached = self.inner.discovered.lock().clone();
        if let Some(services) = cached {
            return Ok(services);
        }

        let mut by_role: FxHashMap<String, Vec<Arc<dyn ServiceHost>>> = FxHashMap::default();
        for container in self.inner.containers.list_containers().await? {
            let Some(role) = container.labels.get(ROLE_LABEL) else {
                debug!(container = %container.id, "skipping container without a role");
                continue;
            };

            let service = self.load(&container.id).await?;
            by_role.entry(role.clone()).or_default().push(service);
        }

        for services in by_role.values_mut() {
            services.sort_by(|a, b| a.name().cmp(b.name()));
        }

        let services = Arc::new(Services { by_role });
        if services.is_empty() {
            debug!("no service discovered");
            return Ok(services);
        }

        info!(services = services.len(), roles = ?services.roles().collect::<Vec<_>>(), "services discovered");
        Ok(Arc::clone(self.inner.discovered.lock().get_or_insert(services)))
    }

    /// Every discovered service playing `role`.
    pub async fn role(&self, role: &str) -> Result<Vec<Arc<dyn ServiceHost>>> {
        Ok(self.load_all().await?.role(role).to_vec())
    }

    pub async fn agents(&self) -> Result<Vec<Arc<AgentHost>>> {
        self.role(&self.inner.options.agent.role)
            .await?
            .into_iter()
            .map(|service| downcast::<AgentHost>(service, "agent host"))
            .collect()
    }

    /// The agent host running in the container `name`.
    pub async fn agent(&self, name: &str) -> Result<Arc<AgentHost>> {
        downcast(self.load(name).await?, "agent host")
    }

    /// The first discovered API host.
    pub async fn api(&self) -> Result<Arc<ApiHost>> {
        let role = &self.inner.options.api.role;
        let service = self
            .role(role)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HostError::HostNotFound(role.clone()))?;
        downcast(service, "API host")
    }

    /// Forgets every loaded service and the last discovery.
    pub fn reset(&self) {
        self.inner.loaded.lock().clear();
        self.inner.discovered.lock().take();
        debug!("service registry reset");
    }
}

pub struct ServiceRegistryBuilder {
    containers: Arc<dyn ContainerRegistry>,
    connector: Arc<dyn ControllerConnector>,
    factories: FxHashMap<String, Factory>,
    options: ServiceOptions,
}

impl fmt::Debug for ServiceRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistryBuilder")
            .field("selectors", &self.factories.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ServiceRegistryBuilder {
    fn new(containers: Arc<dyn ContainerRegistry>, connector: Arc<dyn ControllerConnector>) -> Self {
        let mut factories = FxHashMap::default();
        factories.insert(AgentHost::SELECTOR.to_owned(), AgentHost::factory as Factory);
        factories.insert(ApiHost::SELECTOR.to_owned(), ApiHost::factory as Factory);
        factories.insert(PlainHost::SELECTOR.to_owned(), PlainHost::factory as Factory);

        Self { containers, connector, factories, options: ServiceOptions::default() }
    }

    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers `factory` for containers whose selector label is `selector`, replacing any
    /// previous registration.
    pub fn register(mut self, selector: impl Into<String>, factory: Factory) -> Self {
        self.factories.insert(selector.into(), factory);
        self
    }

    pub fn build(self) -> ServiceRegistry {
        let pool = WorkerPool::new(self.options.workers);

        ServiceRegistry {
            inner: Arc::new(RegistryInner {
                containers: self.containers,
                connector: self.connector,
                factories: self.factories,
                options: self.options,
                pool,
                loaded: Mutex::default(),
                discovered: Mutex::default(),
            }),
        }
    }
}
