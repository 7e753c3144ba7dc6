use std::{
    any::Any,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, FutureExt};
use tracing::{debug, error, info, warn};
use vnt_command::{ip, sysctl, Command};
use vnt_common::WorkerPool;

use super::{downcast, ApiHost, ServiceContext, ServiceHost, ServiceStatus, Services};
use crate::{
    AgentOptions, ControllerClient, GuestSpec, HostBinding, HostError, Interface,
    NamespaceInterface, RemoteHost, Result, ROLE_LABEL,
};

/// A compute host running the network agent. Guests are created on it as namespace-backed
/// interfaces and bound to virtual ports through the controller.
#[derive(Debug)]
pub struct AgentHost {
    host: RemoteHost,
    role: String,
    api: Arc<ApiHost>,
    controller_host_id: String,
    index: u32,
    guests: AtomicU32,
    pool: WorkerPool,
    options: AgentOptions,
    links: Services,
}

impl AgentHost {
    pub const SELECTOR: &'static str = "vnt.agent";

    /// The [`Factory`](super::Factory) registered for [`Self::SELECTOR`].
    pub fn factory(ctx: ServiceContext) -> BoxFuture<'static, Result<Arc<dyn ServiceHost>>> {
        async move { Ok(Arc::new(Self::load(ctx).await?) as Arc<dyn ServiceHost>) }.boxed()
    }

    /// Resolves the linked API host, reads the controller host id and prepares the host.
    pub async fn load(ctx: ServiceContext) -> Result<Self> {
        let options = ctx.options().agent.clone();
        let host = ctx.host.clone();
        let role = host.label(ROLE_LABEL).unwrap_or(&options.role).to_owned();

        let api = ctx.linked(&ctx.options().api.role, &options.api_link)?;
        let api = downcast::<ApiHost>(api, "API host")?;

        let properties = host.exec(Command::new("cat").arg(&options.host_id_file)).await?;
        let controller_host_id = parse_host_id(&properties).ok_or_else(|| HostError::Parse {
            host: host.name().to_owned(),
            what: "controller host id",
            output: properties.clone(),
        })?;

        let index = parse_index(host.name(), &options.name_prefix).ok_or_else(|| HostError::Parse {
            host: host.name().to_owned(),
            what: "agent index",
            output: host.name().to_owned(),
        })?;

        if options.disable_ipv6 {
            for cmd in sysctl::disable_ipv6() {
                host.exec(cmd).await?;
            }
        }

        info!(host = host.name(), %controller_host_id, index, "agent host loaded");

        Ok(Self {
            host,
            role,
            api,
            controller_host_id,
            index,
            guests: AtomicU32::new(0),
            pool: ctx.pool().clone(),
            options,
            links: ctx.links,
        })
    }

    /// Id of this host in the controller.
    pub fn controller_host_id(&self) -> &str {
        &self.controller_host_id
    }

    /// Index of the agent, taken from its container name.
    pub const fn index(&self) -> u32 {
        self.index
    }

    pub fn api(&self) -> &Arc<ApiHost> {
        &self.api
    }

    /// A fresh controller client.
    pub async fn controller(&self) -> Result<Arc<dyn ControllerClient>> {
        self.api.controller().await
    }

    /// Creates a guest: a veth pair whose peer end lives in its own network namespace, with the
    /// addressing of `spec`. Without an explicit hardware address, one is derived as
    /// `aa:bb:cc:RR:HH:II` (random byte, agent index, guest counter).
    pub async fn create_guest(&self, mut spec: GuestSpec) -> Result<NamespaceInterface> {
        let n = self.guests.fetch_add(1, Ordering::Relaxed) + 1;
        let id = spec.ifname.clone().unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));

        if spec.hw_addr.is_none() {
            spec.hw_addr = Some(format!(
                "aa:bb:cc:{:02X}:{:02X}:{:02X}",
                rand::random::<u8>(),
                self.index % 255,
                n % 255
            ));
        }

        let guest = NamespaceInterface::new(self.host.clone(), id, spec, self.pool.clone());
        debug!(host = self.host.name(), guest = guest.id(), "creating guest");

        if let Err(e) = self.provision(&guest).await {
            warn!(host = self.host.name(), guest = guest.id(), error = %e, "guest creation failed, cleaning up");
            self.clean_up(&guest).await;
            return Err(e);
        }

        info!(host = self.host.name(), guest = guest.id(), hw_addr = ?guest.hw_addr(), "guest created");
        Ok(guest)
    }

    async fn provision(&self, guest: &NamespaceInterface) -> Result<()> {
        let (netns, ifname, host_ifname) = (guest.netns(), guest.ifname(), guest.host_ifname());
        let spec = guest.spec();

        self.host.exec(ip::veth_add(host_ifname, ifname)).await?;
        self.host.exec(ip::netns_add(netns)).await?;

        if self.options.disable_ipv6 {
            for cmd in sysctl::disable_ipv6() {
                self.host.exec(ip::netns_exec(netns, cmd)).await?;
            }
        }

        if let Some(hw_addr) = &spec.hw_addr {
            self.host.exec(ip::link_set_address(ifname, hw_addr)).await?;
        }
        self.host.exec(ip::link_up(host_ifname)).await?;
        self.host.exec(ip::link_up_in_netns(ifname, netns)).await?;

        if let Some(cidr) = &spec.ipv4_addr {
            self.host.exec(ip::netns_exec(netns, ip::addr_add(ifname, cidr))).await?;
        }
        if let Some(gw) = spec.ipv4_gw {
            self.host.exec(ip::netns_exec(netns, ip::route_add_default(&gw.to_string()))).await?;
        }
        if let Some(mtu) = spec.mtu {
            self.host.exec(ip::netns_exec(netns, ip::link_set_mtu(ifname, mtu))).await?;
        }

        Ok(())
    }

    /// Removes what a failed creation may have left behind.
    async fn clean_up(&self, guest: &NamespaceInterface) {
        for cmd in [ip::netns_del(guest.netns()), ip::link_del(guest.host_ifname())] {
            match self.host.exec_unchecked(cmd).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    warn!(host = self.host.name(), command = %output.command, code = output.exit.code(), "cleanup command failed")
                }
                Err(e) => warn!(host = self.host.name(), guest = guest.id(), error = %e, "cleanup command failed"),
            }
        }
    }

    pub async fn destroy_guest(&self, guest: &NamespaceInterface) -> Result<()> {
        guest.destroy().await
    }

    /// Attaches the host end of `guest` to the virtual port `port_id`.
    pub async fn bind_port(&self, guest: &NamespaceInterface, port_id: &str) -> Result<()> {
        debug!(host = self.host.name(), guest = guest.id(), port_id, "binding port");
        self.controller()
            .await?
            .bind_interface(&self.controller_host_id, port_id, guest.host_ifname())
            .await?;
        Ok(())
    }

    /// Interface attachments of this host, as known by the controller.
    pub async fn bindings(&self) -> Result<Vec<HostBinding>> {
        Ok(self.controller().await?.host_bindings(&self.controller_host_id).await?)
    }
}

#[async_trait::async_trait]
impl ServiceHost for AgentHost {
    fn host(&self) -> &RemoteHost {
        &self.host
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn service_name(&self) -> &str {
        &self.options.service_name
    }

    /// Liveness of this host according to the controller.
    async fn status(&self) -> Result<ServiceStatus> {
        let hosts = self.controller().await?.hosts().await?;

        match hosts.iter().find(|h| h.id == self.controller_host_id) {
            Some(h) => {
                debug!(host_id = %h.id, alive = h.alive, "host found");
                Ok(if h.alive { ServiceStatus::Up } else { ServiceStatus::Down })
            }
            None => {
                error!(host_id = %self.controller_host_id, "host not found");
                Err(HostError::HostNotFound(self.controller_host_id.clone()))
            }
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn links(&self) -> &Services {
        &self.links
    }
}

/// The value of the last `key=value` line of a properties file.
fn parse_host_id(properties: &str) -> Option<String> {
    let line = properties.lines().rev().find(|line| !line.trim().is_empty())?;
    let (_, value) = line.split_once('=')?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

/// The number following `prefix` in a container name, e.g. `2` in `mdts_midonet-agent-2_1`.
fn parse_index(name: &str, prefix: &str) -> Option<u32> {
    let (_, rest) = name.split_once(prefix)?;
    let digits = rest.find(|c: char| !c.is_ascii_digit()).map_or(rest, |end| &rest[..end]);
    digits.parse().ok()
}
