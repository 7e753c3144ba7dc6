//! The physical substrate: agent hosts, their guest interfaces and the tunnel zone joining them.

use std::net::Ipv4Addr;

use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};
use vnt_host::{GuestSpec, ServiceHost, ServiceRegistry};

use crate::{BindError, PhysicalOptions, Result};

/// Declarative description of the hosts of a test and of the interfaces guests get on them.
///
/// Hosts and interfaces are listed as single-key maps, e.g. `{"host": {"id": 1, ...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PhysicalTopology {
    #[serde(default, deserialize_with = "entries")]
    pub hosts: Vec<PhysicalHost>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PhysicalHost {
    /// Agent index: the host is the agent container named after it.
    pub id: u32,
    #[serde(default, deserialize_with = "entries")]
    pub interfaces: Vec<PhysicalInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PhysicalInterface {
    pub id: u32,
    pub ifname: Option<String>,
    pub hw_addr: Option<String>,
    /// Only the first address is configured.
    #[serde(default)]
    pub ipv4_addr: Vec<String>,
    pub ipv4_gw: Option<Ipv4Addr>,
    pub mtu: Option<u32>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub ipv6_addr: Vec<String>,
}

impl PhysicalInterface {
    /// Guest parameters of this interface. The id, type and IPv6 addresses are description only.
    pub fn guest_spec(&self) -> GuestSpec {
        GuestSpec {
            ifname: self.ifname.clone(),
            hw_addr: self.hw_addr.clone(),
            ipv4_addr: self.ipv4_addr.first().cloned(),
            ipv4_gw: self.ipv4_gw,
            mtu: self.mtu,
        }
    }
}

impl PhysicalTopology {
    pub fn host(&self, host_id: u32) -> Option<&PhysicalHost> {
        self.hosts.iter().find(|h| h.id == host_id)
    }

    pub fn interface(&self, host_id: u32, interface_id: u32) -> Option<&PhysicalInterface> {
        self.host(host_id)?.interfaces.iter().find(|i| i.id == interface_id)
    }
}

#[derive(Deserialize)]
struct Entry<T> {
    #[serde(alias = "host", alias = "interface", alias = "binding")]
    item: T,
}

/// Unwraps a list of single-key maps.
pub(crate) fn entries<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let entries = Vec::<Entry<T>>::deserialize(deserializer)?;
    Ok(entries.into_iter().map(|e| e.item).collect())
}

/// Everything the binding manager needs from the physical side.
#[async_trait::async_trait]
pub trait PhysicalSubstrate: Send + Sync + 'static {
    async fn build(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    /// Guest parameters of the interface `interface_id` of host `host_id`.
    fn interface_spec(&self, host_id: u32, interface_id: u32) -> Result<GuestSpec>;
}

/// Sets up the tunnel zone the agents of the run exchange overlay traffic through, and hands out
/// the guest parameters of a [`PhysicalTopology`].
#[derive(Debug, Clone)]
pub struct PhysicalTopologyManager {
    topology: PhysicalTopology,
    services: ServiceRegistry,
    options: PhysicalOptions,
}

impl PhysicalTopologyManager {
    pub fn new(topology: PhysicalTopology, services: ServiceRegistry) -> Self {
        Self { topology, services, options: PhysicalOptions::default() }
    }

    pub fn with_options(mut self, options: PhysicalOptions) -> Self {
        self.options = options;
        self
    }

    pub fn topology(&self) -> &PhysicalTopology {
        &self.topology
    }
}

#[async_trait::async_trait]
impl PhysicalSubstrate for PhysicalTopologyManager {
    /// Creates the tunnel zone and registers every agent host in it with its current address.
    async fn build(&self) -> Result<()> {
        let agents = self.services.agents().await?;
        let controller = self.services.api().await?.controller().await?;

        let zone = controller.create_tunnel_zone(&self.options.zone_name, self.options.zone_kind).await?;
        debug!(zone_id = %zone.id, name = %zone.name, kind = %zone.kind, "tunnel zone created");

        for agent in &agents {
            let ip = agent.host().current_ip().await?;
            controller.add_tunnel_zone_host(&zone.id, agent.controller_host_id(), ip).await?;
            debug!(zone_id = %zone.id, host = agent.name(), %ip, "host added to tunnel zone");
        }

        info!(zone = %zone.name, hosts = agents.len(), "physical topology built");
        Ok(())
    }

    /// Deletes every tunnel zone named after the harness zone, including leftovers of earlier runs.
    async fn destroy(&self) -> Result<()> {
        let controller = self.services.api().await?.controller().await?;

        let zones = controller.tunnel_zones().await?;
        for zone in zones.iter().filter(|z| z.name == self.options.zone_name) {
            match controller.delete_tunnel_zone(&zone.id).await {
                Ok(()) => debug!(zone_id = %zone.id, "tunnel zone deleted"),
                Err(e) if e.is_not_found() => warn!(zone_id = %zone.id, "tunnel zone already gone"),
                Err(e) => return Err(e.into()),
            }
        }

        info!(zone = %self.options.zone_name, "physical topology destroyed");
        Ok(())
    }

    fn interface_spec(&self, host_id: u32, interface_id: u32) -> Result<GuestSpec> {
        self.topology
            .interface(host_id, interface_id)
            .map(PhysicalInterface::guest_spec)
            .ok_or(BindError::UnknownInterface { host_id, interface_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> PhysicalTopology {
        serde_json::from_value(serde_json::json!({
            "hosts": [
                { "host": {
                    "id": 1,
                    "interfaces": [
                        { "interface": {
                            "id": 1,
                            "ifname": "eth0",
                            "hw_addr": "aa:bb:cc:00:01:01",
                            "ipv4_addr": ["172.16.1.1/24", "172.16.1.100/24"],
                            "ipv4_gw": "172.16.1.254",
                            "ipv6_addr": ["fe80::1/64"],
                            "type": "vmguest"
                        } }
                    ]
                } },
                { "host": { "id": 2 } }
            ],
            "bridges": []
        }))
        .unwrap()
    }

    #[test]
    fn description_is_read_from_wrapped_entries() {
        let topology = topology();

        assert_eq!(topology.hosts.len(), 2);
        assert!(topology.host(2).unwrap().interfaces.is_empty());

        let iface = topology.interface(1, 1).unwrap();
        assert_eq!(iface.kind.as_deref(), Some("vmguest"));
        assert_eq!(iface.ipv6_addr, vec!["fe80::1/64"]);
        assert!(topology.interface(1, 2).is_none());
        assert!(topology.interface(3, 1).is_none());
    }

    #[test]
    fn guest_spec_keeps_the_first_address_only() {
        let spec = topology().interface(1, 1).unwrap().guest_spec();

        assert_eq!(
            spec,
            GuestSpec {
                ifname: Some("eth0".to_owned()),
                hw_addr: Some("aa:bb:cc:00:01:01".to_owned()),
                ipv4_addr: Some("172.16.1.1/24".to_owned()),
                ipv4_gw: Some(Ipv4Addr::new(172, 16, 1, 254)),
                mtu: None,
            }
        );
    }
}
