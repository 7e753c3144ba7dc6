use std::{fmt, net::Ipv4Addr, str::FromStr, sync::Arc};

use crate::ControllerError;

/// A host as registered in the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerHost {
    pub id: String,
    pub name: String,
    pub alive: bool,
}

/// A virtual port, as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPort {
    pub id: String,
    /// Set while the port is bound to a host interface and the binding is in effect.
    pub active: bool,
}

/// Attachment of a host interface to a virtual port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    pub host_id: String,
    pub port_id: String,
    pub interface_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TunnelZoneKind {
    #[default]
    Gre,
    Vxlan,
}

impl TunnelZoneKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gre => "gre",
            Self::Vxlan => "vxlan",
        }
    }
}

impl fmt::Display for TunnelZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelZoneKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gre" => Ok(Self::Gre),
            "vxlan" => Ok(Self::Vxlan),
            other => Err(ControllerError::Rejected(format!("unknown tunnel zone kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelZone {
    pub id: String,
    pub name: String,
    pub kind: TunnelZoneKind,
}

/// Where and how to reach the controller API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// The subset of the controller API the harness drives: hosts, port activation, interface
/// attachments and tunnel zones.
#[async_trait::async_trait]
pub trait ControllerClient: Send + Sync + 'static {
    async fn hosts(&self) -> Result<Vec<ControllerHost>, ControllerError>;

    async fn port(&self, port_id: &str) -> Result<ControllerPort, ControllerError>;

    /// Attaches the host interface `interface_name` to `port_id`.
    async fn bind_interface(
        &self,
        host_id: &str,
        port_id: &str,
        interface_name: &str,
    ) -> Result<(), ControllerError>;

    async fn host_bindings(&self, host_id: &str) -> Result<Vec<HostBinding>, ControllerError>;

    async fn unbind_interface(&self, host_id: &str, port_id: &str) -> Result<(), ControllerError>;

    async fn tunnel_zones(&self) -> Result<Vec<TunnelZone>, ControllerError>;

    async fn create_tunnel_zone(
        &self,
        name: &str,
        kind: TunnelZoneKind,
    ) -> Result<TunnelZone, ControllerError>;

    async fn add_tunnel_zone_host(
        &self,
        zone_id: &str,
        host_id: &str,
        ip: Ipv4Addr,
    ) -> Result<(), ControllerError>;

    async fn delete_tunnel_zone(&self, zone_id: &str) -> Result<(), ControllerError>;
}

/// Opens controller clients. Connecting may fail while the controller is coming up.
#[async_trait::async_trait]
pub trait ControllerConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ControllerClient>, ControllerError>;
}
