use std::time::Duration;

use vnt_common::Poller;
use vnt_host::TunnelZoneKind;

/// Options of the [`BindingManager`](crate::BindingManager).
#[derive(Debug, Clone)]
pub struct BindOptions {
    /// How long a bound port gets to become active, and an unbound one inactive.
    pub activation_timeout: Duration,
    pub activation_poll: Duration,
    /// Agent container name prefix. The host id of a binding is appended to it.
    pub agent_prefix: String,
}

impl BindOptions {
    pub const fn with_activation(mut self, interval: Duration, timeout: Duration) -> Self {
        self.activation_poll = interval;
        self.activation_timeout = timeout;
        self
    }

    pub fn with_agent_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.agent_prefix = prefix.into();
        self
    }

    /// Name of the agent container hosting the interfaces of `host_id`.
    pub fn agent_name(&self, host_id: u32) -> String {
        format!("{}{host_id}", self.agent_prefix)
    }

    pub(crate) const fn activation_poller(&self) -> Poller {
        Poller::new(self.activation_poll, self.activation_timeout)
    }
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(120),
            activation_poll: Duration::from_secs(1),
            agent_prefix: "midonet-agent-".to_owned(),
        }
    }
}

/// Options of the [`PhysicalTopologyManager`](crate::PhysicalTopologyManager).
#[derive(Debug, Clone)]
pub struct PhysicalOptions {
    /// Name of the tunnel zone created at build time. Every zone with this name is deleted at
    /// destroy time.
    pub zone_name: String,
    pub zone_kind: TunnelZoneKind,
}

impl PhysicalOptions {
    pub fn with_zone_name(mut self, name: impl Into<String>) -> Self {
        self.zone_name = name.into();
        self
    }

    pub const fn with_zone_kind(mut self, kind: TunnelZoneKind) -> Self {
        self.zone_kind = kind;
        self
    }
}

impl Default for PhysicalOptions {
    fn default() -> Self {
        Self { zone_name: "mdts-test".to_owned(), zone_kind: TunnelZoneKind::Gre }
    }
}
