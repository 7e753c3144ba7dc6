use std::time::Duration;

use thiserror::Error;
use vnt_host::{ControllerError, HostError, IfaceError};

#[derive(Debug, Error)]
pub enum BindError {
    #[error("port {port_id} of {device} is an interior port and cannot be bound to an interface")]
    InteriorPort { device: String, port_id: u32 },
    #[error("no topology is bound")]
    NotBound,
    #[error("a topology is already bound, unbind it first")]
    AlreadyBound,
    #[error("duplicate binding for {0}")]
    DuplicateBinding(String),
    #[error("device {device} has no port {port_id}")]
    UnknownPort { device: String, port_id: u32 },
    #[error("host {host_id} has no interface {interface_id}")]
    UnknownInterface { host_id: u32, interface_id: u32 },
    #[error("port {port_id} did not reach active={active} within {after:?}")]
    ActivationTimeout { port_id: String, active: bool, after: Duration },
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Iface(#[from] IfaceError),
    #[error("virtual topology error: {0}")]
    Topology(Box<dyn std::error::Error + Send + Sync>),
}

impl BindError {
    /// Misuse of the binding manager or of a binding spec. Retrying the same call cannot succeed.
    pub const fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::InteriorPort { .. } | Self::NotBound | Self::AlreadyBound | Self::DuplicateBinding(_)
        )
    }

    /// Wraps an error raised by a [`VirtualTopology`](crate::VirtualTopology) implementation.
    pub fn topology(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Topology(e.into())
    }
}

pub type Result<T> = std::result::Result<T, BindError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_are_classified() {
        assert!(BindError::NotBound.is_usage());
        assert!(BindError::InteriorPort { device: "bridge-000-001".into(), port_id: 3 }.is_usage());
        assert!(!BindError::UnknownPort { device: "bridge-000-001".into(), port_id: 3 }.is_usage());

        let timeout = BindError::ActivationTimeout {
            port_id: "port-1".into(),
            active: false,
            after: Duration::from_secs(2),
        };
        assert!(!timeout.is_usage());
        assert_eq!(timeout.to_string(), "port port-1 did not reach active=false within 2s");
    }
}
