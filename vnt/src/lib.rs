//! Integration-test harness binding virtual network topologies to namespace-backed interfaces on
//! container hosts.
//!
//! The crates of the workspace are re-exported as modules; the binding layer and the types tests
//! touch most are also available at the root.
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use vnt_bind as bind;
pub use vnt_command as command;
pub use vnt_common as common;
pub use vnt_host as host;

pub use vnt_bind::*;
pub use vnt_host::{
    AgentHost, ApiHost, ContainerRegistry, ControllerClient, ControllerConnector, GuestSpec,
    HostError, IfaceError, Interface, NamespaceInterface, Packet, PingOptions, ServiceHost,
    ServiceOptions, ServiceRegistry, ServiceStatus,
};

#[cfg(feature = "docker")]
pub use vnt_docker::DockerRegistry;
