//! Hosts, roles and endpoints of a virtual network test deployment.
//!
//! A deployment is a set of containers reached through a [`ContainerRegistry`]. Each container
//! is wrapped in a [`RemoteHost`], which runs commands in it, and exposed as a typed
//! [`ServiceHost`] role by the per-run [`ServiceRegistry`]. Agent hosts create
//! [`NamespaceInterface`]s, the endpoints tests send and capture traffic on.
//!
//! ```no_run
//! # async fn run(services: vnt_host::ServiceRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! use vnt_host::{GuestSpec, Interface, Packet};
//!
//! let agent = services.agent("midonet-agent-1").await?;
//! let a = agent.create_guest(GuestSpec { ipv4_addr: Some("172.16.1.2/24".into()), ..Default::default() }).await?;
//! let b = agent.create_guest(GuestSpec { ipv4_addr: Some("172.16.1.3/24".into()), ..Default::default() }).await?;
//!
//! let received = b.expect("udp and dst port 9", Some(std::time::Duration::from_secs(5)));
//! b.wait_capture_ready().await;
//! a.send_udp(&Packet::new(b.get_mac_addr().await?, b.get_ip().await?)).await?;
//! assert!(received.await?);
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::{ControllerError, HostError, IfaceError, RegistryError, Result};

mod options;
pub use options::{AgentOptions, ApiOptions, HostOptions, ServiceOptions};

mod registry;
pub use registry::{
    ContainerInfo, ContainerRegistry, ContainerSummary, Exec, ExecOptions, ExecOutput, ExecStatus,
    OutputStream, ROLE_LABEL, SELECTOR_LABEL,
};

mod host;
pub use host::{ExecHandle, ExitState, LineStream, Output, RemoteHost};

mod controller;
pub use controller::{
    ControllerClient, ControllerConnector, ControllerHost, ControllerPort, Endpoint, HostBinding,
    TunnelZone, TunnelZoneKind,
};

pub mod service;
pub use service::{
    downcast, AgentHost, ApiHost, Factory, PlainHost, ServiceContext, ServiceFailure, ServiceHost,
    ServiceRegistry, ServiceRegistryBuilder, ServiceStatus, Services,
};

pub mod iface;
pub use iface::{
    CaptureGate, CaptureGuard, CaptureState, GuestSpec, Handle, Interface, NamespaceInterface,
    Packet, PingOptions,
};

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use vnt_common::{Pending, WorkerPool};
