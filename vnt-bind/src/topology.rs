use std::fmt;

use crate::Result;

/// Kind of a virtual port. Interior ports link two virtual devices together and can never be
/// attached to a host interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    ExteriorBridge,
    ExteriorRouter,
    InteriorBridge,
    InteriorRouter,
}

impl PortKind {
    pub const fn is_interior(&self) -> bool {
        matches!(self, Self::InteriorBridge | Self::InteriorRouter)
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::ExteriorBridge => "ExteriorBridge",
            Self::ExteriorRouter => "ExteriorRouter",
            Self::InteriorBridge => "InteriorBridge",
            Self::InteriorRouter => "InteriorRouter",
        };
        f.write_str(kind)
    }
}

/// A port of a virtual device, as created in the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPort {
    /// Controller id of the port.
    pub id: String,
    pub kind: PortKind,
}

/// The virtual network under test: bridges, routers and their ports, built through the
/// controller.
///
/// Implementations report their own failures with [`BindError::topology`](crate::BindError::topology)
/// and unknown ports with [`BindError::UnknownPort`](crate::BindError::UnknownPort).
#[async_trait::async_trait]
pub trait VirtualTopology: Send + Sync + 'static {
    async fn build(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    /// Port `port_id` of the device named `device`.
    async fn device_port(&self, device: &str, port_id: u32) -> Result<VirtualPort>;
}
