//! Topology binding for the vnt harness.
//!
//! A [`BindingManager`] takes a [`BindingSpec`], a [`PhysicalSubstrate`] describing the agent
//! hosts and their interfaces, and a [`VirtualTopology`] owning the virtual devices under test.
//! Binding creates one namespace-backed interface per binding and attaches it to its virtual
//! port; unbinding takes everything down again.

mod error;
pub use error::{BindError, Result};

mod options;
pub use options::{BindOptions, PhysicalOptions};

mod physical;
pub use physical::{
    PhysicalHost, PhysicalInterface, PhysicalSubstrate, PhysicalTopology, PhysicalTopologyManager,
};

mod topology;
pub use topology::{PortKind, VirtualPort, VirtualTopology};

mod binding;
pub use binding::{
    Binding, BindingManager, BindingSpec, CleanupFailure, CleanupStep, UnbindReport,
};
