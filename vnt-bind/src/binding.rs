use std::{fmt, sync::Arc};

use rustc_hash::FxHashSet;
use serde::Deserialize;
use tracing::{debug, debug_span, error, info, warn, Instrument};
use vnt_common::PollError;
use vnt_host::{
    AgentHost, ControllerClient, GuestSpec, Interface, NamespaceInterface, ServiceHost,
    ServiceRegistry,
};

use crate::{
    physical::entries, BindError, BindOptions, PhysicalSubstrate, Result, VirtualPort,
    VirtualTopology,
};

/// Attachment of a virtual device port to an interface of an agent host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Binding {
    pub device_name: String,
    /// Index of the port on its device.
    pub port_id: u32,
    /// Agent index of the host the interface lives on.
    pub host_id: u32,
    /// Id of the interface in the physical topology.
    pub interface_id: u32,
}

impl Binding {
    pub fn new(device_name: impl Into<String>, port_id: u32, host_id: u32, interface_id: u32) -> Self {
        Self { device_name: device_name.into(), port_id, host_id, interface_id }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> host {} interface {}",
            self.device_name, self.port_id, self.host_id, self.interface_id
        )
    }
}

/// Ordered list of [`Binding`]s. Bindings are listed as single-key maps, e.g.
/// `{"binding": {"device_name": "bridge-000-001", ...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BindingSpec {
    #[serde(default, deserialize_with = "entries")]
    pub bindings: Vec<Binding>,
}

impl BindingSpec {
    pub fn new(bindings: impl IntoIterator<Item = Binding>) -> Self {
        Self { bindings: bindings.into_iter().collect() }
    }

    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Checks that no port and no interface appears twice.
    pub fn validate(&self) -> Result<()> {
        let mut ports = FxHashSet::default();
        let mut interfaces = FxHashSet::default();

        for b in &self.bindings {
            if !ports.insert((b.device_name.as_str(), b.port_id)) {
                return Err(BindError::DuplicateBinding(format!("port {}:{}", b.device_name, b.port_id)));
            }
            if !interfaces.insert((b.host_id, b.interface_id)) {
                return Err(BindError::DuplicateBinding(format!(
                    "interface {} of host {}",
                    b.interface_id, b.host_id
                )));
            }
        }

        Ok(())
    }
}

/// What went wrong while tearing a binding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    /// Detaching the interface from its port in the controller.
    Detach,
    /// Deleting the namespace of the interface.
    Destroy,
    VirtualTopology,
    PhysicalTopology,
}

#[derive(Debug)]
pub struct CleanupFailure {
    /// The interface, as `host/interface`, or the topology concerned.
    pub target: String,
    pub step: CleanupStep,
    pub error: BindError,
}

/// Failures absorbed by [`BindingManager::unbind`].
#[derive(Debug, Default)]
pub struct UnbindReport {
    failures: Vec<CleanupFailure>,
}

impl UnbindReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }

    fn push(&mut self, target: impl Into<String>, step: CleanupStep, error: BindError) {
        warn!(step = ?step, error = %error, "cleanup failed");
        self.failures.push(CleanupFailure { target: target.into(), step, error });
    }
}

/// A guest created for a binding.
#[derive(Debug)]
struct Guest {
    binding: Binding,
    agent: Arc<AgentHost>,
    iface: NamespaceInterface,
}

impl Guest {
    fn target(&self) -> String {
        format!("{}/{}", self.agent.name(), self.iface.id())
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Unbound,
    Bound(Vec<Guest>),
}

/// Maps the ports of a virtual topology to guest interfaces on agent hosts.
///
/// Every [`bind`](Self::bind) builds the physical substrate and the virtual topology from
/// scratch, creates one guest per binding, attaches it to its port and waits for the port to
/// become active. [`unbind`](Self::unbind) reverses all of it, going on past individual failures.
pub struct BindingManager {
    services: ServiceRegistry,
    ptm: Arc<dyn PhysicalSubstrate>,
    vtm: Arc<dyn VirtualTopology>,
    options: BindOptions,
    state: State,
}

impl fmt::Debug for BindingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingManager")
            .field("options", &self.options)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl BindingManager {
    pub fn new(
        services: ServiceRegistry,
        ptm: Arc<dyn PhysicalSubstrate>,
        vtm: Arc<dyn VirtualTopology>,
    ) -> Self {
        Self { services, ptm, vtm, options: BindOptions::default(), state: State::Unbound }
    }

    pub fn with_options(mut self, options: BindOptions) -> Self {
        self.options = options;
        self
    }

    pub const fn is_bound(&self) -> bool {
        matches!(self.state, State::Bound(_))
    }

    /// Binds every port of `spec`.
    ///
    /// Ports and interface descriptions are all resolved before the first guest is created, so a
    /// spec naming an interior port fails without touching any host. On failure, everything built
    /// so far is torn down again.
    pub async fn bind(&mut self, spec: &BindingSpec) -> Result<()> {
        if self.is_bound() {
            return Err(BindError::AlreadyBound);
        }
        spec.validate()?;

        let mut guests = Vec::with_capacity(spec.bindings.len());
        match self.bind_all(spec, &mut guests).await {
            Ok(()) => {
                info!(bindings = guests.len(), "topology bound");
                self.state = State::Bound(guests);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "bind failed, rolling back");
                let report = self.teardown(guests).await;
                if !report.is_clean() {
                    warn!(failures = report.failures.len(), "rollback left residue behind");
                }
                Err(e)
            }
        }
    }

    async fn bind_all(&self, spec: &BindingSpec, guests: &mut Vec<Guest>) -> Result<()> {
        self.ptm.build().await?;
        self.vtm.build().await?;

        let mut resolved = Vec::with_capacity(spec.bindings.len());
        for binding in &spec.bindings {
            let port = self.vtm.device_port(&binding.device_name, binding.port_id).await?;
            if port.kind.is_interior() {
                error!(%binding, kind = %port.kind, "interior ports cannot be bound");
                return Err(BindError::InteriorPort {
                    device: binding.device_name.clone(),
                    port_id: binding.port_id,
                });
            }

            let guest = self.ptm.interface_spec(binding.host_id, binding.interface_id)?;
            resolved.push((binding, port, guest));
        }

        for (binding, port, guest) in resolved {
            let span = debug_span!(
                "bind",
                device = %binding.device_name,
                port_id = binding.port_id,
                host_id = binding.host_id,
                interface_id = binding.interface_id
            );
            self.bind_one(binding, port, guest, guests).instrument(span).await?;
        }

        Ok(())
    }

    async fn bind_one(
        &self,
        binding: &Binding,
        port: VirtualPort,
        spec: GuestSpec,
        guests: &mut Vec<Guest>,
    ) -> Result<()> {
        let agent = self.services.agent(&self.options.agent_name(binding.host_id)).await?;

        let iface = agent.create_guest(spec).await?;
        guests.push(Guest { binding: binding.clone(), agent: Arc::clone(&agent), iface: iface.clone() });

        iface.clear_arp().await?;

        agent.bind_port(&iface, &port.id).await?;
        iface.set_vport_id(Some(port.id.clone()));

        let controller = agent.controller().await?;
        self.await_port(controller.as_ref(), &port.id, true).await?;

        debug!(iface = iface.id(), vport_id = %port.id, "port active");
        Ok(())
    }

    /// Detaches and destroys every guest, then destroys the virtual topology and the physical
    /// substrate. Individual failures are logged and collected in the report.
    pub async fn unbind(&mut self) -> Result<UnbindReport> {
        let State::Bound(guests) = std::mem::take(&mut self.state) else {
            return Err(BindError::NotBound);
        };

        let report = self.teardown(guests).await;
        info!(failures = report.failures.len(), "topology unbound");
        Ok(report)
    }

    async fn teardown(&self, guests: Vec<Guest>) -> UnbindReport {
        let mut report = UnbindReport::default();

        for guest in &guests {
            let span = debug_span!("unbind", binding = %guest.binding, iface = guest.iface.id());
            async {
                if let Err(e) = self.detach(guest).await {
                    report.push(guest.target(), CleanupStep::Detach, e);
                }
                if let Err(e) = guest.agent.destroy_guest(&guest.iface).await {
                    report.push(guest.target(), CleanupStep::Destroy, e.into());
                }
            }
            .instrument(span)
            .await;
        }

        if let Err(e) = self.vtm.destroy().await {
            report.push("virtual topology", CleanupStep::VirtualTopology, e);
        }
        if let Err(e) = self.ptm.destroy().await {
            report.push("physical topology", CleanupStep::PhysicalTopology, e);
        }

        report
    }

    /// Deletes the host port attachments of the guest, matched by interface name, and waits for
    /// the ports to go inactive. Ports already gone are skipped.
    async fn detach(&self, guest: &Guest) -> Result<()> {
        let controller = guest.agent.controller().await?;
        let host_id = guest.agent.controller_host_id();

        let bindings = controller.host_bindings(host_id).await?;
        for b in bindings.iter().filter(|b| b.interface_name == guest.iface.host_ifname()) {
            match controller.unbind_interface(host_id, &b.port_id).await {
                Ok(()) => debug!(port_id = %b.port_id, "interface detached"),
                Err(e) if e.is_not_found() => debug!(port_id = %b.port_id, "port already detached"),
                Err(e) => return Err(e.into()),
            }

            self.await_port(controller.as_ref(), &b.port_id, false).await?;
        }

        guest.iface.set_vport_id(None);
        Ok(())
    }

    /// Polls the controller until the port reaches the `active` state. A port that no longer
    /// exists counts as inactive.
    async fn await_port(&self, controller: &dyn ControllerClient, port_id: &str, active: bool) -> Result<()> {
        let poller = self.options.activation_poller();

        poller
            .until(move || async move {
                match controller.port(port_id).await {
                    Ok(port) => Ok((port.active == active).then_some(())),
                    Err(e) if e.is_not_found() && !active => Ok(Some(())),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| match e {
                PollError::Timeout { .. } => BindError::ActivationTimeout {
                    port_id: port_id.to_owned(),
                    active,
                    after: poller.timeout,
                },
                PollError::Inner(e) => e.into(),
            })
    }

    fn guests(&self) -> Result<&[Guest]> {
        match &self.state {
            State::Bound(guests) => Ok(guests),
            State::Unbound => Err(BindError::NotBound),
        }
    }

    /// The interface bound to port `port_id` of `device`.
    pub fn get_iface_for_port(&self, device: &str, port_id: u32) -> Result<&NamespaceInterface> {
        self.guests()?
            .iter()
            .find(|g| g.binding.device_name == device && g.binding.port_id == port_id)
            .map(|g| &g.iface)
            .ok_or_else(|| BindError::UnknownPort { device: device.to_owned(), port_id })
    }

    /// The interface created for `interface_id` of host `host_id`.
    pub fn get_iface(&self, host_id: u32, interface_id: u32) -> Result<&NamespaceInterface> {
        self.guests()?
            .iter()
            .find(|g| g.binding.host_id == host_id && g.binding.interface_id == interface_id)
            .map(|g| &g.iface)
            .ok_or(BindError::UnknownInterface { host_id, interface_id })
    }

    /// Bound interfaces, in binding order.
    pub fn interfaces(&self) -> impl Iterator<Item = &NamespaceInterface> {
        let guests: &[Guest] = match &self.state {
            State::Bound(guests) => guests,
            State::Unbound => &[],
        };
        guests.iter().map(|g| &g.iface)
    }
}
