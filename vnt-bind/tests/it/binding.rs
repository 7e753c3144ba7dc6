use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::Instant;
use vnt_bind::{
    BindError, BindOptions, Binding, BindingManager, BindingSpec, CleanupStep, PhysicalTopology,
    PhysicalTopologyManager, PortKind, VirtualPort, VirtualTopology,
};
use vnt_host::{
    testing::{FakeController, FakeDeployment, FakeExec},
    ControllerClient, Interface, Packet,
};

const BRIDGE: &str = "bridge-000-001";

/// A bridge whose ports are registered in the controller at build time.
#[derive(Debug)]
struct FakeVirtualTopology {
    controller: FakeController,
    ports: Vec<(String, u32, VirtualPort, bool)>,
    builds: AtomicUsize,
    destroys: AtomicUsize,
}

impl FakeVirtualTopology {
    fn new(controller: FakeController) -> Self {
        Self { controller, ports: Vec::new(), builds: AtomicUsize::new(0), destroys: AtomicUsize::new(0) }
    }

    fn with_port(self, device: &str, port_id: u32, kind: PortKind) -> Self {
        self.port(device, port_id, kind, false)
    }

    /// A port that never becomes active.
    fn with_dead_port(self, device: &str, port_id: u32) -> Self {
        self.port(device, port_id, PortKind::ExteriorBridge, true)
    }

    fn port(mut self, device: &str, port_id: u32, kind: PortKind, dead: bool) -> Self {
        let port = VirtualPort { id: format!("{device}-port-{port_id}"), kind };
        self.ports.push((device.to_owned(), port_id, port, dead));
        self
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VirtualTopology for FakeVirtualTopology {
    async fn build(&self) -> vnt_bind::Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        for (_, _, port, dead) in &self.ports {
            if *dead {
                self.controller.add_dead_port(&port.id);
            } else {
                self.controller.add_port(&port.id);
            }
        }
        Ok(())
    }

    async fn destroy(&self) -> vnt_bind::Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn device_port(&self, device: &str, port_id: u32) -> vnt_bind::Result<VirtualPort> {
        self.ports
            .iter()
            .find(|(d, p, ..)| d == device && *p == port_id)
            .map(|(_, _, port, _)| port.clone())
            .ok_or_else(|| BindError::UnknownPort { device: device.to_owned(), port_id })
    }
}

fn physical() -> PhysicalTopology {
    serde_json::from_value(serde_json::json!({
        "hosts": [
            { "host": { "id": 1, "interfaces": [
                { "interface": { "id": 1, "ipv4_addr": ["172.16.1.1/24"], "type": "vmguest" } }
            ] } },
            { "host": { "id": 2, "interfaces": [
                { "interface": { "id": 1, "ipv4_addr": ["172.16.1.2/24"], "type": "vmguest" } }
            ] } }
        ]
    }))
    .unwrap()
}

fn two_vms() -> BindingSpec {
    BindingSpec::new([Binding::new(BRIDGE, 1, 1, 1), Binding::new(BRIDGE, 2, 2, 1)])
}

struct Fixture {
    deployment: FakeDeployment,
    vtm: Arc<FakeVirtualTopology>,
    manager: BindingManager,
}

impl Fixture {
    fn new() -> Self {
        Self::with(|vtm| vtm, BindOptions::default())
    }

    fn with(
        ports: impl FnOnce(FakeVirtualTopology) -> FakeVirtualTopology,
        options: BindOptions,
    ) -> Self {
        let deployment = FakeDeployment::new(2);
        let services = deployment.services();

        let vtm = FakeVirtualTopology::new(deployment.controller.clone())
            .with_port(BRIDGE, 1, PortKind::ExteriorBridge)
            .with_port(BRIDGE, 2, PortKind::ExteriorBridge)
            .with_port(BRIDGE, 3, PortKind::InteriorBridge);
        let vtm = Arc::new(ports(vtm));

        let ptm = PhysicalTopologyManager::new(physical(), services.clone());
        let manager = BindingManager::new(services, Arc::new(ptm), vtm.clone()).with_options(options);

        Self { deployment, vtm, manager }
    }

    fn namespaces(&self) -> Vec<String> {
        (1..=2).flat_map(|i| self.deployment.registry.namespaces(&FakeDeployment::agent_name(i))).collect()
    }
}

#[tokio::test(start_paused = true)]
async fn unbind_leaves_nothing_behind() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut fx = Fixture::new();
    let controller = &fx.deployment.controller;

    fx.manager.bind(&two_vms()).await.unwrap();
    assert!(fx.manager.is_bound());
    assert_eq!(fx.namespaces().len(), 2);
    assert_eq!(controller.bindings().len(), 2);

    let zones = controller.zones();
    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0].name, "mdts-test");
    assert_eq!(controller.zone_members(&zones[0].id).len(), 2);

    let iface = fx.manager.get_iface_for_port(BRIDGE, 1).unwrap().clone();
    assert_eq!(iface.vport_id().as_deref(), Some("bridge-000-001-port-1"));
    assert_eq!(fx.manager.interfaces().count(), 2);

    let report = fx.manager.unbind().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(!fx.manager.is_bound());

    assert!(fx.namespaces().is_empty());
    assert!(controller.bindings().is_empty());
    assert!(controller.zones().is_empty());
    assert_eq!(iface.vport_id(), None);
    assert_eq!((fx.vtm.builds(), fx.vtm.destroys()), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn interior_ports_are_rejected_before_any_interface_exists() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut fx = Fixture::new();

    let spec = BindingSpec::new([Binding::new(BRIDGE, 1, 1, 1), Binding::new(BRIDGE, 3, 2, 1)]);
    let err = fx.manager.bind(&spec).await.unwrap_err();

    assert!(err.is_usage(), "{err}");
    assert!(matches!(err, BindError::InteriorPort { ref device, port_id: 3 } if device == BRIDGE));
    assert!(!fx.manager.is_bound());

    for i in 1..=2 {
        let commands = fx.deployment.registry.commands(&FakeDeployment::agent_name(i));
        assert!(!commands.iter().any(|c| c.contains("netns add")), "{commands:?}");
    }

    // Rolled back.
    assert!(fx.deployment.controller.zones().is_empty());
    assert_eq!(fx.vtm.destroys(), 1);
}

#[tokio::test(start_paused = true)]
async fn udp_crosses_hosts_again_after_a_rebind() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut fx = Fixture::new();
    let spec = two_vms();

    for round in 0..2 {
        fx.manager.bind(&spec).await.unwrap();

        let sender = fx.manager.get_iface_for_port(BRIDGE, 1).unwrap().clone();
        let receiver = fx.manager.get_iface(2, 1).unwrap().clone();

        let received = receiver.expect("udp and dst port 9", Some(Duration::from_secs(5)));
        receiver.wait_capture_ready().await;

        let packet = Packet::new(receiver.get_mac_addr().await.unwrap(), receiver.get_ip().await.unwrap());
        sender.send_udp(&packet).await.unwrap();
        assert!(received.await.unwrap(), "round {round}");

        assert!(fx.manager.unbind().await.unwrap().is_clean());
    }

    assert_eq!((fx.vtm.builds(), fx.vtm.destroys()), (2, 2));
}

#[tokio::test(start_paused = true)]
async fn bound_state_is_enforced() {
    let mut fx = Fixture::new();

    let err = fx.manager.get_iface_for_port(BRIDGE, 1).unwrap_err();
    assert!(matches!(err, BindError::NotBound) && err.is_usage());
    assert!(matches!(fx.manager.get_iface(1, 1), Err(BindError::NotBound)));
    assert!(matches!(fx.manager.unbind().await, Err(BindError::NotBound)));
    assert_eq!(fx.manager.interfaces().count(), 0);

    fx.manager.bind(&two_vms()).await.unwrap();
    assert!(matches!(fx.manager.bind(&two_vms()).await, Err(BindError::AlreadyBound)));
    assert!(matches!(fx.manager.get_iface_for_port(BRIDGE, 9), Err(BindError::UnknownPort { port_id: 9, .. })));
    assert!(matches!(
        fx.manager.get_iface(2, 7),
        Err(BindError::UnknownInterface { host_id: 2, interface_id: 7 })
    ));

    // The rejected bind did not disturb the bound topology.
    assert_eq!(fx.namespaces().len(), 2);
    assert!(fx.manager.unbind().await.unwrap().is_clean());
}

#[tokio::test(start_paused = true)]
async fn ports_already_detached_are_tolerated() {
    let mut fx = Fixture::new();
    fx.manager.bind(&two_vms()).await.unwrap();

    let host_id = FakeDeployment::host_id(1);
    fx.deployment.controller.unbind_interface(&host_id, "bridge-000-001-port-1").await.unwrap();

    let report = fx.manager.unbind().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(fx.namespaces().is_empty());
}

#[tokio::test(start_paused = true)]
async fn activation_is_polled_up_to_the_bound() {
    let _ = tracing_subscriber::fmt::try_init();
    let options = BindOptions::default().with_activation(Duration::from_secs(1), Duration::from_secs(5));

    let mut fx = Fixture::with(|vtm| vtm, options.clone());
    fx.deployment.controller.set_activation_delay(Duration::from_secs(3));

    let start = Instant::now();
    fx.manager.bind(&two_vms()).await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7), "{elapsed:?}");
    fx.manager.unbind().await.unwrap();

    let mut fx = Fixture::with(|vtm| vtm.with_dead_port(BRIDGE, 4), options);
    let spec = BindingSpec::new([Binding::new(BRIDGE, 4, 1, 1)]);

    let start = Instant::now();
    let err = fx.manager.bind(&spec).await.unwrap_err();
    assert!(
        matches!(err, BindError::ActivationTimeout { active: true, after, .. } if after == Duration::from_secs(5)),
        "{err}"
    );
    assert!(!err.is_usage());
    assert_eq!(start.elapsed(), Duration::from_secs(5));

    // The guest created before the timeout is gone again.
    assert!(fx.namespaces().is_empty());
    assert!(fx.deployment.controller.bindings().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cleanup_failures_are_reported_and_skipped() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut fx = Fixture::new();
    fx.manager.bind(&two_vms()).await.unwrap();

    let first = FakeDeployment::agent_name(1);
    fx.deployment.registry.respond_on(&first, "ip netns del", FakeExec::exit(1));

    let report = fx.manager.unbind().await.unwrap();
    assert!(!fx.manager.is_bound());

    let failures = report.failures();
    assert_eq!(failures.len(), 1, "{report:?}");
    assert_eq!(failures[0].step, CleanupStep::Destroy);
    assert!(failures[0].target.starts_with(&format!("{first}/")), "{}", failures[0].target);

    // The rest went on.
    assert_eq!(fx.deployment.registry.namespaces(&first).len(), 1);
    assert!(fx.deployment.registry.namespaces(&FakeDeployment::agent_name(2)).is_empty());
    assert!(fx.deployment.controller.bindings().is_empty());
    assert!(fx.deployment.controller.zones().is_empty());
}
