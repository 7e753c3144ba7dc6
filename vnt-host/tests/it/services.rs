use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use vnt_host::{
    testing::{FakeConnector, FakeDeployment, FakeExec, FakeRegistry},
    GuestSpec, HostError, PlainHost, ServiceFailure, ServiceHost, ServiceOptions, ServiceRegistry,
    ServiceStatus, SELECTOR_LABEL,
};

#[tokio::test(start_paused = true)]
async fn discovery_groups_services_by_role() {
    let _ = tracing_subscriber::fmt::try_init();
    let deployment = FakeDeployment::new(2);
    deployment.registry.add_container("zookeeper-1", "zookeeper", PlainHost::SELECTOR);
    deployment.registry.add_labelled("registry-cache", FxHashMap::default());

    let services = deployment.services();
    let all = services.load_all().await.unwrap();

    assert_eq!(all.len(), 4);
    let agents: Vec<&str> = all.role("midonet-agent").iter().map(|s| s.name()).collect();
    assert_eq!(agents, vec!["midonet-agent-1", "midonet-agent-2"]);
    assert_eq!(all.role("zookeeper").len(), 1);
    assert!(all.role("cassandra").is_empty());
    assert!(all.find("registry-cache").is_none());

    // Memoized, and the API is shared by the agents linked to it.
    assert!(Arc::ptr_eq(&all, &services.load_all().await.unwrap()));
    let api = services.api().await.unwrap();
    for agent in services.agents().await.unwrap() {
        assert!(Arc::ptr_eq(agent.api(), &api));
    }

    services.reset();
    assert!(!Arc::ptr_eq(&all, &services.load_all().await.unwrap()));
}

#[tokio::test]
async fn empty_discovery_is_not_cached() {
    let registry = FakeRegistry::default();
    let services = ServiceRegistry::new(
        Arc::new(registry.clone()),
        Arc::new(FakeConnector::default()),
        ServiceOptions::default(),
    );

    assert!(services.load_all().await.unwrap().is_empty());
    assert!(matches!(services.api().await, Err(HostError::HostNotFound(_))));

    registry.add_container("zookeeper-1", "zookeeper", PlainHost::SELECTOR);
    assert_eq!(services.load_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn selectors_dispatch_to_registered_factories() {
    let deployment = FakeDeployment::new(0);
    deployment.registry.add_container("odd-1", "odd", "vnt.odd");
    let labels = [("type".to_owned(), "unlabelled".to_owned())].into_iter().collect();
    deployment.registry.add_labelled("bare-1", labels);

    let services = deployment.services();
    assert!(matches!(services.load("odd-1").await, Err(HostError::UnknownImplementation(s)) if s == "vnt.odd"));
    assert!(matches!(
        services.load("bare-1").await,
        Err(HostError::MissingLabel { label, .. }) if label == SELECTOR_LABEL
    ));

    let services = ServiceRegistry::builder(Arc::new(deployment.registry.clone()), deployment.connector.clone())
        .register("vnt.odd", PlainHost::factory)
        .build();
    let odd = services.load("odd-1").await.unwrap();
    assert_eq!(odd.role(), "odd");
    assert_eq!(odd.service_name(), "odd");
}

#[tokio::test]
async fn agents_need_their_api_link() {
    let deployment = FakeDeployment::new(0);
    deployment.registry.add_container(FakeDeployment::API, "midonet-api", vnt_host::ApiHost::SELECTOR);
    deployment.registry.add_container("midonet-agent-1", "midonet-agent", vnt_host::AgentHost::SELECTOR);

    let err = deployment.services().agent("midonet-agent-1").await.unwrap_err();
    assert!(matches!(err, HostError::MissingLink { ref name, .. } if name == "midonet-api"), "{err}");
}

#[tokio::test]
async fn every_link_resolves_to_a_role() {
    let deployment = FakeDeployment::new(1);
    let registry = &deployment.registry;
    registry.add_container("zookeeper-1", "zookeeper", PlainHost::SELECTOR);
    registry.add_container("cassandra-1", "cassandra", PlainHost::SELECTOR);
    registry.link("zookeeper-1", "cassandra-1");
    registry.link(&FakeDeployment::agent_name(1), "zookeeper-1");

    let services = deployment.services();
    let zookeeper = services.load("zookeeper-1").await.unwrap();
    let cassandra = zookeeper.linked("cassandra", "cassandra-1").unwrap();
    assert!(Arc::ptr_eq(cassandra, &services.load("cassandra-1").await.unwrap()));
    assert!(zookeeper.linked("zookeeper", "cassandra-1").is_none());
    assert!(zookeeper.links().role("midonet-api").is_empty());

    let agent = services.agent(&FakeDeployment::agent_name(1)).await.unwrap();
    let mut roles: Vec<&str> = agent.links().roles().collect();
    roles.sort_unstable();
    assert_eq!(roles, vec!["midonet-api", "zookeeper"]);
    assert!(Arc::ptr_eq(agent.linked("zookeeper", "zookeeper-1").unwrap(), &zookeeper));
}

#[tokio::test]
async fn link_cycles_are_cut() {
    let deployment = FakeDeployment::new(0);
    let registry = &deployment.registry;
    registry.add_container("zookeeper-1", "zookeeper", PlainHost::SELECTOR);
    registry.add_container("zookeeper-2", "zookeeper", PlainHost::SELECTOR);
    registry.link("zookeeper-1", "zookeeper-2");
    registry.link("zookeeper-2", "zookeeper-1");

    let services = deployment.services();
    let first = services.load("zookeeper-1").await.unwrap();
    let second = first.linked("zookeeper", "zookeeper-2").unwrap();

    assert!(second.links().is_empty());
    assert!(Arc::ptr_eq(second, &services.load("zookeeper-2").await.unwrap()));
    assert_eq!(services.load_all().await.unwrap().role("zookeeper").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn agent_loads_its_identity() {
    let deployment = FakeDeployment::new(2);
    let agent = deployment.services().agent("midonet-agent-2").await.unwrap();

    assert_eq!(agent.controller_host_id(), FakeDeployment::host_id(2));
    assert_eq!(agent.index(), 2);

    let commands = deployment.registry.commands("midonet-agent-2");
    assert_eq!(commands[0], "cat /etc/midonet_host_id.properties");
    assert!(commands.contains(&"sysctl -w net.ipv6.conf.all.disable_ipv6=1".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn api_connection_is_retried() {
    let deployment = FakeDeployment::with_connector(1, FakeConnector::default().failing(3));
    let api = deployment.services().api().await.unwrap();

    let start = Instant::now();
    let controller = api.controller().await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(deployment.connector.attempts(), 4);
    assert_eq!(controller.hosts().await.unwrap().len(), 1);

    // The endpoint follows the container address.
    deployment.registry.set_ip(FakeDeployment::API, Some(Ipv4Addr::new(10, 9, 0, 2)));
    api.controller().await.unwrap();
    let endpoint = deployment.connector.last_endpoint().unwrap();
    assert_eq!(endpoint.url, "http://10.9.0.2:8080/midonet-api");
}

#[tokio::test(start_paused = true)]
async fn api_connection_gives_up_at_the_bound() {
    let deployment = FakeDeployment::with_connector(1, FakeConnector::default().failing(usize::MAX));
    let api = deployment.services().api().await.unwrap();

    let start = Instant::now();
    let Err(err) = api.controller().await else {
        panic!("the controller should not be reachable");
    };
    assert!(matches!(err, HostError::Timeout { op: "controller connect", .. }), "{err}");
    assert_eq!(start.elapsed(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn agent_status_follows_the_controller() {
    let deployment = FakeDeployment::new(1);
    let agent = deployment.services().agent("midonet-agent-1").await.unwrap();

    assert_eq!(agent.status().await.unwrap(), ServiceStatus::Up);
    deployment.controller.set_alive(&FakeDeployment::host_id(1), false);
    assert_eq!(agent.status().await.unwrap(), ServiceStatus::Down);
}

#[tokio::test(start_paused = true)]
async fn wait_for_status_times_out_at_the_bound() {
    let deployment = FakeDeployment::new(0);
    deployment.registry.add_container("zookeeper-1", "zookeeper", PlainHost::SELECTOR);
    deployment.registry.respond("service zookeeper status", FakeExec::exit(3));

    let zookeeper = deployment.services().load("zookeeper-1").await.unwrap();

    let start = Instant::now();
    let err = zookeeper.start(true).await.unwrap_err();
    assert!(matches!(err, HostError::Timeout { op: "wait_for_status", .. }), "{err}");

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(120) && elapsed <= Duration::from_secs(125), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn failure_injection_takes_the_link_down() {
    let deployment = FakeDeployment::new(0);
    deployment.registry.add_container("zookeeper-1", "zookeeper", PlainHost::SELECTOR);
    deployment.registry.respond("service zookeeper status", FakeExec::exit(3));

    let services = deployment.services();
    let failure = ServiceFailure::new(&services, "zookeeper-1").await.unwrap();
    assert_eq!(failure.name(), "zookeeper-1 failure");

    failure.inject().await.unwrap();
    assert!(deployment.registry.commands("zookeeper-1").contains(&"ip link set dev eth0 down".to_owned()));

    deployment.registry.respond("service zookeeper status", FakeExec::ok("running"));
    failure.eject().await.unwrap();
    assert!(deployment.registry.commands("zookeeper-1").contains(&"ip link set dev eth0 up".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn bound_ports_show_up_in_the_host_bindings() {
    let deployment = FakeDeployment::new(1);
    let agent = deployment.services().agent("midonet-agent-1").await.unwrap();
    let guest = agent.create_guest(GuestSpec::default()).await.unwrap();

    agent.bind_port(&guest, "port-1").await.unwrap();

    let bindings = agent.bindings().await.unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].port_id, "port-1");
    assert_eq!(bindings[0].interface_name, vnt_host::Interface::host_ifname(&guest));
}
