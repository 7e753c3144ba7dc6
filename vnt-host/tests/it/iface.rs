use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use tokio::time::Instant;
use vnt_host::{
    testing::{FakeDeployment, FakeExec},
    AgentHost, CaptureState, ExitState, GuestSpec, HostError, IfaceError, Interface,
    NamespaceInterface, Packet, PingOptions,
};

fn guest(ipv4_addr: &str) -> GuestSpec {
    GuestSpec { ipv4_addr: Some(ipv4_addr.to_owned()), ..Default::default() }
}

async fn agent(deployment: &FakeDeployment, i: usize) -> Arc<AgentHost> {
    deployment.services().agent(&FakeDeployment::agent_name(i)).await.unwrap()
}

async fn pair(deployment: &FakeDeployment) -> (NamespaceInterface, NamespaceInterface) {
    let first = agent(deployment, 1).await;
    let second = agent(deployment, 2).await;

    let a = first.create_guest(guest("172.16.1.2/24")).await.unwrap();
    let b = second.create_guest(guest("172.16.1.3/24")).await.unwrap();
    (a, b)
}

#[tokio::test(start_paused = true)]
async fn udp_reaches_the_capturing_interface() {
    let _ = tracing_subscriber::fmt::try_init();
    let deployment = FakeDeployment::new(2);
    let (a, b) = pair(&deployment).await;

    let received = b.expect("udp and dst port 9", Some(Duration::from_secs(5)));
    b.wait_capture_ready().await;

    let packet = Packet::new(b.get_mac_addr().await.unwrap(), b.get_ip().await.unwrap());
    a.send_udp(&packet).await.unwrap();

    assert!(received.await.unwrap());

    let mz = deployment
        .registry
        .commands(&FakeDeployment::agent_name(1))
        .into_iter()
        .find(|line| line.contains(" mz "))
        .unwrap();
    assert!(mz.contains("-t udp sp=9,dp=9 "), "{mz}");
    assert!(!mz.contains("iplen"), "{mz}");
}

#[tokio::test(start_paused = true)]
async fn expect_gives_up_at_the_timeout() {
    let _ = tracing_subscriber::fmt::try_init();
    let deployment = FakeDeployment::new(2);
    let (a, b) = pair(&deployment).await;

    let start = Instant::now();
    let received = b.expect("udp", Some(Duration::from_secs(3)));

    // Sent to another address: never seen by the capture.
    let packet = Packet::new("aa:bb:cc:00:00:01", Ipv4Addr::new(172, 16, 1, 99));
    a.send_udp(&packet).await.unwrap();

    assert!(!received.await.unwrap());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4), "{elapsed:?}");
    assert_eq!(deployment.registry.pending_captures(), 0);
}

#[tokio::test(start_paused = true)]
async fn capture_gate_is_released_once_when_the_capture_never_starts() {
    let _ = tracing_subscriber::fmt::try_init();
    let deployment = FakeDeployment::new(1);
    let agent = agent(&deployment, 1).await;
    let iface = agent.create_guest(guest("172.16.1.2/24")).await.unwrap();

    deployment.registry.respond("tcpdump", FakeExec::never_starts());

    let start = Instant::now();
    let received = iface.expect("icmp", None);
    assert_eq!(iface.gate().state(), CaptureState::Starting);

    iface.wait_capture_ready().await;
    assert_eq!(start.elapsed(), Duration::from_secs(10));

    assert!(!received.await.unwrap());
    assert_eq!(iface.gate().releases(), 1);
    assert_eq!(iface.gate().state(), CaptureState::Idle);
}

#[tokio::test(start_paused = true)]
async fn concurrent_expect_is_rejected() {
    let deployment = FakeDeployment::new(1);
    let agent = agent(&deployment, 1).await;
    let iface = agent.create_guest(guest("172.16.1.2/24")).await.unwrap();

    let first = iface.expect("udp", Some(Duration::from_secs(2)));
    let second = iface.expect("udp", Some(Duration::from_secs(2))).await;
    assert!(matches!(second, Err(IfaceError::CaptureInProgress(id)) if id == iface.id()));

    assert!(!first.await.unwrap());

    // The slot is free again once the first capture is over.
    assert!(!iface.expect("udp", Some(Duration::from_secs(1))).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn introspection_reads_back_the_guest_spec() {
    let deployment = FakeDeployment::new(1);
    let agent = agent(&deployment, 1).await;

    let spec = GuestSpec { mtu: Some(1450), ..guest("172.16.1.2/24") };
    let iface = agent.create_guest(spec).await.unwrap();

    let hw_addr = iface.hw_addr().unwrap().to_owned();
    assert!(hw_addr.starts_with("aa:bb:cc:"), "{hw_addr}");
    assert!(hw_addr.ends_with(":01:01"), "{hw_addr}");

    assert_eq!(iface.get_cidr().await.unwrap(), "172.16.1.2/24");
    assert_eq!(iface.get_ip().await.unwrap(), Ipv4Addr::new(172, 16, 1, 2));
    assert_eq!(iface.get_mac_addr().await.unwrap(), hw_addr.to_ascii_lowercase());
    assert_eq!(iface.get_mtu().await.unwrap(), 1450);
    assert_eq!(iface.get_num_routes().await.unwrap(), 0);

    let bare = agent.create_guest(GuestSpec::default()).await.unwrap();
    assert!(matches!(bare.get_ip().await, Err(IfaceError::Parse { what: "IPv4 address", .. })));
}

#[tokio::test(start_paused = true)]
async fn destroy_leaves_nothing_behind() {
    let deployment = FakeDeployment::new(1);
    let name = FakeDeployment::agent_name(1);
    let agent = agent(&deployment, 1).await;

    let iface = agent
        .create_guest(GuestSpec { ifname: Some("42".to_owned()), ..guest("172.16.1.2/24") })
        .await
        .unwrap();
    assert_eq!(iface.netns(), "vm42");
    assert_eq!(iface.ifname(), "peth42");
    assert_eq!(iface.host_ifname(), "veth42");
    assert_eq!(deployment.registry.namespaces(&name), vec!["vm42"]);
    assert_eq!(deployment.registry.devices(&name), vec!["peth42", "veth42"]);

    agent.destroy_guest(&iface).await.unwrap();
    assert!(deployment.registry.namespaces(&name).is_empty());
    assert!(deployment.registry.devices(&name).is_empty());

    // Already gone.
    iface.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_creation_is_cleaned_up() {
    let deployment = FakeDeployment::new(1);
    let name = FakeDeployment::agent_name(1);
    let agent = agent(&deployment, 1).await;

    deployment.registry.respond_on(&name, "ip addr add", FakeExec::exit(2));

    let err = agent.create_guest(guest("172.16.1.2/24")).await.unwrap_err();
    assert!(matches!(err, HostError::CommandFailed { code: 2, .. }), "{err}");
    assert!(deployment.registry.namespaces(&name).is_empty());
    assert!(deployment.registry.devices(&name).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_cleanup_keeps_the_creation_error() {
    let _ = tracing_subscriber::fmt::try_init();
    let deployment = FakeDeployment::new(1);
    let name = FakeDeployment::agent_name(1);
    let agent = agent(&deployment, 1).await;

    deployment.registry.respond_on(&name, "ip addr add", FakeExec::exit(2));
    deployment.registry.respond_on(&name, "ip netns del", FakeExec::exit(1));

    let spec = GuestSpec { ifname: Some("7".to_owned()), ..guest("172.16.1.2/24") };
    let err = agent.create_guest(spec).await.unwrap_err();
    assert!(matches!(err, HostError::CommandFailed { code: 2, ref command, .. } if command.contains("addr add")), "{err}");

    // The veth pair is still removed after the namespace could not be.
    let commands = deployment.registry.commands(&name);
    let netns_del = commands.iter().position(|c| c == "ip netns del vm7").unwrap();
    assert_eq!(commands[netns_del + 1], "ip link del dev veth7");
    assert_eq!(deployment.registry.namespaces(&name), vec!["vm7".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn execute_returns_once_the_exit_status_is_known() {
    let deployment = FakeDeployment::new(1);
    let name = FakeDeployment::agent_name(1);
    let agent = agent(&deployment, 1).await;
    let iface = agent
        .create_guest(GuestSpec { ifname: Some("7".to_owned()), ..guest("172.16.1.2/24") })
        .await
        .unwrap();

    deployment.registry.respond_on(&name, "first", FakeExec::ok("").running_for(Duration::from_secs(3)));

    let start = Instant::now();
    iface.execute(vnt_command::Command::new("first"), None).await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4), "{elapsed:?}");
    assert_eq!(deployment.registry.commands(&name).last().map(String::as_str), Some("ip netns exec vm7 first"));

    iface.execute(vnt_command::Command::new("second"), None).await.unwrap();
    let commands = deployment.registry.commands(&name);
    assert_eq!(&commands[commands.len() - 2..], ["ip netns exec vm7 first", "ip netns exec vm7 second"]);
}

#[tokio::test(start_paused = true)]
async fn ping_and_tcp_request_between_guests() {
    let deployment = FakeDeployment::new(2);
    let (a, b) = pair(&deployment).await;

    let output = a.ping4(&b, PingOptions { do_arp: true, ..Default::default() }).await.unwrap();
    assert!(output.await.unwrap().success());

    let unknown = Ipv4Addr::new(172, 16, 1, 99);
    let err = a.ping_ipv4_addr(unknown, PingOptions::default()).await.unwrap().await.unwrap_err();
    assert!(
        matches!(err, IfaceError::Host(HostError::CommandFailed { ref command, code: 1, .. }) if command.contains("ping")),
        "{err}"
    );

    let lenient = PingOptions { should_succeed: false, ..Default::default() };
    let output = a.ping_ipv4_addr(unknown, lenient).await.unwrap().await.unwrap();
    assert_eq!(output.exit, ExitState::Exited(1));

    b.start_server(8080).await.unwrap();
    let b_ip = b.get_ip().await.unwrap();
    let reply = a.make_request_to(b_ip, 8080, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply, b.id());

    b.stop_server(8080).await.unwrap();
    assert!(a.make_request_to(b_ip, 8080, Duration::from_secs(2)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn commands_run_inside_the_namespace() {
    let deployment = FakeDeployment::new(1);
    let name = FakeDeployment::agent_name(1);
    let agent = agent(&deployment, 1).await;
    let iface = agent
        .create_guest(GuestSpec { ifname: Some("7".to_owned()), ..guest("172.16.1.2/24") })
        .await
        .unwrap();

    iface.clear_arp().await.unwrap();
    let output = iface
        .run(vnt_command::Command::new("sleep").arg("1"), Some(Duration::from_millis(1500)))
        .await
        .unwrap();
    assert!(output.success());

    let commands = deployment.registry.commands(&name);
    assert!(commands.contains(&"ip netns exec vm7 ip neigh flush all".to_owned()));
    assert!(commands.contains(&"ip netns exec vm7 timeout 2 sleep 1".to_owned()));
}
