//! In-memory stand-ins for the container engine and the controller.
//!
//! [`FakeRegistry`] plays the commands the harness sends: every command is logged, the
//! `ip netns exec` and `timeout` wrappers are honoured, namespaces and devices created with `ip`
//! are tracked, and a `mz` packet sent to an address completes the pending `tcpdump` captures
//! listening on the device that owns it. Timings follow the Tokio clock, so tests can run with
//! a paused runtime.

use std::{
    collections::BTreeSet,
    io,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::{sync::mpsc, time::Instant};
use tracing::debug;
use vnt_command::quote;

use crate::{
    AgentHost, ApiHost, ContainerInfo, ContainerRegistry, ContainerSummary, ControllerClient,
    ControllerConnector, ControllerError, ControllerHost, ControllerPort, Endpoint, Exec,
    ExecOptions, ExecOutput, ExecStatus, HostBinding, RegistryError, ServiceOptions,
    ServiceRegistry, TunnelZone, TunnelZoneKind, ROLE_LABEL, SELECTOR_LABEL,
};

/// Exit code of a command killed by the `timeout` wrapper.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Scripted behaviour of a command run by a [`FakeRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeExec {
    pub stdout: String,
    pub exit_code: i64,
    /// Delay before the command shows up as running, `None` if it never does.
    pub start_after: Option<Duration>,
    /// How long the command runs once started, `None` for ever.
    pub run_for: Option<Duration>,
}

impl FakeExec {
    /// Exits right away with `stdout` and code 0.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: 0,
            start_after: Some(Duration::ZERO),
            run_for: Some(Duration::ZERO),
        }
    }

    pub fn exit(code: i64) -> Self {
        Self { exit_code: code, ..Self::ok("") }
    }

    pub fn never_starts() -> Self {
        Self { start_after: None, run_for: None, ..Self::ok("") }
    }

    pub const fn starting_after(mut self, delay: Duration) -> Self {
        self.start_after = Some(delay);
        self
    }

    pub const fn running_for(mut self, duration: Duration) -> Self {
        self.run_for = Some(duration);
        self
    }

    pub const fn forever(mut self) -> Self {
        self.run_for = None;
        self
    }
}

#[derive(Debug)]
struct Rule {
    container: Option<String>,
    pattern: String,
    exec: FakeExec,
}

#[derive(Debug, Clone, Copy)]
struct ExecRecord {
    start_at: Option<Instant>,
    end_at: Option<Instant>,
    exit_code: i64,
}

impl ExecRecord {
    fn scheduled(exec: &FakeExec, timeout: Option<Duration>, now: Instant) -> Self {
        let Some(start_after) = exec.start_after else {
            return Self { start_at: None, end_at: None, exit_code: exec.exit_code };
        };

        let start_at = now + start_after;
        let (end_at, exit_code) = match (exec.run_for, timeout) {
            (Some(run), Some(limit)) if run > limit => (Some(start_at + limit), TIMEOUT_EXIT_CODE),
            (None, Some(limit)) => (Some(start_at + limit), TIMEOUT_EXIT_CODE),
            (run, _) => (run.map(|run| start_at + run), exec.exit_code),
        };

        Self { start_at: Some(start_at), end_at, exit_code }
    }

    fn status(&self, now: Instant) -> ExecStatus {
        match (self.start_at, self.end_at) {
            (Some(start), _) if now < start => ExecStatus::default(),
            (None, _) => ExecStatus::default(),
            (Some(_), Some(end)) if now >= end => {
                ExecStatus { running: false, exit_code: Some(self.exit_code) }
            }
            _ => ExecStatus { running: true, exit_code: None },
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Device {
    netns: Option<String>,
    peer: Option<String>,
    hw_addr: Option<String>,
    cidr: Option<String>,
    mtu: u32,
}

impl Device {
    fn ipv4(&self) -> Option<Ipv4Addr> {
        self.cidr.as_deref()?.split('/').next()?.parse().ok()
    }
}

#[derive(Debug)]
struct Capture {
    exec_id: String,
    container: String,
    device: String,
    filter: String,
    lines: mpsc::UnboundedSender<Bytes>,
}

/// A command split from its `ip netns exec` and `timeout` wrappers.
#[derive(Debug)]
struct Call<'a> {
    netns: Option<&'a str>,
    timeout: Option<Duration>,
    argv: Vec<&'a str>,
}

impl<'a> Call<'a> {
    fn parse(argv: &'a [String]) -> Self {
        let mut argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let mut netns = None;
        let mut timeout = None;

        if argv.len() > 4 && argv[..3] == ["ip", "netns", "exec"] {
            netns = Some(argv[3]);
            argv.drain(..4);
        }
        if argv.len() > 2 && argv[0] == "timeout" {
            timeout = argv[1].parse().ok().map(Duration::from_secs);
            argv.drain(..2);
        }

        Self { netns, timeout, argv }
    }

    fn flag(&self, flag: &str) -> Option<&'a str> {
        let at = self.argv.iter().position(|arg| *arg == flag)?;
        self.argv.get(at + 1).copied()
    }
}

enum Outcome {
    Done(FakeExec),
    Capture { device: String, filter: String },
}

#[derive(Debug, Default)]
struct State {
    containers: Vec<ContainerInfo>,
    rules: Vec<Rule>,
    execs: FxHashMap<String, ExecRecord>,
    log: FxHashMap<String, Vec<String>>,
    namespaces: FxHashMap<String, BTreeSet<String>>,
    devices: FxHashMap<(String, String), Device>,
    servers: FxHashMap<(Ipv4Addr, u16), String>,
    captures: Vec<Capture>,
    next_exec: u64,
}

impl State {
    fn container(&self, id_or_name: &str) -> Result<&ContainerInfo, RegistryError> {
        self.containers
            .iter()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
            .ok_or_else(|| RegistryError::ContainerNotFound(id_or_name.to_owned()))
    }

    fn container_mut(&mut self, id_or_name: &str) -> Result<&mut ContainerInfo, RegistryError> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
            .ok_or_else(|| RegistryError::ContainerNotFound(id_or_name.to_owned()))
    }

    fn rule(&self, container: &str, line: &str) -> Option<FakeExec> {
        self.rules
            .iter()
            .rev()
            .filter(|rule| rule.container.as_deref().map_or(true, |c| c == container))
            .find(|rule| line.contains(&rule.pattern))
            .map(|rule| rule.exec.clone())
    }

    fn has_netns(&self, container: &str, netns: &str) -> bool {
        self.namespaces.get(container).is_some_and(|set| set.contains(netns))
    }

    fn device(&mut self, container: &str, name: &str) -> Option<&mut Device> {
        self.devices.get_mut(&(container.to_owned(), name.to_owned()))
    }

    /// Plays the commands the harness relies on. Anything else succeeds silently.
    fn builtin(&mut self, container: &str, call: &Call<'_>) -> Outcome {
        let fail = || Outcome::Done(FakeExec::exit(1));
        let done = |stdout: String| Outcome::Done(FakeExec::ok(stdout));

        match call.argv.as_slice() {
            ["ip", "netns", "add", name] => {
                let set = self.namespaces.entry(container.to_owned()).or_default();
                if set.insert((*name).to_owned()) {
                    done(String::new())
                } else {
                    fail()
                }
            }
            ["ip", "netns", "del", name] => {
                let removed = self.namespaces.get_mut(container).is_some_and(|set| set.remove(*name));
                if !removed {
                    return fail();
                }

                // Devices of the namespace go with it, and so do their veth peers.
                let gone: Vec<(String, String)> = self
                    .devices
                    .iter()
                    .filter(|((c, _), dev)| c == container && dev.netns.as_deref() == Some(*name))
                    .flat_map(|((c, n), dev)| {
                        let peer = dev.peer.clone().map(|peer| (c.clone(), peer));
                        std::iter::once((c.clone(), n.clone())).chain(peer)
                    })
                    .collect();
                for key in gone {
                    self.devices.remove(&key);
                }
                done(String::new())
            }
            ["test", "-e", path] => match path.strip_prefix("/var/run/netns/") {
                Some(name) if self.has_netns(container, name) => done(String::new()),
                _ => fail(),
            },
            ["ip", "link", "add", "dev", name, "type", "veth", "peer", "name", peer] => {
                for (dev, other) in [(name, peer), (peer, name)] {
                    let device = Device { peer: Some((*other).to_owned()), mtu: 1500, ..Default::default() };
                    self.devices.insert((container.to_owned(), (*dev).to_owned()), device);
                }
                done(String::new())
            }
            ["ip", "link", "del", "dev", name] => match self.devices.remove(&(container.to_owned(), (*name).to_owned())) {
                Some(device) => {
                    if let Some(peer) = device.peer {
                        self.devices.remove(&(container.to_owned(), peer));
                    }
                    done(String::new())
                }
                None => fail(),
            },
            ["ip", "link", "set", "dev", name, "up", "netns", netns] => {
                let netns = (*netns).to_owned();
                match self.device(container, name) {
                    Some(device) => {
                        device.netns = Some(netns);
                        done(String::new())
                    }
                    None => fail(),
                }
            }
            ["ip", "link", "set", "address", hw_addr, "dev", name] => {
                let hw_addr = hw_addr.to_ascii_lowercase();
                match self.device(container, name) {
                    Some(device) => {
                        device.hw_addr = Some(hw_addr);
                        done(String::new())
                    }
                    None => fail(),
                }
            }
            ["ip", "link", "set", "mtu", mtu, "dev", name] => {
                let mtu = mtu.parse().unwrap_or(1500);
                match self.device(container, name) {
                    Some(device) => {
                        device.mtu = mtu;
                        done(String::new())
                    }
                    None => fail(),
                }
            }
            ["ip", "addr", "add", cidr, "dev", name] => {
                let cidr = (*cidr).to_owned();
                match self.device(container, name) {
                    Some(device) => {
                        device.cidr = Some(cidr);
                        done(String::new())
                    }
                    None => fail(),
                }
            }
            ["ip", "-o", "-4", "addr", "show", "dev", name] => match self.device(container, name) {
                Some(device) => done(
                    device
                        .cidr
                        .as_ref()
                        .map(|cidr| format!("2: {name}    inet {cidr} scope global {name}"))
                        .unwrap_or_default(),
                ),
                None => fail(),
            },
            ["cat", path] if path.starts_with("/sys/class/net/") => {
                let mut parts = path.trim_start_matches("/sys/class/net/").split('/');
                let (Some(name), Some(attr)) = (parts.next(), parts.next()) else {
                    return fail();
                };
                match (self.device(container, name), attr) {
                    (Some(device), "address") => done(device.hw_addr.clone().unwrap_or_default()),
                    (Some(device), "mtu") => done(device.mtu.to_string()),
                    _ => fail(),
                }
            }
            ["tcpdump", ..] => match call.flag("-i") {
                Some(device) => Outcome::Capture {
                    device: device.to_owned(),
                    filter: call.argv.last().copied().unwrap_or_default().to_owned(),
                },
                None => fail(),
            },
            ["mz", ..] => {
                self.deliver(call);
                done(String::new())
            }
            ["ping", .., addr] => {
                let known = addr.parse::<Ipv4Addr>().is_ok_and(|addr| self.owner(addr).is_some());
                if known {
                    done("1 packets transmitted, 1 received, 0% packet loss".to_owned())
                } else {
                    let stdout = "1 packets transmitted, 0 received, 100% packet loss".to_owned();
                    Outcome::Done(FakeExec { stdout, ..FakeExec::exit(1) })
                }
            }
            ["nc", addr, port] => {
                let key: (Option<Ipv4Addr>, Option<u16>) = (addr.parse().ok(), port.parse().ok());
                match key {
                    (Some(addr), Some(port)) => match self.servers.get(&(addr, port)) {
                        Some(reply) => done(reply.clone()),
                        None => fail(),
                    },
                    _ => fail(),
                }
            }
            ["sh", "-c", script] => {
                self.script(script);
                done(String::new())
            }
            _ => done(String::new()),
        }
    }

    /// Tracks the netcat servers started and stopped by scripts.
    fn script(&mut self, script: &str) {
        let tokens: Vec<&str> = script.split_whitespace().collect();

        if let Some(at) = tokens.windows(2).position(|w| w == ["nc", "-l"]) {
            let reply = tokens[..at]
                .iter()
                .rposition(|t| *t == "echo")
                .map(|echo| tokens[echo + 1..at - 1].join(" ").trim_matches('\'').to_owned());
            let addr = tokens.get(at + 2).and_then(|a| a.parse().ok());
            let port = tokens.get(at + 3).and_then(|p| p.trim_end_matches(';').parse().ok());

            if let (Some(reply), Some(addr), Some(port)) = (reply, addr, port) {
                self.servers.insert((addr, port), reply);
            }
        } else if script.contains("pkill") {
            let port = tokens
                .iter()
                .find_map(|t| t.strip_prefix("/tmp/vnt-nc-")?.split('.').next()?.parse::<u16>().ok());
            if let Some(port) = port {
                self.servers.retain(|(_, p), _| *p != port);
            }
        }
    }

    /// The container and device holding `addr`.
    fn owner(&self, addr: Ipv4Addr) -> Option<(&str, &str)> {
        self.devices
            .iter()
            .find(|(_, device)| device.ipv4() == Some(addr))
            .map(|((container, name), _)| (container.as_str(), name.as_str()))
    }

    /// Completes the captures of the device owning the target address of a `mz` packet.
    fn deliver(&mut self, call: &Call<'_>) {
        let kind = call.flag("-t").unwrap_or("raw");
        let target = match kind {
            "arp" => call
                .argv
                .iter()
                .find_map(|arg| arg.split(", ").find_map(|kv| kv.strip_prefix("targetip="))),
            _ => call.flag("-B"),
        };
        let Some(target) = target.and_then(|t| t.parse::<Ipv4Addr>().ok()) else {
            return;
        };
        let Some((container, device)) = self.owner(target).map(|(c, d)| (c.to_owned(), d.to_owned())) else {
            debug!(%target, "no device owns the packet target");
            return;
        };

        let source = call.flag("-A").unwrap_or("0.0.0.0");
        let line = format!("IP {source} > {target}: {}, length 1\n", kind.to_ascii_uppercase());
        let now = Instant::now();

        let (matched, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.captures)
            .into_iter()
            .partition(|c| c.container == container && c.device == device && filter_matches(&c.filter, kind));
        self.captures = pending;

        for capture in matched {
            let _ = capture.lines.send(Bytes::from(line.clone()));
            if let Some(record) = self.execs.get_mut(&capture.exec_id) {
                record.end_at = Some(now);
                record.exit_code = 0;
            }
        }
    }
}

/// A capture filter matches a packet kind unless it names another protocol.
fn filter_matches(filter: &str, kind: &str) -> bool {
    let protocols = ["udp", "tcp", "icmp", "arp"];
    let named: Vec<&str> = filter.split_whitespace().filter(|t| protocols.contains(t)).collect();
    named.is_empty() || named.contains(&kind)
}

/// Scripted in-memory [`ContainerRegistry`].
#[derive(Debug, Clone, Default)]
pub struct FakeRegistry {
    state: Arc<Mutex<State>>,
}

impl FakeRegistry {
    /// Adds a running container playing `role`, proxied by the `selector` implementation.
    pub fn add_container(&self, name: &str, role: &str, selector: &str) -> ContainerInfo {
        let labels = [(ROLE_LABEL, role), (SELECTOR_LABEL, selector)];
        self.add_labelled(name, labels.into_iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect())
    }

    /// Adds a running container with arbitrary labels.
    pub fn add_labelled(&self, name: &str, labels: FxHashMap<String, String>) -> ContainerInfo {
        let mut state = self.state.lock();
        let n = state.containers.len() + 1;
        let octet = (n % 250) as u8 + 1;

        let info = ContainerInfo {
            id: format!("{n:012x}"),
            name: name.to_owned(),
            hostname: format!("{n:012x}"),
            labels,
            ip: Some(Ipv4Addr::new(172, 17, 0, octet)),
            mac: Some(format!("02:42:ac:11:00:{octet:02x}")),
            links: Vec::new(),
            env: Vec::new(),
        };
        state.containers.push(info.clone());
        info
    }

    /// Links `from` to `to`, the way a compose file would.
    pub fn link(&self, from: &str, to: &str) {
        if let Ok(container) = self.state.lock().container_mut(from) {
            container.links.push(to.to_owned());
        }
    }

    pub fn set_ip(&self, container: &str, ip: Option<Ipv4Addr>) {
        if let Ok(container) = self.state.lock().container_mut(container) {
            container.ip = ip;
        }
    }

    /// Scripts every command whose line contains `pattern`, on any container. Later rules win.
    pub fn respond(&self, pattern: &str, exec: FakeExec) {
        self.state.lock().rules.push(Rule { container: None, pattern: pattern.to_owned(), exec });
    }

    /// Scripts the commands whose line contains `pattern`, on `container` only.
    pub fn respond_on(&self, container: &str, pattern: &str, exec: FakeExec) {
        let rule = Rule { container: Some(container.to_owned()), pattern: pattern.to_owned(), exec };
        self.state.lock().rules.push(rule);
    }

    /// Every command line run on `container`, in order.
    pub fn commands(&self, container: &str) -> Vec<String> {
        self.state.lock().log.get(container).cloned().unwrap_or_default()
    }

    /// The network namespaces currently present on `container`.
    pub fn namespaces(&self, container: &str) -> Vec<String> {
        let state = self.state.lock();
        state.namespaces.get(container).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }

    /// The network devices currently present on `container`, sorted by name.
    pub fn devices(&self, container: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut devices: Vec<String> =
            state.devices.keys().filter(|(c, _)| c == container).map(|(_, name)| name.clone()).collect();
        devices.sort();
        devices
    }

    /// Number of captures still waiting for a packet.
    pub fn pending_captures(&self) -> usize {
        self.state.lock().captures.len()
    }

    fn start(
        &self,
        container: &str,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<(Exec, Option<Instant>), RegistryError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let name = state.container(container)?.name.clone();

        let line = argv.iter().map(|arg| quote(arg)).collect::<Vec<_>>().join(" ");
        state.log.entry(name.clone()).or_default().push(line.clone());

        state.next_exec += 1;
        let id = format!("exec-{}", state.next_exec);
        let call = Call::parse(argv);

        let outcome = if call.netns.is_some_and(|netns| !state.has_netns(&name, netns)) {
            Outcome::Done(FakeExec::exit(1))
        } else if let Some(exec) = state.rule(&name, &line) {
            Outcome::Done(exec)
        } else {
            state.builtin(&name, &call)
        };

        let exec = match outcome {
            Outcome::Capture { device, filter } if options.stream => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let record = ExecRecord {
                    start_at: Some(now),
                    end_at: call.timeout.map(|t| now + t),
                    exit_code: TIMEOUT_EXIT_CODE,
                };
                state.execs.insert(id.clone(), record);
                state.captures.push(Capture {
                    exec_id: id.clone(),
                    container: name,
                    device,
                    filter,
                    lines: tx,
                });

                if let Some(timeout) = call.timeout {
                    let registry = Arc::clone(&self.state);
                    let exec_id = id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        registry.lock().captures.retain(|c| c.exec_id != exec_id);
                    });
                }

                let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx).map(|line| line.map(Ok::<_, io::Error>)));
                return Ok((Exec { id, output: ExecOutput::Stream(Box::pin(stream)) }, None));
            }
            Outcome::Capture { .. } => FakeExec::ok(""),
            Outcome::Done(exec) => exec,
        };

        let record = ExecRecord::scheduled(&exec, call.timeout, now);
        state.execs.insert(id.clone(), record);

        if options.detach {
            Ok((Exec { id, output: ExecOutput::Detached }, None))
        } else if options.stream {
            let chunk = Bytes::from(exec.stdout);
            let stream = futures::stream::once(async move { Ok::<_, io::Error>(chunk) });
            Ok((Exec { id, output: ExecOutput::Stream(Box::pin(stream)) }, None))
        } else {
            Ok((Exec { id, output: ExecOutput::Collected(exec.stdout) }, record.end_at))
        }
    }
}

#[async_trait::async_trait]
impl ContainerRegistry for FakeRegistry {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RegistryError> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInfo, RegistryError> {
        self.state.lock().container(container).cloned()
    }

    /// Attached commands return once they exited, or right away when they never end.
    async fn exec(
        &self,
        container: &str,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> Result<Exec, RegistryError> {
        let (exec, done_at) = self.start(container, &argv, options)?;
        if let Some(done_at) = done_at {
            tokio::time::sleep_until(done_at).await;
        }
        Ok(exec)
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RegistryError> {
        let state = self.state.lock();
        let record = state.execs.get(exec_id).ok_or_else(|| RegistryError::ExecNotFound(exec_id.to_owned()))?;
        Ok(record.status(Instant::now()))
    }
}

#[derive(Debug, Clone, Copy)]
struct PortState {
    bound_at: Option<Instant>,
    never_active: bool,
}

#[derive(Debug, Default)]
struct ControllerState {
    hosts: Vec<ControllerHost>,
    ports: FxHashMap<String, PortState>,
    bindings: Vec<HostBinding>,
    zones: Vec<TunnelZone>,
    zone_members: FxHashMap<String, Vec<(String, Ipv4Addr)>>,
    activation_delay: Duration,
    next_zone: u64,
}

/// In-memory [`ControllerClient`]. Ports become active `activation_delay` after being bound.
#[derive(Debug, Clone, Default)]
pub struct FakeController {
    state: Arc<Mutex<ControllerState>>,
}

impl FakeController {
    pub fn add_host(&self, id: &str, name: &str, alive: bool) {
        let host = ControllerHost { id: id.to_owned(), name: name.to_owned(), alive };
        self.state.lock().hosts.push(host);
    }

    pub fn set_alive(&self, id: &str, alive: bool) {
        if let Some(host) = self.state.lock().hosts.iter_mut().find(|h| h.id == id) {
            host.alive = alive;
        }
    }

    /// Registers an unbound port.
    pub fn add_port(&self, id: &str) {
        let port = PortState { bound_at: None, never_active: false };
        self.state.lock().ports.insert(id.to_owned(), port);
    }

    /// A port that stays inactive even once bound.
    pub fn add_dead_port(&self, id: &str) {
        let port = PortState { bound_at: None, never_active: true };
        self.state.lock().ports.insert(id.to_owned(), port);
    }

    pub fn set_activation_delay(&self, delay: Duration) {
        self.state.lock().activation_delay = delay;
    }

    pub fn bindings(&self) -> Vec<HostBinding> {
        self.state.lock().bindings.clone()
    }

    pub fn zones(&self) -> Vec<TunnelZone> {
        self.state.lock().zones.clone()
    }

    /// Hosts registered in the tunnel zone `zone_id`, with their tunnel address.
    pub fn zone_members(&self, zone_id: &str) -> Vec<(String, Ipv4Addr)> {
        self.state.lock().zone_members.get(zone_id).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ControllerClient for FakeController {
    async fn hosts(&self) -> Result<Vec<ControllerHost>, ControllerError> {
        Ok(self.state.lock().hosts.clone())
    }

    async fn port(&self, port_id: &str) -> Result<ControllerPort, ControllerError> {
        let state = self.state.lock();
        let port = state
            .ports
            .get(port_id)
            .ok_or_else(|| ControllerError::NotFound { kind: "port", id: port_id.to_owned() })?;

        let active = !port.never_active &&
            port.bound_at.is_some_and(|at| Instant::now() >= at + state.activation_delay);
        Ok(ControllerPort { id: port_id.to_owned(), active })
    }

    async fn bind_interface(
        &self,
        host_id: &str,
        port_id: &str,
        interface_name: &str,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock();
        if !state.hosts.iter().any(|h| h.id == host_id) {
            return Err(ControllerError::NotFound { kind: "host", id: host_id.to_owned() });
        }

        let port = state
            .ports
            .entry(port_id.to_owned())
            .or_insert(PortState { bound_at: None, never_active: false });
        port.bound_at = Some(Instant::now());

        state.bindings.retain(|b| b.port_id != port_id);
        state.bindings.push(HostBinding {
            host_id: host_id.to_owned(),
            port_id: port_id.to_owned(),
            interface_name: interface_name.to_owned(),
        });
        Ok(())
    }

    async fn host_bindings(&self, host_id: &str) -> Result<Vec<HostBinding>, ControllerError> {
        let state = self.state.lock();
        Ok(state.bindings.iter().filter(|b| b.host_id == host_id).cloned().collect())
    }

    async fn unbind_interface(&self, host_id: &str, port_id: &str) -> Result<(), ControllerError> {
        let mut state = self.state.lock();
        let before = state.bindings.len();
        state.bindings.retain(|b| !(b.host_id == host_id && b.port_id == port_id));
        if state.bindings.len() == before {
            return Err(ControllerError::NotFound { kind: "port", id: port_id.to_owned() });
        }

        if let Some(port) = state.ports.get_mut(port_id) {
            port.bound_at = None;
        }
        Ok(())
    }

    async fn tunnel_zones(&self) -> Result<Vec<TunnelZone>, ControllerError> {
        Ok(self.state.lock().zones.clone())
    }

    async fn create_tunnel_zone(
        &self,
        name: &str,
        kind: TunnelZoneKind,
    ) -> Result<TunnelZone, ControllerError> {
        let mut state = self.state.lock();
        state.next_zone += 1;

        let zone = TunnelZone { id: format!("tz-{}", state.next_zone), name: name.to_owned(), kind };
        state.zones.push(zone.clone());
        Ok(zone)
    }

    async fn add_tunnel_zone_host(
        &self,
        zone_id: &str,
        host_id: &str,
        ip: Ipv4Addr,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock();
        if !state.zones.iter().any(|z| z.id == zone_id) {
            return Err(ControllerError::NotFound { kind: "tunnel zone", id: zone_id.to_owned() });
        }

        state.zone_members.entry(zone_id.to_owned()).or_default().push((host_id.to_owned(), ip));
        Ok(())
    }

    async fn delete_tunnel_zone(&self, zone_id: &str) -> Result<(), ControllerError> {
        let mut state = self.state.lock();
        let before = state.zones.len();
        state.zones.retain(|z| z.id != zone_id);
        if state.zones.len() == before {
            return Err(ControllerError::NotFound { kind: "tunnel zone", id: zone_id.to_owned() });
        }

        state.zone_members.remove(zone_id);
        Ok(())
    }
}

/// Hands out a shared [`FakeController`], failing the first connection attempts on demand.
#[derive(Debug, Default)]
pub struct FakeConnector {
    controller: FakeController,
    failures: AtomicUsize,
    attempts: AtomicUsize,
    last_endpoint: Mutex<Option<Endpoint>>,
}

impl FakeConnector {
    pub fn new(controller: FakeController) -> Self {
        Self { controller, ..Default::default() }
    }

    /// Fails the next `n` connection attempts.
    pub fn failing(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn controller(&self) -> &FakeController {
        &self.controller
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.last_endpoint.lock().clone()
    }
}

#[async_trait::async_trait]
impl ControllerConnector for FakeConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ControllerClient>, ControllerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_endpoint.lock() = Some(endpoint.clone());

        let failed = self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if failed {
            return Err(ControllerError::Unavailable(endpoint.url.clone()));
        }

        Ok(Arc::new(self.controller.clone()))
    }
}

/// A deployment of one API host and `agents` agent hosts, `midonet-agent-1` and up, each
/// linked to the API and registered alive in the controller.
#[derive(Debug, Clone)]
pub struct FakeDeployment {
    pub registry: FakeRegistry,
    pub controller: FakeController,
    pub connector: Arc<FakeConnector>,
    agents: usize,
}

impl FakeDeployment {
    pub const API: &'static str = "midonet-api";

    pub fn new(agents: usize) -> Self {
        Self::with_connector(agents, FakeConnector::default())
    }

    /// A deployment whose controller is reached through `connector`.
    pub fn with_connector(agents: usize, connector: FakeConnector) -> Self {
        let registry = FakeRegistry::default();
        let controller = connector.controller().clone();
        let options = ServiceOptions::default();

        registry.add_container(Self::API, &options.api.role, ApiHost::SELECTOR);

        for i in 1..=agents {
            let name = Self::agent_name(i);
            let host_id = Self::host_id(i);

            registry.add_container(&name, &options.agent.role, AgentHost::SELECTOR);
            registry.link(&name, &options.agent.api_link);
            registry.respond_on(&name, &options.agent.host_id_file, FakeExec::ok(format!("host_uuid={host_id}\n")));
            controller.add_host(&host_id, &name, true);
        }

        Self { registry, controller, connector: Arc::new(connector), agents }
    }

    pub fn agent_name(i: usize) -> String {
        format!("midonet-agent-{i}")
    }

    /// Controller host id of the agent `i`.
    pub fn host_id(i: usize) -> String {
        format!("00000000-0000-0000-0000-{i:012}")
    }

    pub const fn agents(&self) -> usize {
        self.agents
    }

    pub fn services(&self) -> ServiceRegistry {
        self.services_with(ServiceOptions::default())
    }

    pub fn services_with(&self, options: ServiceOptions) -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(self.registry.clone()), self.connector.clone(), options)
    }
}
