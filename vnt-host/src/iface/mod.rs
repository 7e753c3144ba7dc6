//! Addressable endpoints of the test network.
//!
//! The [`Interface`] trait is the capability set every endpoint offers to tests: run commands,
//! craft and send packets, wait for a packet and inspect the link. Long running operations
//! return a [`Handle`] right away; awaiting it gives the synchronous flavour of the call.

use std::{
    fmt,
    future::Future,
    net::Ipv4Addr,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use vnt_command::{ip, nc, ArpOp, Command, Mz, PacketKind, Ping, ProtocolParams};
use vnt_common::Pending;

use crate::{ExecHandle, IfaceError, Output};

mod gate;
pub use gate::{CaptureGate, CaptureGuard, CaptureState};

mod namespace;
pub use namespace::{GuestSpec, NamespaceInterface};

/// Handle to an interface operation running on the worker pool.
#[derive(Debug)]
pub struct Handle<T> {
    state: HandleState<T>,
}

enum HandleState<T> {
    Pending(Pending<Result<T, IfaceError>>),
    Ready(Option<Result<T, IfaceError>>),
    Chained(BoxFuture<'static, Result<T, IfaceError>>),
}

impl<T: fmt::Debug> fmt::Debug for HandleState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(pending) => f.debug_tuple("Pending").field(pending).finish(),
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Chained(_) => f.write_str("Chained"),
        }
    }
}

impl<T> Unpin for Handle<T> {}

impl<T> Handle<T> {
    pub(crate) fn spawned(pending: Pending<Result<T, IfaceError>>) -> Self {
        Self { state: HandleState::Pending(pending) }
    }

    pub(crate) fn ready(result: Result<T, IfaceError>) -> Self {
        Self { state: HandleState::Ready(Some(result)) }
    }

    /// Waits for the operation to complete.
    pub async fn join(self) -> Result<T, IfaceError> {
        self.await
    }

    /// Always `false` for a [`checked`](Handle::checked) handle.
    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Pending(pending) => pending.is_finished(),
            HandleState::Ready(_) => true,
            HandleState::Chained(_) => false,
        }
    }
}

impl Handle<Output> {
    /// Resolves to [`HostError::CommandFailed`](crate::HostError::CommandFailed) when the
    /// command exits non-zero. `origin` names where it ran.
    pub fn checked(self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        let checked = async move {
            let output = self.await?;
            if !output.success() {
                output.clone().into_checked(&origin)?;
            }
            Ok::<_, IfaceError>(output)
        };

        Self { state: HandleState::Chained(checked.boxed()) }
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, IfaceError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Pending(pending) => {
                pending.poll_unpin(cx).map(|joined| joined.map_err(IfaceError::from).and_then(|r| r))
            }
            HandleState::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            },
            HandleState::Chained(chained) => chained.poll_unpin(cx),
        }
    }
}

/// A crafted IPv4 packet. Defaults: ports 9 to 9, one byte of payload, one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Hardware address of the receiving interface on the same segment, or of the router port
    /// facing the sender otherwise.
    pub target_hw: String,
    pub target_ipv4: Ipv4Addr,
    pub src_hw: Option<String>,
    pub src_ipv4: Option<Ipv4Addr>,
    pub params: ProtocolParams,
    pub payload_size: usize,
    pub delay: Duration,
    pub count: u32,
}

impl Packet {
    pub fn new(target_hw: impl Into<String>, target_ipv4: Ipv4Addr) -> Self {
        Self {
            target_hw: target_hw.into(),
            target_ipv4,
            src_hw: None,
            src_ipv4: None,
            params: ProtocolParams::ports(9, 9),
            payload_size: 1,
            delay: Duration::from_secs(1),
            count: 1,
        }
    }

    /// Ports left to `None` are omitted from the packet parameters.
    pub const fn with_ports(mut self, src_port: Option<u16>, dst_port: Option<u16>) -> Self {
        self.params.src_port = src_port;
        self.params.dst_port = dst_port;
        self
    }

    /// IP packet length, 28 bytes of headers plus the payload size.
    pub const fn with_iplen(mut self, iplen: Option<u16>) -> Self {
        self.params.iplen = iplen;
        self
    }

    /// Comma-separated extra packet parameters (see `man mz`).
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.params.extra = Some(extra.into());
        self
    }

    pub fn with_source(mut self, hw: Option<String>, ipv4: Option<Ipv4Addr>) -> Self {
        self.src_hw = hw;
        self.src_ipv4 = ipv4;
        self
    }

    pub const fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub const fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    fn to_mz(&self, device: &str, kind: PacketKind) -> Mz {
        Mz::new(device)
            .src(self.src_hw.clone(), self.src_ipv4)
            .target(self.target_hw.clone(), self.target_ipv4)
            .packet(kind, self.params.render())
            .payload_size(self.payload_size)
            .delay(self.delay)
            .count(self.count)
    }
}

/// Parameters of an ICMP echo run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingOptions {
    pub interval: Duration,
    pub count: u32,
    pub size: u32,
    /// Send an ARP request for the target one second before pinging it, to let the network
    /// learn the sender's hardware address.
    pub do_arp: bool,
    /// Report a ping that gets no reply as a failed command.
    pub should_succeed: bool,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self { interval: Duration::from_millis(500), count: 1, size: 56, do_arp: false, should_succeed: true }
    }
}

impl PingOptions {
    fn to_ping(self, addr: Ipv4Addr) -> Ping {
        Ping::new(addr).interval(self.interval).count(self.count).size(self.size)
    }
}

#[async_trait::async_trait]
pub trait Interface: Send + Sync {
    fn id(&self) -> &str;

    /// Device name on the endpoint side, where packets are sent and captured.
    fn ifname(&self) -> &str;

    /// Device name on the host side, the one bound to a virtual port.
    fn host_ifname(&self) -> &str;

    /// The virtual port this interface is bound to.
    fn vport_id(&self) -> Option<String>;

    fn set_vport_id(&self, vport_id: Option<String>);

    /// Runs `cmd` on the endpoint, whatever its exit status. With a `timeout` the command is
    /// killed remotely once it elapses.
    fn run(&self, cmd: Command, timeout: Option<Duration>) -> Handle<Output>;

    /// Runs `cmd` on the endpoint and returns its output. A non-zero exit is an error.
    fn execute(&self, cmd: Command, timeout: Option<Duration>) -> Handle<String>;

    /// Starts `cmd` on the endpoint without waiting for it.
    async fn execute_detached(&self, cmd: Command) -> Result<ExecHandle, IfaceError>;

    /// Captures the first packet matching `filter` (see `man pcap-filter`). Resolves to `true`
    /// when a packet was seen within `timeout`, to `false` otherwise.
    ///
    /// One capture at a time: a second call while one is in progress resolves to
    /// [`IfaceError::CaptureInProgress`].
    fn expect(&self, filter: &str, timeout: Option<Duration>) -> Handle<bool>;

    /// Waits until the capture started by [`Interface::expect`], if any, is listening.
    async fn wait_capture_ready(&self);

    fn clear_arp(&self) -> Handle<String> {
        self.execute(ip::neigh_flush_all(), None)
    }

    async fn set_up(&self) -> Result<(), IfaceError> {
        self.execute(ip::link_up(self.ifname()), None).await.map(drop)
    }

    async fn set_down(&self) -> Result<(), IfaceError> {
        self.execute(ip::link_down(self.ifname()), None).await.map(drop)
    }

    fn send_arp_request(&self, target_ipv4: Ipv4Addr) -> Handle<String> {
        self.execute(Mz::arp(self.ifname(), &ArpOp::Request { target_ipv4 }).into(), None)
    }

    fn send_arp_reply(
        &self,
        src_mac: &str,
        target_mac: &str,
        src_ipv4: Ipv4Addr,
        target_ipv4: Ipv4Addr,
    ) -> Handle<String> {
        let op = ArpOp::Reply {
            src_mac: src_mac.to_owned(),
            target_mac: target_mac.to_owned(),
            src_ipv4,
            target_ipv4,
        };
        self.execute(Mz::arp(self.ifname(), &op).into(), None)
    }

    /// Sends a raw ethernet frame, given as a hex string, `count` times (`0` for ever).
    fn send_ether(&self, frame: &str, count: u32) -> Handle<String> {
        self.execute(Mz::ether(self.ifname(), frame, count).into(), None)
    }

    fn send_protocol(&self, kind: PacketKind, packet: &Packet) -> Handle<String> {
        self.execute(packet.to_mz(self.ifname(), kind).into(), None)
    }

    fn send_udp(&self, packet: &Packet) -> Handle<String> {
        self.send_protocol(PacketKind::Udp, packet)
    }

    fn send_tcp(&self, packet: &Packet) -> Handle<String> {
        self.send_protocol(PacketKind::Tcp, packet)
    }

    /// Pings `addr`. The returned handle resolves to the ping output. A failed ping is an
    /// error unless [`PingOptions::should_succeed`] is unset, then check [`Output::success`].
    async fn ping_ipv4_addr(&self, addr: Ipv4Addr, options: PingOptions) -> Result<Handle<Output>, IfaceError> {
        if options.do_arp {
            self.send_arp_request(addr).await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let ping = self.run(options.to_ping(addr).into(), None);
        Ok(if options.should_succeed { ping.checked(self.id()) } else { ping })
    }

    async fn ping4(&self, target: &dyn Interface, options: PingOptions) -> Result<Handle<Output>, IfaceError> {
        let addr = target.get_ip().await?;
        self.ping_ipv4_addr(addr, options).await
    }

    /// The IPv4 address and prefix length of the endpoint, e.g. `172.16.1.2/24`.
    async fn get_cidr(&self) -> Result<String, IfaceError> {
        let output = self.execute(ip::addr_show_v4(self.ifname()), None).await?;
        ip::parse_addr_show_v4(&output).map(str::to_owned).ok_or_else(|| IfaceError::Parse {
            iface: self.id().to_owned(),
            what: "IPv4 address",
            output: output.clone(),
        })
    }

    async fn get_ip(&self) -> Result<Ipv4Addr, IfaceError> {
        let cidr = self.get_cidr().await?;
        let addr = cidr.split('/').next().unwrap_or_default();
        Ipv4Addr::from_str(addr).map_err(|_| IfaceError::Parse {
            iface: self.id().to_owned(),
            what: "IPv4 address",
            output: cidr.clone(),
        })
    }

    async fn get_mac_addr(&self) -> Result<String, IfaceError> {
        let output = self.execute(ip::link_address(self.ifname()), None).await?;
        let valid = output.split(':').count() == 6
            && output.split(':').all(|octet| octet.len() == 2 && u8::from_str_radix(octet, 16).is_ok());

        if valid {
            Ok(output)
        } else {
            Err(IfaceError::Parse { iface: self.id().to_owned(), what: "hardware address", output })
        }
    }

    async fn get_mtu(&self) -> Result<u32, IfaceError> {
        let output = self.execute(ip::link_mtu(self.ifname()), None).await?;
        output.trim().parse().map_err(|_| IfaceError::Parse {
            iface: self.id().to_owned(),
            what: "MTU",
            output: output.clone(),
        })
    }

    async fn get_num_routes(&self) -> Result<usize, IfaceError> {
        let output = self.execute(ip::route_show(), None).await?;
        Ok(output.lines().filter(|line| !line.trim().is_empty()).count())
    }

    /// Starts a TCP server on `port` answering every connection with the interface id.
    async fn start_server(&self, port: u16) -> Result<ExecHandle, IfaceError> {
        let addr = self.get_ip().await?;
        self.execute_detached(nc::echo_server(self.id(), addr, port)).await
    }

    async fn stop_server(&self, port: u16) -> Result<(), IfaceError> {
        self.execute(nc::stop_server(port), None).await.map(drop)
    }

    /// Connects to `addr:port` and returns what the server answered.
    async fn make_request_to(&self, addr: Ipv4Addr, port: u16, timeout: Duration) -> Result<String, IfaceError> {
        self.execute(nc::request(addr, port), Some(timeout)).await
    }
}
