//! Builder for the `mz` (mausezahn) packet crafter.

use std::{fmt, net::Ipv4Addr, time::Duration};

use crate::Command;

/// Packet types understood by `mz -t`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Arp,
    Udp,
    Tcp,
    Icmp,
    Other(String),
}

impl PacketKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Arp => "arp",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Icmp => "icmp",
            Self::Other(kind) => kind,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layer 4 parameters of a UDP or TCP packet. Every field left to `None` is omitted from the
/// generated argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolParams {
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// IP packet length. `mz` needs it to be 28 (IP and UDP headers) plus the payload size.
    pub iplen: Option<u16>,
    /// Comma-separated extra parameters, appended verbatim.
    pub extra: Option<String>,
}

impl ProtocolParams {
    pub const fn ports(src_port: u16, dst_port: u16) -> Self {
        Self { src_port: Some(src_port), dst_port: Some(dst_port), iplen: None, extra: None }
    }

    pub const fn iplen(mut self, iplen: Option<u16>) -> Self {
        self.iplen = iplen;
        self
    }

    /// Renders the parameters as `mz` expects them, e.g. `sp=9,dp=9,iplen=28`.
    pub fn render(&self) -> String {
        let mut params = Vec::with_capacity(4);
        if let Some(sp) = self.src_port {
            params.push(format!("sp={sp}"));
        }
        if let Some(dp) = self.dst_port {
            params.push(format!("dp={dp}"));
        }
        if let Some(iplen) = self.iplen {
            params.push(format!("iplen={iplen}"));
        }
        if let Some(extra) = self.extra.as_deref().filter(|e| !e.is_empty()) {
            params.push(extra.to_owned());
        }
        params.join(",")
    }
}

/// ARP messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArpOp {
    Request { target_ipv4: Ipv4Addr },
    Reply { src_mac: String, target_mac: String, src_ipv4: Ipv4Addr, target_ipv4: Ipv4Addr },
}

impl ArpOp {
    fn render(&self) -> String {
        match self {
            Self::Request { target_ipv4 } => format!("request, targetip={target_ipv4}"),
            Self::Reply { src_mac, target_mac, src_ipv4, target_ipv4 } => format!(
                "reply, smac={src_mac}, tmac={target_mac}, sip={src_ipv4}, tip={target_ipv4}"
            ),
        }
    }
}

/// A `mz` invocation sending crafted packets out of `device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mz {
    device: String,
    src_hw: Option<String>,
    src_ipv4: Option<Ipv4Addr>,
    target_hw: Option<String>,
    target_ipv4: Option<Ipv4Addr>,
    packet: Option<(PacketKind, String)>,
    payload_size: Option<usize>,
    delay: Option<Duration>,
    count: Option<u32>,
    frame: Option<String>,
}

impl Mz {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            src_hw: None,
            src_ipv4: None,
            target_hw: None,
            target_ipv4: None,
            packet: None,
            payload_size: None,
            delay: None,
            count: None,
            frame: None,
        }
    }

    /// An ARP request or reply.
    pub fn arp(device: impl Into<String>, op: &ArpOp) -> Self {
        Self::new(device).packet(PacketKind::Arp, op.render())
    }

    /// A raw ethernet frame given as a hex string without white spaces (see `man mz`).
    pub fn ether(device: impl Into<String>, frame: impl Into<String>, count: u32) -> Self {
        let mut mz = Self::new(device).count(count);
        mz.frame = Some(frame.into());
        mz
    }

    pub fn src(mut self, hw: Option<String>, ipv4: Option<Ipv4Addr>) -> Self {
        self.src_hw = hw;
        self.src_ipv4 = ipv4;
        self
    }

    pub fn target(mut self, hw: impl Into<String>, ipv4: Ipv4Addr) -> Self {
        self.target_hw = Some(hw.into());
        self.target_ipv4 = Some(ipv4);
        self
    }

    pub fn packet(mut self, kind: PacketKind, params: impl Into<String>) -> Self {
        self.packet = Some((kind, params.into()));
        self
    }

    /// Pads the packet with an ASCII payload of `size` zeros, at least one. `mz -P` takes the
    /// payload itself, not its length.
    pub const fn payload_size(mut self, size: usize) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Delay between two transmissions.
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of packets to send, `0` means forever.
    pub const fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }
}

/// `mz` takes microseconds by default, `m` and `s` suffixes otherwise.
fn render_delay(delay: Duration) -> String {
    if delay.subsec_nanos() == 0 {
        format!("{}s", delay.as_secs())
    } else if delay.subsec_micros() % 1000 == 0 {
        format!("{}m", delay.as_millis())
    } else {
        delay.as_micros().to_string()
    }
}

impl From<Mz> for Command {
    fn from(value: Mz) -> Self {
        let mut cmd = Self::new("mz")
            .arg(value.device)
            .arg_opt("-a", value.src_hw)
            .arg_opt("-A", value.src_ipv4)
            .arg_opt("-b", value.target_hw)
            .arg_opt("-B", value.target_ipv4);

        if let Some((kind, params)) = value.packet {
            cmd = cmd.arg("-t").arg(kind.as_str());
            if !params.is_empty() {
                cmd = cmd.arg(params);
            }
        }

        if let Some(size) = value.payload_size {
            cmd = cmd.arg("-P").arg("0".repeat(size.max(1)));
        }

        cmd.arg_opt("-d", value.delay.map(render_delay))
            .arg_opt("-c", value.count)
            .args(value.frame)
    }
}
