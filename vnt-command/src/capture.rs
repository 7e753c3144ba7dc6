use crate::Command;

/// A `tcpdump` invocation scoped to a number of packets matching a pcap filter.
///
/// Output is line buffered and numeric, so every captured packet shows up as exactly one line
/// on stdout as soon as it is seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tcpdump {
    device: String,
    filter: String,
    count: u32,
}

impl Tcpdump {
    /// Captures the first packet on `device` matching `filter` (see `man pcap-filter`).
    pub fn new(device: impl Into<String>, filter: impl Into<String>) -> Self {
        Self { device: device.into(), filter: filter.into(), count: 1 }
    }

    pub const fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }
}

impl From<Tcpdump> for Command {
    fn from(value: Tcpdump) -> Self {
        let cmd = Self::new("tcpdump")
            .args(["-n", "-l", "-i"])
            .arg(value.device)
            .arg("-c")
            .arg(value.count.to_string());

        if value.filter.trim().is_empty() {
            cmd
        } else {
            cmd.arg(value.filter)
        }
    }
}
