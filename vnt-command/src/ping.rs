use std::{net::Ipv4Addr, time::Duration};

use crate::Command;

/// An ICMP echo run: `ping -i <interval> -c <count> -s <size> <addr>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    addr: Ipv4Addr,
    interval: Duration,
    count: u32,
    size: u32,
}

impl Ping {
    /// One 56 bytes echo request, with a 500ms interval should `count` be raised.
    pub const fn new(addr: Ipv4Addr) -> Self {
        Self { addr, interval: Duration::from_millis(500), count: 1, size: 56 }
    }

    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub const fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Payload size in bytes.
    pub const fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }
}

impl From<Ping> for Command {
    fn from(value: Ping) -> Self {
        Self::new("ping")
            .arg("-i")
            .arg(value.interval.as_secs_f64().to_string())
            .arg("-c")
            .arg(value.count.to_string())
            .arg("-s")
            .arg(value.size.to_string())
            .arg(value.addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cmd: Command = Ping::new(Ipv4Addr::new(172, 16, 0, 2)).into();
        assert_eq!(cmd.to_line(), "ping -i 0.5 -c 1 -s 56 172.16.0.2");
    }

    #[test]
    fn whole_second_interval() {
        let cmd: Command =
            Ping::new(Ipv4Addr::LOCALHOST).interval(Duration::from_secs(1)).count(3).size(1400).into();
        assert_eq!(cmd.to_line(), "ping -i 1 -c 3 -s 1400 127.0.0.1");
    }
}
