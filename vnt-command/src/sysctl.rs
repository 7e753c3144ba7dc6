//! `sysctl` invocations.

use crate::Command;

/// `sysctl -w <key>=<value>`
pub fn set(key: &str, value: impl std::fmt::Display) -> Command {
    Command::new("sysctl").arg("-w").arg(format!("{key}={value}"))
}

/// The commands disabling IPv6 for both the default and all current devices.
pub fn disable_ipv6() -> [Command; 2] {
    [set("net.ipv6.conf.default.disable_ipv6", 1), set("net.ipv6.conf.all.disable_ipv6", 1)]
}
