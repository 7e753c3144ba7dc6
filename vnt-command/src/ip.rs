//! `ip` (iproute2) invocations used to provision and inspect namespace-backed interfaces.

use crate::Command;

fn ip() -> Command {
    Command::new("ip")
}

/// `ip netns add <name>`
pub fn netns_add(name: &str) -> Command {
    ip().args(["netns", "add", name])
}

/// `ip netns del <name>`
pub fn netns_del(name: &str) -> Command {
    ip().args(["netns", "del", name])
}

/// Exits with 0 when the network namespace `name` exists.
pub fn netns_exists(name: &str) -> Command {
    Command::new("test").arg("-e").arg(format!("/var/run/netns/{name}"))
}

/// Runs `cmd` inside the network namespace `name`.
pub fn netns_exec(name: &str, cmd: Command) -> Command {
    cmd.wrapped_by(ip().args(["netns", "exec", name]))
}

/// Create Virtual Ethernet (veth) devices and link them.
///
/// Note: device name length can be max 15 chars long
pub fn veth_add(name: &str, peer: &str) -> Command {
    ip().args(["link", "add", "dev", name, "type", "veth", "peer", "name", peer])
}

/// `ip link del dev <dev>`, deleting a veth pair removes its peer too.
pub fn link_del(dev: &str) -> Command {
    ip().args(["link", "del", "dev", dev])
}

/// `ip link set address <mac> dev <dev>`
pub fn link_set_address(dev: &str, hw_addr: &str) -> Command {
    ip().args(["link", "set", "address", hw_addr, "dev", dev])
}

/// `ip link set dev <dev> up`
pub fn link_up(dev: &str) -> Command {
    ip().args(["link", "set", "dev", dev, "up"])
}

/// `ip link set dev <dev> down`
pub fn link_down(dev: &str) -> Command {
    ip().args(["link", "set", "dev", dev, "down"])
}

/// Moves `dev` into namespace `netns` and brings it up in one go.
pub fn link_up_in_netns(dev: &str, netns: &str) -> Command {
    ip().args(["link", "set", "dev", dev, "up", "netns", netns])
}

/// `ip link set mtu <mtu> dev <dev>`
pub fn link_set_mtu(dev: &str, mtu: u32) -> Command {
    ip().args(["link", "set", "mtu"]).arg(mtu.to_string()).args(["dev", dev])
}

/// `ip addr add <cidr> dev <dev>`
pub fn addr_add(dev: &str, cidr: &str) -> Command {
    ip().args(["addr", "add", cidr, "dev", dev])
}

/// `ip route add default via <gw>`
pub fn route_add_default(gateway: &str) -> Command {
    ip().args(["route", "add", "default", "via", gateway])
}

/// `ip neigh flush all`
pub fn neigh_flush_all() -> Command {
    ip().args(["neigh", "flush", "all"])
}

/// One line per IPv4 address of `dev`: `<idx>: <dev>    inet <cidr> ...`.
pub fn addr_show_v4(dev: &str) -> Command {
    ip().args(["-o", "-4", "addr", "show", "dev", dev])
}

/// One line per route of the main table.
pub fn route_show() -> Command {
    ip().args(["route", "show"])
}

/// Hardware address of `dev`, read from sysfs so the output is a single token.
pub fn link_address(dev: &str) -> Command {
    Command::new("cat").arg(format!("/sys/class/net/{dev}/address"))
}

/// MTU of `dev`, read from sysfs so the output is a single token.
pub fn link_mtu(dev: &str) -> Command {
    Command::new("cat").arg(format!("/sys/class/net/{dev}/mtu"))
}

/// Parses the CIDR out of the first line of [`addr_show_v4`].
pub fn parse_addr_show_v4(output: &str) -> Option<&str> {
    let line = output.lines().next()?;
    let mut tokens = line.split_whitespace();
    tokens.find(|t| *t == "inet")?;
    tokens.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_in_namespace_prefixes_the_command() {
        let cmd = netns_exec("vm42", neigh_flush_all());
        assert_eq!(cmd.to_line(), "ip netns exec vm42 ip neigh flush all");
    }

    #[test]
    fn veth_and_link_commands() {
        assert_eq!(veth_add("veth42", "peth42").to_line(), "ip link add dev veth42 type veth peer name peth42");
        assert_eq!(link_up_in_netns("peth42", "vm42").to_line(), "ip link set dev peth42 up netns vm42");
        assert_eq!(link_set_mtu("peth42", 1450).to_line(), "ip link set mtu 1450 dev peth42");
    }

    #[test]
    fn parses_cidr_from_oneline_output() {
        let output = "2: peth42    inet 172.16.1.2/24 brd 172.16.1.255 scope global peth42\\       valid_lft forever preferred_lft forever";
        assert_eq!(parse_addr_show_v4(output), Some("172.16.1.2/24"));
        assert_eq!(parse_addr_show_v4(""), None);
        assert_eq!(parse_addr_show_v4("2: peth42 link/ether"), None);
    }
}
