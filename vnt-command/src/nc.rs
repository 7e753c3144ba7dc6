//! Netcat based TCP echo server and client.
//!
//! The server is a shell loop answering every connection with a fixed reply. Its pid is written
//! to a file so that [`stop_server`] can take down both the loop and the listening `nc`.

use std::net::Ipv4Addr;

use crate::{quote, Command};

/// Location of the pid file of the server listening on `port`.
pub fn pidfile(port: u16) -> String {
    format!("/tmp/vnt-nc-{port}.pid")
}

/// Serves `reply` to every client connecting to `addr:port`, until stopped.
pub fn echo_server(reply: &str, addr: Ipv4Addr, port: u16) -> Command {
    Command::script(format!(
        "echo $$ > {pidfile}; while true; do echo {reply} | nc -l {addr} {port}; done",
        pidfile = pidfile(port),
        reply = quote(reply),
    ))
}

/// Stops the server started by [`echo_server`] on `port`. The loop is frozen first so it cannot
/// respawn `nc` in between.
pub fn stop_server(port: u16) -> Command {
    Command::script(format!(
        "pid=$(cat {pidfile}) && kill -STOP $pid && pkill -9 -P $pid; kill -9 $pid; rm -f {pidfile}",
        pidfile = pidfile(port),
    ))
}

/// Connects to `addr:port` and prints whatever the server sends back.
pub fn request(addr: Ipv4Addr, port: u16) -> Command {
    Command::new("nc").arg(addr.to_string()).arg(port.to_string())
}
