use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, debug_span, info, warn, Instrument};
use vnt_command::{ip, Command, Tcpdump};
use vnt_common::WorkerPool;

use super::{CaptureGate, CaptureGuard, Handle, Interface};
use crate::{ExecHandle, HostError, IfaceError, Output, RemoteHost};

/// Addressing of a guest interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestSpec {
    /// Interface id, used to name the devices and the namespace. Generated when missing.
    pub ifname: Option<String>,
    pub hw_addr: Option<String>,
    /// Address in CIDR notation, e.g. `172.16.1.2/24`.
    pub ipv4_addr: Option<String>,
    pub ipv4_gw: Option<Ipv4Addr>,
    pub mtu: Option<u32>,
}

/// A veth pair on a remote host whose peer end lives alone in a network namespace.
///
/// For an interface with id `X`, the host end is `vethX`, the namespace is `vmX` and the device
/// inside it is `pethX`. Every command of the [`Interface`] runs inside the namespace, on the
/// shared worker pool.
#[derive(Debug, Clone)]
pub struct NamespaceInterface {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: String,
    netns: String,
    ifname: String,
    host_ifname: String,
    host: RemoteHost,
    spec: GuestSpec,
    pool: WorkerPool,
    vport_id: Mutex<Option<String>>,
    gate: Arc<CaptureGate>,
}

impl NamespaceInterface {
    /// Wraps an interface `id` of `host`. The devices themselves are provisioned by the owning
    /// host, see [`AgentHost::create_guest`](crate::AgentHost::create_guest).
    pub fn new(host: RemoteHost, id: impl Into<String>, spec: GuestSpec, pool: WorkerPool) -> Self {
        let id = id.into();

        Self {
            inner: Arc::new(Inner {
                netns: format!("vm{id}"),
                ifname: format!("peth{id}"),
                host_ifname: format!("veth{id}"),
                id,
                host,
                spec,
                pool,
                vport_id: Mutex::default(),
                gate: Arc::default(),
            }),
        }
    }

    pub fn netns(&self) -> &str {
        &self.inner.netns
    }

    pub fn host(&self) -> &RemoteHost {
        &self.inner.host
    }

    pub fn spec(&self) -> &GuestSpec {
        &self.inner.spec
    }

    /// The hardware address the interface was created with.
    pub fn hw_addr(&self) -> Option<&str> {
        self.inner.spec.hw_addr.as_deref()
    }

    pub fn gate(&self) -> &CaptureGate {
        &self.inner.gate
    }

    /// Sets the endpoint down and deletes the namespace, which takes the veth pair with it.
    /// Destroying an interface whose namespace is already gone is a no-op.
    pub async fn destroy(&self) -> Result<(), HostError> {
        let host = &self.inner.host;
        let netns = self.netns();

        if !host.exec_unchecked(ip::netns_exists(netns)).await?.success() {
            debug!(host = host.name(), iface = self.id(), "namespace already gone");
            return Ok(());
        }

        let down = host.exec_unchecked(ip::netns_exec(netns, ip::link_down(self.ifname()))).await?;
        if !down.success() {
            debug!(host = host.name(), iface = self.id(), "could not set the endpoint down");
        }

        host.exec(ip::netns_del(netns)).await?;
        info!(host = host.name(), iface = self.id(), "guest destroyed");
        Ok(())
    }

    fn in_netns(&self, cmd: Command, timeout: Option<Duration>) -> Command {
        ip::netns_exec(self.netns(), cmd.with_timeout(timeout))
    }

    /// Runs one capture. The guard is released as soon as the capture command runs or failed
    /// to start; the slot stays reserved until this returns.
    async fn capture(&self, filter: &str, timeout: Option<Duration>, mut guard: CaptureGuard) -> bool {
        let host = &self.inner.host;
        let cmd = self.in_netns(Tcpdump::new(self.ifname(), filter).into(), timeout);

        let started = host.exec_streaming(cmd).await;
        guard.release();

        let (mut lines, handle) = match started {
            Ok(started) => started,
            Err(e) => {
                warn!(iface = self.id(), error = %e, "capture did not start");
                return false;
            }
        };

        debug!(iface = self.id(), command = %handle.command, "capture running");

        let mut output = String::new();
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    debug!(iface = self.id(), %line, "captured");
                    output.push_str(&line);
                    output.push('\n');
                }
                Err(e) => {
                    debug!(iface = self.id(), error = %e, "capture stream failed");
                    break;
                }
            }
        }

        match host.wait_exit_status(&handle, None).await {
            Ok(exit) if exit.success() && !output.is_empty() => {
                debug!(iface = self.id(), %output, "packet received");
                true
            }
            Ok(exit) => {
                debug!(iface = self.id(), code = exit.code(), %output, "no packet received");
                false
            }
            Err(e) => {
                warn!(iface = self.id(), error = %e, "could not check the capture exit status");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl Interface for NamespaceInterface {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn ifname(&self) -> &str {
        &self.inner.ifname
    }

    fn host_ifname(&self) -> &str {
        &self.inner.host_ifname
    }

    fn vport_id(&self) -> Option<String> {
        self.inner.vport_id.lock().clone()
    }

    fn set_vport_id(&self, vport_id: Option<String>) {
        *self.inner.vport_id.lock() = vport_id;
    }

    fn run(&self, cmd: Command, timeout: Option<Duration>) -> Handle<Output> {
        let host = self.inner.host.clone();
        let cmd = self.in_netns(cmd, timeout);

        Handle::spawned(self.inner.pool.spawn(async move { host.exec_unchecked(cmd).await.map_err(IfaceError::from) }))
    }

    fn execute(&self, cmd: Command, timeout: Option<Duration>) -> Handle<String> {
        let host = self.inner.host.clone();
        let cmd = self.in_netns(cmd, timeout);

        Handle::spawned(self.inner.pool.spawn(async move { host.exec(cmd).await.map_err(IfaceError::from) }))
    }

    async fn execute_detached(&self, cmd: Command) -> Result<ExecHandle, IfaceError> {
        Ok(self.inner.host.exec_detached(self.in_netns(cmd, None)).await?)
    }

    fn expect(&self, filter: &str, timeout: Option<Duration>) -> Handle<bool> {
        let Some(guard) = self.inner.gate.arm() else {
            warn!(iface = self.id(), filter, "capture already in progress");
            return Handle::ready(Err(IfaceError::CaptureInProgress(self.id().to_owned())));
        };

        let this = self.clone();
        let filter = filter.to_owned();
        let span = debug_span!("expect", iface = %self.id(), %filter);

        Handle::spawned(
            self.inner
                .pool
                .spawn(async move { Ok(this.capture(&filter, timeout, guard).await) }.instrument(span)),
        )
    }

    async fn wait_capture_ready(&self) {
        self.inner.gate.ready().await;
    }
}
