use std::{fmt, net::Ipv4Addr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    io::StreamReader,
};
use tracing::debug;
use vnt_command::Command;
use vnt_common::{trim_output, PollError};

use crate::{
    ContainerInfo, ContainerRegistry, ExecOptions, ExecOutput, ExecStatus, HostError, HostOptions,
    OutputStream, RegistryError, Result,
};

/// Lines of the standard output of a streamed command.
pub type LineStream = FramedRead<StreamReader<OutputStream, Bytes>, LinesCodec>;

/// How a command ended, as far as the host could tell within the allotted time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i64),
    /// The command was still running when the wait gave up.
    StillRunning,
}

impl ExitState {
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// The exit code, `-1` standing for a command that is still running.
    pub const fn code(&self) -> i64 {
        match self {
            Self::Exited(code) => *code,
            Self::StillRunning => -1,
        }
    }
}

/// Output of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub command: String,
    /// Standard output, trailing whitespace trimmed.
    pub stdout: String,
    pub exit: ExitState,
}

impl Output {
    pub const fn success(&self) -> bool {
        self.exit.success()
    }

    /// Turns a non-zero exit into [`HostError::CommandFailed`].
    pub fn into_checked(self, host: &str) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(HostError::CommandFailed {
                host: host.to_owned(),
                command: self.command,
                code: self.exit.code(),
                output: self.stdout,
            })
        }
    }
}

/// Handle to a command started on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHandle {
    pub id: String,
    pub command: String,
}

/// Proxy to one container host: runs commands through the container registry and tracks them.
///
/// Every call logs the host name and the command line. Nothing is retried: a failed exec is
/// reported to the caller as is.
#[derive(Clone)]
pub struct RemoteHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    registry: Arc<dyn ContainerRegistry>,
    info: ContainerInfo,
    options: HostOptions,
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("id", &self.inner.info.id)
            .field("name", &self.inner.info.name)
            .finish_non_exhaustive()
    }
}

impl RemoteHost {
    pub fn new(registry: Arc<dyn ContainerRegistry>, info: ContainerInfo, options: HostOptions) -> Self {
        Self { inner: Arc::new(HostInner { registry, info, options }) }
    }

    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn hostname(&self) -> &str {
        &self.inner.info.hostname
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.inner.info.ip
    }

    pub fn mac(&self) -> Option<&str> {
        self.inner.info.mac.as_deref()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.inner.info.label(key)
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.inner.info
    }

    pub fn options(&self) -> &HostOptions {
        &self.inner.options
    }

    pub fn registry(&self) -> &Arc<dyn ContainerRegistry> {
        &self.inner.registry
    }

    /// Current IPv4 address of the container, inspected anew on every call.
    pub async fn current_ip(&self) -> Result<Ipv4Addr> {
        let info = self.inner.registry.inspect(self.id()).await?;
        info.ip.ok_or_else(|| HostError::NoAddress(self.name().to_owned()))
    }

    /// Runs `cmd` to completion and returns its trimmed output. A non-zero exit is an error.
    pub async fn exec(&self, cmd: impl Into<Command>) -> Result<String> {
        self.exec_unchecked(cmd).await?.into_checked(self.name())
    }

    /// Runs `cmd` to completion, whatever its exit status.
    pub async fn exec_unchecked(&self, cmd: impl Into<Command>) -> Result<Output> {
        let cmd = cmd.into();
        let command = cmd.to_line();
        debug!(host = self.name(), %command, "executing command");

        let exec = self.inner.registry.exec(self.id(), cmd.argv(), ExecOptions::default()).await?;
        let stdout = match exec.output {
            ExecOutput::Collected(output) => trim_output(&output),
            _ => String::new(),
        };

        let handle = ExecHandle { id: exec.id, command };
        let exit = self.wait_exit_status(&handle, None).await?;
        debug!(host = self.name(), command = %handle.command, ?exit, %stdout, "command done");

        Ok(Output { command: handle.command, stdout, exit })
    }

    /// Starts `cmd` without waiting for it nor collecting its output.
    pub async fn exec_detached(&self, cmd: impl Into<Command>) -> Result<ExecHandle> {
        let cmd = cmd.into();
        let command = cmd.to_line();
        debug!(host = self.name(), %command, "executing detached command");

        let exec = self.inner.registry.exec(self.id(), cmd.argv(), ExecOptions::detach()).await?;
        Ok(ExecHandle { id: exec.id, command })
    }

    /// Starts `cmd` and returns its output as a stream of lines, once the command is confirmed
    /// to be running.
    pub async fn exec_streaming(&self, cmd: impl Into<Command>) -> Result<(LineStream, ExecHandle)> {
        let cmd = cmd.into();
        let command = cmd.to_line();
        debug!(host = self.name(), %command, "executing streamed command");

        let exec = self.inner.registry.exec(self.id(), cmd.argv(), ExecOptions::stream()).await?;
        let handle = ExecHandle { id: exec.id, command };

        let stream: OutputStream = match exec.output {
            ExecOutput::Stream(stream) => stream,
            ExecOutput::Collected(output) => {
                Box::pin(futures::stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(output)) }))
            }
            ExecOutput::Detached => Box::pin(futures::stream::empty()),
        };

        self.ensure_running(&handle).await?;

        Ok((FramedRead::new(StreamReader::new(stream), LinesCodec::new()), handle))
    }

    pub async fn exec_status(&self, handle: &ExecHandle) -> Result<ExecStatus> {
        Ok(self.inner.registry.exec_status(&handle.id).await?)
    }

    /// Polls until the command shows up as running. A command that already exited counts as
    /// started.
    async fn ensure_running(&self, handle: &ExecHandle) -> Result<()> {
        let poller = self.inner.options.start_poller();
        let registry = &self.inner.registry;

        let started = poller
            .until(move || async move {
                let status = registry.exec_status(&handle.id).await?;
                Ok::<_, RegistryError>((status.running || status.exit_code.is_some()).then_some(()))
            })
            .await;

        match started {
            Ok(()) => {
                debug!(host = self.name(), command = %handle.command, "command started");
                Ok(())
            }
            Err(PollError::Inner(e)) => Err(e.into()),
            Err(PollError::Timeout { .. }) => {
                debug!(host = self.name(), command = %handle.command, "command did not start");
                Err(HostError::StartTimeout {
                    host: self.name().to_owned(),
                    command: handle.command.clone(),
                    after: poller.timeout,
                })
            }
        }
    }

    /// Waits for the command to exit, up to `timeout` (the host's exit timeout by default).
    /// Running past the bound is not an error, it is reported as [`ExitState::StillRunning`].
    pub async fn wait_exit_status(
        &self,
        handle: &ExecHandle,
        timeout: Option<Duration>,
    ) -> Result<ExitState> {
        let registry = &self.inner.registry;

        let exited = self
            .inner
            .options
            .exit_poller(timeout)
            .until(move || async move {
                let status = registry.exec_status(&handle.id).await?;
                if status.running {
                    debug!(host = self.name(), command = %handle.command, "command still running");
                    return Ok::<_, RegistryError>(None);
                }
                Ok(status.exit_code.or(Some(-1)))
            })
            .await;

        match exited {
            Ok(code) => Ok(ExitState::Exited(code)),
            Err(PollError::Inner(e)) => Err(e.into()),
            Err(PollError::Timeout { elapsed }) => {
                debug!(host = self.name(), command = %handle.command, ?elapsed, "command timed out");
                Ok(ExitState::StillRunning)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::testing::{FakeExec, FakeRegistry};

    fn host(registry: &FakeRegistry) -> RemoteHost {
        let info = registry.add_container("plain-1", "plain", "vnt.plain");
        RemoteHost::new(Arc::new(registry.clone()), info, HostOptions::default())
    }

    #[tokio::test(start_paused = true)]
    async fn exec_trims_output_and_checks_exit_code() {
        let _ = tracing_subscriber::fmt::try_init();
        let registry = FakeRegistry::default();
        let host = host(&registry);

        registry.respond("echo hello", FakeExec::ok("hello\n\n"));
        registry.respond("false", FakeExec::exit(1));

        assert_eq!(host.exec(Command::new("echo").arg("hello")).await.unwrap(), "hello");

        let err = host.exec(Command::new("false")).await.unwrap_err();
        assert!(matches!(err, HostError::CommandFailed { code: 1, .. }));

        let output = host.exec_unchecked(Command::new("false")).await.unwrap();
        assert_eq!(output.exit, ExitState::Exited(1));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_fails_when_the_command_never_starts() {
        let registry = FakeRegistry::default();
        let host = host(&registry);
        registry.respond("tcpdump", FakeExec::never_starts());

        let start = Instant::now();
        let Err(err) = host.exec_streaming(Command::new("tcpdump")).await else {
            panic!("the command should not start");
        };

        assert!(matches!(err, HostError::StartTimeout { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_status_times_out_with_a_sentinel() {
        let registry = FakeRegistry::default();
        let host = host(&registry);
        registry.respond("sleep", FakeExec::ok("").running_for(Duration::from_secs(60)));

        let handle = host.exec_detached(Command::new("sleep").arg("60")).await.unwrap();

        let start = Instant::now();
        let exit = host.wait_exit_status(&handle, None).await.unwrap();
        assert_eq!(exit, ExitState::StillRunning);
        assert_eq!(exit.code(), -1);
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        let exit = host.wait_exit_status(&handle, Some(Duration::from_secs(120))).await.unwrap();
        assert_eq!(exit, ExitState::Exited(0));
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_commands_are_ordered() {
        let registry = FakeRegistry::default();
        let host = host(&registry);
        registry.respond("first", FakeExec::ok("").running_for(Duration::from_secs(3)));

        host.exec(Command::new("first")).await.unwrap();
        host.exec(Command::new("second")).await.unwrap();

        assert_eq!(registry.commands("plain-1"), vec!["first", "second"]);
    }
}
