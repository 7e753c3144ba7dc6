use std::{fmt, io, net::Ipv4Addr, pin::Pin};

use bytes::Bytes;
use futures::Stream;
use rustc_hash::FxHashMap;

use crate::RegistryError;

/// Label carrying the role of a container, e.g. `midonet-agent`.
pub const ROLE_LABEL: &str = "type";
/// Label selecting the service implementation proxying a container.
pub const SELECTOR_LABEL: &str = "interface";

/// A running container, as listed by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: FxHashMap<String, String>,
}

/// Inspection details of a single container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Container name, without the leading `/`.
    pub name: String,
    pub hostname: String,
    pub labels: FxHashMap<String, String>,
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<String>,
    /// Names of the containers this one is linked to.
    pub links: Vec<String>,
    pub env: Vec<String>,
}

impl ContainerInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Byte stream of the standard output of a streamed exec.
pub type OutputStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Return the output as a stream instead of waiting for the command to exit.
    pub stream: bool,
    /// Start the command and return right away, discarding its output.
    pub detach: bool,
}

impl ExecOptions {
    pub const fn stream() -> Self {
        Self { stream: true, detach: false }
    }

    pub const fn detach() -> Self {
        Self { stream: false, detach: true }
    }
}

pub enum ExecOutput {
    /// The whole standard output of a command that has exited.
    Collected(String),
    Stream(OutputStream),
    Detached,
}

impl fmt::Debug for ExecOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collected(output) => f.debug_tuple("Collected").field(output).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Detached => f.write_str("Detached"),
        }
    }
}

/// A command started in a container.
#[derive(Debug)]
pub struct Exec {
    pub id: String,
    pub output: ExecOutput,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    /// Set once the command has exited.
    pub exit_code: Option<i64>,
}

/// Container engine access: discovery, inspection and command execution.
#[async_trait::async_trait]
pub trait ContainerRegistry: Send + Sync + 'static {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RegistryError>;

    async fn inspect(&self, container: &str) -> Result<ContainerInfo, RegistryError>;

    /// Runs `argv` in `container`. Only the standard output is captured.
    async fn exec(
        &self,
        container: &str,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> Result<Exec, RegistryError>;

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RegistryError>;
}
