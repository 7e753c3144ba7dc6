use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

/// Errors surfaced by a [`ContainerRegistry`](crate::ContainerRegistry).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("container {0} not found")]
    ContainerNotFound(String),
    #[error("exec {0} not found")]
    ExecNotFound(String),
    #[error("registry backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors surfaced by a [`ControllerClient`](crate::ControllerClient) or its connector.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller unavailable: {0}")]
    Unavailable(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("controller backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ControllerError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("[{host}] command `{command}` did not start within {after:?}")]
    StartTimeout { host: String, command: String, after: Duration },
    #[error("[{host}] {op} timed out after {after:?}")]
    Timeout { host: String, op: &'static str, after: Duration },
    #[error("[{host}] command `{command}` failed with exit code {code}: {output}")]
    CommandFailed { host: String, command: String, code: i64, output: String },
    #[error("no service implementation registered for selector {0:?}")]
    UnknownImplementation(String),
    #[error("container {container} has no {label:?} label")]
    MissingLabel { container: String, label: &'static str },
    #[error("container {container} is not linked to a {role} named {name}")]
    MissingLink { container: String, role: String, name: String },
    #[error("host {0} not found")]
    HostNotFound(String),
    #[error("service {name} is not a {expected}")]
    WrongRole { name: String, expected: &'static str },
    #[error("[{host}] could not parse {what} from {output:?}")]
    Parse { host: String, what: &'static str, output: String },
    #[error("container {0} has no IPv4 address")]
    NoAddress(String),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Errors surfaced by [`Interface`](crate::Interface) operations.
#[derive(Debug, Error)]
pub enum IfaceError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("interface {iface}: could not parse {what} from {output:?}")]
    Parse { iface: String, what: &'static str, output: String },
    #[error("interface {0} already has a capture in progress")]
    CaptureInProgress(String),
    #[error("interface task failed: {0}")]
    Join(#[from] JoinError),
}
