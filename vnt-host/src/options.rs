use std::time::Duration;

use vnt_common::Poller;

/// Timing of the polling loops run by a [`RemoteHost`](crate::RemoteHost) and the service
/// roles built on top of it.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// How long a streamed command gets to show up as running.
    pub start_timeout: Duration,
    pub start_poll: Duration,
    /// How long to wait for a command to exit before reporting it as still running.
    pub exit_timeout: Duration,
    pub exit_poll: Duration,
    /// Bound of [`ServiceHost::wait_for_status`](crate::ServiceHost::wait_for_status).
    pub status_timeout: Duration,
    pub status_poll: Duration,
    /// The link taken down by [`ServiceHost::inject_failure`](crate::ServiceHost::inject_failure).
    pub failure_device: String,
}

impl HostOptions {
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    /// Sets the overall bound and the interval of the service status polling.
    pub fn with_status_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.status_poll = interval;
        self.status_timeout = timeout;
        self
    }

    pub fn with_failure_device(mut self, device: impl Into<String>) -> Self {
        self.failure_device = device.into();
        self
    }

    pub(crate) const fn start_poller(&self) -> Poller {
        Poller::new(self.start_poll, self.start_timeout)
    }

    pub(crate) const fn exit_poller(&self, timeout: Option<Duration>) -> Poller {
        match timeout {
            Some(timeout) => Poller::new(self.exit_poll, timeout),
            None => Poller::new(self.exit_poll, self.exit_timeout),
        }
    }

    pub(crate) const fn status_poller(&self) -> Poller {
        Poller::new(self.status_poll, self.status_timeout)
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(10),
            start_poll: Duration::from_secs(1),
            exit_timeout: Duration::from_secs(5),
            exit_poll: Duration::from_secs(1),
            status_timeout: Duration::from_secs(120),
            status_poll: Duration::from_secs(5),
            failure_device: "eth0".to_owned(),
        }
    }
}

/// Options of the controller API host.
#[derive(Debug, Clone)]
pub struct ApiOptions {
    /// Value of the role label identifying API hosts.
    pub role: String,
    pub service_name: String,
    pub port: u16,
    pub base_path: String,
    pub username: String,
    pub password: String,
    /// Overall bound and interval of the connect-and-probe retry loop.
    pub connect_timeout: Duration,
    pub connect_poll: Duration,
    /// Probe command whose exit status tells whether the API is up.
    pub status_command: String,
    pub status_timeout: Duration,
}

impl ApiOptions {
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_connect_retry(mut self, interval: Duration, timeout: Duration) -> Self {
        self.connect_poll = interval;
        self.connect_timeout = timeout;
        self
    }

    pub fn with_status_command(mut self, command: impl Into<String>) -> Self {
        self.status_command = command.into();
        self
    }

    pub(crate) const fn connect_poller(&self) -> Poller {
        Poller::new(self.connect_poll, self.connect_timeout)
    }
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            role: "midonet-api".to_owned(),
            service_name: "tomcat7".to_owned(),
            port: 8080,
            base_path: "/midonet-api".to_owned(),
            username: "admin".to_owned(),
            password: "*".to_owned(),
            connect_timeout: Duration::from_secs(60),
            connect_poll: Duration::from_secs(1),
            status_command: "midonet-cli -e host list".to_owned(),
            status_timeout: Duration::from_secs(60),
        }
    }
}

/// Options of the agent (compute) hosts.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Value of the role label identifying agent hosts.
    pub role: String,
    pub service_name: String,
    /// Properties file holding the controller host id on its last line, as `key=value`.
    pub host_id_file: String,
    /// Container name prefix followed by the agent index, e.g. `midonet-agent-1`.
    pub name_prefix: String,
    /// Name of the linked API container.
    pub api_link: String,
    pub disable_ipv6: bool,
}

impl AgentOptions {
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_api_link(mut self, name: impl Into<String>) -> Self {
        self.api_link = name.into();
        self
    }

    pub const fn with_ipv6(mut self, enabled: bool) -> Self {
        self.disable_ipv6 = !enabled;
        self
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            role: "midonet-agent".to_owned(),
            service_name: "midolman".to_owned(),
            host_id_file: "/etc/midonet_host_id.properties".to_owned(),
            name_prefix: "midonet-agent-".to_owned(),
            api_link: "midonet-api".to_owned(),
            disable_ipv6: true,
        }
    }
}

/// Everything a [`ServiceRegistry`](crate::ServiceRegistry) hands down to the services it loads.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub host: HostOptions,
    pub api: ApiOptions,
    pub agent: AgentOptions,
    /// Size of the worker pool shared by every interface of the run.
    pub workers: usize,
}

impl ServiceOptions {
    pub fn with_host(mut self, host: HostOptions) -> Self {
        self.host = host;
        self
    }

    pub fn with_api(mut self, api: ApiOptions) -> Self {
        self.api = api;
        self
    }

    pub fn with_agent(mut self, agent: AgentOptions) -> Self {
        self.agent = agent;
        self
    }

    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            host: HostOptions::default(),
            api: ApiOptions::default(),
            agent: AgentOptions::default(),
            workers: vnt_common::WorkerPool::DEFAULT_WORKERS,
        }
    }
}
