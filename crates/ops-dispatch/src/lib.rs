//! Service lifecycle dispatch.
//!
//! Resolves a service name to a host-specific execution strategy: the
//! [`LocalDispatcher`] invokes the registered [`Handler`] in-process on the
//! current host, the [`RemoteDispatcher`] fans the same operation out over
//! every host registered for the service through an SSH channel, one host at
//! a time, and aggregates the per-host outcomes in registration order.
//!
//! Failure policy: configuration errors (unknown service, unresolvable
//! handler reference) propagate to the caller; runtime errors (handler
//! failure, unreachable host, garbled remote output) are recovered into a
//! `Failed` entry so the caller always receives one row per targeted host.

#![forbid(unsafe_code)]

use ops_config::{ConfigError, ServiceRegistry, SiteConfig};
use ops_proto::{Command, InstanceStatus, Status};
use ssh2::Session;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Command as OsCommand, Stdio};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bound on the SSH connect phase. Unreachable hosts fail fast instead of
/// hanging the fan-out.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on blocking SSH operations after connect, including the remote
/// command itself. A hung remote command surfaces as a `Failed` entry for
/// that host instead of blocking the remaining hosts forever.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Settling delay between `stop` and `start` in the default restart.
const RESTART_SETTLE: Duration = Duration::from_secs(1);

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Configuration errors. These abort the whole dispatch call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("service '{0}' not found in registry")]
    ServiceNotFound(String),

    #[error("cannot resolve handler '{0}'")]
    HandlerResolution(String),

    #[error("registry error: {0}")]
    Registry(String),
}

impl From<ConfigError> for DispatchError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::ServiceNotFound(name) => Self::ServiceNotFound(name),
            other => Self::Registry(other.to_string()),
        }
    }
}

/// Runtime failure inside a handler. Recovered by the dispatcher into a
/// `Failed` entry, never propagated.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("command failed: {0}")]
    Exec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime failure in the remote transport. Recovered per host; the fan-out
/// continues with the next host.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("auth on {0} failed: {1}")]
    Auth(String, String),

    #[error("exec on {0} failed: {1}")]
    Exec(String, String),
}

// ─── Handler contract ────────────────────────────────────────────────────────

/// The local strategy object for one kind of service: knows how to start,
/// stop, and query that service on the host it runs on.
///
/// `status` must be idempotent and side-effect-free; repeated calls without
/// an intervening start/stop return the same value absent external change.
pub trait Handler {
    fn start(&self) -> Result<Status, HandlerError>;
    fn stop(&self) -> Result<Status, HandlerError>;
    fn status(&self) -> Result<Status, HandlerError>;

    /// Best-effort restart: stop, settle briefly, start. A failed stop is
    /// logged and the start is attempted anyway; the start outcome is what
    /// gets reported.
    fn restart(&self) -> Result<Status, HandlerError> {
        if let Err(e) = self.stop() {
            warn!("stop before restart failed: {e}");
        }
        std::thread::sleep(RESTART_SETTLE);
        self.start()
    }
}

fn invoke(handler: &dyn Handler, command: Command) -> Result<Status, HandlerError> {
    match command {
        Command::Start => handler.start(),
        Command::Stop => handler.stop(),
        Command::Restart => handler.restart(),
        Command::Status => handler.status(),
    }
}

// ─── Handler registry ────────────────────────────────────────────────────────

type HandlerCtor = Box<dyn Fn(&SiteConfig) -> Box<dyn Handler> + Send + Sync>;

/// Maps the descriptor's handler reference to a registered constructor.
///
/// Keeps the "configure handler by name in data" capability without runtime
/// reflection: references are plain tags resolved against this table, and an
/// unknown tag is a configuration error.
#[derive(Default)]
pub struct HandlerRegistry {
    ctors: HashMap<String, HandlerCtor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("httpd", |site| Box::new(HttpdHandler::from_site(site)));
        registry
    }

    pub fn register(
        &mut self,
        reference: impl Into<String>,
        ctor: impl Fn(&SiteConfig) -> Box<dyn Handler> + Send + Sync + 'static,
    ) {
        let reference = reference.into();
        info!(handler = %reference, "registering handler");
        self.ctors.insert(reference, Box::new(ctor));
    }

    pub fn resolve(
        &self,
        reference: &str,
        site: &SiteConfig,
    ) -> Result<Box<dyn Handler>, DispatchError> {
        let ctor = self
            .ctors
            .get(reference)
            .ok_or_else(|| DispatchError::HandlerResolution(reference.to_string()))?;
        Ok(ctor(site))
    }

    /// Validate a reference without instantiating. Used by the remote path
    /// to fail fast on misconfiguration before contacting any host.
    pub fn check(&self, reference: &str) -> Result<(), DispatchError> {
        if self.ctors.contains_key(reference) {
            Ok(())
        } else {
            Err(DispatchError::HandlerResolution(reference.to_string()))
        }
    }
}

// ─── Dispatcher contract ─────────────────────────────────────────────────────

/// Routes one lifecycle operation for a named service and returns one
/// [`InstanceStatus`] per targeted host, in host registration order.
pub trait Dispatcher {
    fn start_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError>;
    fn stop_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError>;
    fn restart_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError>;
    fn service_status(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError>;

    fn run(&self, command: Command, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        match command {
            Command::Start => self.start_service(service),
            Command::Stop => self.stop_service(service),
            Command::Restart => self.restart_service(service),
            Command::Status => self.service_status(service),
        }
    }
}

/// Name the local host reports in its `InstanceStatus` entries.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

// ─── Local dispatcher ────────────────────────────────────────────────────────

/// Executes operations on the current host by resolving the descriptor's
/// handler reference and invoking the handler in-process. Not itself
/// responsible for starting processes; that is the handler's job.
pub struct LocalDispatcher {
    registry: ServiceRegistry,
    handlers: HandlerRegistry,
    site: SiteConfig,
}

impl LocalDispatcher {
    pub fn new(registry: ServiceRegistry, handlers: HandlerRegistry, site: SiteConfig) -> Self {
        Self {
            registry,
            handlers,
            site,
        }
    }

    fn dispatch(&self, service: &str, command: Command) -> Result<Vec<InstanceStatus>, DispatchError> {
        let descriptor = self.registry.get_service(service)?;
        let handler = self.handlers.resolve(&descriptor.handler, &self.site)?;
        let host = local_hostname();

        match invoke(handler.as_ref(), command) {
            Ok(status) => {
                debug!(service, %command, %status, "local dispatch complete");
                Ok(vec![InstanceStatus::new(host, status)])
            }
            Err(e) => {
                warn!(service, %command, "handler failed: {e}");
                Ok(vec![InstanceStatus::failed(host)])
            }
        }
    }
}

impl Dispatcher for LocalDispatcher {
    fn start_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        self.dispatch(service, Command::Start)
    }

    fn stop_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        self.dispatch(service, Command::Stop)
    }

    fn restart_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        self.dispatch(service, Command::Restart)
    }

    fn service_status(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        self.dispatch(service, Command::Status)
    }
}

// ─── Remote transport ────────────────────────────────────────────────────────

/// Runs a command on a remote host with a forwarded environment and returns
/// its captured stdout. The seam between dispatch logic and SSH plumbing.
pub trait RemoteExec {
    fn run(
        &self,
        host: &str,
        command: &str,
        env: &[(String, String)],
    ) -> Result<String, TransportError>;
}

/// Production transport: one scoped SSH session per host, agent auth,
/// closed on every exit path when the session drops.
pub struct SshTransport {
    connect_timeout: Duration,
    exec_timeout: Duration,
    username: String,
}

impl Default for SshTransport {
    fn default() -> Self {
        let username = std::env::var("OPSMAN_SSH_USER")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_else(|_| "root".to_string());
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            exec_timeout: EXEC_TIMEOUT,
            username,
        }
    }
}

impl SshTransport {
    pub fn new(connect_timeout: Duration, exec_timeout: Duration, username: String) -> Self {
        Self {
            connect_timeout,
            exec_timeout,
            username,
        }
    }
}

impl RemoteExec for SshTransport {
    fn run(
        &self,
        host: &str,
        command: &str,
        env: &[(String, String)],
    ) -> Result<String, TransportError> {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:22")
        };
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect(host.to_string(), e.to_string()))?
            .next()
            .ok_or_else(|| {
                TransportError::Connect(host.to_string(), "no address resolved".to_string())
            })?;

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| TransportError::Connect(host.to_string(), e.to_string()))?;

        let mut session = Session::new()
            .map_err(|e| TransportError::Connect(host.to_string(), e.to_string()))?;
        session.set_timeout(self.exec_timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| TransportError::Connect(host.to_string(), e.to_string()))?;
        session
            .userauth_agent(&self.username)
            .map_err(|e| TransportError::Auth(host.to_string(), e.to_string()))?;

        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::Exec(host.to_string(), e.to_string()))?;

        for (var, value) in env {
            // Servers without a matching AcceptEnv refuse this; the remote
            // side then falls back to its own site configuration.
            if let Err(e) = channel.setenv(var, value) {
                debug!(host, var, "setenv refused: {e}");
            }
        }

        channel
            .exec(command)
            .map_err(|e| TransportError::Exec(host.to_string(), e.to_string()))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| TransportError::Exec(host.to_string(), e.to_string()))?;

        // Failing remote commands report on stderr; keep it out of the wire
        // reply but surface it for diagnostics.
        let mut stderr = String::new();
        if channel.stderr().read_to_string(&mut stderr).is_err() {
            stderr.clear();
        }
        if let Some(diag) = diagnostic_line(&stderr) {
            debug!(host, stderr = diag, "remote command stderr");
        }

        if let Err(e) = channel.wait_close() {
            debug!(host, "channel close: {e}");
        }
        if let Ok(code) = channel.exit_status() {
            debug!(host, code, "remote command finished");
        }

        Ok(output)
    }
}

/// First non-blank line of a captured stderr stream, trimmed. `None` when
/// the stream carried nothing useful.
fn diagnostic_line(stderr: &str) -> Option<&str> {
    stderr.lines().map(str::trim).find(|line| !line.is_empty())
}

// ─── Remote dispatcher ───────────────────────────────────────────────────────

/// Executes operations on every host in the descriptor, sequentially, in
/// registration order, by running the equivalent local-dispatch command on
/// each host over SSH. One unreachable host never aborts the fan-out.
pub struct RemoteDispatcher {
    registry: ServiceRegistry,
    handlers: HandlerRegistry,
    transport: Box<dyn RemoteExec>,
    /// Immutable snapshot of the site environment forwarded to each remote
    /// invocation, so the remote process resolves the same registry.
    env: Vec<(String, String)>,
}

/// Site keys forwarded to the remote invocation, as `(ENV_VAR, site_key)`.
const FORWARDED_KEYS: &[(&str, &str)] = &[
    ("OPSMAN_SITE_ID", "site_id"),
    ("OPSMAN_SITE_LOCATION", "site_location"),
    ("OPSMAN_DEPLOY_ROOT", "deploy_root"),
    ("OPSMAN_SITE_SUFFIX", "site_suffix"),
];

fn forwarded_env(site: &SiteConfig) -> Vec<(String, String)> {
    FORWARDED_KEYS
        .iter()
        .filter_map(|(var, key)| site.get(key).map(|v| (var.to_string(), v.to_string())))
        .collect()
}

impl RemoteDispatcher {
    pub fn new(registry: ServiceRegistry, handlers: HandlerRegistry, site: &SiteConfig) -> Self {
        Self::with_transport(registry, handlers, site, Box::new(SshTransport::default()))
    }

    pub fn with_transport(
        registry: ServiceRegistry,
        handlers: HandlerRegistry,
        site: &SiteConfig,
        transport: Box<dyn RemoteExec>,
    ) -> Self {
        Self {
            registry,
            handlers,
            transport,
            env: forwarded_env(site),
        }
    }

    fn run_on_host(&self, host: &str, service: &str, command: Command) -> InstanceStatus {
        let remote_command = format!("opsman service {command} {service} --local");

        match self.transport.run(host, &remote_command, &self.env) {
            Ok(output) => InstanceStatus::new(host, classify_output(&output, command)),
            Err(e) => {
                warn!(host, service, %command, "remote dispatch failed: {e}");
                InstanceStatus::failed(host)
            }
        }
    }

    fn dispatch(&self, service: &str, command: Command) -> Result<Vec<InstanceStatus>, DispatchError> {
        let descriptor = self.registry.get_service(service)?.clone();
        self.handlers.check(&descriptor.handler)?;

        let mut results = Vec::with_capacity(descriptor.hosts.len());
        for host in &descriptor.hosts {
            results.push(self.run_on_host(host, service, command));
        }
        debug!(service, %command, hosts = results.len(), "remote dispatch complete");
        Ok(results)
    }
}

impl Dispatcher for RemoteDispatcher {
    fn start_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        self.dispatch(service, Command::Start)
    }

    fn stop_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        self.dispatch(service, Command::Stop)
    }

    fn restart_service(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        self.dispatch(service, Command::Restart)
    }

    fn service_status(&self, service: &str) -> Result<Vec<InstanceStatus>, DispatchError> {
        self.dispatch(service, Command::Status)
    }
}

/// Parse the first stdout line as a status and classify it against the
/// operation's expected success state. A status query accepts any
/// well-formed observation; other operations must land in their expected
/// state to count as success.
fn classify_output(output: &str, command: Command) -> Status {
    let line = output.lines().next().unwrap_or("").trim();
    let Ok(parsed) = line.parse::<Status>() else {
        warn!(%command, output = line, "unparseable remote status");
        return Status::Failed;
    };

    match command.expected_status() {
        Some(expected) if parsed != expected => Status::Failed,
        _ => parsed,
    }
}

// ─── Built-in handlers ───────────────────────────────────────────────────────

/// Handler for an Apache httpd managed through a site init script.
pub struct HttpdHandler {
    init_script: Option<PathBuf>,
    process_name: String,
}

impl HttpdHandler {
    pub fn from_site(site: &SiteConfig) -> Self {
        Self {
            init_script: site.get("httpd_init_script").map(PathBuf::from),
            process_name: "httpd".to_string(),
        }
    }

    fn process_running(&self) -> bool {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .values()
            .any(|p| p.name() == OsStr::new(&self.process_name))
    }
}

impl Handler for HttpdHandler {
    fn start(&self) -> Result<Status, HandlerError> {
        let script = self.init_script.as_ref().ok_or_else(|| {
            HandlerError::Exec("httpd_init_script not set in site config".to_string())
        })?;

        let exit = OsCommand::new(script)
            .arg("start")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !exit.success() {
            return Ok(Status::Failed);
        }
        self.status()
    }

    fn stop(&self) -> Result<Status, HandlerError> {
        let exit = OsCommand::new("killall")
            .arg(&self.process_name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !exit.success() {
            return Ok(Status::Failed);
        }
        self.status()
    }

    fn status(&self) -> Result<Status, HandlerError> {
        Ok(if self.process_running() {
            Status::Running
        } else {
            Status::Stopped
        })
    }
}
