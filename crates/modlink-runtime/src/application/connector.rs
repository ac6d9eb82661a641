//! ModuleConnector: registers a module at the broker and keeps its servers
//! and proxies in step with the broker's commands.
//!
//! # Module lifecycle (for beginners)
//!
//! ```text
//!  declare   register_handler / register_proxy / register_broadcaster
//!     │        (nothing is sent yet)
//!  connect   receptor.register_module ─► Registration
//!     │        serve module_control on registration.control
//!  subscribe_all   one subscribe / auto_subscribe per handler
//!  publish_all     fan-out proxies first, then call/reply proxies
//!     │            (call/reply publish blocks until an implementer exists)
//!  run       wait for Ctrl-C, SIGTERM or a broker `kill`
//!  shutdown  unregister, stop every server and proxy
//! ```
//!
//! Subscriptions go out before publications.  Two modules that each call
//! what the other implements would otherwise both block in `publish` before
//! either had offered its implementation.
//!
//! While the module runs, the broker calls back through [`LocalModule`],
//! the module's implementation of [`ModuleControl`]: it starts a server
//! thread when a caller was paired with one of the module's handlers, and
//! points a proxy at a server when one of the module's publications was
//! paired.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use modlink_core::{
    EventId, InterfaceCatalog, InterfaceId, InterfaceKind, ModuleHandle, ModuleId,
    PeerConstraint, ProtocolDescriptor,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::client_stub::CallError;
use super::control::{control_dispatcher, module_control, ModuleControl, ProxyCommand, ServerCommand};
use super::dispatcher::{serve, ServerDispatcher, ServerHandle};
use super::proxy::{CallProxy, EventProxy};
use super::registrar::{
    PublishOutcome, PublishRequest, Receptor, ReceptorStub, Registrar, RegistrarStub,
    Registration, SubscribeRequest,
};
use crate::infrastructure::shutdown::ShutdownSignal;
use crate::infrastructure::transport::{self, TransportError, TransportTimeouts};
use crate::infrastructure::worker_pool::WorkerPool;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Environment variable naming the broker host.
pub const BROKER_HOST_ENV: &str = "MODLINK_BROKER_HOST";
/// Environment variable naming the broker's receptor port.
pub const BROKER_PORT_ENV: &str = "MODLINK_BROKER_PORT";
/// Receptor port used when none is configured.
pub const DEFAULT_BROKER_PORT: u16 = 49900;

/// How a module reaches the broker and sizes its own threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    /// The broker's receptor.
    pub broker: ProtocolDescriptor,
    pub timeouts: TransportTimeouts,
    /// Upper bound on a blocking call/reply `publish`.
    pub publish_wait: Duration,
    /// Workers dispatching fan-out events.
    pub workers: usize,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            broker: ProtocolDescriptor::datagram("127.0.0.1", DEFAULT_BROKER_PORT),
            timeouts: TransportTimeouts::default(),
            publish_wait: Duration::from_secs(3600),
            workers: 2,
        }
    }
}

impl ModuleConfig {
    /// Reads the broker address from `MODLINK_BROKER_HOST` and
    /// `MODLINK_BROKER_PORT`, falling back to `127.0.0.1:49900`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ModuleConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let host = lookup(BROKER_HOST_ENV)
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = match lookup(BROKER_PORT_ENV) {
            Some(raw) => raw.trim().parse::<u16>().unwrap_or_else(|_| {
                warn!(value = %raw, "invalid {BROKER_PORT_ENV}; using {DEFAULT_BROKER_PORT}");
                DEFAULT_BROKER_PORT
            }),
            None => DEFAULT_BROKER_PORT,
        };
        Self {
            broker: ProtocolDescriptor::datagram(host, port),
            ..Self::default()
        }
    }

    /// Timeouts of the registrar stub: a reply may take as long as a
    /// blocking publish.
    fn registrar_timeouts(&self) -> TransportTimeouts {
        TransportTimeouts {
            reply: self.publish_wait.max(self.timeouts.reply),
            ..self.timeouts
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("registration at {broker} failed: {source}")]
    Registration {
        broker: ProtocolDescriptor,
        #[source]
        source: CallError,
    },
    #[error("module is not registered at the broker")]
    NotRegistered,
    #[error("{interface} is declared {declared:?}, not {requested:?}")]
    KindMismatch {
        interface: &'static str,
        declared: InterfaceKind,
        requested: InterfaceKind,
    },
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to start worker threads: {0}")]
    Workers(#[from] io::Error),
}

/// One side of an interface declaration: the catalog, this module's
/// application id, whom it accepts as the other side, and an optional path
/// that distinguishes several instances of the same interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub catalog: InterfaceCatalog,
    pub id: ModuleId,
    pub peer: PeerConstraint,
    pub path: Option<String>,
}

impl InterfaceSpec {
    pub fn new(catalog: InterfaceCatalog, id: ModuleId) -> Self {
        Self {
            catalog,
            id,
            peer: PeerConstraint::Any,
            path: None,
        }
    }

    pub fn with_peer(mut self, peer: ModuleId) -> Self {
        self.peer = PeerConstraint::Only(peer);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn expect_kind(&self, requested: InterfaceKind) -> Result<(), ConnectorError> {
        if self.catalog.kind == requested {
            Ok(())
        } else {
            Err(ConnectorError::KindMismatch {
                interface: self.catalog.name,
                declared: self.catalog.kind,
                requested,
            })
        }
    }
}

// ── Local module ──────────────────────────────────────────────────────────────

type DeclarationKey = (InterfaceId, Option<String>);

enum ProxySlot {
    Call(Arc<CallProxy>),
    Event(Arc<EventProxy>),
}

/// The module-side implementation of [`ModuleControl`].
pub struct LocalModule {
    name: String,
    timeouts: TransportTimeouts,
    handlers: Mutex<HashMap<DeclarationKey, Arc<ServerDispatcher>>>,
    servers: Mutex<HashMap<(InterfaceId, ProtocolDescriptor), ServerHandle>>,
    proxies: Mutex<HashMap<DeclarationKey, ProxySlot>>,
    pool: Arc<WorkerPool>,
    shutdown: Arc<ShutdownSignal>,
}

impl LocalModule {
    pub fn new(name: &str, timeouts: TransportTimeouts, workers: usize) -> io::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            timeouts,
            handlers: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
            pool: Arc::new(WorkerPool::new(&format!("{name}-events"), workers)?),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown_signal(&self) -> &Arc<ShutdownSignal> {
        &self.shutdown
    }

    /// Number of server loops currently alive.
    pub fn running_servers(&self) -> usize {
        lock(&self.servers)
            .values()
            .filter(|s| s.is_running())
            .count()
    }

    fn add_handler(&self, interface: InterfaceId, path: Option<String>, dispatcher: ServerDispatcher) {
        lock(&self.handlers).insert((interface, path), Arc::new(dispatcher));
    }

    fn add_proxy(&self, interface: InterfaceId, path: Option<String>, proxy: ProxySlot) {
        lock(&self.proxies).insert((interface, path), proxy);
    }

    fn handler(&self, interface: InterfaceId, path: &Option<String>) -> Result<Arc<ServerDispatcher>, CallError> {
        lock(&self.handlers)
            .get(&(interface, path.clone()))
            .cloned()
            .ok_or_else(|| CallError::Rejected(format!("no handler for interface {interface}")))
    }

    /// Starts the server for `command` unless it runs already, and returns
    /// the descriptor it listens on.
    fn ensure_server(
        &self,
        command: &ServerCommand,
        action: &str,
    ) -> Result<ProtocolDescriptor, CallError> {
        let dispatcher = self.handler(command.interface, &command.path)?;
        let key = (command.interface, command.descriptor.clone());
        let mut servers = lock(&self.servers);
        if let Some(running) = servers.get(&key).filter(|s| s.is_running()) {
            debug!(module = %self.name, descriptor = %command.descriptor, "server already running");
            return Ok(running.descriptor().clone());
        }
        let catalog = *dispatcher.catalog();
        let protocol = transport::open(&command.descriptor, catalog.sizing, self.timeouts);
        let pool = (catalog.kind == InterfaceKind::FanOut).then(|| Arc::clone(&self.pool));
        let handle = serve(dispatcher, protocol, pool)?;
        let bound = handle.descriptor().clone();
        info!(module = %self.name, interface = catalog.name, descriptor = %bound, "server {action}");
        servers.insert(key, handle);
        Ok(bound)
    }

    /// Stops every server and detaches every proxy.  Handlers and proxies
    /// stay declared.
    pub fn stop_all(&self) {
        let servers: Vec<_> = lock(&self.servers).drain().map(|(_, s)| s).collect();
        for mut server in servers {
            server.stop();
        }
        for proxy in lock(&self.proxies).values() {
            match proxy {
                ProxySlot::Call(p) => p.deactivate(),
                ProxySlot::Event(p) => p.deactivate_all(),
            }
        }
    }
}

impl ModuleControl for LocalModule {
    fn start_server(&self, command: &ServerCommand) -> Result<ProtocolDescriptor, CallError> {
        self.ensure_server(command, "started")
    }

    fn restart_server(&self, command: &ServerCommand) -> Result<(), CallError> {
        self.ensure_server(command, "restarted").map(drop)
    }

    fn stop_server(&self, command: &ServerCommand) -> Result<(), CallError> {
        let removed = lock(&self.servers).remove(&(command.interface, command.descriptor.clone()));
        match removed {
            Some(mut server) => {
                server.stop();
                info!(module = %self.name, descriptor = %command.descriptor, "server stopped");
            }
            None => debug!(module = %self.name, descriptor = %command.descriptor, "no server to stop"),
        }
        Ok(())
    }

    fn start_proxy(&self, command: &ProxyCommand) -> Result<(), CallError> {
        let proxies = lock(&self.proxies);
        match proxies.get(&(command.interface, command.path.clone())) {
            Some(ProxySlot::Call(p)) => p.activate(&command.descriptor),
            Some(ProxySlot::Event(p)) => p.activate(command.event, &command.descriptor),
            None => Err(CallError::Rejected(format!(
                "no proxy for interface {}",
                command.interface
            ))),
        }
    }

    fn stop_proxy(&self, command: &ProxyCommand) -> Result<(), CallError> {
        let proxies = lock(&self.proxies);
        match proxies.get(&(command.interface, command.path.clone())) {
            Some(ProxySlot::Call(p)) => p.deactivate(),
            Some(ProxySlot::Event(p)) => p.deactivate(command.event, &command.descriptor),
            None => debug!(module = %self.name, interface = %command.interface, "no proxy to stop"),
        }
        Ok(())
    }

    fn kill(&self) -> Result<(), CallError> {
        info!(module = %self.name, "kill requested by broker");
        self.shutdown.trigger();
        Ok(())
    }
}

impl Drop for LocalModule {
    fn drop(&mut self) {
        self.stop_all();
        self.pool.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Connector ─────────────────────────────────────────────────────────────────

struct Session {
    registration: Registration,
    receptor: ReceptorStub,
    registrar: RegistrarStub,
    control: ServerHandle,
}

/// Drives one module through registration, declaration, and teardown.
pub struct ModuleConnector {
    config: ModuleConfig,
    handle: ModuleHandle,
    module: Arc<LocalModule>,
    publications: Vec<PublishRequest>,
    subscriptions: Vec<(SubscribeRequest, InterfaceKind)>,
    session: Option<Session>,
}

impl ModuleConnector {
    /// Creates a connector whose handle is the process id.
    pub fn new(name: &str, config: ModuleConfig) -> Result<Self, ConnectorError> {
        let module = LocalModule::new(name, config.timeouts, config.workers)?;
        Ok(Self {
            handle: ModuleHandle(std::process::id()),
            config,
            module: Arc::new(module),
            publications: Vec::new(),
            subscriptions: Vec::new(),
            session: None,
        })
    }

    /// Overrides the handle, for several modules in one process.
    pub fn with_handle(mut self, handle: ModuleHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn module(&self) -> &Arc<LocalModule> {
        &self.module
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(self.module.shutdown_signal())
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.session.as_ref().map(|s| &s.registration)
    }

    /// Declares an implementation of `spec.catalog` served by `dispatcher`.
    pub fn register_handler(&mut self, spec: InterfaceSpec, dispatcher: ServerDispatcher) {
        let catalog = spec.catalog;
        self.module
            .add_handler(catalog.id, spec.path.clone(), dispatcher);
        self.subscriptions.push((
            SubscribeRequest {
                handle: self.handle,
                interface: catalog.id,
                num_events: catalog.event_count(),
                subscriber: spec.id,
                peer: spec.peer,
                path: spec.path,
            },
            catalog.kind,
        ));
    }

    /// Declares a call/reply proxy.  The returned handle is connected once
    /// the broker pairs it.
    pub fn register_proxy(&mut self, spec: InterfaceSpec) -> Result<Arc<CallProxy>, ConnectorError> {
        spec.expect_kind(InterfaceKind::CallReply)?;
        let proxy = Arc::new(CallProxy::new(spec.catalog, self.config.timeouts));
        self.module
            .add_proxy(spec.catalog.id, spec.path.clone(), ProxySlot::Call(Arc::clone(&proxy)));
        self.publications.push(self.publish_request(spec));
        Ok(proxy)
    }

    /// Declares a fan-out broadcaster.
    pub fn register_broadcaster(&mut self, spec: InterfaceSpec) -> Result<Arc<EventProxy>, ConnectorError> {
        spec.expect_kind(InterfaceKind::FanOut)?;
        let proxy = Arc::new(EventProxy::new(spec.catalog, self.config.timeouts));
        self.module
            .add_proxy(spec.catalog.id, spec.path.clone(), ProxySlot::Event(Arc::clone(&proxy)));
        self.publications.push(self.publish_request(spec));
        Ok(proxy)
    }

    fn publish_request(&self, spec: InterfaceSpec) -> PublishRequest {
        PublishRequest {
            handle: self.handle,
            interface: spec.catalog.id,
            kind: spec.catalog.kind,
            num_events: spec.catalog.event_count(),
            caller: spec.id,
            peer: spec.peer,
            path: spec.path,
        }
    }

    /// Registers at the broker and starts serving `module_control`.
    pub fn connect(&mut self) -> Result<(), ConnectorError> {
        if self.session.is_some() {
            return Ok(());
        }
        let receptor = ReceptorStub::new(&self.config.broker, self.config.timeouts);
        let registration = receptor
            .register_module(self.handle, self.module.name())
            .map_err(|source| ConnectorError::Registration {
                broker: self.config.broker.clone(),
                source,
            })?;

        let dispatcher = control_dispatcher(Arc::clone(&self.module) as Arc<dyn ModuleControl>);
        let protocol = transport::open(
            &registration.control,
            module_control::CATALOG.sizing,
            self.config.timeouts,
        );
        let control = serve(Arc::new(dispatcher), protocol, None)?;
        let registrar = RegistrarStub::new(&registration.registrar, self.config.registrar_timeouts());
        info!(
            module = self.module.name(),
            handle = %self.handle,
            control = %registration.control,
            registrar = %registration.registrar,
            "registered at broker"
        );
        self.session = Some(Session {
            registration,
            receptor,
            registrar,
            control,
        });
        Ok(())
    }

    fn registrar(&self) -> Result<&RegistrarStub, ConnectorError> {
        self.session
            .as_ref()
            .map(|s| &s.registrar)
            .ok_or(ConnectorError::NotRegistered)
    }

    /// Offers every declared handler.  Failures are logged per interface.
    pub fn subscribe_all(&self) -> Result<(), ConnectorError> {
        let registrar = self.registrar()?;
        for (request, kind) in &self.subscriptions {
            let result = match kind {
                InterfaceKind::CallReply => registrar.subscribe(request),
                InterfaceKind::FanOut => registrar.auto_subscribe(request),
            };
            if let Err(e) = result {
                warn!(interface = %request.interface, error = %e, "subscribe failed");
            }
        }
        Ok(())
    }

    /// Publishes every declared proxy, fan-out first.
    ///
    /// Returns `ShuttingDown` as soon as the broker reports it, `Unmatched`
    /// when some fan-out publication has no subscriber yet, and `Matched`
    /// otherwise.
    pub fn publish_all(&self) -> Result<PublishOutcome, ConnectorError> {
        let registrar = self.registrar()?;
        let fan_out = self.publications.iter().filter(|p| p.kind == InterfaceKind::FanOut);
        let call_reply = self.publications.iter().filter(|p| p.kind == InterfaceKind::CallReply);

        let mut overall = PublishOutcome::Matched;
        for request in fan_out.chain(call_reply) {
            match registrar.publish(request) {
                Ok(PublishOutcome::ShuttingDown) => {
                    info!(interface = %request.interface, "broker is shutting down");
                    return Ok(PublishOutcome::ShuttingDown);
                }
                Ok(PublishOutcome::Unmatched) => {
                    debug!(interface = %request.interface, "published without subscriber");
                    overall = PublishOutcome::Unmatched;
                }
                Ok(PublishOutcome::Matched) => {}
                Err(e) => {
                    warn!(interface = %request.interface, error = %e, "publish failed");
                }
            }
        }
        Ok(overall)
    }

    /// `connect`, `subscribe_all`, then `publish_all`.
    pub fn start(&mut self) -> Result<PublishOutcome, ConnectorError> {
        self.connect()?;
        self.subscribe_all()?;
        self.publish_all()
    }

    /// Asks the broker to switch `event` on or off for every pairing this
    /// module implements.
    pub fn set_activation(&self, event: EventId, enable: bool) -> Result<(), ConnectorError> {
        self.registrar()?
            .activation(&super::registrar::ActivationRequest {
                handle: self.handle,
                event,
                enable,
            })?;
        Ok(())
    }

    /// Withdraws the publication of `interface` at `path`.
    pub fn unpublish(&self, interface: InterfaceId, path: Option<String>) -> Result<(), ConnectorError> {
        self.registrar()?
            .unpublish(&super::registrar::UnpublishRequest {
                handle: self.handle,
                interface,
                path,
            })?;
        Ok(())
    }

    /// Blocks until the shutdown signal fires, then shuts down.
    pub fn run_until_shutdown(&mut self) {
        self.module.shutdown_signal().wait();
        self.shutdown();
    }

    /// Unregisters and stops everything.  Safe to call more than once.
    pub fn shutdown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Err(e) = session.registrar.unregister_module(self.handle) {
            warn!(handle = %self.handle, error = %e, "unregister via registrar failed; trying receptor");
            if let Err(e) = session.receptor.unregister_module(self.handle) {
                warn!(handle = %self.handle, error = %e, "unregister failed");
            }
        }
        self.module.stop_all();
        session.control.stop();
        session.registrar.disconnect();
        info!(module = self.module.name(), "module shut down");
    }
}

impl Drop for ModuleConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ModuleConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleConnector")
            .field("module", &self.module.name())
            .field("handle", &self.handle)
            .field("publications", &self.publications.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("registered", &self.session.is_some())
            .finish()
    }
}
