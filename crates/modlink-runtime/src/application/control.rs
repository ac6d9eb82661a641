//! The remote-control interface every module serves for the broker.
//!
//! Once a module has registered, the broker drives it through six commands:
//!
//! ```text
//!  broker                                   module
//!    │ start_server(iface, descriptor, path) │  open a receiver, run the loop,
//!    │              ◄── bound descriptor      │  report where it listens
//!    │ restart_server(...)                   │  same, if the loop has died
//!    │ stop_server(...)                      │  end the loop
//!    │ start_proxy(iface, event, descr, path)│  point a caller proxy at a server
//!    │ stop_proxy(...)                       │  detach it (event All = fully)
//!    │ kill()                                │  trigger the module's shutdown
//! ```
//!
//! The same [`ModuleControl`] trait is implemented twice: by
//! [`ModuleControlStub`], which forwards each command over the wire, and by
//! the module's local implementation, which [`control_dispatcher`] serves.

use std::sync::Arc;

use modlink_core::{declare_interface, wire_record, EventId, InterfaceId, ProtocolDescriptor};

use super::client_stub::{CallError, ClientStub};
use super::dispatcher::ServerDispatcher;
use crate::infrastructure::transport::{Protocol, TransportTimeouts};

declare_interface! {
    /// Commands the broker sends to a registered module.
    pub mod module_control {
        id: 2,
        kind: CallReply,
        sizing: (512, 256, 1),
        calls: {
            START_SERVER => start_server(ServerCommand) -> ProtocolDescriptor;
            RESTART_SERVER => restart_server(ServerCommand);
            STOP_SERVER => stop_server(ServerCommand);
            START_PROXY => start_proxy(ProxyCommand);
            STOP_PROXY => stop_proxy(ProxyCommand);
            KILL => kill();
        }
    }
}

/// Names the server of one pairing on the implementing module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub interface: InterfaceId,
    pub descriptor: ProtocolDescriptor,
    pub path: Option<String>,
}
wire_record!(ServerCommand {
    interface,
    descriptor,
    path
});

/// Names the proxy of one pairing on the calling module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    pub interface: InterfaceId,
    pub event: EventId,
    pub descriptor: ProtocolDescriptor,
    pub path: Option<String>,
}
wire_record!(ProxyCommand {
    interface,
    event,
    descriptor,
    path
});

/// What the broker can ask of a module.
pub trait ModuleControl: Send + Sync {
    /// Starts the server and returns the descriptor it listens on, which
    /// the broker records for the pair.
    fn start_server(&self, command: &ServerCommand) -> Result<ProtocolDescriptor, CallError>;
    fn restart_server(&self, command: &ServerCommand) -> Result<(), CallError>;
    fn stop_server(&self, command: &ServerCommand) -> Result<(), CallError>;
    fn start_proxy(&self, command: &ProxyCommand) -> Result<(), CallError>;
    fn stop_proxy(&self, command: &ProxyCommand) -> Result<(), CallError>;
    fn kill(&self) -> Result<(), CallError>;
}

/// Broker-side proxy of one module's control server.
#[derive(Debug)]
pub struct ModuleControlStub {
    stub: ClientStub,
}

impl ModuleControlStub {
    pub fn new(descriptor: &ProtocolDescriptor, timeouts: TransportTimeouts) -> Self {
        Self {
            stub: ClientStub::new(module_control::CATALOG, descriptor, timeouts),
        }
    }

    pub fn with_protocol(protocol: Box<dyn Protocol>) -> Self {
        Self {
            stub: ClientStub::with_protocol(module_control::CATALOG, protocol),
        }
    }

    pub fn descriptor(&self) -> &ProtocolDescriptor {
        self.stub.descriptor()
    }
}

impl ModuleControl for ModuleControlStub {
    fn start_server(&self, command: &ServerCommand) -> Result<ProtocolDescriptor, CallError> {
        self.stub.call(
            module_control::START_SERVER,
            |b| b.write(command),
            |b| b.read::<ProtocolDescriptor>(),
        )
    }

    fn restart_server(&self, command: &ServerCommand) -> Result<(), CallError> {
        self.stub
            .call(module_control::RESTART_SERVER, |b| b.write(command), |_| Ok(()))
    }

    fn stop_server(&self, command: &ServerCommand) -> Result<(), CallError> {
        self.stub
            .call(module_control::STOP_SERVER, |b| b.write(command), |_| Ok(()))
    }

    fn start_proxy(&self, command: &ProxyCommand) -> Result<(), CallError> {
        self.stub
            .call(module_control::START_PROXY, |b| b.write(command), |_| Ok(()))
    }

    fn stop_proxy(&self, command: &ProxyCommand) -> Result<(), CallError> {
        self.stub
            .call(module_control::STOP_PROXY, |b| b.write(command), |_| Ok(()))
    }

    fn kill(&self) -> Result<(), CallError> {
        self.stub.call(module_control::KILL, |_| Ok(()), |_| Ok(()))
    }
}

/// Builds the server dispatcher that forwards control commands to `target`.
///
/// A command the target refuses is answered with a null reply, which the
/// broker's stub reports as [`CallError::NullReply`].
pub fn control_dispatcher(target: Arc<dyn ModuleControl>) -> ServerDispatcher {
    let start = Arc::clone(&target);
    let restart = Arc::clone(&target);
    let stop = Arc::clone(&target);
    let proxy_on = Arc::clone(&target);
    let proxy_off = Arc::clone(&target);
    ServerDispatcher::new(module_control::CATALOG)
        .on(module_control::START_SERVER, move |req, reply| {
            let bound = start.start_server(&req.read()?)?;
            reply.write(&bound)?;
            Ok(())
        })
        .on(module_control::RESTART_SERVER, move |req, _| {
            restart.restart_server(&req.read()?)
        })
        .on(module_control::STOP_SERVER, move |req, _| {
            stop.stop_server(&req.read()?)
        })
        .on(module_control::START_PROXY, move |req, _| {
            proxy_on.start_proxy(&req.read()?)
        })
        .on(module_control::STOP_PROXY, move |req, _| {
            proxy_off.stop_proxy(&req.read()?)
        })
        .on(module_control::KILL, move |_, _| target.kill())
}
