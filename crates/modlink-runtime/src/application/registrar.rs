//! The broker-facing interfaces a module calls.
//!
//! # Two doors into the broker (for beginners)
//!
//! A module first knocks on the **receptor**, which listens on the one
//! address every module is configured with.  Registration hands back a
//! [`Registration`]: where the module must serve its control interface, and
//! where its own private **registrar** listens.  Every later request goes to
//! that registrar, so one slow module never blocks the receptor.
//!
//! ```text
//!  module                       broker
//!    │ register_module ───────► receptor (well-known address)
//!    │ ◄── Registration {control, registrar}
//!    │ subscribe / publish ───► registrar (one per module)
//!    │ ◄── start_server / start_proxy  (module_control, see control.rs)
//! ```
//!
//! `publish` of a call/reply interface blocks until an implementer shows up
//! or the broker shuts down, so the registrar stub is built with a reply
//! timeout long enough to cover that wait.

use std::sync::Arc;

use modlink_core::{
    declare_interface, wire_record, CodecError, EventId, InterfaceId, InterfaceKind, MessageBuffer,
    ModuleHandle, ModuleId, PeerConstraint, ProtocolDescriptor, Wire,
};

use super::client_stub::{CallError, ClientStub};
use super::dispatcher::ServerDispatcher;
use crate::infrastructure::transport::TransportTimeouts;

declare_interface! {
    /// Registration at the broker's well-known address.
    pub mod receptor {
        id: 0,
        kind: CallReply,
        sizing: (256, 1024, 1),
        calls: {
            REGISTER_MODULE => register_module(ModuleHandle, String) -> Registration;
            UNREGISTER_MODULE => unregister_module(ModuleHandle);
        }
    }
}

declare_interface! {
    /// Requests of one registered module.
    pub mod registrar {
        id: 1,
        kind: CallReply,
        sizing: (512, 16, 1),
        calls: {
            PUBLISH => publish(PublishRequest) -> PublishOutcome;
            SUBSCRIBE => subscribe(SubscribeRequest);
            AUTO_SUBSCRIBE => auto_subscribe(SubscribeRequest);
            UNPUBLISH => unpublish(UnpublishRequest);
            UNREGISTER_MODULE => unregister_module(ModuleHandle);
            ACTIVATION => activation(ActivationRequest);
            KILL => kill();
        }
    }
}

// ── Request records ───────────────────────────────────────────────────────────

/// A module's wish to call an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub handle: ModuleHandle,
    pub interface: InterfaceId,
    pub kind: InterfaceKind,
    pub num_events: u8,
    pub caller: ModuleId,
    pub peer: PeerConstraint,
    pub path: Option<String>,
}
wire_record!(PublishRequest {
    handle,
    interface,
    kind,
    num_events,
    caller,
    peer,
    path
});

/// A module's offer to implement an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub handle: ModuleHandle,
    pub interface: InterfaceId,
    pub num_events: u8,
    pub subscriber: ModuleId,
    pub peer: PeerConstraint,
    pub path: Option<String>,
}
wire_record!(SubscribeRequest {
    handle,
    interface,
    num_events,
    subscriber,
    peer,
    path
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpublishRequest {
    pub handle: ModuleHandle,
    pub interface: InterfaceId,
    pub path: Option<String>,
}
wire_record!(UnpublishRequest {
    handle,
    interface,
    path
});

/// Switches one event on or off for every pairing a module implements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRequest {
    pub handle: ModuleHandle,
    pub event: EventId,
    pub enable: bool,
}
wire_record!(ActivationRequest {
    handle,
    event,
    enable
});

/// Where a freshly registered module serves and sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub handle: ModuleHandle,
    /// The module serves `module_control` here.
    pub control: ProtocolDescriptor,
    /// The module's registrar at the broker.
    pub registrar: ProtocolDescriptor,
}
wire_record!(Registration {
    handle,
    control,
    registrar
});

/// How a `publish` request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// At least one implementer is paired with the publication.
    Matched,
    /// No implementer yet.  Only fan-out publications return this.
    Unmatched,
    /// The broker is going down; the module should stop too.
    ShuttingDown,
}

impl Wire for PublishOutcome {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        let tag: u8 = match self {
            PublishOutcome::Matched => 0,
            PublishOutcome::Unmatched => 1,
            PublishOutcome::ShuttingDown => 2,
        };
        buf.write(&tag)
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        match buf.read::<u8>()? {
            0 => Ok(PublishOutcome::Matched),
            1 => Ok(PublishOutcome::Unmatched),
            2 => Ok(PublishOutcome::ShuttingDown),
            other => Err(CodecError::MalformedPayload(format!(
                "invalid publish outcome {other}"
            ))),
        }
    }
}

// ── Contracts ─────────────────────────────────────────────────────────────────

/// The broker's registration desk.
pub trait Receptor: Send + Sync {
    fn register_module(&self, handle: ModuleHandle, name: &str) -> Result<Registration, CallError>;
    fn unregister_module(&self, handle: ModuleHandle) -> Result<(), CallError>;
}

/// Everything a registered module can ask of the broker.
pub trait Registrar: Send + Sync {
    fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, CallError>;
    fn subscribe(&self, request: &SubscribeRequest) -> Result<(), CallError>;
    fn auto_subscribe(&self, request: &SubscribeRequest) -> Result<(), CallError>;
    fn unpublish(&self, request: &UnpublishRequest) -> Result<(), CallError>;
    fn unregister_module(&self, handle: ModuleHandle) -> Result<(), CallError>;
    fn activation(&self, request: &ActivationRequest) -> Result<(), CallError>;
    fn kill(&self) -> Result<(), CallError>;
}

// ── Stubs ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ReceptorStub {
    stub: ClientStub,
}

impl ReceptorStub {
    pub fn new(descriptor: &ProtocolDescriptor, timeouts: TransportTimeouts) -> Self {
        Self {
            stub: ClientStub::new(receptor::CATALOG, descriptor, timeouts),
        }
    }

    pub fn descriptor(&self) -> &ProtocolDescriptor {
        self.stub.descriptor()
    }
}

impl Receptor for ReceptorStub {
    fn register_module(&self, handle: ModuleHandle, name: &str) -> Result<Registration, CallError> {
        self.stub.call(
            receptor::REGISTER_MODULE,
            |b| {
                b.write(&handle)?;
                b.write_str(name)
            },
            |b| b.read(),
        )
    }

    fn unregister_module(&self, handle: ModuleHandle) -> Result<(), CallError> {
        self.stub
            .call(receptor::UNREGISTER_MODULE, |b| b.write(&handle), |_| Ok(()))
    }
}

#[derive(Debug)]
pub struct RegistrarStub {
    stub: ClientStub,
}

impl RegistrarStub {
    /// `timeouts.reply` bounds how long a blocking `publish` may wait.
    pub fn new(descriptor: &ProtocolDescriptor, timeouts: TransportTimeouts) -> Self {
        Self {
            stub: ClientStub::new(registrar::CATALOG, descriptor, timeouts),
        }
    }

    pub fn descriptor(&self) -> &ProtocolDescriptor {
        self.stub.descriptor()
    }

    pub fn disconnect(&self) {
        self.stub.disconnect();
    }
}

impl Registrar for RegistrarStub {
    fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, CallError> {
        self.stub
            .call(registrar::PUBLISH, |b| b.write(request), |b| b.read())
    }

    fn subscribe(&self, request: &SubscribeRequest) -> Result<(), CallError> {
        self.stub
            .call(registrar::SUBSCRIBE, |b| b.write(request), |_| Ok(()))
    }

    fn auto_subscribe(&self, request: &SubscribeRequest) -> Result<(), CallError> {
        self.stub
            .call(registrar::AUTO_SUBSCRIBE, |b| b.write(request), |_| Ok(()))
    }

    fn unpublish(&self, request: &UnpublishRequest) -> Result<(), CallError> {
        self.stub
            .call(registrar::UNPUBLISH, |b| b.write(request), |_| Ok(()))
    }

    fn unregister_module(&self, handle: ModuleHandle) -> Result<(), CallError> {
        self.stub
            .call(registrar::UNREGISTER_MODULE, |b| b.write(&handle), |_| Ok(()))
    }

    fn activation(&self, request: &ActivationRequest) -> Result<(), CallError> {
        self.stub
            .call(registrar::ACTIVATION, |b| b.write(request), |_| Ok(()))
    }

    fn kill(&self) -> Result<(), CallError> {
        self.stub.call(registrar::KILL, |_| Ok(()), |_| Ok(()))
    }
}

// ── Dispatchers ───────────────────────────────────────────────────────────────

/// Serves the receptor catalog from `target`.
pub fn receptor_dispatcher(target: Arc<dyn Receptor>) -> ServerDispatcher {
    let register = Arc::clone(&target);
    ServerDispatcher::new(receptor::CATALOG)
        .on(receptor::REGISTER_MODULE, move |req, reply| {
            let handle: ModuleHandle = req.read()?;
            let name: String = req.read()?;
            let registration = register.register_module(handle, &name)?;
            reply.write(&registration)?;
            Ok(())
        })
        .on(receptor::UNREGISTER_MODULE, move |req, _| {
            target.unregister_module(req.read()?)
        })
}

/// Serves the registrar catalog from `target`.
pub fn registrar_dispatcher(target: Arc<dyn Registrar>) -> ServerDispatcher {
    let publish = Arc::clone(&target);
    let subscribe = Arc::clone(&target);
    let auto = Arc::clone(&target);
    let unpublish = Arc::clone(&target);
    let unregister = Arc::clone(&target);
    let activation = Arc::clone(&target);
    ServerDispatcher::new(registrar::CATALOG)
        .on(registrar::PUBLISH, move |req, reply| {
            let outcome = publish.publish(&req.read()?)?;
            reply.write(&outcome)?;
            Ok(())
        })
        .on(registrar::SUBSCRIBE, move |req, _| {
            subscribe.subscribe(&req.read()?)
        })
        .on(registrar::AUTO_SUBSCRIBE, move |req, _| {
            auto.auto_subscribe(&req.read()?)
        })
        .on(registrar::UNPUBLISH, move |req, _| {
            unpublish.unpublish(&req.read()?)
        })
        .on(registrar::UNREGISTER_MODULE, move |req, _| {
            unregister.unregister_module(req.read()?)
        })
        .on(registrar::ACTIVATION, move |req, _| {
            activation.activation(&req.read()?)
        })
        .on(registrar::KILL, move |_, _| target.kill())
}
