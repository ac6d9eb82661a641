//! Rendezvous servers: the receptor on the broker's well-known address and
//! one registrar per registered module.
//!
//! # Registration sequence
//!
//! ```text
//!  module                         receptor                    Broker
//!    │ register_module(h, name) ─►  │
//!    │                              │ allocate control + registrar descriptors
//!    │                              │ serve registrar for h
//!    │                              │ register_module(h, name, control stub) ─►│
//!    │ ◄─ Registration{control, registrar}
//!    │ serve module_control on `control`
//!    │ subscribe / publish ──────────────────► registrar(h) ─► Broker
//! ```
//!
//! Each registrar runs on its own server thread, so a call/reply `publish`
//! that blocks waiting for an implementer only holds up its own module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use modlink_core::protocol::SequenceCounter;
use modlink_core::{ModuleHandle, ProtocolDescriptor};
use modlink_runtime::application::registrar::{
    receptor, receptor_dispatcher, registrar, registrar_dispatcher,
};
use modlink_runtime::infrastructure::transport;
use modlink_runtime::{
    serve, ActivationRequest, CallError, ModuleControlStub, PublishOutcome, PublishRequest,
    Receptor, Registrar, Registration, ServerHandle, ShutdownSignal, SubscribeRequest,
    TransportError, TransportTimeouts, UnpublishRequest,
};
use tracing::{info, warn};

use crate::application::broker::{Broker, BrokerError};

/// Where the rendezvous listens and how it numbers module endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousSettings {
    /// The receptor's well-known address.
    pub receptor: ProtocolDescriptor,
    /// Base of the family control and registrar descriptors are derived from.
    pub module_base: ProtocolDescriptor,
    pub timeouts: TransportTimeouts,
}

/// The running receptor plus every module's registrar.
pub struct Rendezvous {
    desk: Arc<Desk>,
    receptor: Option<ServerHandle>,
}

impl Rendezvous {
    /// Serves the receptor.  A module's `kill` request triggers `shutdown`.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the receptor address cannot be bound.
    pub fn start(
        broker: Arc<Broker>,
        settings: RendezvousSettings,
        shutdown: Arc<ShutdownSignal>,
    ) -> Result<Self, TransportError> {
        let receptor_descriptor = settings.receptor.clone();
        let desk = Arc::new(Desk {
            broker,
            module_base: settings.module_base,
            cursor: SequenceCounter::starting_at(1),
            timeouts: settings.timeouts,
            registrars: Arc::new(RegistrarSet::default()),
            shutdown,
        });
        let protocol = transport::open(
            &receptor_descriptor,
            receptor::CATALOG.sizing,
            settings.timeouts,
        );
        let handle = serve(
            Arc::new(receptor_dispatcher(Arc::clone(&desk) as Arc<dyn Receptor>)),
            protocol,
            None,
        )?;
        info!(receptor = %receptor_descriptor, "rendezvous listening");
        Ok(Self {
            desk,
            receptor: Some(handle),
        })
    }

    pub fn receptor(&self) -> Option<&ProtocolDescriptor> {
        self.receptor.as_ref().map(ServerHandle::descriptor)
    }

    /// Number of registrar servers currently serving a module.
    pub fn registrar_count(&self) -> usize {
        self.desk.registrars.len()
    }

    /// Stops the receptor and every registrar.  The broker is killed first so
    /// no registrar thread is left waiting in `publish`.
    pub fn stop(&mut self) {
        self.desk.broker.kill();
        if let Some(mut receptor) = self.receptor.take() {
            receptor.stop();
        }
        self.desk.registrars.stop_all();
        info!("rendezvous stopped");
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Registrar bookkeeping ─────────────────────────────────────────────────────

#[derive(Default)]
struct RegistrarSet {
    servers: Mutex<HashMap<ModuleHandle, ServerHandle>>,
}

impl RegistrarSet {
    fn lock(&self) -> MutexGuard<'_, HashMap<ModuleHandle, ServerHandle>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, handle: ModuleHandle, server: ServerHandle) {
        if let Some(old) = self.lock().insert(handle, server) {
            old.stop_detached();
        }
    }

    /// Stops the registrar of `handle` without joining it; the caller may be
    /// running on that registrar's own thread.
    fn retire(&self, handle: ModuleHandle) {
        if let Some(server) = self.lock().remove(&handle) {
            info!(%handle, registrar = %server.descriptor(), "registrar retired");
            server.stop_detached();
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn stop_all(&self) {
        let servers: Vec<_> = self.lock().drain().map(|(_, s)| s).collect();
        for mut server in servers {
            server.stop();
        }
    }
}

// ── Receptor ──────────────────────────────────────────────────────────────────

struct Desk {
    broker: Arc<Broker>,
    module_base: ProtocolDescriptor,
    cursor: SequenceCounter,
    timeouts: TransportTimeouts,
    registrars: Arc<RegistrarSet>,
    shutdown: Arc<ShutdownSignal>,
}

impl Desk {
    fn next_module_descriptor(&self) -> Result<ProtocolDescriptor, CallError> {
        self.module_base
            .derive(self.cursor.next())
            .map_err(|e| CallError::Rejected(e.to_string()))
    }
}

impl Receptor for Desk {
    fn register_module(&self, handle: ModuleHandle, name: &str) -> Result<Registration, CallError> {
        let control = self.next_module_descriptor()?;
        let registrar_descriptor = self.next_module_descriptor()?;

        let module_registrar = ModuleRegistrar {
            handle,
            broker: Arc::clone(&self.broker),
            registrars: Arc::clone(&self.registrars),
            shutdown: Arc::clone(&self.shutdown),
        };
        let protocol = transport::open(
            &registrar_descriptor,
            registrar::CATALOG.sizing,
            self.timeouts,
        );
        let server = serve(
            Arc::new(registrar_dispatcher(Arc::new(module_registrar))),
            protocol,
            None,
        )?;
        self.registrars.insert(handle, server);

        let stub = ModuleControlStub::new(&control, self.timeouts);
        self.broker.register_module(handle, name, Arc::new(stub));
        info!(%handle, module = name, %control, registrar = %registrar_descriptor, "registration granted");
        Ok(Registration {
            handle,
            control,
            registrar: registrar_descriptor,
        })
    }

    fn unregister_module(&self, handle: ModuleHandle) -> Result<(), CallError> {
        self.broker.unregister_module(handle);
        self.registrars.retire(handle);
        Ok(())
    }
}

// ── Per-module registrar ──────────────────────────────────────────────────────

/// Serves one module's requests.  Broker refusals become
/// [`CallError::Rejected`], which the module sees as a null reply.
struct ModuleRegistrar {
    handle: ModuleHandle,
    broker: Arc<Broker>,
    registrars: Arc<RegistrarSet>,
    shutdown: Arc<ShutdownSignal>,
}

impl ModuleRegistrar {
    fn check_sender(&self, claimed: ModuleHandle) {
        if claimed != self.handle {
            warn!(registrar = %self.handle, %claimed, "request names another module's handle");
        }
    }
}

fn rejected(e: BrokerError) -> CallError {
    CallError::Rejected(e.to_string())
}

impl Registrar for ModuleRegistrar {
    fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, CallError> {
        self.check_sender(request.handle);
        self.broker.publish(request).map_err(rejected)
    }

    fn subscribe(&self, request: &SubscribeRequest) -> Result<(), CallError> {
        self.check_sender(request.handle);
        self.broker.subscribe(request).map_err(rejected)
    }

    fn auto_subscribe(&self, request: &SubscribeRequest) -> Result<(), CallError> {
        self.check_sender(request.handle);
        self.broker.auto_subscribe(request).map_err(rejected)
    }

    fn unpublish(&self, request: &UnpublishRequest) -> Result<(), CallError> {
        self.check_sender(request.handle);
        self.broker.unpublish(request);
        Ok(())
    }

    fn unregister_module(&self, handle: ModuleHandle) -> Result<(), CallError> {
        self.check_sender(handle);
        self.broker.unregister_module(handle);
        self.registrars.retire(handle);
        Ok(())
    }

    fn activation(&self, request: &ActivationRequest) -> Result<(), CallError> {
        self.check_sender(request.handle);
        self.broker.activation(request).map(|_| ()).map_err(rejected)
    }

    fn kill(&self) -> Result<(), CallError> {
        info!(requested_by = %self.handle, "kill requested by module");
        self.broker.kill();
        self.shutdown.trigger();
        Ok(())
    }
}
