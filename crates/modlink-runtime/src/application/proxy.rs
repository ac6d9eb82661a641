//! Caller-side handles a module keeps for the interfaces it publishes.
//!
//! A module declares a proxy before it knows who implements the interface.
//! The handle exists from the start; the broker fills it in later with
//! `start_proxy` and empties it with `stop_proxy`.  Calls made in between
//! fail with [`CallError::NotConnected`] (call/reply) or reach nobody
//! (fan-out).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use modlink_core::{
    CodecError, EventId, InterfaceCatalog, MessageBuffer, MessageNum, ProtocolDescriptor,
};
use tracing::info;

use super::broadcaster::{BroadcastReport, EventBroadcaster};
use super::client_stub::{CallError, ClientStub};
use crate::infrastructure::transport::TransportTimeouts;

// ── Call/reply ────────────────────────────────────────────────────────────────

/// A call/reply proxy; holds one [`ClientStub`] once activated.
#[derive(Debug)]
pub struct CallProxy {
    catalog: InterfaceCatalog,
    timeouts: TransportTimeouts,
    stub: Mutex<Option<Arc<ClientStub>>>,
}

impl CallProxy {
    pub fn new(catalog: InterfaceCatalog, timeouts: TransportTimeouts) -> Self {
        Self {
            catalog,
            timeouts,
            stub: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &InterfaceCatalog {
        &self.catalog
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// The implementer currently called, if any.
    pub fn descriptor(&self) -> Option<ProtocolDescriptor> {
        self.lock().as_ref().map(|s| s.descriptor().clone())
    }

    /// Points the proxy at `descriptor`.  Re-activating the same descriptor
    /// keeps the open stub.
    pub fn activate(&self, descriptor: &ProtocolDescriptor) -> Result<(), CallError> {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|s| s.descriptor() == descriptor) {
            return Ok(());
        }
        let stub = ClientStub::new(self.catalog, descriptor, self.timeouts);
        stub.connect()?;
        if let Some(old) = slot.replace(Arc::new(stub)) {
            old.disconnect();
        }
        info!(interface = self.catalog.name, %descriptor, "proxy activated");
        Ok(())
    }

    /// Detaches the proxy.  Later calls fail with `NotConnected`.
    pub fn deactivate(&self) {
        if let Some(stub) = self.lock().take() {
            stub.disconnect();
            info!(interface = self.catalog.name, descriptor = %stub.descriptor(), "proxy deactivated");
        }
    }

    /// Performs one call through the active stub.
    pub fn call<R>(
        &self,
        message: MessageNum,
        encode: impl FnOnce(&mut MessageBuffer) -> Result<(), CodecError>,
        decode: impl FnOnce(&mut MessageBuffer) -> Result<R, CodecError>,
    ) -> Result<R, CallError> {
        // Clone out so a slow call does not block activation.
        let stub = self.lock().clone().ok_or(CallError::NotConnected {
            interface: self.catalog.name,
        })?;
        stub.call(message, encode, decode)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ClientStub>>> {
        self.stub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Fan-out ───────────────────────────────────────────────────────────────────

/// A fan-out proxy: the module's [`EventBroadcaster`] for one interface.
#[derive(Debug)]
pub struct EventProxy {
    catalog: InterfaceCatalog,
    broadcaster: Mutex<EventBroadcaster>,
}

impl EventProxy {
    pub fn new(catalog: InterfaceCatalog, timeouts: TransportTimeouts) -> Self {
        Self {
            catalog,
            broadcaster: Mutex::new(EventBroadcaster::new(catalog, timeouts)),
        }
    }

    pub fn catalog(&self) -> &InterfaceCatalog {
        &self.catalog
    }

    pub fn activate(&self, event: EventId, descriptor: &ProtocolDescriptor) -> Result<(), CallError> {
        self.lock().add_subscriber(event, descriptor)?;
        info!(interface = self.catalog.name, %event, %descriptor, "event route added");
        Ok(())
    }

    pub fn deactivate(&self, event: EventId, descriptor: &ProtocolDescriptor) {
        self.lock().remove_subscriber(event, descriptor);
        info!(interface = self.catalog.name, %event, %descriptor, "event route removed");
    }

    /// Drops every subscriber.
    pub fn deactivate_all(&self) {
        self.lock().clear();
    }

    /// Number of subscribers event `index` currently reaches.
    pub fn subscriber_count(&self, index: u8) -> usize {
        self.lock().subscriber_count(index)
    }

    /// Sends `event` to its subscribers, encoding at most once per protocol
    /// kind.
    pub fn broadcast(
        &self,
        event: MessageNum,
        encode: impl FnMut(&mut MessageBuffer) -> Result<(), CodecError>,
    ) -> Result<BroadcastReport, CallError> {
        self.lock().broadcast(event, encode)
    }

    /// Runs `f` with the broadcaster locked, for callers that need the
    /// `init_message`/`send` split.
    pub fn with_broadcaster<R>(&self, f: impl FnOnce(&mut EventBroadcaster) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, EventBroadcaster> {
        self.broadcaster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
