//! Event broadcasters: the publisher side of a fan-out interface.
//!
//! A broadcaster keeps, for every event of its interface, the list of
//! subscriber descriptors that enabled it.  One sender [`Protocol`] is open
//! per distinct descriptor, however many events it subscribed to.
//!
//! # Encode once per kind (for beginners)
//!
//! Sending one event to N subscribers must not encode the payload N times.
//! The broadcaster keeps one buffer per [`ProtocolKind`] and a "processed"
//! flag beside it:
//!
//! ```text
//!  init_message(EVENT)            flags: [ - - - - ]
//!  send(encode)
//!    subscriber A (datagram)  → encode into buffer[datagram]   flags: [x - - -]
//!    subscriber B (datagram)  → reuse buffer[datagram]
//!    subscriber C (native)    → encode into buffer[native],    flags: [x - x -]
//!                               stage once in C's region with
//!                               readers = native subscribers of that region
//!    subscriber D (native)    → pulse the staged slot
//! ```
//!
//! A failure to reach one subscriber is logged and counted; the others still
//! get the event.

use std::collections::HashMap;
use std::sync::Arc;

use modlink_core::{
    CodecError, EventId, InterfaceCatalog, MessageBuffer, MessageNum, ProtocolDescriptor,
    ProtocolKind,
};
use tracing::{debug, warn};

use super::client_stub::CallError;
use crate::infrastructure::transport::region::{SharedRegion, SlotIndex};
use crate::infrastructure::transport::{
    self, buffer_capacity, Protocol, SendStatus, TransportError, TransportTimeouts,
};

/// Counters of one [`EventBroadcaster::send`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers the event was handed to.
    pub delivered: usize,
    /// Subscribers that could not be reached.
    pub failed: usize,
    /// Times the payload was encoded.
    pub encodes: usize,
}

struct Subscriber {
    protocol: Box<dyn Protocol>,
    /// Number of events this descriptor is subscribed to.
    events: usize,
}

struct RegionUse {
    region: Arc<SharedRegion>,
    subscribers: usize,
}

/// The publisher side of one fan-out interface.
pub struct EventBroadcaster {
    catalog: InterfaceCatalog,
    timeouts: TransportTimeouts,
    subscribers: HashMap<ProtocolDescriptor, Subscriber>,
    /// Per event: descriptors in subscription order.
    routes: Vec<Vec<ProtocolDescriptor>>,
    regions: HashMap<String, RegionUse>,
    buffers: [MessageBuffer; 4],
    processed: [bool; 4],
    current: Option<MessageNum>,
}

impl EventBroadcaster {
    pub fn new(catalog: InterfaceCatalog, timeouts: TransportTimeouts) -> Self {
        let capacity = buffer_capacity(catalog.sizing);
        Self {
            catalog,
            timeouts,
            subscribers: HashMap::new(),
            routes: vec![Vec::new(); catalog.message_count()],
            regions: HashMap::new(),
            buffers: std::array::from_fn(|_| MessageBuffer::new(capacity)),
            processed: [false; 4],
            current: None,
        }
    }

    pub fn catalog(&self) -> &InterfaceCatalog {
        &self.catalog
    }

    fn selected(&self, event: EventId) -> Vec<usize> {
        match event {
            EventId::All => (0..self.routes.len()).collect(),
            EventId::Single(n) if usize::from(n) < self.routes.len() => vec![usize::from(n)],
            EventId::Single(n) => {
                warn!(interface = self.catalog.name, event = n, "event out of range ignored");
                Vec::new()
            }
        }
    }

    /// Routes `event` to `descriptor`, opening a sender on first use.
    ///
    /// Adding a route that already exists changes nothing.
    pub fn add_subscriber(
        &mut self,
        event: EventId,
        descriptor: &ProtocolDescriptor,
    ) -> Result<(), TransportError> {
        let selected = self.selected(event);
        if selected.is_empty() {
            return Ok(());
        }
        if !self.subscribers.contains_key(descriptor) {
            let protocol = transport::open(descriptor, self.catalog.sizing, self.timeouts);
            self.attach(descriptor, protocol)?;
        }
        for index in selected {
            let route = &mut self.routes[index];
            if !route.contains(descriptor) {
                route.push(descriptor.clone());
                if let Some(sub) = self.subscribers.get_mut(descriptor) {
                    sub.events += 1;
                }
            }
        }
        Ok(())
    }

    /// Registers an already built sender for `descriptor` without routing any
    /// event to it yet.
    pub fn attach(
        &mut self,
        descriptor: &ProtocolDescriptor,
        mut protocol: Box<dyn Protocol>,
    ) -> Result<(), TransportError> {
        if self.subscribers.contains_key(descriptor) {
            return Ok(());
        }
        protocol.init_sender()?;
        if let Some(region) = protocol.shared_region() {
            self.regions
                .entry(region.name().to_string())
                .or_insert_with(|| RegionUse {
                    region: Arc::clone(region),
                    subscribers: 0,
                })
                .subscribers += 1;
        }
        debug!(interface = self.catalog.name, %descriptor, "subscriber attached");
        self.subscribers.insert(
            descriptor.clone(),
            Subscriber {
                protocol,
                events: 0,
            },
        );
        Ok(())
    }

    /// Stops routing `event` to `descriptor`.  The sender is closed when the
    /// descriptor has no event left.
    pub fn remove_subscriber(&mut self, event: EventId, descriptor: &ProtocolDescriptor) {
        for index in self.selected(event) {
            let route = &mut self.routes[index];
            if let Some(pos) = route.iter().position(|d| d == descriptor) {
                route.remove(pos);
                if let Some(sub) = self.subscribers.get_mut(descriptor) {
                    sub.events = sub.events.saturating_sub(1);
                }
            }
        }
        if self
            .subscribers
            .get(descriptor)
            .is_some_and(|s| s.events == 0)
        {
            self.detach(descriptor);
        }
    }

    fn detach(&mut self, descriptor: &ProtocolDescriptor) {
        let Some(mut sub) = self.subscribers.remove(descriptor) else {
            return;
        };
        if let Some(name) = sub.protocol.shared_region().map(|r| r.name().to_string()) {
            if let Some(entry) = self.regions.get_mut(&name) {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                if entry.subscribers == 0 {
                    self.regions.remove(&name);
                }
            }
        }
        sub.protocol.stop();
        debug!(interface = self.catalog.name, %descriptor, "subscriber detached");
    }

    /// Number of subscribers routed for event `index`.
    pub fn subscriber_count(&self, index: u8) -> usize {
        self.routes.get(usize::from(index)).map_or(0, Vec::len)
    }

    /// Number of distinct descriptors with an open sender.
    pub fn sender_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Names of the shared regions kept alive for native subscribers.
    pub fn region_names(&self) -> Vec<&str> {
        self.regions.values().map(|r| r.region.name()).collect()
    }

    /// Starts a new event.  Must precede [`EventBroadcaster::send`].
    pub fn init_message(&mut self, event: MessageNum) -> Result<(), CallError> {
        if !self.catalog.contains(event) {
            return Err(CallError::UnknownMessage {
                interface: self.catalog.name,
                message: event,
            });
        }
        self.current = Some(event);
        self.processed = [false; 4];
        Ok(())
    }

    /// Delivers the current event to every subscriber routed for it.
    ///
    /// `encode` writes the event's arguments; it runs at most once per
    /// protocol kind present among the subscribers.
    pub fn send(
        &mut self,
        mut encode: impl FnMut(&mut MessageBuffer) -> Result<(), CodecError>,
    ) -> Result<BroadcastReport, CallError> {
        let Some(event) = self.current.take() else {
            return Err(CallError::NotConnected {
                interface: self.catalog.name,
            });
        };
        let mut report = BroadcastReport::default();
        let Some(route) = event.index().and_then(|i| self.routes.get(i)).cloned() else {
            return Ok(report);
        };

        // region name → slot holding this event's frame
        let mut staged: HashMap<String, SlotIndex> = HashMap::new();

        for descriptor in &route {
            let kind: ProtocolKind = descriptor.kind();
            let k = kind.index();
            if !self.processed[k] {
                let buf = &mut self.buffers[k];
                buf.clear();
                buf.set_message_number(event);
                encode(buf)?;
                buf.finalize_size();
                self.processed[k] = true;
                report.encodes += 1;
            }

            let region = self
                .subscribers
                .get(descriptor)
                .and_then(|s| s.protocol.shared_region().cloned());
            if let Some(region) = &region {
                let name = region.name().to_string();
                if !staged.contains_key(&name) {
                    let readers = count_region_readers(&route, &self.subscribers, &name);
                    let frame = self.buffers[k].to_frame();
                    match region.stage(&frame, readers, self.timeouts.slot) {
                        Ok(slot) => {
                            staged.insert(name, slot);
                        }
                        Err(e) => {
                            warn!(interface = self.catalog.name, %descriptor, error = %e, "event not staged");
                            report.failed += 1;
                            continue;
                        }
                    }
                }
            }

            let Some(sub) = self.subscribers.get_mut(descriptor) else {
                continue;
            };
            let result = match &region {
                Some(region) => {
                    let Some(&slot) = staged.get(region.name()) else {
                        continue;
                    };
                    let sent = sub.protocol.send_staged_pulse(event, slot);
                    if !matches!(sent, Ok(SendStatus::Sent)) {
                        region.release(slot);
                    }
                    sent
                }
                None => sub.protocol.send_pulse(&mut self.buffers[k]),
            };
            match result {
                Ok(SendStatus::Sent) => report.delivered += 1,
                Ok(SendStatus::NotSent) => {
                    warn!(interface = self.catalog.name, %descriptor, kind = %kind, "event not sent");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(interface = self.catalog.name, %descriptor, error = %e, "event delivery failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Convenience for `init_message` followed by `send`.
    pub fn broadcast(
        &mut self,
        event: MessageNum,
        encode: impl FnMut(&mut MessageBuffer) -> Result<(), CodecError>,
    ) -> Result<BroadcastReport, CallError> {
        self.init_message(event)?;
        self.send(encode)
    }

    /// Closes every sender.
    pub fn clear(&mut self) {
        let descriptors: Vec<_> = self.subscribers.keys().cloned().collect();
        for descriptor in descriptors {
            self.detach(&descriptor);
        }
        for route in &mut self.routes {
            route.clear();
        }
    }
}

fn count_region_readers(
    route: &[ProtocolDescriptor],
    subscribers: &HashMap<ProtocolDescriptor, Subscriber>,
    region: &str,
) -> u32 {
    let count = route
        .iter()
        .filter_map(|d| subscribers.get(d))
        .filter(|s| s.protocol.shared_region().is_some_and(|r| r.name() == region))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("interface", &self.catalog.name)
            .field("senders", &self.subscribers.len())
            .field("regions", &self.region_names())
            .finish()
    }
}
