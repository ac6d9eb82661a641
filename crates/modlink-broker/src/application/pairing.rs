//! Which transport a new pairing gets, and where its channel lives.
//!
//! Every protocol kind has one **base descriptor**.  A new pairing takes the
//! next index from the broker's cursor and derives its channel from the base
//! of the kind chosen for the interface:
//!
//! ```text
//!   base  udp://127.0.0.1:51000      cursor 7   ─►  udp://127.0.0.1:51007
//!   base  native://modlink/ch1000    cursor 8   ─►  native://modlink/ch1008
//! ```
//!
//! The kind comes from a per-interface override if there is one, otherwise
//! from the plan's default.

use std::collections::HashMap;

use modlink_core::{InterfaceId, ProtocolDescriptor, ProtocolKind};

/// Base descriptors and the kind choice for pairings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPlan {
    default_kind: ProtocolKind,
    bases: [ProtocolDescriptor; 4],
    overrides: HashMap<InterfaceId, ProtocolKind>,
}

impl PairingPlan {
    /// `bases` must hold one descriptor of each kind, in
    /// [`ProtocolKind::ALL`] order.
    pub fn new(default_kind: ProtocolKind, bases: [ProtocolDescriptor; 4]) -> Self {
        Self {
            default_kind,
            bases,
            overrides: HashMap::new(),
        }
    }

    /// Pairs of `interface` use `kind` instead of the default.
    pub fn with_override(mut self, interface: InterfaceId, kind: ProtocolKind) -> Self {
        self.overrides.insert(interface, kind);
        self
    }

    pub fn default_kind(&self) -> ProtocolKind {
        self.default_kind
    }

    /// The kind a new pairing of `interface` uses.
    pub fn kind_for(&self, interface: InterfaceId) -> ProtocolKind {
        self.overrides
            .get(&interface)
            .copied()
            .unwrap_or(self.default_kind)
    }

    pub fn base(&self, kind: ProtocolKind) -> &ProtocolDescriptor {
        &self.bases[kind.index()]
    }
}

impl Default for PairingPlan {
    /// Loopback datagrams for everything.
    fn default() -> Self {
        Self::new(
            ProtocolKind::Datagram,
            [
                ProtocolDescriptor::datagram("127.0.0.1", 51000),
                ProtocolDescriptor::stream("127.0.0.1", 52000),
                ProtocolDescriptor::native("modlink", 1000),
                ProtocolDescriptor::null(60000),
            ],
        )
    }
}
