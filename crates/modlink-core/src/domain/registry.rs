//! Registry records the broker matches on.
//!
//! ```text
//!   Publication (caller side)         Subscription (implementer side)
//!   ──────────────────────────        ───────────────────────────────
//!   interface 42, caller 5,     ⋈     interface 42, subscriber 5
//!   peer Only(5), path "a"            path "a"
//!                    │
//!                    ▼
//!             ActivationPair { descriptor, events }
//! ```
//!
//! A publication and a subscription match when the interface ids are equal,
//! the publication's peer constraint admits the subscriber's id, and the paths
//! are equal (two absent paths are equal).

use serde::Serialize;

use crate::domain::ids::{EventId, InterfaceId, ModuleHandle, ModuleId, PeerConstraint};
use crate::protocol::catalog::InterfaceKind;
use crate::protocol::descriptor::ProtocolDescriptor;

/// Broker-local id of a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PublicationId(pub u64);

/// Broker-local id of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub u64);

/// Per-event activation bits of a fan-out pairing (event `n` is bit `n`).
///
/// Call/reply pairings use bit 0 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct EventMask(u64);

impl EventMask {
    /// Largest number of events a mask can track.
    pub const CAPACITY: u8 = 64;

    pub const fn empty() -> Self {
        EventMask(0)
    }

    /// A mask with the first `num_events` bits set (at least bit 0).
    pub fn all(num_events: u8) -> Self {
        match num_events.clamp(1, Self::CAPACITY) {
            64 => EventMask(u64::MAX),
            n => EventMask((1u64 << n) - 1),
        }
    }

    /// The bits selected by `event` for an interface with `num_events` events.
    ///
    /// Events outside the mask's capacity select nothing.
    pub fn select(event: EventId, num_events: u8) -> Self {
        match event {
            EventId::All => Self::all(num_events),
            EventId::Single(n) if n < Self::CAPACITY => EventMask(1u64 << n),
            EventId::Single(_) => Self::empty(),
        }
    }

    /// Sets every bit of `other` and returns the bits that were newly set.
    pub fn enable(&mut self, other: EventMask) -> EventMask {
        let added = other.0 & !self.0;
        self.0 |= other.0;
        EventMask(added)
    }

    /// Clears every bit of `other` and returns the bits that were cleared.
    pub fn disable(&mut self, other: EventMask) -> EventMask {
        let removed = other.0 & self.0;
        self.0 &= !other.0;
        EventMask(removed)
    }

    pub fn contains(&self, event: u8) -> bool {
        event < Self::CAPACITY && self.0 & (1u64 << event) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// The indices of the set bits, lowest first.
    pub fn events(&self) -> impl Iterator<Item = u8> + '_ {
        (0..Self::CAPACITY).filter(move |&n| self.contains(n))
    }
}

/// A module's declared intent to call an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Publication {
    pub id: PublicationId,
    pub interface: InterfaceId,
    pub module: ModuleHandle,
    pub kind: InterfaceKind,
    pub num_events: u8,
    pub caller: ModuleId,
    pub peer: PeerConstraint,
    pub path: Option<String>,
}

impl Publication {
    /// The match rule between a publication and a subscription.
    pub fn matches(&self, sub: &Subscription) -> bool {
        self.interface == sub.interface
            && self.peer.admits(sub.subscriber)
            && self.path == sub.path
    }

    /// Returns `true` when `publish` must block until the publication is matched.
    pub fn waits_for_match(&self) -> bool {
        self.kind == InterfaceKind::CallReply
    }

    /// The identity under which re-publishing is idempotent.
    pub fn same_declaration(
        &self,
        module: ModuleHandle,
        interface: InterfaceId,
        path: &Option<String>,
    ) -> bool {
        self.module == module && self.interface == interface && &self.path == path
    }
}

/// A module's declared implementation of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub interface: InterfaceId,
    pub module: ModuleHandle,
    pub num_events: u8,
    pub subscriber: ModuleId,
    pub peer: PeerConstraint,
    pub path: Option<String>,
    /// Fan-out handlers subscribe automatically to every event.
    pub auto: bool,
}

impl Subscription {
    /// The identity under which re-subscribing is idempotent.
    pub fn same_declaration(
        &self,
        module: ModuleHandle,
        interface: InterfaceId,
        path: &Option<String>,
    ) -> bool {
        self.module == module && self.interface == interface && &self.path == path
    }
}

/// A live pairing of one publication with one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationPair {
    pub publication: PublicationId,
    pub subscription: SubscriptionId,
    /// The descriptor the caller side uses to reach the implementer.
    pub descriptor: ProtocolDescriptor,
    pub events: EventMask,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publication(interface: u16, peer: PeerConstraint, path: Option<&str>) -> Publication {
        Publication {
            id: PublicationId(1),
            interface: InterfaceId(interface),
            module: ModuleHandle(1),
            kind: InterfaceKind::CallReply,
            num_events: 1,
            caller: ModuleId(5),
            peer,
            path: path.map(str::to_string),
        }
    }

    fn subscription(interface: u16, subscriber: u16, path: Option<&str>) -> Subscription {
        Subscription {
            id: SubscriptionId(1),
            interface: InterfaceId(interface),
            module: ModuleHandle(2),
            num_events: 1,
            subscriber: ModuleId(subscriber),
            peer: PeerConstraint::Any,
            path: path.map(str::to_string),
            auto: false,
        }
    }

    #[test]
    fn test_match_requires_equal_interface() {
        let p = publication(42, PeerConstraint::Any, None);

        assert!(p.matches(&subscription(42, 9, None)));
        assert!(!p.matches(&subscription(43, 9, None)));
    }

    #[test]
    fn test_match_honours_peer_constraint() {
        // Arrange
        let pinned = publication(42, PeerConstraint::Only(ModuleId(5)), None);

        // Act / Assert
        assert!(pinned.matches(&subscription(42, 5, None)));
        assert!(!pinned.matches(&subscription(42, 6, None)));
    }

    #[test]
    fn test_match_requires_equal_paths() {
        let p = publication(42, PeerConstraint::Any, Some("left"));

        assert!(p.matches(&subscription(42, 1, Some("left"))));
        assert!(!p.matches(&subscription(42, 1, Some("right"))));
        assert!(!p.matches(&subscription(42, 1, None)));
    }

    #[test]
    fn test_event_mask_enable_is_idempotent() {
        // Arrange
        let mut mask = EventMask::empty();
        let third = EventMask::select(EventId::Single(2), 4);

        // Act
        let first = mask.enable(third);
        let after_once = mask;
        let second = mask.enable(third);

        // Assert
        assert_eq!(first.bits(), 0b100);
        assert!(second.is_empty(), "second enable must add nothing");
        assert_eq!(mask, after_once);
    }

    #[test]
    fn test_event_mask_all_covers_declared_events() {
        assert_eq!(EventMask::all(3).bits(), 0b111);
        assert_eq!(EventMask::all(0).bits(), 0b1, "call/reply uses bit 0");
        assert_eq!(EventMask::all(64).bits(), u64::MAX);
        assert_eq!(EventMask::all(200).bits(), u64::MAX);
    }

    #[test]
    fn test_event_mask_disable_reports_removed_bits() {
        let mut mask = EventMask::all(3);

        let removed = mask.disable(EventMask::select(EventId::Single(1), 3));

        assert_eq!(removed.bits(), 0b010);
        assert_eq!(mask.events().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_select_out_of_range_event_is_empty() {
        assert!(EventMask::select(EventId::Single(64), 3).is_empty());
        assert!(!EventMask::empty().contains(70));
    }
}
