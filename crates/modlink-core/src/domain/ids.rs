//! Strongly typed identifiers used throughout modlink.
//!
//! Every identifier is a thin newtype so a module handle can never be passed
//! where an interface id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one live module process at the broker.
///
/// Modules use their OS process id unless configured otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleHandle(pub u32);

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Numeric id of a declared interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId(pub u16);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iface#{}", self.0)
    }
}

/// Application-level id of a caller or implementer.
///
/// Unlike [`ModuleHandle`] this id is chosen by the application and stays the
/// same across restarts, so publications can be pinned to a specific peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u16);

/// Message number carried in every frame header.
///
/// Non-negative numbers index the calls of an interface catalog; negative
/// numbers are reserved for control sentinels (see
/// [`crate::protocol::SHUTDOWN_MESSAGE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageNum(pub i16);

impl MessageNum {
    /// Returns `true` for the reserved negative control numbers.
    pub fn is_control(self) -> bool {
        self.0 < 0
    }

    /// Returns the catalog index for a regular message number.
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for MessageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

/// Restricts which subscriber a publication may be paired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PeerConstraint {
    /// Any implementer of the interface is acceptable.
    #[default]
    Any,
    /// Only the implementer with this application id.
    Only(ModuleId),
}

impl PeerConstraint {
    /// Returns `true` when `candidate` satisfies the constraint.
    pub fn admits(self, candidate: ModuleId) -> bool {
        match self {
            PeerConstraint::Any => true,
            PeerConstraint::Only(id) => id == candidate,
        }
    }
}

/// Selects the events of a fan-out interface an activation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventId {
    /// Every event the interface declares.
    All,
    /// A single event, by its index in the catalog.
    Single(u8),
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventId::All => write!(f, "all-events"),
            EventId::Single(n) => write!(f, "event#{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_constraint_any_admits_every_id() {
        assert!(PeerConstraint::Any.admits(ModuleId(0)));
        assert!(PeerConstraint::Any.admits(ModuleId(u16::MAX)));
    }

    #[test]
    fn test_peer_constraint_only_admits_exact_id() {
        // Arrange
        let constraint = PeerConstraint::Only(ModuleId(5));

        // Act / Assert
        assert!(constraint.admits(ModuleId(5)));
        assert!(!constraint.admits(ModuleId(6)));
    }

    #[test]
    fn test_message_num_control_and_index() {
        assert!(MessageNum(-1).is_control());
        assert_eq!(MessageNum(-1).index(), None);
        assert_eq!(MessageNum(3).index(), Some(3));
    }
}
