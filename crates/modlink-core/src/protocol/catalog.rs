//! Interface catalogs: the static description every interface is declared by.
//!
//! An interface is declared exactly once, with [`declare_interface!`]. The
//! macro produces a module holding a [`InterfaceCatalog`] constant plus one
//! [`MessageNum`] constant per call, numbered in declaration order:
//!
//! ```rust
//! use modlink_core::declare_interface;
//!
//! declare_interface! {
//!     /// Temperature sensor control.
//!     pub mod sensor_control {
//!         id: 40,
//!         kind: CallReply,
//!         sizing: (256, 256, 2),
//!         calls: {
//!             READ_TEMPERATURE => read_temperature(u8) -> f64;
//!             RESET => reset();
//!         }
//!     }
//! }
//!
//! assert_eq!(sensor_control::READ_TEMPERATURE.0, 0);
//! assert_eq!(sensor_control::RESET.0, 1);
//! assert_eq!(sensor_control::CATALOG.calls.len(), 2);
//! ```
//!
//! # The role quartet (for beginners)
//!
//! Four pieces of code are built around every catalog:
//!
//! ```text
//!                ┌──────────────┐   send/reply    ┌──────────────────┐
//!  caller ──────►│ client stub  │ ──────────────► │ server dispatch  │──► local impl
//!                └──────────────┘                 └──────────────────┘
//!                ┌──────────────────┐   pulses    ┌──────────────────┐
//!  publisher ───►│ event broadcaster│ ──────────► │ server dispatch  │──► local impl
//!                └──────────────────┘ (fan-out)   └──────────────────┘
//! ```
//!
//! Call/reply interfaces use the stub; fan-out interfaces use the
//! broadcaster.  Both land in a server dispatcher on the implementing side,
//! which forwards to the module's local implementation.

use serde::{Deserialize, Serialize};

use crate::domain::ids::{InterfaceId, MessageNum};

/// How calls on an interface are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    /// Synchronous request with a reply; the caller blocks.
    CallReply,
    /// Asynchronous events delivered to every subscriber.
    FanOut,
}

/// The four code roles produced from a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    ClientStub,
    ServerDispatch,
    LocalImpl,
    EventBroadcaster,
}

/// One call of an interface: its name, argument types, and return type.
///
/// Types are recorded by name only; the layout is fixed by the code that
/// encodes and decodes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSignature {
    pub name: &'static str,
    pub args: &'static [&'static str],
    pub returns: Option<&'static str>,
}

/// Pre-computed buffer sizes for an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizing {
    /// Payload capacity of request (or event) buffers.
    pub send_bytes: usize,
    /// Payload capacity of reply buffers.
    pub reply_bytes: usize,
    /// Number of buffers/slots kept ready per protocol.
    pub pool_depth: usize,
}

/// Static description of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceCatalog {
    pub id: InterfaceId,
    pub name: &'static str,
    pub kind: InterfaceKind,
    pub calls: &'static [CallSignature],
    pub sizing: BufferSizing,
}

impl InterfaceCatalog {
    /// Number of calls (message numbers) the interface declares.
    pub fn message_count(&self) -> usize {
        self.calls.len()
    }

    /// Number of events a fan-out interface declares; zero for call/reply.
    pub fn event_count(&self) -> u8 {
        match self.kind {
            InterfaceKind::FanOut => u8::try_from(self.calls.len()).unwrap_or(u8::MAX),
            InterfaceKind::CallReply => 0,
        }
    }

    /// Returns `true` when `message` indexes one of the declared calls.
    pub fn contains(&self, message: MessageNum) -> bool {
        self.signature(message).is_some()
    }

    /// Returns the signature behind `message`, if it is a declared call.
    pub fn signature(&self, message: MessageNum) -> Option<&'static CallSignature> {
        message.index().and_then(|i| self.calls.get(i))
    }

    /// Looks up the message number of the call named `name`.
    pub fn message_number(&self, name: &str) -> Option<MessageNum> {
        self.calls
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| i16::try_from(i).ok())
            .map(MessageNum)
    }

    /// The roles this interface produces.
    pub fn roles(&self) -> &'static [Role] {
        match self.kind {
            InterfaceKind::CallReply => &[Role::ClientStub, Role::ServerDispatch, Role::LocalImpl],
            InterfaceKind::FanOut => &[
                Role::EventBroadcaster,
                Role::ServerDispatch,
                Role::LocalImpl,
            ],
        }
    }
}

/// Declares an interface catalog and its message-number constants.
///
/// See the [module documentation](self) for the syntax.
#[macro_export]
macro_rules! declare_interface {
    (
        $(#[$meta:meta])*
        $vis:vis mod $module:ident {
            id: $id:expr,
            kind: $kind:ident,
            sizing: ($send:expr, $reply:expr, $depth:expr $(,)?),
            calls: {
                $( $konst:ident => $call:ident ( $($arg:ty),* $(,)? ) $(-> $ret:ty)? ; )*
            } $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis mod $module {
            /// Every call of this interface, in message-number order.
            pub const CALLS: &[$crate::protocol::CallSignature] = &[
                $(
                    $crate::protocol::CallSignature {
                        name: stringify!($call),
                        args: &[$(stringify!($arg)),*],
                        returns: $crate::__call_returns!($($ret)?),
                    },
                )*
            ];

            /// The catalog of this interface.
            pub const CATALOG: $crate::protocol::InterfaceCatalog =
                $crate::protocol::InterfaceCatalog {
                    id: $crate::domain::InterfaceId($id),
                    name: stringify!($module),
                    kind: $crate::protocol::InterfaceKind::$kind,
                    calls: CALLS,
                    sizing: $crate::protocol::BufferSizing {
                        send_bytes: $send,
                        reply_bytes: $reply,
                        pool_depth: $depth,
                    },
                };

            $crate::__message_numbers!(0i16; $($konst)*);
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __call_returns {
    () => {
        None
    };
    ($ret:ty) => {
        Some(stringify!($ret))
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __message_numbers {
    ($n:expr;) => {};
    ($n:expr; $head:ident $($tail:ident)*) => {
        #[allow(dead_code)]
        pub const $head: $crate::domain::MessageNum = $crate::domain::MessageNum($n);
        $crate::__message_numbers!($n + 1; $($tail)*);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::declare_interface! {
        mod sample_events {
            id: 7,
            kind: FanOut,
            sizing: (64, 0, 4),
            calls: {
                STARTED => started(u32);
                SAMPLE => sample(u32, Vec<f64>);
                STOPPED => stopped();
            }
        }
    }

    crate::declare_interface! {
        mod sample_control {
            id: 8,
            kind: CallReply,
            sizing: (32, 32, 1),
            calls: {
                START => start(u32) -> bool;
                STOP => stop();
            }
        }
    }

    #[test]
    fn test_message_numbers_follow_declaration_order() {
        assert_eq!(sample_events::STARTED, MessageNum(0));
        assert_eq!(sample_events::SAMPLE, MessageNum(1));
        assert_eq!(sample_events::STOPPED, MessageNum(2));
    }

    #[test]
    fn test_catalog_records_signatures() {
        // Arrange
        let catalog = sample_events::CATALOG;

        // Act
        let sample = catalog.signature(sample_events::SAMPLE).unwrap();

        // Assert
        assert_eq!(catalog.id, InterfaceId(7));
        assert_eq!(catalog.name, "sample_events");
        assert_eq!(sample.name, "sample");
        assert_eq!(sample.args.len(), 2);
        assert_eq!(sample.args[0], "u32");
        assert_eq!(sample.returns, None);
    }

    #[test]
    fn test_event_count_only_for_fan_out() {
        assert_eq!(sample_events::CATALOG.event_count(), 3);
        assert_eq!(sample_control::CATALOG.event_count(), 0);
        assert_eq!(sample_control::CATALOG.message_count(), 2);
    }

    #[test]
    fn test_contains_rejects_control_and_out_of_range_numbers() {
        let catalog = sample_control::CATALOG;

        assert!(catalog.contains(MessageNum(1)));
        assert!(!catalog.contains(MessageNum(2)));
        assert!(!catalog.contains(MessageNum(-1)));
    }

    #[test]
    fn test_message_number_lookup_by_name() {
        assert_eq!(
            sample_control::CATALOG.message_number("stop"),
            Some(sample_control::STOP)
        );
        assert_eq!(sample_control::CATALOG.message_number("missing"), None);
    }

    #[test]
    fn test_roles_depend_on_kind() {
        assert!(sample_events::CATALOG
            .roles()
            .contains(&Role::EventBroadcaster));
        assert!(!sample_control::CATALOG
            .roles()
            .contains(&Role::EventBroadcaster));
        assert_eq!(
            sample_control::CATALOG.signature(sample_control::START).unwrap().returns,
            Some("bool")
        );
    }
}
