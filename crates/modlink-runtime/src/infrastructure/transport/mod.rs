//! Transports: the four ways a pairing moves frames between two modules.
//!
//! Every transport implements [`Protocol`].  One side of a pairing opens the
//! descriptor as a *sender* (the caller, or the event publisher); the other
//! side opens it as a *receiver* (the implementer).
//!
//! ```text
//!   caller                                   implementer
//!   ──────                                   ───────────
//!   init_sender()                            init_receiver()
//!   send(request, reply) ──── frame ───────► get_message(request)
//!                        ◄─── frame ──────── reply(reply)
//!
//!   send_pulse(event)    ──── frame ───────► get_pulse(event)
//!                                            message_handled()
//! ```
//!
//! # Receive loops and timeouts (for beginners)
//!
//! `get_message` and `get_pulse` never block forever.  When nothing arrives
//! within [`TransportTimeouts::idle`] they return `Ok(())` with the buffer
//! marked as a timeout (`TIMEOUT_MESSAGE`).  Server loops use that tick to
//! check their `running` flag, which is how a server is stopped without
//! closing the socket underneath a blocked thread.
//!
//! # Picking an implementation
//!
//! [`open`] builds the right implementation for a descriptor:
//!
//! | descriptor      | implementation                           |
//! |-----------------|------------------------------------------|
//! | `Datagram`      | [`datagram::DatagramProtocol`] (UDP)     |
//! | `Stream`        | [`stream::StreamProtocol`] (TCP)         |
//! | `NativeChannel` | `native::NativeProtocol` (Unix sockets)  |
//! | `Null`          | [`null::NullProtocol`] (in-process)      |

pub mod datagram;
#[cfg(unix)]
pub mod native;
pub mod null;
pub mod region;
pub mod stream;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use modlink_core::{
    BufferSizing, CodecError, MessageBuffer, MessageNum, ProtocolDescriptor, ProtocolKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use region::{SharedRegion, SlotIndex};

/// Errors produced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operating system refused an operation on the channel.
    #[error("transport failure on {descriptor}: {source}")]
    Failure {
        descriptor: String,
        #[source]
        source: io::Error,
    },
    /// The descriptor cannot be opened (placeholder port, empty station, ...).
    #[error("descriptor {0} cannot be opened")]
    InvalidDescriptor(String),
    /// No reply arrived within the reply timeout.
    #[error("no reply from {descriptor} within {waited:?}")]
    Timeout { descriptor: String, waited: Duration },
    /// A received frame could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Every slot of a shared region stayed in use for the whole wait.
    #[error("shared region {region} has no free slot")]
    AllocationFailure { region: String },
    /// The file backing a shared region could not be created or mapped.
    #[error("shared region {region} is unavailable: {source}")]
    RegionUnavailable {
        region: String,
        #[source]
        source: io::Error,
    },
    /// The operation does not exist for this transport kind.
    #[error("{kind} transport does not support {operation}")]
    Unsupported {
        kind: ProtocolKind,
        operation: &'static str,
    },
}

impl TransportError {
    pub(crate) fn io(descriptor: &ProtocolDescriptor, source: io::Error) -> Self {
        TransportError::Failure {
            descriptor: descriptor.to_string(),
            source,
        }
    }
}

/// Result of a send that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The frame was handed to the channel.
    Sent,
    /// Nothing was sent because the sender is not open.
    NotSent,
}

/// Wait limits shared by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportTimeouts {
    /// How long a receive loop waits before reporting a timeout tick.
    #[serde(with = "millis")]
    pub idle: Duration,
    /// How long a caller waits for a reply.
    #[serde(with = "millis")]
    pub reply: Duration,
    /// How long a publisher waits for a free shared-region slot.
    #[serde(with = "millis")]
    pub slot: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(200),
            reply: Duration::from_secs(5),
            slot: Duration::from_millis(500),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// One end of a pairing.
///
/// Implementations are driven by a single thread at a time; the role objects
/// wrap them in a `Mutex` where several threads share one sender.
pub trait Protocol: Send {
    /// The descriptor this channel was opened from.
    fn descriptor(&self) -> &ProtocolDescriptor;

    fn kind(&self) -> ProtocolKind {
        self.descriptor().kind()
    }

    /// Opens the caller side.  Calling it on an open sender is a no-op.
    fn init_sender(&mut self) -> Result<(), TransportError>;

    /// Opens the implementer side.  Calling it on an open receiver is a no-op.
    fn init_receiver(&mut self) -> Result<(), TransportError>;

    /// Returns `true` once `init_sender` succeeded.
    fn is_sender_open(&self) -> bool;

    /// Sends a finalized request and blocks until the reply frame is in `reply`.
    ///
    /// Returns [`SendStatus::NotSent`] when the sender is not open.
    fn send(
        &mut self,
        request: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<SendStatus, TransportError>;

    /// Waits for the next request; marks `request` as a timeout when none
    /// arrives within the idle timeout.
    fn get_message(&mut self, request: &mut MessageBuffer) -> Result<(), TransportError>;

    /// Sends a finalized reply to the peer of the last `get_message`.
    fn reply(&mut self, reply: &mut MessageBuffer) -> Result<(), TransportError>;

    /// Sends one finalized event frame without waiting for a reply.
    fn send_pulse(&mut self, event: &mut MessageBuffer) -> Result<SendStatus, TransportError>;

    /// Waits for the next event; marks `event` as a timeout when none arrives.
    fn get_pulse(&mut self, event: &mut MessageBuffer) -> Result<(), TransportError>;

    /// Releases whatever the last `get_pulse` pinned.
    fn message_handled(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// The shared region pulses of this channel are staged in, if any.
    fn shared_region(&self) -> Option<&Arc<SharedRegion>> {
        None
    }

    /// Signals an event whose frame is already staged in `slot` of
    /// [`Protocol::shared_region`].
    fn send_staged_pulse(
        &mut self,
        _message: MessageNum,
        _slot: SlotIndex,
    ) -> Result<SendStatus, TransportError> {
        Err(TransportError::Unsupported {
            kind: self.kind(),
            operation: "staged pulses",
        })
    }

    /// Closes both sides.  The protocol can be re-opened afterwards.
    fn stop(&mut self);
}

/// Builds the transport for `descriptor`.
///
/// The channel is not opened; call `init_sender` or `init_receiver`.
pub fn open(
    descriptor: &ProtocolDescriptor,
    sizing: BufferSizing,
    timeouts: TransportTimeouts,
) -> Box<dyn Protocol> {
    match descriptor.kind() {
        ProtocolKind::Datagram => Box::new(datagram::DatagramProtocol::new(
            descriptor.clone(),
            timeouts,
        )),
        ProtocolKind::Stream => Box::new(stream::StreamProtocol::new(
            descriptor.clone(),
            timeouts,
        )),
        #[cfg(unix)]
        ProtocolKind::NativeChannel => Box::new(native::NativeProtocol::new(
            descriptor.clone(),
            sizing,
            timeouts,
        )),
        #[cfg(not(unix))]
        ProtocolKind::NativeChannel => Box::new(null::NullProtocol::unavailable(
            descriptor.clone(),
            timeouts,
        )),
        ProtocolKind::Null => Box::new(null::NullProtocol::new(descriptor.clone(), timeouts)),
    }
}

/// Builds a finalized null reply (used for unknown messages and shutdown).
pub fn null_reply(reply: &mut MessageBuffer) {
    reply.clear();
    reply.set_message_number(modlink_core::protocol::NULL_REPLY);
    reply.finalize_size();
}

/// Returns `true` for the error kinds a socket read timeout produces.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Payload capacity every buffer for `sizing` needs: the larger of the two
/// directions, so one buffer type serves requests and replies.
pub fn buffer_capacity(sizing: BufferSizing) -> usize {
    sizing.send_bytes.max(sizing.reply_bytes).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_reply_is_finalized() {
        // Arrange
        let mut reply = MessageBuffer::new(16);
        reply.write(&7u32).unwrap();

        // Act
        null_reply(&mut reply);

        // Assert
        assert_eq!(reply.message_number(), modlink_core::protocol::NULL_REPLY);
        assert!(reply.is_empty());
        assert!(reply.verify_checksum().is_ok());
    }

    #[test]
    fn test_unopened_sender_reports_not_sent() {
        // Arrange
        let descriptor = ProtocolDescriptor::datagram("127.0.0.1", 0);
        let sizing = BufferSizing {
            send_bytes: 16,
            reply_bytes: 16,
            pool_depth: 1,
        };
        let mut protocol = open(&descriptor, sizing, TransportTimeouts::default());
        let mut request = MessageBuffer::new(16);
        let mut reply = MessageBuffer::new(16);
        request.finalize_size();

        // Act
        let status = protocol.send(&mut request, &mut reply).unwrap();

        // Assert
        assert_eq!(status, SendStatus::NotSent);
        assert!(!protocol.is_sender_open());
    }

    #[test]
    fn test_invalid_descriptor_cannot_open_sender() {
        let descriptor = ProtocolDescriptor::stream("", 4000);
        let sizing = BufferSizing {
            send_bytes: 16,
            reply_bytes: 16,
            pool_depth: 1,
        };
        let mut protocol = open(&descriptor, sizing, TransportTimeouts::default());

        let err = protocol.init_sender().unwrap_err();

        assert!(matches!(err, TransportError::InvalidDescriptor(_)));
    }
}
