//! Client stubs: the caller side of a call/reply interface.
//!
//! A stub owns one sender [`Protocol`] plus a request and a reply buffer
//! sized from the interface catalog.  [`ClientStub::call`] is the only entry
//! point: it encodes the arguments, sends, waits for the reply, and decodes
//! the result.
//!
//! ```text
//!  call(msg, encode, decode)
//!    │ lock ─ clear request ─ set msg ─ encode ─ finalize
//!    │ protocol.send(request, reply)       (blocks until reply or timeout)
//!    │ verify checksum
//!    └ NULL_REPLY? → CallError::NullReply   else → decode(reply)
//! ```
//!
//! Concurrent calls from several threads are serialized by the stub's mutex,
//! so a stub can be shared through an `Arc`.  The sender is opened lazily on
//! the first call; a stub whose peer restarted reconnects on the next call.

use std::sync::{Mutex, MutexGuard, PoisonError};

use modlink_core::protocol::{NULL_REPLY, SHUTDOWN_MESSAGE};
use modlink_core::{CodecError, InterfaceCatalog, MessageBuffer, MessageNum, ProtocolDescriptor};
use thiserror::Error;
use tracing::trace;

use crate::infrastructure::transport::{
    self, buffer_capacity, Protocol, SendStatus, TransportError, TransportTimeouts,
};

/// Errors returned by calls through any role object.
#[derive(Debug, Error)]
pub enum CallError {
    /// The message number is not declared by the interface.
    #[error("{message} is not part of interface {interface}")]
    UnknownMessage {
        interface: &'static str,
        message: MessageNum,
    },
    /// No pairing has been activated for this proxy yet.
    #[error("{interface} proxy is not connected")]
    NotConnected { interface: &'static str },
    /// The sender refused the request without trying.
    #[error("{interface}: request was not sent")]
    NotSent { interface: &'static str },
    /// The implementer answered with a null reply.
    #[error("{interface}: null reply to {message}")]
    NullReply {
        interface: &'static str,
        message: MessageNum,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The local implementation refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

struct StubState {
    protocol: Box<dyn Protocol>,
    request: MessageBuffer,
    reply: MessageBuffer,
}

/// The caller side of one call/reply pairing.
pub struct ClientStub {
    catalog: InterfaceCatalog,
    descriptor: ProtocolDescriptor,
    state: Mutex<StubState>,
}

impl ClientStub {
    /// Creates a stub that will reach the implementer at `descriptor`.
    pub fn new(
        catalog: InterfaceCatalog,
        descriptor: &ProtocolDescriptor,
        timeouts: TransportTimeouts,
    ) -> Self {
        Self::with_protocol(
            catalog,
            transport::open(descriptor, catalog.sizing, timeouts),
        )
    }

    /// Creates a stub over an already built protocol.
    pub fn with_protocol(catalog: InterfaceCatalog, protocol: Box<dyn Protocol>) -> Self {
        let capacity = buffer_capacity(catalog.sizing);
        Self {
            catalog,
            descriptor: protocol.descriptor().clone(),
            state: Mutex::new(StubState {
                protocol,
                request: MessageBuffer::new(capacity),
                reply: MessageBuffer::new(capacity),
            }),
        }
    }

    pub fn catalog(&self) -> &InterfaceCatalog {
        &self.catalog
    }

    pub fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    /// Opens the sender now instead of on the first call.
    pub fn connect(&self) -> Result<(), CallError> {
        self.lock().protocol.init_sender()?;
        Ok(())
    }

    /// Performs one synchronous call.
    ///
    /// `encode` writes the arguments into the request; `decode` reads the
    /// result out of the reply.
    ///
    /// # Errors
    ///
    /// - [`CallError::UnknownMessage`] when `message` is not in the catalog.
    /// - [`CallError::NullReply`] when the implementer does not handle it.
    /// - [`CallError::Transport`] on timeouts and socket failures.
    pub fn call<R>(
        &self,
        message: MessageNum,
        encode: impl FnOnce(&mut MessageBuffer) -> Result<(), CodecError>,
        decode: impl FnOnce(&mut MessageBuffer) -> Result<R, CodecError>,
    ) -> Result<R, CallError> {
        if !self.catalog.contains(message) {
            return Err(CallError::UnknownMessage {
                interface: self.catalog.name,
                message,
            });
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        self.exchange(state, message, encode)?;
        if state.reply.message_number() == NULL_REPLY {
            return Err(CallError::NullReply {
                interface: self.catalog.name,
                message,
            });
        }
        Ok(decode(&mut state.reply)?)
    }

    /// Asks the implementer's server loop to stop.
    pub fn send_shutdown(&self) -> Result<(), CallError> {
        let mut guard = self.lock();
        self.exchange(&mut guard, SHUTDOWN_MESSAGE, |_| Ok(()))
    }

    /// Closes the sender; the next call reopens it.
    pub fn disconnect(&self) {
        self.lock().protocol.stop();
    }

    fn exchange(
        &self,
        state: &mut StubState,
        message: MessageNum,
        encode: impl FnOnce(&mut MessageBuffer) -> Result<(), CodecError>,
    ) -> Result<(), CallError> {
        state.request.clear();
        state.request.set_message_number(message);
        encode(&mut state.request)?;
        state.request.finalize_size();

        if !state.protocol.is_sender_open() {
            state.protocol.init_sender()?;
        }
        trace!(interface = self.catalog.name, %message, "call");
        match state.protocol.send(&mut state.request, &mut state.reply)? {
            SendStatus::Sent => {}
            SendStatus::NotSent => {
                return Err(CallError::NotSent {
                    interface: self.catalog.name,
                })
            }
        }
        state.reply.verify_checksum()?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ClientStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStub")
            .field("interface", &self.catalog.name)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use modlink_core::declare_interface;

    declare_interface! {
        mod calculator {
            id: 900,
            kind: CallReply,
            sizing: (32, 32, 1),
            calls: {
                ADD => add(i32, i32) -> i32;
                RESET => reset();
            }
        }
    }

    mock! {
        Channel {}
        impl Protocol for Channel {
            fn descriptor(&self) -> &ProtocolDescriptor;
            fn init_sender(&mut self) -> Result<(), TransportError>;
            fn init_receiver(&mut self) -> Result<(), TransportError>;
            fn is_sender_open(&self) -> bool;
            fn send(
                &mut self,
                request: &mut MessageBuffer,
                reply: &mut MessageBuffer,
            ) -> Result<SendStatus, TransportError>;
            fn get_message(&mut self, request: &mut MessageBuffer) -> Result<(), TransportError>;
            fn reply(&mut self, reply: &mut MessageBuffer) -> Result<(), TransportError>;
            fn send_pulse(&mut self, event: &mut MessageBuffer) -> Result<SendStatus, TransportError>;
            fn get_pulse(&mut self, event: &mut MessageBuffer) -> Result<(), TransportError>;
            fn stop(&mut self);
        }
    }

    fn mock_wire() -> MockChannel {
        let mut wire = MockChannel::new();
        wire.expect_descriptor()
            .return_const(ProtocolDescriptor::null(1));
        wire.expect_is_sender_open().return_const(true);
        wire
    }

    #[test]
    fn test_call_encodes_and_decodes_through_protocol() {
        // Arrange: the fake peer adds the two arguments.
        let mut wire = mock_wire();
        wire.expect_send().times(1).returning(|request, reply| {
            let (a, b): (i32, i32) = request.read()?;
            reply.clear();
            reply.set_message_number(request.message_number());
            reply.write(&(a + b))?;
            reply.finalize_size();
            Ok(SendStatus::Sent)
        });
        let stub = ClientStub::with_protocol(calculator::CATALOG, Box::new(wire));

        // Act
        let sum = stub.call(
            calculator::ADD,
            |buf| buf.write(&(20i32, 22i32)),
            |buf| buf.read::<i32>(),
        );

        // Assert
        assert_eq!(sum.unwrap(), 42);
    }

    #[test]
    fn test_unknown_message_is_rejected_before_sending() {
        let mut wire = mock_wire();
        wire.expect_send().never();
        let stub = ClientStub::with_protocol(calculator::CATALOG, Box::new(wire));

        let result = stub.call(MessageNum(5), |_| Ok(()), |_| Ok(()));

        assert!(matches!(result, Err(CallError::UnknownMessage { .. })));
    }

    #[test]
    fn test_null_reply_becomes_error() {
        // Arrange
        let mut wire = mock_wire();
        wire.expect_send().returning(|_, reply| {
            transport::null_reply(reply);
            Ok(SendStatus::Sent)
        });
        let stub = ClientStub::with_protocol(calculator::CATALOG, Box::new(wire));

        // Act
        let result = stub.call(calculator::RESET, |_| Ok(()), |_| Ok(()));

        // Assert
        assert!(matches!(
            result,
            Err(CallError::NullReply { message, .. }) if message == calculator::RESET
        ));
    }

    #[test]
    fn test_not_sent_is_reported() {
        let mut wire = mock_wire();
        wire.expect_send().returning(|_, _| Ok(SendStatus::NotSent));
        let stub = ClientStub::with_protocol(calculator::CATALOG, Box::new(wire));

        let result = stub.call(calculator::RESET, |_| Ok(()), |_| Ok(()));

        assert!(matches!(result, Err(CallError::NotSent { .. })));
    }

    #[test]
    fn test_closed_sender_is_opened_lazily() {
        // Arrange
        let mut wire = MockChannel::new();
        wire.expect_descriptor()
            .return_const(ProtocolDescriptor::null(1));
        wire.expect_is_sender_open().times(1).return_const(false);
        wire.expect_init_sender().times(1).returning(|| Ok(()));
        wire.expect_send().returning(|_, reply| {
            reply.clear();
            reply.finalize_size();
            Ok(SendStatus::Sent)
        });
        let stub = ClientStub::with_protocol(calculator::CATALOG, Box::new(wire));

        // Act
        let result = stub.call(calculator::RESET, |_| Ok(()), |_| Ok(()));

        // Assert
        assert!(result.is_ok());
    }
}
