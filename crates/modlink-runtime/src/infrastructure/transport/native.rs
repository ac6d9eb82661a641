//! Same-host transport over Unix domain sockets.
//!
//! Each native descriptor names two socket files under the temp directory:
//!
//! ```text
//!   modlink-{station}-{channel}.sock    request/reply (stream socket)
//!   modlink-{station}-{channel}.pulse   event pulses  (datagram socket)
//! ```
//!
//! Requests and replies are framed exactly like the TCP transport.  Pulses
//! do not carry the payload: the publisher stages the frame in the channel's
//! [`SharedRegion`] and the pulse only names the message number and slot.
//!
//! ```text
//!  pulse datagram: [message: i16][slot: u32]
//! ```
//!
//! The receiver keeps the slot pinned until `message_handled`, then releases
//! its reader count.

use std::fs;
use std::io;
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use modlink_core::protocol::HEADER_SIZE;
use modlink_core::{BufferSizing, MessageBuffer, MessageNum, ProtocolDescriptor};
use tracing::{debug, warn};

use super::region::{SharedRegion, SlotIndex};
use super::stream::{read_frame, write_frame, ReadOutcome};
use super::{buffer_capacity, is_timeout, Protocol, SendStatus, TransportError, TransportTimeouts};

const PULSE_LEN: usize = 6;
const ACCEPT_POLL: Duration = Duration::from_millis(10);

fn encode_pulse(message: MessageNum, slot: SlotIndex) -> [u8; PULSE_LEN] {
    let mut out = [0u8; PULSE_LEN];
    out[..2].copy_from_slice(&message.0.to_be_bytes());
    out[2..].copy_from_slice(&slot.0.to_be_bytes());
    out
}

fn decode_pulse(bytes: &[u8]) -> Option<(MessageNum, SlotIndex)> {
    if bytes.len() != PULSE_LEN {
        return None;
    }
    let message = i16::from_be_bytes([bytes[0], bytes[1]]);
    let slot = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    Some((MessageNum(message), SlotIndex(slot)))
}

/// Request/reply over a Unix stream socket, pulses through a shared region.
pub struct NativeProtocol {
    descriptor: ProtocolDescriptor,
    sizing: BufferSizing,
    timeouts: TransportTimeouts,
    region: Option<Arc<SharedRegion>>,
    // caller side
    request_out: Option<UnixStream>,
    pulse_out: Option<UnixDatagram>,
    // implementer side
    listener: Option<UnixListener>,
    peer: Option<UnixStream>,
    pulse_in: Option<UnixDatagram>,
    pinned: Option<SlotIndex>,
    scratch: [u8; 64],
}

impl NativeProtocol {
    pub fn new(
        descriptor: ProtocolDescriptor,
        sizing: BufferSizing,
        timeouts: TransportTimeouts,
    ) -> Self {
        Self {
            descriptor,
            sizing,
            timeouts,
            region: None,
            request_out: None,
            pulse_out: None,
            listener: None,
            peer: None,
            pulse_in: None,
            pinned: None,
            scratch: [0u8; 64],
        }
    }

    fn endpoint(&self) -> Result<(&str, u32), TransportError> {
        match &self.descriptor {
            ProtocolDescriptor::NativeChannel(ep) if self.descriptor.is_valid() => {
                Ok((ep.station.as_str(), ep.channel))
            }
            _ => Err(TransportError::InvalidDescriptor(self.descriptor.to_string())),
        }
    }

    fn socket_path(&self, suffix: &str) -> Result<PathBuf, TransportError> {
        let (station, channel) = self.endpoint()?;
        Ok(std::env::temp_dir().join(format!("modlink-{station}-{channel}.{suffix}")))
    }

    fn region_name(&self) -> Result<String, TransportError> {
        match self.descriptor.region() {
            Some(name) => Ok(name.to_string()),
            None => {
                let (station, channel) = self.endpoint()?;
                Ok(format!("{station}-{channel}"))
            }
        }
    }

    fn open_region(&mut self) -> Result<Arc<SharedRegion>, TransportError> {
        if let Some(region) = &self.region {
            return Ok(Arc::clone(region));
        }
        let region = SharedRegion::open(
            &self.region_name()?,
            self.sizing.pool_depth,
            HEADER_SIZE + buffer_capacity(self.sizing),
        )?;
        self.region = Some(Arc::clone(&region));
        Ok(region)
    }

    fn connect_request_stream(&mut self) -> Result<(), TransportError> {
        if self.request_out.is_some() {
            return Ok(());
        }
        let path = self.socket_path("sock")?;
        let stream = UnixStream::connect(&path)
            .and_then(|s| {
                s.set_read_timeout(Some(self.timeouts.reply))?;
                Ok(s)
            })
            .map_err(|e| TransportError::io(&self.descriptor, e))?;
        self.request_out = Some(stream);
        Ok(())
    }

    fn try_accept(&mut self) -> Result<bool, TransportError> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        match listener.accept() {
            Ok((stream, _)) => {
                stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_read_timeout(Some(self.timeouts.idle)))
                    .map_err(|e| TransportError::io(&self.descriptor, e))?;
                self.peer = Some(stream);
                Ok(true)
            }
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(TransportError::io(&self.descriptor, e)),
        }
    }

    fn remove_socket_files(&self) {
        for suffix in ["sock", "pulse"] {
            if let Ok(path) = self.socket_path(suffix) {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        debug!(path = %path.display(), error = %e, "socket file not removed");
                    }
                }
            }
        }
    }
}

impl Protocol for NativeProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    fn init_sender(&mut self) -> Result<(), TransportError> {
        if self.pulse_out.is_some() {
            return Ok(());
        }
        self.endpoint()?;
        self.open_region()?;
        let socket =
            UnixDatagram::unbound().map_err(|e| TransportError::io(&self.descriptor, e))?;
        self.pulse_out = Some(socket);
        debug!(descriptor = %self.descriptor, "native sender open");
        Ok(())
    }

    fn init_receiver(&mut self) -> Result<(), TransportError> {
        if self.listener.is_some() {
            return Ok(());
        }
        self.open_region()?;
        // Stale files from a crashed run would make bind fail.
        self.remove_socket_files();
        let listener = UnixListener::bind(self.socket_path("sock")?)
            .and_then(|l| {
                l.set_nonblocking(true)?;
                Ok(l)
            })
            .map_err(|e| TransportError::io(&self.descriptor, e))?;
        let pulses = UnixDatagram::bind(self.socket_path("pulse")?)
            .and_then(|s| {
                s.set_read_timeout(Some(self.timeouts.idle))?;
                Ok(s)
            })
            .map_err(|e| TransportError::io(&self.descriptor, e))?;
        self.listener = Some(listener);
        self.pulse_in = Some(pulses);
        debug!(descriptor = %self.descriptor, "native receiver bound");
        Ok(())
    }

    fn is_sender_open(&self) -> bool {
        self.pulse_out.is_some()
    }

    fn send(
        &mut self,
        request: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<SendStatus, TransportError> {
        if self.pulse_out.is_none() {
            return Ok(SendStatus::NotSent);
        }
        self.connect_request_stream()?;
        let Some(stream) = self.request_out.as_mut() else {
            return Ok(SendStatus::NotSent);
        };
        let outcome = write_frame(stream, request)
            .map_err(|e| TransportError::io(&self.descriptor, e))
            .and_then(|()| read_frame(stream, reply, self.timeouts.reply, &self.descriptor));
        match outcome {
            Ok(ReadOutcome::Complete) => Ok(SendStatus::Sent),
            Ok(ReadOutcome::Idle) => Err(TransportError::Timeout {
                descriptor: self.descriptor.to_string(),
                waited: self.timeouts.reply,
            }),
            Ok(ReadOutcome::Closed) => {
                self.request_out = None;
                Err(TransportError::io(
                    &self.descriptor,
                    io::ErrorKind::ConnectionReset.into(),
                ))
            }
            Err(e) => {
                self.request_out = None;
                Err(e)
            }
        }
    }

    fn get_message(&mut self, request: &mut MessageBuffer) -> Result<(), TransportError> {
        if self.peer.is_none() {
            let deadline = Instant::now() + self.timeouts.idle;
            while !self.try_accept()? {
                if Instant::now() >= deadline {
                    request.mark_timeout();
                    return Ok(());
                }
                thread::sleep(ACCEPT_POLL);
            }
        }
        let Some(peer) = self.peer.as_mut() else {
            request.mark_timeout();
            return Ok(());
        };
        match read_frame(peer, request, self.timeouts.reply, &self.descriptor) {
            Ok(ReadOutcome::Complete) => Ok(()),
            Ok(ReadOutcome::Idle) => {
                self.try_accept()?;
                request.mark_timeout();
                Ok(())
            }
            Ok(ReadOutcome::Closed) => {
                self.peer = None;
                request.mark_timeout();
                Ok(())
            }
            Err(e) => {
                self.peer = None;
                Err(e)
            }
        }
    }

    fn reply(&mut self, reply: &mut MessageBuffer) -> Result<(), TransportError> {
        let Some(peer) = self.peer.as_mut() else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        write_frame(peer, reply).map_err(|e| TransportError::io(&self.descriptor, e))
    }

    fn send_pulse(&mut self, event: &mut MessageBuffer) -> Result<SendStatus, TransportError> {
        if self.pulse_out.is_none() {
            return Ok(SendStatus::NotSent);
        }
        let region = self.open_region()?;
        let slot = region.stage(&event.to_frame(), 1, self.timeouts.slot)?;
        let sent = self.send_staged_pulse(event.message_number(), slot);
        if !matches!(sent, Ok(SendStatus::Sent)) {
            region.release(slot);
        }
        sent
    }

    fn get_pulse(&mut self, event: &mut MessageBuffer) -> Result<(), TransportError> {
        if let Some(stale) = self.pinned.take() {
            warn!(descriptor = %self.descriptor, "previous pulse was never marked handled");
            if let Some(region) = &self.region {
                region.release(stale);
            }
        }
        let (Some(socket), Some(region)) = (self.pulse_in.as_ref(), self.region.as_ref()) else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        let n = match socket.recv(&mut self.scratch) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => {
                event.mark_timeout();
                return Ok(());
            }
            Err(e) => return Err(TransportError::io(&self.descriptor, e)),
        };
        let Some((message, slot)) = decode_pulse(&self.scratch[..n]) else {
            warn!(descriptor = %self.descriptor, len = n, "malformed pulse dropped");
            event.mark_timeout();
            return Ok(());
        };
        if let Err(e) = region.read_into(slot, event) {
            region.release(slot);
            return Err(e);
        }
        if event.message_number() != message {
            warn!(
                descriptor = %self.descriptor,
                pulse = %message,
                staged = %event.message_number(),
                "pulse and staged frame disagree"
            );
        }
        self.pinned = Some(slot);
        Ok(())
    }

    fn message_handled(&mut self) -> Result<(), TransportError> {
        if let (Some(slot), Some(region)) = (self.pinned.take(), self.region.as_ref()) {
            region.release(slot);
        }
        Ok(())
    }

    fn shared_region(&self) -> Option<&Arc<SharedRegion>> {
        self.region.as_ref()
    }

    fn send_staged_pulse(
        &mut self,
        message: MessageNum,
        slot: SlotIndex,
    ) -> Result<SendStatus, TransportError> {
        let Some(socket) = self.pulse_out.as_ref() else {
            return Ok(SendStatus::NotSent);
        };
        let path = self.socket_path("pulse")?;
        socket
            .send_to(&encode_pulse(message, slot), path)
            .map_err(|e| TransportError::io(&self.descriptor, e))?;
        Ok(SendStatus::Sent)
    }

    fn stop(&mut self) {
        let _ = self.message_handled();
        let was_receiver = self.listener.is_some();
        self.request_out = None;
        self.pulse_out = None;
        self.peer = None;
        self.listener = None;
        self.pulse_in = None;
        if was_receiver {
            self.remove_socket_files();
        }
        self.region = None;
    }
}

impl Drop for NativeProtocol {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizing() -> BufferSizing {
        BufferSizing {
            send_bytes: 64,
            reply_bytes: 64,
            pool_depth: 2,
        }
    }

    fn timeouts() -> TransportTimeouts {
        TransportTimeouts {
            idle: Duration::from_millis(50),
            ..TransportTimeouts::default()
        }
    }

    fn station() -> String {
        format!("test-{}", std::process::id())
    }

    #[test]
    fn test_pulse_encoding_reads_back() {
        let bytes = encode_pulse(MessageNum(3), SlotIndex(9));

        assert_eq!(decode_pulse(&bytes), Some((MessageNum(3), SlotIndex(9))));
        assert_eq!(decode_pulse(&bytes[..4]), None);
    }

    #[test]
    fn test_pulse_pins_slot_until_handled() {
        // Arrange
        let descriptor = ProtocolDescriptor::native(station(), 7001)
            .with_region(format!("test-native-pin-{}", std::process::id()));
        let mut receiver = NativeProtocol::new(descriptor.clone(), sizing(), timeouts());
        receiver.init_receiver().unwrap();
        let mut sender = NativeProtocol::new(descriptor, sizing(), timeouts());
        sender.init_sender().unwrap();
        let mut event = MessageBuffer::new(64);
        event.set_message_number(MessageNum(1));
        event.write(&99u32).unwrap();
        event.finalize_size();

        // Act
        sender.send_pulse(&mut event).unwrap();
        let mut received = MessageBuffer::new(64);
        receiver.get_pulse(&mut received).unwrap();
        let region = Arc::clone(receiver.shared_region().unwrap());
        let free_while_pinned = region.free_slots();
        receiver.message_handled().unwrap();

        // Assert
        assert_eq!(received.read::<u32>().unwrap(), 99);
        assert_eq!(free_while_pinned, 1);
        assert_eq!(region.free_slots(), 2);
    }

    #[test]
    fn test_request_and_reply_over_unix_socket() {
        // Arrange
        let descriptor = ProtocolDescriptor::native(station(), 7002);
        let mut server = NativeProtocol::new(descriptor.clone(), sizing(), timeouts());
        server.init_receiver().unwrap();
        let server_thread = thread::spawn(move || {
            let mut request = MessageBuffer::new(64);
            loop {
                server.get_message(&mut request).unwrap();
                if !request.is_timeout() {
                    break;
                }
            }
            let mut reply = MessageBuffer::new(64);
            reply.set_message_number(request.message_number());
            reply.write(&(request.read::<u16>().unwrap() + 1)).unwrap();
            reply.finalize_size();
            server.reply(&mut reply).unwrap();
        });
        let mut client = NativeProtocol::new(descriptor, sizing(), timeouts());
        client.init_sender().unwrap();
        let mut request = MessageBuffer::new(64);
        request.set_message_number(MessageNum(0));
        request.write(&41u16).unwrap();
        request.finalize_size();
        let mut reply = MessageBuffer::new(64);

        // Act
        let status = client.send(&mut request, &mut reply).unwrap();
        server_thread.join().unwrap();

        // Assert
        assert_eq!(status, SendStatus::Sent);
        assert_eq!(reply.read::<u16>().unwrap(), 42);
    }

    #[test]
    fn test_receiver_removes_socket_files_on_stop() {
        let descriptor = ProtocolDescriptor::native(station(), 7003);
        let mut receiver = NativeProtocol::new(descriptor, sizing(), timeouts());
        receiver.init_receiver().unwrap();
        let path = receiver.socket_path("sock").unwrap();
        assert!(path.exists());

        receiver.stop();

        assert!(!path.exists());
    }
}
