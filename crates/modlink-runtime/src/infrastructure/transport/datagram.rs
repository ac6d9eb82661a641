//! UDP transport.
//!
//! A frame larger than one datagram is split into fragments.  The first
//! fragment carries the 10-byte header and the start of the payload; every
//! following fragment carries raw payload bytes only.  The receiver knows
//! how many bytes to expect from the header's `payload_len`:
//!
//! ```text
//!  fragment 0: [header][payload 0 .. MAX)
//!  fragment 1:         [payload MAX .. 2·MAX)
//!  fragment 2:         [payload 2·MAX .. len)
//! ```
//!
//! Fragments from a different source arriving mid-reassembly are dropped.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Instant;

use modlink_core::protocol::HEADER_SIZE;
use modlink_core::{CodecError, FrameHeader, MessageBuffer, ProtocolDescriptor};
use tracing::{debug, warn};

use super::{is_timeout, Protocol, SendStatus, TransportError, TransportTimeouts};

/// Largest number of payload bytes carried by one datagram.
pub const MAX_DATAGRAM_PAYLOAD: usize = 8 * 1024;

const RECV_BUFFER: usize = HEADER_SIZE + MAX_DATAGRAM_PAYLOAD;

// ── Fragmentation ─────────────────────────────────────────────────────────────

/// Splits a finalized buffer into the datagrams that carry it.
pub fn fragments(buf: &MessageBuffer) -> Vec<Vec<u8>> {
    let payload = buf.payload();
    let first_len = payload.len().min(MAX_DATAGRAM_PAYLOAD);

    let mut first = Vec::with_capacity(HEADER_SIZE + first_len);
    first.extend_from_slice(&buf.header().encode());
    first.extend_from_slice(&payload[..first_len]);

    let mut out = vec![first];
    out.extend(
        payload[first_len..]
            .chunks(MAX_DATAGRAM_PAYLOAD)
            .map(<[u8]>::to_vec),
    );
    out
}

/// Collects fragments into a buffer until the declared payload is complete.
pub struct Reassembly<'a> {
    payload: &'a mut [u8],
    filled: usize,
}

impl<'a> Reassembly<'a> {
    /// Starts a frame from its first fragment.
    pub fn start(buf: &'a mut MessageBuffer, first: &[u8]) -> Result<Self, CodecError> {
        let header = FrameHeader::decode(first)?;
        let mut this = Self {
            payload: buf.begin_receive(header)?,
            filled: 0,
        };
        this.feed(&first[HEADER_SIZE..])?;
        Ok(this)
    }

    /// Appends the next fragment.
    pub fn feed(&mut self, fragment: &[u8]) -> Result<(), CodecError> {
        let end = self.filled + fragment.len();
        if end > self.payload.len() {
            return Err(CodecError::MalformedPayload(format!(
                "fragment overruns declared payload ({end} > {})",
                self.payload.len()
            )));
        }
        self.payload[self.filled..end].copy_from_slice(fragment);
        self.filled = end;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.payload.len()
    }
}

// ── Protocol ──────────────────────────────────────────────────────────────────

/// Request/reply and pulses over UDP.
pub struct DatagramProtocol {
    descriptor: ProtocolDescriptor,
    timeouts: TransportTimeouts,
    sender: Option<UdpSocket>,
    receiver: Option<UdpSocket>,
    /// Source of the last request; replies go back there.
    last_peer: Option<SocketAddr>,
    scratch: Vec<u8>,
}

impl DatagramProtocol {
    pub fn new(descriptor: ProtocolDescriptor, timeouts: TransportTimeouts) -> Self {
        Self {
            descriptor,
            timeouts,
            sender: None,
            receiver: None,
            last_peer: None,
            scratch: vec![0u8; RECV_BUFFER],
        }
    }

    fn target(&self) -> Result<SocketAddr, TransportError> {
        let invalid = || TransportError::InvalidDescriptor(self.descriptor.to_string());
        if !self.descriptor.is_valid() {
            return Err(invalid());
        }
        self.descriptor
            .socket_address()
            .ok_or_else(invalid)?
            .to_socket_addrs()
            .map_err(|e| TransportError::io(&self.descriptor, e))?
            .next()
            .ok_or_else(invalid)
    }

    fn write_fragments(
        &self,
        socket: &UdpSocket,
        to: SocketAddr,
        buf: &MessageBuffer,
    ) -> Result<(), TransportError> {
        for fragment in fragments(buf) {
            socket
                .send_to(&fragment, to)
                .map_err(|e| TransportError::io(&self.descriptor, e))?;
        }
        Ok(())
    }

    /// Receives one whole frame.  Returns the source, or `None` on timeout.
    ///
    /// Once the first fragment arrived the read continues until the frame is
    /// complete or a full idle period passes without a fragment.
    fn receive_frame(
        socket: &UdpSocket,
        scratch: &mut [u8],
        buf: &mut MessageBuffer,
        descriptor: &ProtocolDescriptor,
        expect_from: Option<SocketAddr>,
    ) -> Result<Option<SocketAddr>, TransportError> {
        let (n, source) = loop {
            match socket.recv_from(scratch) {
                Ok((n, from)) if expect_from.map_or(true, |e| e == from) => break (n, from),
                Ok((_, from)) => debug!(%from, "datagram from unexpected source dropped"),
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(TransportError::io(descriptor, e)),
            }
        };

        let mut frame = Reassembly::start(buf, &scratch[..n])?;
        while !frame.is_complete() {
            match socket.recv_from(scratch) {
                Ok((n, from)) if from == source => frame.feed(&scratch[..n])?,
                Ok((_, from)) => debug!(%from, "fragment from another source dropped"),
                Err(e) if is_timeout(&e) => {
                    warn!(%source, "incomplete datagram frame discarded");
                    return Ok(None);
                }
                Err(e) => return Err(TransportError::io(descriptor, e)),
            }
        }
        Ok(Some(source))
    }

    fn receive_on_receiver(&mut self, buf: &mut MessageBuffer) -> Result<(), TransportError> {
        let Some(socket) = self.receiver.as_ref() else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        match Self::receive_frame(socket, &mut self.scratch, buf, &self.descriptor, None)? {
            Some(source) => self.last_peer = Some(source),
            None => buf.mark_timeout(),
        }
        Ok(())
    }
}

impl Protocol for DatagramProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    fn init_sender(&mut self) -> Result<(), TransportError> {
        if self.sender.is_some() {
            return Ok(());
        }
        let target = self.target()?;
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).map_err(|e| TransportError::io(&self.descriptor, e))?;
        socket
            .set_read_timeout(Some(self.timeouts.reply))
            .map_err(|e| TransportError::io(&self.descriptor, e))?;
        self.sender = Some(socket);
        debug!(descriptor = %self.descriptor, "datagram sender open");
        Ok(())
    }

    fn init_receiver(&mut self) -> Result<(), TransportError> {
        if self.receiver.is_some() {
            return Ok(());
        }
        let bind = self.target()?;
        let socket = UdpSocket::bind(bind).map_err(|e| TransportError::io(&self.descriptor, e))?;
        socket
            .set_read_timeout(Some(self.timeouts.idle))
            .map_err(|e| TransportError::io(&self.descriptor, e))?;
        self.receiver = Some(socket);
        debug!(descriptor = %self.descriptor, "datagram receiver bound");
        Ok(())
    }

    fn is_sender_open(&self) -> bool {
        self.sender.is_some()
    }

    fn send(
        &mut self,
        request: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<SendStatus, TransportError> {
        let Some(socket) = self.sender.as_ref() else {
            return Ok(SendStatus::NotSent);
        };
        let target = self.target()?;
        self.write_fragments(socket, target, request)?;

        let started = Instant::now();
        loop {
            match Self::receive_frame(
                socket,
                &mut self.scratch,
                reply,
                &self.descriptor,
                Some(target),
            )? {
                Some(_) => return Ok(SendStatus::Sent),
                None if started.elapsed() < self.timeouts.reply => continue,
                None => {
                    return Err(TransportError::Timeout {
                        descriptor: self.descriptor.to_string(),
                        waited: self.timeouts.reply,
                    })
                }
            }
        }
    }

    fn get_message(&mut self, request: &mut MessageBuffer) -> Result<(), TransportError> {
        self.receive_on_receiver(request)
    }

    fn reply(&mut self, reply: &mut MessageBuffer) -> Result<(), TransportError> {
        let (Some(socket), Some(peer)) = (self.receiver.as_ref(), self.last_peer) else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        self.write_fragments(socket, peer, reply)
    }

    fn send_pulse(&mut self, event: &mut MessageBuffer) -> Result<SendStatus, TransportError> {
        let Some(socket) = self.sender.as_ref() else {
            return Ok(SendStatus::NotSent);
        };
        let target = self.target()?;
        self.write_fragments(socket, target, event)?;
        Ok(SendStatus::Sent)
    }

    fn get_pulse(&mut self, event: &mut MessageBuffer) -> Result<(), TransportError> {
        self.receive_on_receiver(event)
    }

    fn stop(&mut self) {
        self.sender = None;
        self.receiver = None;
        self.last_peer = None;
    }
}
