//! TCP transport, plus the framed read/write helpers shared with the native
//! channel.
//!
//! # Framing on a byte stream (for beginners)
//!
//! TCP delivers bytes, not messages, and a single `read` may return only part
//! of what the peer wrote.  Frames are therefore read in two steps:
//!
//! 1. read exactly [`HEADER_SIZE`] bytes and decode the header,
//! 2. read exactly `payload_len` more bytes into the buffer.
//!
//! A read timeout before the first header byte is an idle tick.  Once a frame
//! has started, timeouts are retried until the reply timeout runs out, so a
//! frame is never released half-filled.
//!
//! The receiver serves one connection at a time.  A newer connection replaces
//! the current one the next time the current one is idle, which lets a
//! restarted peer reconnect.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use modlink_core::protocol::HEADER_SIZE;
use modlink_core::{FrameHeader, MessageBuffer, ProtocolDescriptor};
use tracing::{debug, info};

use super::{is_timeout, Protocol, SendStatus, TransportError, TransportTimeouts};

// ── Framed I/O ────────────────────────────────────────────────────────────────

/// How a framed read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// A whole frame is in the buffer.
    Complete,
    /// Nothing arrived within one read timeout.
    Idle,
    /// The peer closed the connection between frames.
    Closed,
}

/// Fills `out` completely.
///
/// `started` tells whether earlier bytes of the same frame were already
/// consumed; in that case a timeout is retried until `patience` runs out.
fn read_full<R: Read>(
    reader: &mut R,
    out: &mut [u8],
    mut started: bool,
    patience: Duration,
) -> io::Result<ReadOutcome> {
    let began = Instant::now();
    let mut filled = 0;
    while filled < out.len() {
        match reader.read(&mut out[filled..]) {
            Ok(0) if !started => return Ok(ReadOutcome::Closed),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                filled += n;
                started = true;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) && !started => return Ok(ReadOutcome::Idle),
            Err(e) if is_timeout(&e) && began.elapsed() < patience => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Complete)
}

/// Reads one frame into `buf`.
pub(crate) fn read_frame<R: Read>(
    reader: &mut R,
    buf: &mut MessageBuffer,
    patience: Duration,
    descriptor: &ProtocolDescriptor,
) -> Result<ReadOutcome, TransportError> {
    let io_err = |e| TransportError::io(descriptor, e);

    let mut header = [0u8; HEADER_SIZE];
    match read_full(reader, &mut header, false, patience).map_err(io_err)? {
        ReadOutcome::Complete => {}
        other => return Ok(other),
    }
    let payload = buf.begin_receive(FrameHeader::decode(&header)?)?;
    if !payload.is_empty() {
        read_full(reader, payload, true, patience).map_err(io_err)?;
    }
    Ok(ReadOutcome::Complete)
}

/// Writes one finalized frame.
pub(crate) fn write_frame<W: Write>(writer: &mut W, buf: &MessageBuffer) -> io::Result<()> {
    writer.write_all(&buf.header().encode())?;
    writer.write_all(buf.payload())?;
    writer.flush()
}

// ── Protocol ──────────────────────────────────────────────────────────────────

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Request/reply and pulses over one TCP connection per pairing.
pub struct StreamProtocol {
    descriptor: ProtocolDescriptor,
    timeouts: TransportTimeouts,
    sender: Option<TcpStream>,
    listener: Option<TcpListener>,
    peer: Option<TcpStream>,
}

impl StreamProtocol {
    pub fn new(descriptor: ProtocolDescriptor, timeouts: TransportTimeouts) -> Self {
        Self {
            descriptor,
            timeouts,
            sender: None,
            listener: None,
            peer: None,
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

    /// Takes one pending connection, if any, as the current peer.
    fn try_accept(&mut self) -> Result<bool, TransportError> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        match listener.accept() {
            Ok((stream, addr)) => {
                let prepared = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_read_timeout(Some(self.timeouts.idle)))
                    .and_then(|()| stream.set_nodelay(true));
                prepared.map_err(|e| TransportError::io(&self.descriptor, e))?;
                if self.peer.replace(stream).is_some() {
                    info!(%addr, descriptor = %self.descriptor, "stream peer replaced");
                } else {
                    debug!(%addr, descriptor = %self.descriptor, "stream peer connected");
                }
                Ok(true)
            }
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(TransportError::io(&self.descriptor, e)),
        }
    }

    /// Waits up to one idle period for a first connection.
    fn wait_for_peer(&mut self) -> Result<bool, TransportError> {
        let deadline = Instant::now() + self.timeouts.idle;
        loop {
            if self.try_accept()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(ACCEPT_POLL);
        }
    }

    fn receive(&mut self, buf: &mut MessageBuffer) -> Result<(), TransportError> {
        if self.peer.is_none() && !self.wait_for_peer()? {
            buf.mark_timeout();
            return Ok(());
        }
        let Some(peer) = self.peer.as_mut() else {
            buf.mark_timeout();
            return Ok(());
        };
        match read_frame(peer, buf, self.timeouts.reply, &self.descriptor) {
            Ok(ReadOutcome::Complete) => Ok(()),
            Ok(ReadOutcome::Idle) => {
                self.try_accept()?;
                buf.mark_timeout();
                Ok(())
            }
            Ok(ReadOutcome::Closed) => {
                debug!(descriptor = %self.descriptor, "stream peer closed");
                self.peer = None;
                buf.mark_timeout();
                Ok(())
            }
            Err(e) => {
                self.peer = None;
                Err(e)
            }
        }
    }
}

impl Protocol for StreamProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    fn init_sender(&mut self) -> Result<(), TransportError> {
        if self.sender.is_some() {
            return Ok(());
        }
        let target = self.target()?;
        let stream = TcpStream::connect_timeout(&target, self.timeouts.reply)
            .and_then(|s| {
                s.set_nodelay(true)?;
                s.set_read_timeout(Some(self.timeouts.reply))?;
                Ok(s)
            })
            .map_err(|e| TransportError::io(&self.descriptor, e))?;
        self.sender = Some(stream);
        debug!(descriptor = %self.descriptor, "stream sender connected");
        Ok(())
    }

    fn init_receiver(&mut self) -> Result<(), TransportError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let target = self.target()?;
        let listener = TcpListener::bind(target)
            .and_then(|l| {
                l.set_nonblocking(true)?;
                Ok(l)
            })
            .map_err(|e| TransportError::io(&self.descriptor, e))?;
        self.listener = Some(listener);
        debug!(descriptor = %self.descriptor, "stream receiver listening");
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
        let Some(stream) = self.sender.as_mut() else {
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
                self.sender = None;
                Err(TransportError::io(
                    &self.descriptor,
                    io::ErrorKind::ConnectionReset.into(),
                ))
            }
            Err(e) => {
                // The connection state is unknown; reconnect on the next send.
                self.sender = None;
                Err(e)
            }
        }
    }

    fn get_message(&mut self, request: &mut MessageBuffer) -> Result<(), TransportError> {
        self.receive(request)
    }

    fn reply(&mut self, reply: &mut MessageBuffer) -> Result<(), TransportError> {
        let Some(peer) = self.peer.as_mut() else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        write_frame(peer, reply).map_err(|e| TransportError::io(&self.descriptor, e))
    }

    fn send_pulse(&mut self, event: &mut MessageBuffer) -> Result<SendStatus, TransportError> {
        let Some(stream) = self.sender.as_mut() else {
            return Ok(SendStatus::NotSent);
        };
        if let Err(e) = write_frame(stream, event) {
            self.sender = None;
            return Err(TransportError::io(&self.descriptor, e));
        }
        Ok(SendStatus::Sent)
    }

    fn get_pulse(&mut self, event: &mut MessageBuffer) -> Result<(), TransportError> {
        self.receive(event)
    }

    fn stop(&mut self) {
        self.sender = None;
        self.peer = None;
        self.listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_core::MessageNum;
    use std::io::Cursor;

    /// A reader that hands out at most `step` bytes per call.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = out.len().min(self.step);
            self.data.read(&mut out[..n])
        }
    }

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut buf = MessageBuffer::new(payload.len().max(1));
        buf.set_message_number(MessageNum(2));
        buf.put_bytes(payload).unwrap();
        buf.finalize_size();
        buf.to_frame()
    }

    #[test]
    fn test_read_frame_tolerates_partial_reads() {
        // Arrange
        let mut reader = Trickle {
            data: Cursor::new(frame_bytes(b"hello world")),
            step: 3,
        };
        let mut buf = MessageBuffer::new(32);
        let descriptor = ProtocolDescriptor::stream("127.0.0.1", 1);

        // Act
        let outcome = read_frame(&mut reader, &mut buf, Duration::from_secs(1), &descriptor);

        // Assert
        assert_eq!(outcome.unwrap(), ReadOutcome::Complete);
        assert_eq!(buf.payload(), b"hello world");
        assert!(buf.verify_checksum().is_ok());
    }

    #[test]
    fn test_eof_between_frames_is_closed() {
        let mut reader = Cursor::new(Vec::new());
        let mut buf = MessageBuffer::new(8);
        let descriptor = ProtocolDescriptor::stream("127.0.0.1", 1);

        let outcome = read_frame(&mut reader, &mut buf, Duration::from_secs(1), &descriptor);

        assert_eq!(outcome.unwrap(), ReadOutcome::Closed);
    }

    #[test]
    fn test_eof_inside_frame_is_an_error() {
        let mut bytes = frame_bytes(b"abcdef");
        bytes.truncate(bytes.len() - 2);
        let mut reader = Cursor::new(bytes);
        let mut buf = MessageBuffer::new(8);
        let descriptor = ProtocolDescriptor::stream("127.0.0.1", 1);

        let outcome = read_frame(&mut reader, &mut buf, Duration::from_secs(1), &descriptor);

        assert!(matches!(outcome, Err(TransportError::Failure { .. })));
    }

    #[test]
    fn test_oversized_frame_is_rejected_before_payload_read() {
        let mut reader = Cursor::new(frame_bytes(&[7u8; 64]));
        let mut buf = MessageBuffer::new(8);
        let descriptor = ProtocolDescriptor::stream("127.0.0.1", 1);

        let outcome = read_frame(&mut reader, &mut buf, Duration::from_secs(1), &descriptor);

        assert!(matches!(outcome, Err(TransportError::Codec(_))));
    }

    #[test]
    fn test_request_and_reply_over_loopback() {
        // Arrange
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let descriptor = ProtocolDescriptor::stream("127.0.0.1", port);
        let timeouts = TransportTimeouts {
            idle: Duration::from_millis(50),
            ..TransportTimeouts::default()
        };
        let mut server = StreamProtocol::new(descriptor.clone(), timeouts);
        server.init_receiver().unwrap();
        let server_thread = thread::spawn(move || {
            let mut request = MessageBuffer::new(64);
            loop {
                server.get_message(&mut request).unwrap();
                if !request.is_timeout() {
                    break;
                }
            }
            let doubled = request.read::<u32>().unwrap() * 2;
            let mut reply = MessageBuffer::new(8);
            reply.set_message_number(request.message_number());
            reply.write(&doubled).unwrap();
            reply.finalize_size();
            server.reply(&mut reply).unwrap();
        });

        let mut client = StreamProtocol::new(descriptor, timeouts);
        client.init_sender().unwrap();
        let mut request = MessageBuffer::new(8);
        request.set_message_number(MessageNum(1));
        request.write(&21u32).unwrap();
        request.finalize_size();
        let mut reply = MessageBuffer::new(8);

        // Act
        let status = client.send(&mut request, &mut reply).unwrap();
        server_thread.join().unwrap();

        // Assert
        assert_eq!(status, SendStatus::Sent);
        assert_eq!(reply.read::<u32>().unwrap(), 42);
    }
}
