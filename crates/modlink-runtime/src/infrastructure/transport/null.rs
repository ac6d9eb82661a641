//! In-process transport for modules linked into the same executable.
//!
//! Both ends of a null channel find the same [`NullChannel`] in a
//! process-wide registry keyed by channel number.  The registry holds weak
//! references, so a channel goes away once no endpoint uses it.  A request/reply exchange
//! ping-pongs one frame buffer between two counting semaphores:
//!
//! ```text
//!   caller                     channel                  implementer
//!   ──────                     ───────                  ───────────
//!   write frame ─────────►  [ frame buffer ]
//!   request_ready.release()                  ─────────► request_ready.acquire()
//!                                                       read frame, handle,
//!                           [ frame buffer ] ◄───────── write reply
//!   reply_ready.acquire() ◄───────────────────────────  reply_ready.release()
//! ```
//!
//! A gate mutex keeps a second caller out until the first exchange is
//! complete.  Pulses use their own queue and do not touch the frame buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use modlink_core::{MessageBuffer, ProtocolDescriptor};
use tracing::debug;

use super::{Protocol, SendStatus, TransportError, TransportTimeouts};

// ── Semaphore ─────────────────────────────────────────────────────────────────

/// A counting semaphore with a timed acquire.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.available.notify_one();
    }

    /// Takes one unit, waiting up to `timeout`.  Returns `false` on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            count = self
                .available
                .wait_timeout(count, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *count -= 1;
        true
    }

    /// Drops every pending unit.
    pub fn drain(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// The shared state of one null channel.
#[derive(Debug, Default)]
pub struct NullChannel {
    gate: Mutex<()>,
    frame: Mutex<Vec<u8>>,
    request_ready: Semaphore,
    reply_ready: Semaphore,
    pulses: Mutex<VecDeque<Vec<u8>>>,
    pulse_ready: Semaphore,
}

fn channels() -> MutexGuard<'static, HashMap<u32, Weak<NullChannel>>> {
    static CHANNELS: OnceLock<Mutex<HashMap<u32, Weak<NullChannel>>>> = OnceLock::new();
    CHANNELS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl NullChannel {
    /// Returns the channel numbered `channel`, creating it when no endpoint
    /// holds it.
    pub fn open(channel: u32) -> Arc<NullChannel> {
        let mut channels = channels();
        if let Some(live) = channels.get(&channel).and_then(Weak::upgrade) {
            return live;
        }
        channels.retain(|_, w| w.strong_count() > 0);
        let fresh = Arc::new(NullChannel::default());
        channels.insert(channel, Arc::downgrade(&fresh));
        fresh
    }

    /// Returns the channel numbered `channel` if some endpoint still holds it.
    pub fn lookup(channel: u32) -> Option<Arc<NullChannel>> {
        channels().get(&channel).and_then(Weak::upgrade)
    }

    fn frame(&self) -> MutexGuard<'_, Vec<u8>> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Protocol ──────────────────────────────────────────────────────────────────

pub struct NullProtocol {
    descriptor: ProtocolDescriptor,
    timeouts: TransportTimeouts,
    channel: Option<Arc<NullChannel>>,
    sender_open: bool,
    receiver_open: bool,
    available: bool,
}

impl NullProtocol {
    pub fn new(descriptor: ProtocolDescriptor, timeouts: TransportTimeouts) -> Self {
        Self {
            descriptor,
            timeouts,
            channel: None,
            sender_open: false,
            receiver_open: false,
            available: true,
        }
    }

    /// A protocol that refuses to open, standing in for a kind the platform
    /// lacks.
    pub fn unavailable(descriptor: ProtocolDescriptor, timeouts: TransportTimeouts) -> Self {
        Self {
            available: false,
            ..Self::new(descriptor, timeouts)
        }
    }

    fn attach(&mut self) -> Result<Arc<NullChannel>, TransportError> {
        if !self.available {
            return Err(TransportError::Unsupported {
                kind: self.descriptor.kind(),
                operation: "this platform",
            });
        }
        if let Some(channel) = &self.channel {
            return Ok(Arc::clone(channel));
        }
        let ProtocolDescriptor::Null(endpoint) = &self.descriptor else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        let channel = NullChannel::open(endpoint.channel);
        self.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }
}

impl Protocol for NullProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    fn init_sender(&mut self) -> Result<(), TransportError> {
        self.attach()?;
        self.sender_open = true;
        Ok(())
    }

    fn init_receiver(&mut self) -> Result<(), TransportError> {
        let channel = self.attach()?;
        if !self.receiver_open {
            // Leftovers belong to a previous receiver.
            channel.request_ready.drain();
            channel.pulse_ready.drain();
            channel
                .pulses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            self.receiver_open = true;
            debug!(descriptor = %self.descriptor, "null receiver attached");
        }
        Ok(())
    }

    fn is_sender_open(&self) -> bool {
        self.sender_open
    }

    fn send(
        &mut self,
        request: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<SendStatus, TransportError> {
        let (true, Some(channel)) = (self.sender_open, self.channel.as_ref()) else {
            return Ok(SendStatus::NotSent);
        };
        let _exchange = channel.gate.lock().unwrap_or_else(PoisonError::into_inner);
        // A reply that arrived after an earlier timeout is stale.
        channel.reply_ready.drain();
        *channel.frame() = request.to_frame();
        channel.request_ready.release();

        if !channel.reply_ready.acquire_timeout(self.timeouts.reply) {
            return Err(TransportError::Timeout {
                descriptor: self.descriptor.to_string(),
                waited: self.timeouts.reply,
            });
        }
        reply.load_frame(&channel.frame())?;
        Ok(SendStatus::Sent)
    }

    fn get_message(&mut self, request: &mut MessageBuffer) -> Result<(), TransportError> {
        let Some(channel) = self.channel.as_ref().filter(|_| self.receiver_open) else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        if channel.request_ready.acquire_timeout(self.timeouts.idle) {
            request.load_frame(&channel.frame())?;
        } else {
            request.mark_timeout();
        }
        Ok(())
    }

    fn reply(&mut self, reply: &mut MessageBuffer) -> Result<(), TransportError> {
        let Some(channel) = self.channel.as_ref().filter(|_| self.receiver_open) else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        *channel.frame() = reply.to_frame();
        channel.reply_ready.release();
        Ok(())
    }

    fn send_pulse(&mut self, event: &mut MessageBuffer) -> Result<SendStatus, TransportError> {
        let (true, Some(channel)) = (self.sender_open, self.channel.as_ref()) else {
            return Ok(SendStatus::NotSent);
        };
        channel
            .pulses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event.to_frame());
        channel.pulse_ready.release();
        Ok(SendStatus::Sent)
    }

    fn get_pulse(&mut self, event: &mut MessageBuffer) -> Result<(), TransportError> {
        let Some(channel) = self.channel.as_ref().filter(|_| self.receiver_open) else {
            return Err(TransportError::InvalidDescriptor(self.descriptor.to_string()));
        };
        if !channel.pulse_ready.acquire_timeout(self.timeouts.idle) {
            event.mark_timeout();
            return Ok(());
        }
        let frame = channel
            .pulses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match frame {
            Some(frame) => event.load_frame(&frame)?,
            None => event.mark_timeout(),
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.sender_open = false;
        self.receiver_open = false;
        self.channel = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_core::MessageNum;
    use std::thread;

    fn timeouts() -> TransportTimeouts {
        TransportTimeouts {
            idle: Duration::from_millis(50),
            reply: Duration::from_millis(500),
            ..TransportTimeouts::default()
        }
    }

    #[test]
    fn test_semaphore_counts_releases() {
        let sem = Semaphore::default();
        sem.release();
        sem.release();

        assert!(sem.acquire_timeout(Duration::ZERO));
        assert!(sem.acquire_timeout(Duration::ZERO));
        assert!(!sem.acquire_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_request_reply_ping_pong() {
        // Arrange
        let descriptor = ProtocolDescriptor::null(9001);
        let mut server = NullProtocol::new(descriptor.clone(), timeouts());
        server.init_receiver().unwrap();
        let server_thread = thread::spawn(move || {
            let mut request = MessageBuffer::new(32);
            loop {
                server.get_message(&mut request).unwrap();
                if !request.is_timeout() {
                    break;
                }
            }
            let mut reply = MessageBuffer::new(32);
            reply.set_message_number(request.message_number());
            reply.write_str("pong").unwrap();
            reply.finalize_size();
            server.reply(&mut reply).unwrap();
        });
        let mut client = NullProtocol::new(descriptor, timeouts());
        client.init_sender().unwrap();
        let mut request = MessageBuffer::new(32);
        request.set_message_number(MessageNum(0));
        request.finalize_size();
        let mut reply = MessageBuffer::new(32);

        // Act
        let status = client.send(&mut request, &mut reply).unwrap();
        server_thread.join().unwrap();

        // Assert
        assert_eq!(status, SendStatus::Sent);
        assert_eq!(reply.read::<String>().unwrap(), "pong");
    }

    #[test]
    fn test_send_without_receiver_times_out() {
        let mut client = NullProtocol::new(ProtocolDescriptor::null(9002), timeouts());
        client.init_sender().unwrap();
        let mut request = MessageBuffer::new(8);
        request.finalize_size();
        let mut reply = MessageBuffer::new(8);

        let result = client.send(&mut request, &mut reply);

        assert!(matches!(result, Err(TransportError::Timeout { .. })));
    }

    #[test]
    fn test_pulses_arrive_in_send_order() {
        // Arrange
        let descriptor = ProtocolDescriptor::null(9003);
        let mut receiver = NullProtocol::new(descriptor.clone(), timeouts());
        receiver.init_receiver().unwrap();
        let mut sender = NullProtocol::new(descriptor, timeouts());
        sender.init_sender().unwrap();

        // Act
        for n in 0..3i16 {
            let mut event = MessageBuffer::new(8);
            event.set_message_number(MessageNum(n));
            event.finalize_size();
            sender.send_pulse(&mut event).unwrap();
        }
        let mut seen = Vec::new();
        let mut event = MessageBuffer::new(8);
        for _ in 0..3 {
            receiver.get_pulse(&mut event).unwrap();
            seen.push(event.message_number().0);
        }

        // Assert
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_channel_is_released_with_its_last_endpoint() {
        // Arrange
        let descriptor = ProtocolDescriptor::null(9005);
        let mut receiver = NullProtocol::new(descriptor.clone(), timeouts());
        let mut sender = NullProtocol::new(descriptor, timeouts());
        receiver.init_receiver().unwrap();
        sender.init_sender().unwrap();

        // Act
        receiver.stop();
        let held_by_sender = NullChannel::lookup(9005).is_some();
        sender.stop();

        // Assert
        assert!(held_by_sender);
        assert!(NullChannel::lookup(9005).is_none());
    }

    #[test]
    fn test_unopened_receiver_is_rejected() {
        let mut receiver = NullProtocol::new(ProtocolDescriptor::null(9004), timeouts());
        let mut event = MessageBuffer::new(8);

        assert!(receiver.get_pulse(&mut event).is_err());
    }
}
