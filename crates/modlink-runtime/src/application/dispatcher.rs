//! Server dispatch: the implementer side of an interface.
//!
//! A [`ServerDispatcher`] is a table of handlers indexed by message number.
//! [`serve`] opens a receiver [`Protocol`] and runs the receive loop on its
//! own thread:
//!
//! ```text
//!  loop while running
//!    get_message(request)
//!    ├─ TIMEOUT_MESSAGE    → check running flag, continue
//!    ├─ bad checksum       → log, null reply
//!    ├─ SHUTDOWN_MESSAGE   → null reply, leave the loop
//!    ├─ declared message   → handler(request, reply), reply
//!    └─ anything else      → log, null reply
//!  protocol.stop()
//! ```
//!
//! Fan-out servers run the same loop over `get_pulse` and never reply.  When
//! a worker pool is given, each event is copied out of the transport, the
//! transport's hold on it is released, and the handler runs on the pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use modlink_core::protocol::SHUTDOWN_MESSAGE;
use modlink_core::{InterfaceCatalog, InterfaceKind, MessageBuffer, MessageNum, ProtocolDescriptor};
use tracing::{debug, error, info, warn};

use super::client_stub::CallError;
use crate::infrastructure::transport::{buffer_capacity, null_reply, Protocol, TransportError};
use crate::infrastructure::worker_pool::WorkerPool;

/// Handles one message: reads arguments from the request and writes the
/// result into the reply (whose message number is already set).
pub type Handler =
    Box<dyn Fn(&mut MessageBuffer, &mut MessageBuffer) -> Result<(), CallError> + Send + Sync>;

/// What the loop should do after one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran; send the reply.
    Replied,
    /// A receive timeout; nothing to send.
    Idle,
    /// The peer asked the loop to stop; send the (null) reply and exit.
    Shutdown,
    /// Undeclared message or failed handler; send the null reply.
    Rejected,
}

/// Handler table for one interface.
pub struct ServerDispatcher {
    catalog: InterfaceCatalog,
    handlers: Vec<Option<Handler>>,
}

impl ServerDispatcher {
    pub fn new(catalog: InterfaceCatalog) -> Self {
        Self {
            catalog,
            handlers: (0..catalog.message_count()).map(|_| None).collect(),
        }
    }

    /// Registers the handler of `message`.
    ///
    /// Numbers outside the catalog are logged and ignored.
    pub fn on(
        mut self,
        message: MessageNum,
        handler: impl Fn(&mut MessageBuffer, &mut MessageBuffer) -> Result<(), CallError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        match message.index().and_then(|i| self.handlers.get_mut(i)) {
            Some(slot) => *slot = Some(Box::new(handler)),
            None => warn!(
                interface = self.catalog.name,
                %message,
                "handler for undeclared message ignored"
            ),
        }
        self
    }

    pub fn catalog(&self) -> &InterfaceCatalog {
        &self.catalog
    }

    /// Runs the handler for `request` and leaves a finalized reply.
    pub fn dispatch(&self, request: &mut MessageBuffer, reply: &mut MessageBuffer) -> Dispatch {
        let message = request.message_number();
        if request.is_timeout() {
            return Dispatch::Idle;
        }
        if message == SHUTDOWN_MESSAGE {
            null_reply(reply);
            return Dispatch::Shutdown;
        }
        if let Err(e) = request.verify_checksum() {
            warn!(interface = self.catalog.name, %message, error = %e, "corrupt request");
            null_reply(reply);
            return Dispatch::Rejected;
        }
        let Some(handler) = message
            .index()
            .and_then(|i| self.handlers.get(i))
            .and_then(Option::as_ref)
        else {
            warn!(interface = self.catalog.name, %message, "unexpected message");
            null_reply(reply);
            return Dispatch::Rejected;
        };

        reply.clear();
        reply.set_message_number(message);
        match handler(request, reply) {
            Ok(()) => {
                reply.finalize_size();
                Dispatch::Replied
            }
            Err(e) => {
                warn!(interface = self.catalog.name, %message, error = %e, "handler failed");
                null_reply(reply);
                Dispatch::Rejected
            }
        }
    }

    /// Runs the handler of one event.  Returns `false` when it was dropped.
    pub fn handle_event(&self, event: &mut MessageBuffer) -> bool {
        let mut unused = MessageBuffer::new(0);
        matches!(self.dispatch(event, &mut unused), Dispatch::Replied)
    }
}

// ── Serving ───────────────────────────────────────────────────────────────────

static SERVER_IDS: AtomicUsize = AtomicUsize::new(0);

/// A running server loop.  Dropping the handle stops the loop.
pub struct ServerHandle {
    descriptor: ProtocolDescriptor,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    /// `true` while the loop thread is alive and not asked to stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the loop and waits for its thread.  The wait is bounded by the
    /// transport's idle timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(descriptor = %self.descriptor, "server thread panicked");
            }
        }
    }

    /// Asks the loop to stop without waiting for it.  Needed when the request
    /// being handled by this very server ends its own life.
    pub fn stop_detached(mut self) {
        self.running.store(false, Ordering::Relaxed);
        drop(self.thread.take());
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens `protocol` as a receiver and starts the loop for `dispatcher`.
///
/// # Errors
///
/// Returns the transport error when the receiver cannot be opened (port in
/// use, bad descriptor) or the thread cannot be spawned.
pub fn serve(
    dispatcher: Arc<ServerDispatcher>,
    mut protocol: Box<dyn Protocol>,
    pool: Option<Arc<WorkerPool>>,
) -> Result<ServerHandle, TransportError> {
    protocol.init_receiver()?;
    let descriptor = protocol.descriptor().clone();
    let running = Arc::new(AtomicBool::new(true));
    let id = SERVER_IDS.fetch_add(1, Ordering::Relaxed);
    let kind = dispatcher.catalog.kind;

    let thread = {
        let running = Arc::clone(&running);
        let name = format!("srv-{}-{id}", dispatcher.catalog.name);
        thread::Builder::new()
            .name(name)
            .spawn(move || match kind {
                InterfaceKind::CallReply => call_loop(&dispatcher, protocol, &running),
                InterfaceKind::FanOut => event_loop(dispatcher, protocol, &running, pool, id),
            })
            .map_err(|e| TransportError::io(&descriptor, e))?
    };
    info!(%descriptor, "server started");
    Ok(ServerHandle {
        descriptor,
        running,
        thread: Some(thread),
    })
}

const ERROR_BACKOFF: Duration = Duration::from_millis(50);

fn call_loop(dispatcher: &ServerDispatcher, mut protocol: Box<dyn Protocol>, running: &AtomicBool) {
    let capacity = buffer_capacity(dispatcher.catalog.sizing);
    let mut request = MessageBuffer::new(capacity);
    let mut reply = MessageBuffer::new(capacity);

    while running.load(Ordering::Relaxed) {
        if let Err(e) = protocol.get_message(&mut request) {
            warn!(descriptor = %protocol.descriptor(), error = %e, "receive failed");
            thread::sleep(ERROR_BACKOFF);
            continue;
        }
        let outcome = dispatcher.dispatch(&mut request, &mut reply);
        if outcome == Dispatch::Idle {
            continue;
        }
        if let Err(e) = protocol.reply(&mut reply) {
            warn!(descriptor = %protocol.descriptor(), error = %e, "reply failed");
        }
        if outcome == Dispatch::Shutdown {
            info!(descriptor = %protocol.descriptor(), "shutdown requested by peer");
            running.store(false, Ordering::Relaxed);
        }
    }
    protocol.stop();
    debug!(descriptor = %protocol.descriptor(), "server loop finished");
}

fn event_loop(
    dispatcher: Arc<ServerDispatcher>,
    mut protocol: Box<dyn Protocol>,
    running: &AtomicBool,
    pool: Option<Arc<WorkerPool>>,
    id: usize,
) {
    let mut event = MessageBuffer::new(buffer_capacity(dispatcher.catalog.sizing));

    while running.load(Ordering::Relaxed) {
        if let Err(e) = protocol.get_pulse(&mut event) {
            warn!(descriptor = %protocol.descriptor(), error = %e, "pulse receive failed");
            thread::sleep(ERROR_BACKOFF);
            continue;
        }
        if event.is_timeout() {
            continue;
        }
        if event.is_shutdown() {
            running.store(false, Ordering::Relaxed);
            release_pulse(protocol.as_mut());
            break;
        }
        match &pool {
            Some(pool) => {
                let mut owned = event.clone();
                release_pulse(protocol.as_mut());
                let dispatcher = Arc::clone(&dispatcher);
                if !pool.submit(id, move || {
                    dispatcher.handle_event(&mut owned);
                }) {
                    warn!(descriptor = %protocol.descriptor(), "worker pool closed; event dropped");
                }
            }
            None => {
                dispatcher.handle_event(&mut event);
                release_pulse(protocol.as_mut());
            }
        }
    }
    protocol.stop();
    debug!(descriptor = %protocol.descriptor(), "event loop finished");
}

/// Marks the current pulse handled.  A failure is logged and the loop goes on.
fn release_pulse(protocol: &mut dyn Protocol) {
    if let Err(e) = protocol.message_handled() {
        warn!(descriptor = %protocol.descriptor(), error = %e, "pulse release failed");
    }
}
