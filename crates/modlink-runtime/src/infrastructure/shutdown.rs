//! Process-wide shutdown signal.
//!
//! # How Ctrl-C reaches the module (for beginners)
//!
//! A module's main thread parks in [`ShutdownSignal::wait`] while its servers
//! run on their own threads.  Three things can end that wait:
//!
//! - Ctrl-C or SIGTERM (through the handler installed by [`install`]),
//! - a `kill` request from the broker,
//! - the application calling [`ShutdownSignal::trigger`] itself.
//!
//! The OS signal handler cannot carry a reference to a particular module, so
//! the signal currently in charge is kept in a static slot.  [`install`]
//! fills the slot; the handler triggers whatever the slot holds.

use std::sync::{Arc, Condvar, Mutex, Once, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to install the termination handler: {0}")]
    Handler(#[from] ctrlc::Error),
}

/// A one-shot flag threads can wait on.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    changed: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets the flag and wakes every waiter.  Later calls are no-ops.
    pub fn trigger(&self) {
        let mut triggered = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        if !*triggered {
            *triggered = true;
            self.changed.notify_all();
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the flag is set.
    pub fn wait(&self) {
        let mut triggered = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        while !*triggered {
            triggered = self
                .changed
                .wait(triggered)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the flag is set or `timeout` passes.  Returns the flag.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let triggered = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        let (triggered, _) = self
            .changed
            .wait_timeout_while(triggered, timeout, |t| !*t)
            .unwrap_or_else(PoisonError::into_inner);
        *triggered
    }
}

static ACTIVE: Mutex<Option<Arc<ShutdownSignal>>> = Mutex::new(None);
static HANDLER: Once = Once::new();

/// Makes `signal` the one Ctrl-C and SIGTERM trigger, installing the OS
/// handler on first use.
pub fn install(signal: &Arc<ShutdownSignal>) -> Result<(), ShutdownError> {
    *ACTIVE.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(signal));

    let mut result = Ok(());
    HANDLER.call_once(|| {
        result = ctrlc::set_handler(|| {
            info!("termination signal received");
            notify_active();
        })
        .map_err(ShutdownError::from);
    });
    result
}

/// Triggers the installed signal.  Returns `false` when none is installed.
pub fn notify_active() -> bool {
    let active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner).clone();
    match active {
        Some(signal) => {
            signal.trigger();
            true
        }
        None => false,
    }
}

/// Empties the slot so a finished module no longer receives signals.
pub fn clear() {
    *ACTIVE.lock().unwrap_or_else(PoisonError::into_inner) = None;
}
