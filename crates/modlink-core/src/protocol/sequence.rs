//! Thread-safe counter handing out descriptor family indices.
//!
//! # What is a family index? (for beginners)
//!
//! Every new pairing needs its own channel: its own UDP port, its own native
//! channel number, and so on.  The broker keeps one base descriptor per
//! protocol kind and asks this counter for the next index whenever a new
//! pairing is created, then calls `base.derive(index)`.  Index 0 is the base
//! itself, which is why brokers usually start the counter at 1.
//!
//! The counter is also used to number shared regions, so every region name
//! handed out by one broker is unique.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU32` internally, so two threads calling `next()`
//! at the same moment always receive different values.

use std::sync::atomic::{AtomicU32, Ordering};

/// A thread-safe, monotonically increasing counter.
///
/// # Examples
///
/// ```rust
/// use modlink_core::protocol::SequenceCounter;
///
/// let cursor = SequenceCounter::starting_at(1);
/// assert_eq!(cursor.next(), 1);
/// assert_eq!(cursor.next(), 2);
/// assert_eq!(cursor.current(), 3);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU32,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a counter whose first `next()` returns `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            inner: AtomicU32::new(first),
        }
    }

    /// Returns the next index and atomically advances the counter.
    ///
    /// Wraps from `u32::MAX` to 0; callers detect an exhausted family through
    /// [`crate::ProtocolDescriptor::derive`].
    pub fn next(&self) -> u32 {
        // `Relaxed` is enough: the value is an identifier, it does not publish
        // any other memory.
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to `next()` will hand out.
    pub fn current(&self) -> u32 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
