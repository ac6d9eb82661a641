//! Infrastructure layer of the module runtime.
//!
//! Contains the OS-facing pieces the role objects are built on.
//!
//! # Sub-modules
//!
//! - **`transport`** – The [`Protocol`](transport::Protocol) trait and its four
//!   implementations (UDP, TCP, Unix-socket native channels, in-process null
//!   channels), plus the shared slot regions native pulses are staged in.
//!
//! - **`worker_pool`** – A fixed set of threads fan-out servers hand events
//!   to.  Jobs with the same key run in order on the same thread.
//!
//! - **`ready`** – The one-line start-up handshake written to `--ready-pipe`.
//!
//! - **`shutdown`** – The process-wide shutdown signal that Ctrl-C, SIGTERM,
//!   and the broker's `kill` request all end up triggering.

pub mod ready;
pub mod shutdown;
pub mod transport;
pub mod worker_pool;
