//! modlink-broker library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/` and
//! the binary entry point in `main.rs` share the same module tree.
//!
//! # What does the broker do? (for beginners)
//!
//! Modules never find each other directly.  Each one registers at the broker
//! and then declares two kinds of facts:
//!
//! - **publish**: "I want to call interface N" (call/reply) or "I emit the
//!   events of interface N" (fan-out),
//! - **subscribe**: "I implement interface N" or "I listen to interface N".
//!
//! Whenever a publication and a subscription agree on interface, module id,
//! and peer constraint, the broker picks a fresh channel for the pair, asks
//! the implementer to start a server on it, and asks the caller to connect
//! its proxy.  When either side leaves, both sides are told to let go.
//!
//! ```text
//!  caller module            broker                 implementer module
//!      │ publish(42) ───────► │ ◄─────── subscribe(42) │
//!      │                      │ match, derive channel  │
//!      │                      │ start_server ─────────►│
//!      │ ◄─────── start_proxy │                        │
//!      │ ════════ direct calls on the channel ════════►│
//! ```

pub mod application;
pub mod infrastructure;

pub use application::broker::{Broker, BrokerError};
pub use application::pairing::PairingPlan;
pub use application::table::BrokerSnapshot;
pub use infrastructure::rendezvous::{Rendezvous, RendezvousSettings};
