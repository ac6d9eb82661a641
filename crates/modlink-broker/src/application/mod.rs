//! Application layer of the broker.
//!
//! # Sub-modules
//!
//! - **`broker`**  – The matching engine: publish, subscribe, activation,
//!   teardown, and kill.  Calls out to modules only through the
//!   [`modlink_runtime::ModuleControl`] trait, so tests drive it with mocks.
//!
//! - **`table`**   – The registration table the engine guards with one mutex.
//!
//! - **`pairing`** – Which protocol kind and base descriptor a new pairing
//!   of an interface gets.
//!
//! Nothing here opens a socket.  Serving the receptor and the per-module
//! registrars is the infrastructure layer's job.

pub mod broker;
pub mod pairing;
pub mod table;
