//! Infrastructure layer of the broker.
//!
//! - **`rendezvous`** – The receptor server on the broker's well-known
//!   address and the per-module registrar servers it hands out.
//! - **`storage`**    – TOML configuration file persistence.
//!
//! **Dependency rule**: this layer may depend on `application`, but the
//! `application` layer MUST NOT import it.

pub mod rendezvous;
pub mod storage;
