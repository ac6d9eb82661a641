//! Application layer of the module runtime: the role objects built around
//! every interface catalog, and the connector that ties a module to the
//! broker.
//!
//! # Sub-modules
//!
//! - **`client_stub`** – The caller side of a call/reply interface.  One
//!   synchronous `call` per request; the [`CallError`](client_stub::CallError)
//!   taxonomy every role shares lives here.
//!
//! - **`dispatcher`** – The implementer side.  A handler table indexed by
//!   message number plus the receive loops that run it on their own threads.
//!
//! - **`broadcaster`** – The publisher side of a fan-out interface.  Encodes
//!   each event once per protocol kind and pulses every routed subscriber.
//!
//! - **`proxy`** – Handles a module keeps for the interfaces it calls; the
//!   broker connects and disconnects them at runtime.
//!
//! - **`control`** – The `module_control` interface the broker drives every
//!   module with.
//!
//! - **`registrar`** – The `receptor` and `registrar` interfaces a module
//!   uses to register, publish, and subscribe.
//!
//! - **`connector`** – [`ModuleConnector`](connector::ModuleConnector), the
//!   one object an application needs to join a deployment.

pub mod broadcaster;
pub mod client_stub;
pub mod connector;
pub mod control;
pub mod dispatcher;
pub mod proxy;
pub mod registrar;
