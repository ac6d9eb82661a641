//! modlink-runtime library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`, the
//! broker crate, and the binary entry point in `main.rs` share the same
//! module tree.
//!
//! # What does the runtime do? (for beginners)
//!
//! Every process in a modlink deployment links this crate.  It provides:
//!
//! 1. **Transports** – four ways to move a [`MessageBuffer`] between two
//!    processes (UDP datagrams, TCP streams, Unix-socket native channels with
//!    a shared slot region, and an in-process null channel), all behind the
//!    same [`Protocol`] trait.
//! 2. **Role objects** – for each interface catalog: a [`ClientStub`] to call
//!    it, a [`ServerDispatcher`] to implement it, and an [`EventBroadcaster`]
//!    to publish its events.
//! 3. **The module connector** – [`ModuleConnector`] registers the module at
//!    the broker, declares what it calls and what it implements, and then
//!    lets the broker start servers and connect proxies as peers come and go.
//!
//! ```text
//!  application code
//!       │ CallProxy::call / EventProxy::broadcast / handlers
//!  ┌────▼─────────────────────────────────────────────┐
//!  │ application: stubs, dispatchers, broadcasters,   │
//!  │              connector, control, registrar       │
//!  ├──────────────────────────────────────────────────┤
//!  │ infrastructure: transports, region, workers,     │
//!  │                 shutdown                         │
//!  └──────────────────────────────────────────────────┘
//! ```
//!
//! [`MessageBuffer`]: modlink_core::MessageBuffer

/// Application layer: role objects, proxies, and the broker connector.
pub mod application;

/// Infrastructure layer: transports, worker pool, and shutdown signal.
pub mod infrastructure;

pub use application::broadcaster::{BroadcastReport, EventBroadcaster};
pub use application::client_stub::{CallError, ClientStub};
pub use application::connector::{
    ConnectorError, InterfaceSpec, LocalModule, ModuleConfig, ModuleConnector,
};
pub use application::control::{ModuleControl, ModuleControlStub, ProxyCommand, ServerCommand};
pub use application::dispatcher::{serve, ServerDispatcher, ServerHandle};
pub use application::proxy::{CallProxy, EventProxy};
pub use application::registrar::{
    ActivationRequest, PublishOutcome, PublishRequest, Receptor, Registrar, Registration,
    SubscribeRequest, UnpublishRequest,
};
pub use infrastructure::shutdown::ShutdownSignal;
pub use infrastructure::transport::{Protocol, SendStatus, TransportError, TransportTimeouts};
