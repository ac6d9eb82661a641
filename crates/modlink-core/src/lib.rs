//! # modlink-core
//!
//! Shared library for modlink containing the binary message codec, the
//! protocol descriptors that tell a peer how to reach a module, the interface
//! catalogs, and the registry model the broker matches on.
//!
//! This crate is used by both the broker and the module runtime.
//! It has zero dependencies on sockets, threads, or the file system.
//!
//! # Architecture overview (for beginners)
//!
//! A modlink deployment is a set of independent processes ("modules") plus one
//! broker.  A module that *calls* an interface publishes it; a module that
//! *implements* an interface subscribes to it.  The broker pairs the two and
//! hands both sides a protocol descriptor so they can talk directly.
//!
//! This crate (`modlink-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel between modules.  Every message is a
//!   10-byte header plus a payload written field by field into a
//!   fixed-capacity [`MessageBuffer`], and every transport is described by a
//!   serializable [`ProtocolDescriptor`].
//!
//! - **`domain`** – Identifiers and the registry records (publications,
//!   subscriptions, activation pairs) together with the rule that decides
//!   whether a publication and a subscription belong together.

pub mod domain;
pub mod protocol;

pub use domain::ids::{EventId, InterfaceId, MessageNum, ModuleHandle, ModuleId, PeerConstraint};
pub use domain::registry::{
    ActivationPair, EventMask, Publication, PublicationId, Subscription, SubscriptionId,
};
pub use protocol::buffer::{CodecError, FrameHeader, MessageBuffer};
pub use protocol::catalog::{BufferSizing, CallSignature, InterfaceCatalog, InterfaceKind, Role};
pub use protocol::descriptor::{DescriptorError, ProtocolDescriptor, ProtocolKind};
pub use protocol::wire::Wire;
