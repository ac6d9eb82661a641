//! Domain types shared by the broker and the module runtime.
//!
//! - **`ids`** – strongly typed identifiers (module handles, interface ids,
//!   message numbers) and the peer/event selectors.
//! - **`registry`** – publication, subscription, and activation records plus
//!   the match rule.

pub mod ids;
pub mod registry;

pub use ids::{EventId, InterfaceId, MessageNum, ModuleHandle, ModuleId, PeerConstraint};
pub use registry::{
    ActivationPair, EventMask, Publication, PublicationId, Subscription, SubscriptionId,
};
