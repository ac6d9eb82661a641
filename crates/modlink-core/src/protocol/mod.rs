//! Protocol module containing the message buffer, the typed wire codec,
//! protocol descriptors, and interface catalogs.

pub mod buffer;
pub mod catalog;
pub mod descriptor;
pub mod sequence;
pub mod wire;

pub use buffer::{
    CodecError, FrameHeader, MessageBuffer, HEADER_SIZE, NULL_REPLY, SHUTDOWN_MESSAGE,
    TIMEOUT_MESSAGE,
};
pub use catalog::{BufferSizing, CallSignature, InterfaceCatalog, InterfaceKind, Role};
pub use descriptor::{
    DescriptorError, NativeEndpoint, NullEndpoint, ProtocolDescriptor, ProtocolKind,
    SocketEndpoint,
};
pub use sequence::SequenceCounter;
pub use wire::Wire;
