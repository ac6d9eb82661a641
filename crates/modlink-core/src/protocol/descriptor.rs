//! Protocol descriptors: serializable values describing how to reach a peer.
//!
//! A descriptor never owns a live resource.  It is handed from the broker to
//! both sides of a pairing; the implementer opens a receiver with it and the
//! caller opens a sender with it.
//!
//! # Descriptor families
//!
//! The broker keeps one *base* descriptor per protocol kind and mints a fresh
//! descriptor for every new pairing with [`ProtocolDescriptor::derive`]:
//!
//! ```text
//! base   udp://127.0.0.1:50000
//! #1     udp://127.0.0.1:50001
//! #2     udp://127.0.0.1:50002
//! ```
//!
//! Deriving is pure arithmetic on the base; no socket is opened.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::buffer::{CodecError, MessageBuffer};
use crate::protocol::wire::Wire;

/// Errors produced while deriving or validating descriptors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    /// The numbered family has no member with this index.
    #[error("descriptor family {base} has no member #{index}")]
    FamilyExhausted { base: String, index: u32 },
}

/// The four transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Datagram,
    Stream,
    NativeChannel,
    Null,
}

impl ProtocolKind {
    /// Every kind, in a stable order.
    pub const ALL: [ProtocolKind; 4] = [
        ProtocolKind::Datagram,
        ProtocolKind::Stream,
        ProtocolKind::NativeChannel,
        ProtocolKind::Null,
    ];

    /// Position of this kind in [`ProtocolKind::ALL`].
    pub fn index(self) -> usize {
        match self {
            ProtocolKind::Datagram => 0,
            ProtocolKind::Stream => 1,
            ProtocolKind::NativeChannel => 2,
            ProtocolKind::Null => 3,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::Datagram => "datagram",
            ProtocolKind::Stream => "stream",
            ProtocolKind::NativeChannel => "native",
            ProtocolKind::Null => "null",
        };
        f.write_str(name)
    }
}

/// Host and port of a network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketEndpoint {
    pub host: String,
    pub port: u16,
}

/// A same-host channel: `station` names the host-local namespace, `channel`
/// the endpoint inside it, and `region` the shared region carrying pulse
/// payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeEndpoint {
    pub station: String,
    pub channel: u32,
    #[serde(default)]
    pub region: Option<String>,
}

/// An in-process channel number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NullEndpoint {
    pub channel: u32,
}

/// Everything a peer needs to open a channel to a module.
///
/// Equality compares the variant tag plus every field of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolDescriptor {
    Datagram(SocketEndpoint),
    Stream(SocketEndpoint),
    NativeChannel(NativeEndpoint),
    Null(NullEndpoint),
}

impl ProtocolDescriptor {
    pub fn datagram(host: impl Into<String>, port: u16) -> Self {
        ProtocolDescriptor::Datagram(SocketEndpoint {
            host: host.into(),
            port,
        })
    }

    pub fn stream(host: impl Into<String>, port: u16) -> Self {
        ProtocolDescriptor::Stream(SocketEndpoint {
            host: host.into(),
            port,
        })
    }

    pub fn native(station: impl Into<String>, channel: u32) -> Self {
        ProtocolDescriptor::NativeChannel(NativeEndpoint {
            station: station.into(),
            channel,
            region: None,
        })
    }

    pub fn null(channel: u32) -> Self {
        ProtocolDescriptor::Null(NullEndpoint { channel })
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            ProtocolDescriptor::Datagram(_) => ProtocolKind::Datagram,
            ProtocolDescriptor::Stream(_) => ProtocolKind::Stream,
            ProtocolDescriptor::NativeChannel(_) => ProtocolKind::NativeChannel,
            ProtocolDescriptor::Null(_) => ProtocolKind::Null,
        }
    }

    /// Returns `true` when the descriptor can be used to open a channel.
    ///
    /// Port 0 and empty host or station names are placeholders, never real
    /// endpoints.
    pub fn is_valid(&self) -> bool {
        match self {
            ProtocolDescriptor::Datagram(ep) | ProtocolDescriptor::Stream(ep) => {
                ep.port != 0 && !ep.host.is_empty()
            }
            ProtocolDescriptor::NativeChannel(ep) => !ep.station.is_empty(),
            ProtocolDescriptor::Null(_) => true,
        }
    }

    /// Returns member `index` of the numbered family this descriptor is the
    /// base of.  Member 0 is the base itself.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::FamilyExhausted`] when the port or channel
    /// number would overflow.
    pub fn derive(&self, index: u32) -> Result<ProtocolDescriptor, DescriptorError> {
        let exhausted = || DescriptorError::FamilyExhausted {
            base: self.to_string(),
            index,
        };
        Ok(match self {
            ProtocolDescriptor::Datagram(ep) | ProtocolDescriptor::Stream(ep) => {
                let port = u16::try_from(index)
                    .ok()
                    .and_then(|i| ep.port.checked_add(i))
                    .ok_or_else(exhausted)?;
                let endpoint = SocketEndpoint {
                    host: ep.host.clone(),
                    port,
                };
                if matches!(self, ProtocolDescriptor::Datagram(_)) {
                    ProtocolDescriptor::Datagram(endpoint)
                } else {
                    ProtocolDescriptor::Stream(endpoint)
                }
            }
            ProtocolDescriptor::NativeChannel(ep) => {
                ProtocolDescriptor::NativeChannel(NativeEndpoint {
                    station: ep.station.clone(),
                    channel: ep.channel.checked_add(index).ok_or_else(exhausted)?,
                    region: ep.region.clone(),
                })
            }
            ProtocolDescriptor::Null(ep) => ProtocolDescriptor::Null(NullEndpoint {
                channel: ep.channel.checked_add(index).ok_or_else(exhausted)?,
            }),
        })
    }

    /// Attaches a shared region name.  Only native channels carry one; other
    /// variants are returned unchanged.
    pub fn with_region(self, name: impl Into<String>) -> Self {
        match self {
            ProtocolDescriptor::NativeChannel(mut ep) => {
                ep.region = Some(name.into());
                ProtocolDescriptor::NativeChannel(ep)
            }
            other => other,
        }
    }

    /// The shared region name of a native channel, if any.
    pub fn region(&self) -> Option<&str> {
        match self {
            ProtocolDescriptor::NativeChannel(ep) => ep.region.as_deref(),
            _ => None,
        }
    }

    /// `"host:port"` for network variants.
    pub fn socket_address(&self) -> Option<String> {
        match self {
            ProtocolDescriptor::Datagram(ep) | ProtocolDescriptor::Stream(ep) => {
                Some(format!("{}:{}", ep.host, ep.port))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolDescriptor::Datagram(ep) => write!(f, "udp://{}:{}", ep.host, ep.port),
            ProtocolDescriptor::Stream(ep) => write!(f, "tcp://{}:{}", ep.host, ep.port),
            ProtocolDescriptor::NativeChannel(ep) => {
                write!(f, "native://{}/{}", ep.station, ep.channel)?;
                if let Some(region) = &ep.region {
                    write!(f, "#{region}")?;
                }
                Ok(())
            }
            ProtocolDescriptor::Null(ep) => write!(f, "null://{}", ep.channel),
        }
    }
}

/// Descriptors travel inside message payloads as a length-prefixed bincode blob.
impl Wire for ProtocolDescriptor {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        let blob = bincode::serialize(self)
            .map_err(|e| CodecError::MalformedPayload(format!("descriptor encode: {e}")))?;
        buf.write(&blob)
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        let blob: Vec<u8> = buf.read()?;
        bincode::deserialize(&blob)
            .map_err(|e| CodecError::MalformedPayload(format!("descriptor decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_offsets_port_of_network_family() {
        // Arrange
        let base = ProtocolDescriptor::datagram("127.0.0.1", 50000);

        // Act
        let third = base.derive(3).unwrap();

        // Assert
        assert_eq!(third, ProtocolDescriptor::datagram("127.0.0.1", 50003));
        assert_eq!(base.derive(0).unwrap(), base);
    }

    #[test]
    fn test_derive_keeps_variant_tag() {
        let base = ProtocolDescriptor::stream("localhost", 51000);

        let derived = base.derive(1).unwrap();

        assert_eq!(derived.kind(), ProtocolKind::Stream);
    }

    #[test]
    fn test_derive_fails_when_port_overflows() {
        let base = ProtocolDescriptor::datagram("127.0.0.1", u16::MAX - 1);

        let result = base.derive(2);

        assert!(matches!(result, Err(DescriptorError::FamilyExhausted { index: 2, .. })));
    }

    #[test]
    fn test_derive_native_keeps_region() {
        // Arrange
        let base = ProtocolDescriptor::native("station-a", 10).with_region("xfer-a-1");

        // Act
        let derived = base.derive(5).unwrap();

        // Assert
        assert_eq!(derived.region(), Some("xfer-a-1"));
        assert_eq!(derived.to_string(), "native://station-a/15#xfer-a-1");
    }

    #[test]
    fn test_equality_compares_tag_and_payload() {
        let udp = ProtocolDescriptor::datagram("h", 1);
        let tcp = ProtocolDescriptor::stream("h", 1);

        assert_ne!(udp, tcp, "same payload under a different tag must differ");
        assert_ne!(udp, ProtocolDescriptor::datagram("h", 2));
        assert_eq!(udp, ProtocolDescriptor::datagram("h", 1));
    }

    #[test]
    fn test_placeholder_descriptors_are_invalid() {
        assert!(!ProtocolDescriptor::datagram("127.0.0.1", 0).is_valid());
        assert!(!ProtocolDescriptor::stream("", 4000).is_valid());
        assert!(!ProtocolDescriptor::native("", 1).is_valid());
        assert!(ProtocolDescriptor::null(0).is_valid());
    }

    #[test]
    fn test_with_region_ignores_network_variants() {
        let udp = ProtocolDescriptor::datagram("h", 7);

        assert_eq!(udp.clone().with_region("r"), udp);
    }

    #[test]
    fn test_descriptor_travels_through_message_buffer() {
        // Arrange
        let original = ProtocolDescriptor::native("station-b", 3).with_region("xfer-b-9");
        let mut buf = MessageBuffer::new(128);

        // Act
        buf.write(&original).unwrap();
        buf.rewind();
        let decoded: ProtocolDescriptor = buf.read().unwrap();

        // Assert
        assert_eq!(decoded, original);
    }
}
