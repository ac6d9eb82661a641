//! Typed encode/decode of values into a [`MessageBuffer`].
//!
//! Encoding rules:
//!
//! | type                       | representation                           |
//! |----------------------------|------------------------------------------|
//! | integers, `f32`, `f64`     | fixed width, big-endian                  |
//! | `bool`                     | one byte, `0` or `1`                     |
//! | `String`                   | `u32` byte length + UTF-8 bytes          |
//! | `Vec<T>`                   | `u32` element count + elements           |
//! | `Option<T>`                | one tag byte (`0` none, `1` some) + `T`  |
//! | tuples                     | fields in order                          |
//! | identifiers                | their inner integer                      |
//!
//! Records implement [`Wire`] field by field, usually through the
//! [`wire_record!`](crate::wire_record) macro.

use crate::domain::ids::{EventId, InterfaceId, MessageNum, ModuleHandle, ModuleId, PeerConstraint};
use crate::protocol::buffer::{CodecError, MessageBuffer};
use crate::protocol::catalog::InterfaceKind;

/// A value that can be written to and read back from a [`MessageBuffer`].
pub trait Wire: Sized {
    /// Appends `self` at the buffer's write position.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferOverflow`] if the encoding does not fit.
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError>;

    /// Reads one value at the buffer's read cursor.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the bytes are missing or invalid.
    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError>;
}

macro_rules! wire_number {
    ($($t:ty),* $(,)?) => {
        $(
            impl Wire for $t {
                fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
                    buf.put_bytes(&self.to_be_bytes())
                }

                fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
                    Ok(<$t>::from_be_bytes(buf.take_array()?))
                }
            }
        )*
    };
}

wire_number!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Wire for bool {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        buf.put_bytes(&[u8::from(*self)])
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        match buf.take_array::<1>()?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::MalformedPayload(format!(
                "invalid bool byte 0x{other:02X}"
            ))),
        }
    }
}

impl Wire for String {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        buf.write_str(self)
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        let len = buf.read::<u32>()? as usize;
        let bytes = buf.take_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CodecError::MalformedPayload(format!("invalid UTF-8 in string: {e}")))
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        buf.write_seq(self)
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        buf.read_seq()
    }
}

impl<T: Wire> Wire for Option<T> {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        match self {
            None => buf.write(&0u8),
            Some(value) => {
                buf.write(&1u8)?;
                buf.write(value)
            }
        }
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        match buf.read::<u8>()? {
            0 => Ok(None),
            1 => Ok(Some(buf.read()?)),
            other => Err(CodecError::MalformedPayload(format!(
                "invalid option tag 0x{other:02X}"
            ))),
        }
    }
}

impl Wire for () {
    fn write_to(&self, _buf: &mut MessageBuffer) -> Result<(), CodecError> {
        Ok(())
    }

    fn read_from(_buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        Ok(())
    }
}

macro_rules! wire_tuple {
    ($($name:ident),+) => {
        impl<$($name: Wire),+> Wire for ($($name,)+) {
            #[allow(non_snake_case)]
            fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
                let ($($name,)+) = self;
                $( buf.write($name)?; )+
                Ok(())
            }

            fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
                Ok(($( buf.read::<$name>()?, )+))
            }
        }
    };
}

wire_tuple!(A);
wire_tuple!(A, B);
wire_tuple!(A, B, C);
wire_tuple!(A, B, C, D);
wire_tuple!(A, B, C, D, E);
wire_tuple!(A, B, C, D, E, F);

// ── Identifiers ───────────────────────────────────────────────────────────────

macro_rules! wire_newtype {
    ($($t:ident($inner:ty)),* $(,)?) => {
        $(
            impl Wire for $t {
                fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
                    buf.write(&self.0)
                }

                fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
                    Ok($t(buf.read::<$inner>()?))
                }
            }
        )*
    };
}

wire_newtype!(
    ModuleHandle(u32),
    InterfaceId(u16),
    ModuleId(u16),
    MessageNum(i16),
);

/// `-1` encodes [`PeerConstraint::Any`]; any other value is a module id.
impl Wire for PeerConstraint {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        let raw: i32 = match self {
            PeerConstraint::Any => -1,
            PeerConstraint::Only(id) => i32::from(id.0),
        };
        buf.write(&raw)
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        match buf.read::<i32>()? {
            -1 => Ok(PeerConstraint::Any),
            raw => u16::try_from(raw)
                .map(|id| PeerConstraint::Only(ModuleId(id)))
                .map_err(|_| CodecError::MalformedPayload(format!("invalid peer id {raw}"))),
        }
    }
}

/// `-1` encodes [`EventId::All`]; any other value is an event index.
impl Wire for EventId {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        let raw: i16 = match self {
            EventId::All => -1,
            EventId::Single(n) => i16::from(*n),
        };
        buf.write(&raw)
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        match buf.read::<i16>()? {
            -1 => Ok(EventId::All),
            raw => u8::try_from(raw)
                .map(EventId::Single)
                .map_err(|_| CodecError::MalformedPayload(format!("invalid event id {raw}"))),
        }
    }
}

/// `0` is call/reply, `1` is fan-out.
impl Wire for InterfaceKind {
    fn write_to(&self, buf: &mut MessageBuffer) -> Result<(), CodecError> {
        let raw: u8 = match self {
            InterfaceKind::CallReply => 0,
            InterfaceKind::FanOut => 1,
        };
        buf.write(&raw)
    }

    fn read_from(buf: &mut MessageBuffer) -> Result<Self, CodecError> {
        match buf.read::<u8>()? {
            0 => Ok(InterfaceKind::CallReply),
            1 => Ok(InterfaceKind::FanOut),
            other => Err(CodecError::MalformedPayload(format!(
                "invalid interface kind {other}"
            ))),
        }
    }
}

/// Implements [`Wire`] for a struct by encoding the listed fields in order.
///
/// ```rust
/// use modlink_core::{wire_record, MessageBuffer};
///
/// #[derive(Debug, PartialEq)]
/// struct Sample {
///     id: u32,
///     label: String,
/// }
/// wire_record!(Sample { id, label });
///
/// let mut buf = MessageBuffer::new(64);
/// buf.write(&Sample { id: 7, label: "x".into() }).unwrap();
/// buf.rewind();
/// assert_eq!(buf.read::<Sample>().unwrap(), Sample { id: 7, label: "x".into() });
/// ```
#[macro_export]
macro_rules! wire_record {
    ($name:ident { $($field:ident),+ $(,)? }) => {
        impl $crate::protocol::Wire for $name {
            fn write_to(
                &self,
                buf: &mut $crate::protocol::MessageBuffer,
            ) -> ::core::result::Result<(), $crate::protocol::CodecError> {
                $( buf.write(&self.$field)?; )+
                Ok(())
            }

            fn read_from(
                buf: &mut $crate::protocol::MessageBuffer,
            ) -> ::core::result::Result<Self, $crate::protocol::CodecError> {
                Ok(Self { $( $field: buf.read()?, )+ })
            }
        }
    };
}
