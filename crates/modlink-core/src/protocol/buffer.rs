//! Fixed-capacity message buffer and frame header.
//!
//! Wire format:
//! ```text
//! [message_num:2][payload_len:4][checksum:4][payload:N]
//! ```
//! Total header size: 10 bytes. All multi-byte integers are big-endian.
//!
//! # Buffer lifecycle (for beginners)
//!
//! Every client stub and server dispatcher owns its own [`MessageBuffer`].  A
//! send goes through the same steps every time:
//!
//! ```text
//! clear() ──► set_message_number() ──► write()… ──► finalize_size() ──► transport
//! ```
//!
//! On the receiving side the transport fills the buffer (header first, then
//! the payload) and the dispatcher reads the arguments back with `read()` in
//! exactly the order they were written.  Nothing is self-describing: both
//! sides agree on the layout through the interface catalog.
//!
//! The capacity is fixed when the buffer is created.  Writing past it fails
//! with [`CodecError::BufferOverflow`] instead of growing, so a misbehaving
//! caller can never make a module allocate without bound.

use thiserror::Error;

use crate::domain::ids::MessageNum;
use crate::protocol::wire::Wire;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 10;

/// Reserved message number asking a receive loop to stop.
pub const SHUTDOWN_MESSAGE: MessageNum = MessageNum(-1);

/// Reserved message number a transport reports when a receive timed out.
pub const TIMEOUT_MESSAGE: MessageNum = MessageNum(-2);

/// Reserved message number of the empty reply sent for unknown requests.
pub const NULL_REPLY: MessageNum = MessageNum(-3);

/// Errors that can occur while writing to or reading from a [`MessageBuffer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A write would exceed the fixed payload capacity.
    #[error("buffer overflow: need {needed} bytes, capacity is {available}")]
    BufferOverflow { needed: usize, available: usize },

    /// A read ran past the end of the received payload.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// A field could not be parsed (bad UTF-8, unknown tag, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The checksum in the header does not match the payload.
    #[error("checksum mismatch: header says {expected:#010x}, payload sums to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A received header declares more payload than the buffer can hold.
    #[error("frame too large: header declares {declared} bytes, capacity is {capacity}")]
    FrameTooLarge { declared: usize, capacity: usize },
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// The decoded 10-byte header in front of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message: MessageNum,
    pub payload_len: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Serializes the header into its wire representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.message.0.to_be_bytes());
        out[2..6].copy_from_slice(&self.payload_len.to_be_bytes());
        out[6..10].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }

    /// Parses a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InsufficientData`] when fewer than
    /// [`HEADER_SIZE`] bytes are available.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::InsufficientData {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            message: MessageNum(i16::from_be_bytes([bytes[0], bytes[1]])),
            payload_len: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            checksum: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        })
    }

    /// Total frame length (header plus declared payload).
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self {
            message: MessageNum(0),
            payload_len: 0,
            checksum: 0,
        }
    }
}

/// Computes the payload checksum: the wrapping sum of every byte plus its index.
///
/// Adding the index makes zero-filled payloads of different lengths, and
/// payloads with swapped bytes, produce different sums.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| {
            acc.wrapping_add(u32::from(b)).wrapping_add(i as u32)
        })
}

// ── Message buffer ────────────────────────────────────────────────────────────

/// A fixed-capacity, exclusively owned message buffer with a read cursor.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    header: FrameHeader,
    payload: Vec<u8>,
    capacity: usize,
    cursor: usize,
}

impl MessageBuffer {
    /// Creates an empty buffer that can hold `capacity` payload bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            header: FrameHeader::default(),
            payload: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    /// Maximum number of payload bytes this buffer accepts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of payload bytes currently held.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` when no payload bytes are held.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bytes still available for writing.
    pub fn remaining(&self) -> usize {
        self.capacity - self.payload.len()
    }

    /// Resets the header, payload, and read cursor for reuse.
    pub fn clear(&mut self) {
        self.header = FrameHeader::default();
        self.payload.clear();
        self.cursor = 0;
    }

    pub fn set_message_number(&mut self, message: MessageNum) {
        self.header.message = message;
    }

    pub fn message_number(&self) -> MessageNum {
        self.header.message
    }

    /// Clears the buffer and marks it as a timed-out receive.
    pub fn mark_timeout(&mut self) {
        self.clear();
        self.header.message = TIMEOUT_MESSAGE;
    }

    pub fn is_timeout(&self) -> bool {
        self.header.message == TIMEOUT_MESSAGE
    }

    pub fn is_shutdown(&self) -> bool {
        self.header.message == SHUTDOWN_MESSAGE
    }

    /// Appends one typed value at the write position.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferOverflow`] if the value does not fit.
    pub fn write<T: Wire>(&mut self, value: &T) -> Result<(), CodecError> {
        value.write_to(self)
    }

    /// Reads one typed value at the read cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InsufficientData`] if the payload is exhausted or
    /// [`CodecError::MalformedPayload`] if the bytes do not form a valid `T`.
    pub fn read<T: Wire>(&mut self) -> Result<T, CodecError> {
        T::read_from(self)
    }

    /// Writes a `u32` byte length followed by the UTF-8 bytes of `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferOverflow`] if the string does not fit.
    pub fn write_str(&mut self, value: &str) -> Result<(), CodecError> {
        let len = u32::try_from(value.len()).map_err(|_| {
            CodecError::MalformedPayload(format!("string of {} bytes", value.len()))
        })?;
        if 4 + value.len() > self.remaining() {
            return Err(CodecError::BufferOverflow {
                needed: self.payload.len() + 4 + value.len(),
                available: self.capacity,
            });
        }
        self.put_bytes(&len.to_be_bytes())?;
        self.put_bytes(value.as_bytes())
    }

    /// Writes a `u32` element count followed by every element.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferOverflow`] if the sequence does not fit.
    pub fn write_seq<T: Wire>(&mut self, items: &[T]) -> Result<(), CodecError> {
        let count = u32::try_from(items.len()).map_err(|_| {
            CodecError::MalformedPayload(format!("sequence of {} elements", items.len()))
        })?;
        self.write(&count)?;
        items.iter().try_for_each(|item| self.write(item))
    }

    /// Reads a `u32` element count followed by that many elements.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InsufficientData`] if fewer elements are present
    /// than the count declares.
    pub fn read_seq<T: Wire>(&mut self) -> Result<Vec<T>, CodecError> {
        let count = self.read::<u32>()? as usize;
        // Each element occupies at least one byte; refuse counts that cannot fit.
        if count > self.payload.len() - self.cursor {
            return Err(CodecError::InsufficientData {
                needed: self.cursor + count,
                available: self.payload.len(),
            });
        }
        (0..count).map(|_| self.read()).collect()
    }

    /// Appends raw bytes at the write position.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferOverflow`] if the bytes do not fit.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let needed = self.payload.len() + bytes.len();
        if needed > self.capacity {
            return Err(CodecError::BufferOverflow {
                needed,
                available: self.capacity,
            });
        }
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    /// Consumes `n` raw bytes at the read cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InsufficientData`] if fewer than `n` bytes remain.
    pub fn take_bytes(&mut self, n: usize) -> Result<&[u8], CodecError> {
        let end = self.cursor + n;
        if end > self.payload.len() {
            return Err(CodecError::InsufficientData {
                needed: end,
                available: self.payload.len(),
            });
        }
        let start = self.cursor;
        self.cursor = end;
        Ok(&self.payload[start..end])
    }

    /// Consumes exactly `N` raw bytes at the read cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InsufficientData`] if fewer than `N` bytes remain.
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take_bytes(N)?);
        Ok(out)
    }

    /// Moves the read cursor back to the start of the payload.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn header(&self) -> FrameHeader {
        self.header
    }

    /// Computes the checksum of the current payload.
    pub fn checksum(&self) -> u32 {
        payload_checksum(&self.payload)
    }

    /// Records the payload size and checksum in the header.
    ///
    /// Returns the total frame length (header plus payload).
    pub fn finalize_size(&mut self) -> usize {
        // `put_bytes` caps the payload at `capacity`, which is always a usize
        // that fits the transports' u32 length field.
        self.header.payload_len = self.payload.len() as u32;
        self.header.checksum = self.checksum();
        HEADER_SIZE + self.payload.len()
    }

    /// Checks the header checksum against the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ChecksumMismatch`] when the two disagree.
    pub fn verify_checksum(&self) -> Result<(), CodecError> {
        let actual = self.checksum();
        if actual == self.header.checksum {
            Ok(())
        } else {
            Err(CodecError::ChecksumMismatch {
                expected: self.header.checksum,
                actual,
            })
        }
    }

    /// Returns the finalized frame (header plus payload) as one byte vector.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Replaces the contents with a complete frame received from a transport.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InsufficientData`] when the frame is shorter than
    /// its header declares, or [`CodecError::FrameTooLarge`] when the declared
    /// payload exceeds this buffer's capacity.
    pub fn load_frame(&mut self, frame: &[u8]) -> Result<(), CodecError> {
        let header = FrameHeader::decode(frame)?;
        if frame.len() < header.frame_len() {
            return Err(CodecError::InsufficientData {
                needed: header.frame_len(),
                available: frame.len(),
            });
        }
        self.begin_receive(header)?
            .copy_from_slice(&frame[HEADER_SIZE..header.frame_len()]);
        Ok(())
    }

    /// Installs a received header and returns the payload slice to fill.
    ///
    /// Stream transports read the header first, call this, then read the
    /// payload straight into the returned slice.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooLarge`] when the declared payload exceeds
    /// this buffer's capacity.
    pub fn begin_receive(&mut self, header: FrameHeader) -> Result<&mut [u8], CodecError> {
        let declared = header.payload_len as usize;
        if declared > self.capacity {
            return Err(CodecError::FrameTooLarge {
                declared,
                capacity: self.capacity,
            });
        }
        self.header = header;
        self.payload.clear();
        self.payload.resize(declared, 0);
        self.cursor = 0;
        Ok(&mut self.payload[..])
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encodes_big_endian_fields() {
        // Arrange
        let header = FrameHeader {
            message: MessageNum(-1),
            payload_len: 0x0102_0304,
            checksum: 0xAABB_CCDD,
        };

        // Act
        let bytes = header.encode();

        // Assert
        assert_eq!(
            bytes,
            [0xFF, 0xFF, 0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]
        );
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_decode_rejects_short_input() {
        let err = FrameHeader::decode(&[0u8; 9]).unwrap_err();
        assert_eq!(
            err,
            CodecError::InsufficientData {
                needed: HEADER_SIZE,
                available: 9
            }
        );
    }

    #[test]
    fn test_write_past_capacity_fails_with_buffer_overflow() {
        // Arrange
        let mut buf = MessageBuffer::new(6);
        buf.write(&1u32).unwrap();

        // Act
        let result = buf.write(&2u32);

        // Assert
        assert_eq!(
            result,
            Err(CodecError::BufferOverflow {
                needed: 8,
                available: 6
            })
        );
        assert_eq!(buf.len(), 4, "a rejected write must leave the payload untouched");
    }

    #[test]
    fn test_fields_read_back_in_declared_order() {
        // Arrange
        let mut buf = MessageBuffer::new(128);
        buf.write(&-7i32).unwrap();
        buf.write_str("sensor").unwrap();
        buf.write_seq(&[1.5f64, -2.25]).unwrap();
        buf.write(&true).unwrap();

        // Act
        buf.rewind();
        let a: i32 = buf.read().unwrap();
        let b: String = buf.read().unwrap();
        let c: Vec<f64> = buf.read_seq().unwrap();
        let d: bool = buf.read().unwrap();

        // Assert
        assert_eq!(a, -7);
        assert_eq!(b, "sensor");
        assert_eq!(c, vec![1.5, -2.25]);
        assert!(d);
    }

    #[test]
    fn test_read_past_end_fails_with_insufficient_data() {
        let mut buf = MessageBuffer::new(16);
        buf.write(&1u16).unwrap();
        buf.rewind();

        let err = buf.read::<u32>().unwrap_err();

        assert_eq!(
            err,
            CodecError::InsufficientData {
                needed: 4,
                available: 2
            }
        );
    }

    #[test]
    fn test_read_seq_rejects_count_larger_than_payload() {
        // Arrange – a count of 1000 with no elements behind it
        let mut buf = MessageBuffer::new(16);
        buf.write(&1000u32).unwrap();
        buf.rewind();

        // Act
        let result = buf.read_seq::<u8>();

        // Assert
        assert!(matches!(result, Err(CodecError::InsufficientData { .. })));
    }

    #[test]
    fn test_checksum_adds_byte_index() {
        // 0 + 0, 0 + 1, 0 + 2
        assert_eq!(payload_checksum(&[0, 0, 0]), 3);
        // (1 + 0) + (2 + 1)
        assert_eq!(payload_checksum(&[1, 2]), 4);
        assert_ne!(payload_checksum(&[0]), payload_checksum(&[0, 0]));
    }

    #[test]
    fn test_finalize_size_records_length_and_checksum() {
        // Arrange
        let mut buf = MessageBuffer::new(32);
        buf.set_message_number(MessageNum(4));
        buf.write(&0x0102u16).unwrap();

        // Act
        let frame_len = buf.finalize_size();

        // Assert
        assert_eq!(frame_len, HEADER_SIZE + 2);
        assert_eq!(buf.header().payload_len, 2);
        assert_eq!(buf.header().checksum, 1 + (2 + 1));
        assert!(buf.verify_checksum().is_ok());
    }

    #[test]
    fn test_load_frame_restores_message() {
        // Arrange
        let mut sender = MessageBuffer::new(64);
        sender.set_message_number(MessageNum(2));
        sender.write_str("hello").unwrap();
        sender.finalize_size();
        let frame = sender.to_frame();

        // Act
        let mut receiver = MessageBuffer::new(64);
        receiver.load_frame(&frame).unwrap();

        // Assert
        assert_eq!(receiver.message_number(), MessageNum(2));
        assert!(receiver.verify_checksum().is_ok());
        assert_eq!(receiver.read::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_load_frame_rejects_payload_beyond_capacity() {
        let mut sender = MessageBuffer::new(64);
        sender.put_bytes(&[7u8; 40]).unwrap();
        sender.finalize_size();

        let mut small = MessageBuffer::new(16);
        let err = small.load_frame(&sender.to_frame()).unwrap_err();

        assert_eq!(
            err,
            CodecError::FrameTooLarge {
                declared: 40,
                capacity: 16
            }
        );
    }

    #[test]
    fn test_verify_checksum_detects_corruption() {
        // Arrange
        let mut sender = MessageBuffer::new(16);
        sender.write(&42u64).unwrap();
        sender.finalize_size();
        let mut frame = sender.to_frame();
        frame[HEADER_SIZE + 3] ^= 0x10;

        // Act
        let mut receiver = MessageBuffer::new(16);
        receiver.load_frame(&frame).unwrap();

        // Assert
        assert!(matches!(
            receiver.verify_checksum(),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_mark_timeout_sets_sentinel_and_empties_payload() {
        let mut buf = MessageBuffer::new(8);
        buf.write(&1u8).unwrap();

        buf.mark_timeout();

        assert!(buf.is_timeout());
        assert!(!buf.is_shutdown());
        assert_eq!(buf.message_number(), TIMEOUT_MESSAGE);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_clear_resets_header_and_cursor() {
        let mut buf = MessageBuffer::new(8);
        buf.set_message_number(SHUTDOWN_MESSAGE);
        buf.write(&9u8).unwrap();
        buf.finalize_size();

        buf.clear();

        assert_eq!(buf.header(), FrameHeader::default());
        assert_eq!(buf.remaining(), 8);
    }
}
