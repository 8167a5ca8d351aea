//! Protocol module - Defines the wire protocol spoken by Labnode devices
//!
//! Every message is a CBOR map of small integer keys to values. One reserved
//! key carries the correlation id, the remaining keys are operation ids.
//! The serialized map is then framed for the transport:
//! - Serial links: COBS stuffed, terminated by a 0x00 delimiter
//! - Stream sockets: 4 bytes payload length (big-endian) + payload

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Default TCP port of a Labnode device
pub const DEFAULT_PORT: u16 = 4223;

/// Byte value that terminates a COBS frame
pub const FRAME_DELIMITER: u8 = 0x00;

/// Default size of the correlation id space.
///
/// Ids 0..=23 encode as a single CBOR byte.
pub const DEFAULT_ID_SPACE: u16 = 24;

/// Largest possible correlation id space (ids are a `u8` on the wire)
pub const MAX_ID_SPACE: u16 = 256;

/// Default maximum payload size (64 KiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Largest payload a 4-byte length prefix can describe
pub const MAX_PAYLOAD_LIMIT: usize = u32::MAX as usize;

/// Well-known operation ids used by the connection layer itself
pub mod function {
    use super::OperationId;

    /// Reserved key carrying the correlation id
    pub const REQUEST_ID: OperationId = OperationId(23);

    /// Query the device type
    pub const GET_DEVICE_TYPE: OperationId = OperationId(13);

    /// Query the `(major, minor, patch)` API version
    pub const GET_API_VERSION: OperationId = OperationId(31);
}
