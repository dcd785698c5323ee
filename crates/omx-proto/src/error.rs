//! Protocol error types.

use thiserror::Error;

/// Errors raised while building or parsing wire messages.
///
/// Every variant is a validation failure: the offending message is never put
/// on the wire, and an offending inbound message is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the header or the declared payload length require.
    #[error("truncated message: need {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Header carries a type code outside the known set.
    #[error("unknown message type: {0}")]
    UnknownType(u32),

    /// Map descriptor tag is not one of NONE, ONE, TWO, THREE.
    #[error("invalid map descriptor tag: {0}")]
    InvalidMapType(u32),

    /// Buffer handle array does not lie inside the payload.
    #[error("buffer array at offset {offset} with {count} entries exceeds payload of {len} bytes")]
    MapOutOfBounds {
        /// Offset read from the map descriptor.
        offset: i64,
        /// Number of handles the descriptor announces.
        count: usize,
        /// Payload length.
        len: usize,
    },

    /// Payload length does not fit the header's 32-bit length field.
    #[error("payload of {len} bytes exceeds the length field")]
    PayloadTooLarge {
        /// Length of the rejected payload.
        len: usize,
    },

    /// Connect request with an empty service name.
    #[error("service name is empty")]
    EmptyName,

    /// Connect request name does not fit the fixed name field.
    #[error("service name is {len} bytes, limit is {max}")]
    NameTooLong {
        /// Length of the rejected name.
        len: usize,
        /// Longest accepted name.
        max: usize,
    },

    /// Connect request name contains an interior NUL byte.
    #[error("service name contains a NUL byte")]
    NameContainsNul,
}
