//! OMX connection service wire format.
//!
//! Every message exchanged with the remote connection service is a fixed
//! 12-byte [`MessageHeader`] followed by `len` payload bytes. This crate only
//! describes and validates those bytes; sending them is the job of
//! `omx-core`.
//!
//! ```text
//! +-----------+-----------+-----------+------------------------+
//! | type: u32 | flags:u32 | len: u32  | payload (len bytes)    |
//! +-----------+-----------+-----------+------------------------+
//!   little-endian                       <= 500 bytes when sent
//! ```
//!
//! Raw application payloads may reference registered host buffers. The
//! [`map_info`] module implements the in-place rewriting of those references
//! into device addresses before a payload leaves the host.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod header;
pub mod map_info;
pub mod message;

pub use error::ProtocolError;
pub use header::{MessageHeader, MessageType};
pub use map_info::{MapDescriptor, MapType, rewrite_buffer_refs};
pub use message::{ConnectResponse, Message, split_frame, validate_service_name};

/// Address of a transport endpoint (local or remote).
pub type EndpointAddr = u32;

/// Address of host memory as seen by the remote processor.
pub type DeviceAddr = u32;

/// Caller-chosen identifier of a registered buffer.
pub type BufferHandle = u32;

/// Largest frame (header included) the host will transmit.
pub const MAX_FRAME_SIZE: usize = 512;

/// Largest payload that fits in a [`MAX_FRAME_SIZE`] frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - MessageHeader::SIZE;

/// Capacity of the service-name field in a connect request, NUL included.
pub const SERVICE_NAME_CAPACITY: usize = 48;
