//! Fixed message header.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::little_endian::U32,
};

use crate::ProtocolError;

/// Message type codes understood by the remote connection service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Host asks the broker to connect a session to a named component.
    ConnectRequest = 0,
    /// Broker answers a connect request.
    ConnectResponse = 1,
    /// Keepalive probe (never sent by the host).
    Ping = 2,
    /// Keepalive answer (never sent by the host).
    Pong = 3,
    /// Host tears a connection down.
    Disconnect = 4,
    /// Opaque application payload.
    Raw = 5,
}

impl MessageType {
    /// Map a wire code to a known type.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::ConnectRequest),
            1 => Some(Self::ConnectResponse),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Disconnect),
            5 => Some(Self::Raw),
            _ => None,
        }
    }

    /// Wire code of this type.
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// 12-byte little-endian header preceding every payload.
///
/// The layout is read directly out of received buffers with zerocopy, so the
/// struct is `Unaligned` and carries no padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MessageHeader {
    msg_type: U32,
    flags: U32,
    len: U32,
}

impl MessageHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 12;

    /// Header for a payload of `len` bytes. Flags are always zero.
    pub fn new(msg_type: MessageType, len: u32) -> Self {
        Self { msg_type: U32::new(msg_type.to_u32()), flags: U32::new(0), len: U32::new(len) }
    }

    /// Raw type code.
    pub fn msg_type(&self) -> u32 {
        self.msg_type.get()
    }

    /// Decoded type, `None` for unknown codes.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.msg_type())
    }

    /// Flags word.
    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    /// Declared payload length.
    pub fn payload_len(&self) -> usize {
        self.len.get() as usize
    }

    /// Split `bytes` into a header reference and the bytes that follow it.
    pub fn split(bytes: &[u8]) -> Result<(&Self, &[u8]), ProtocolError> {
        Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })
    }
}
