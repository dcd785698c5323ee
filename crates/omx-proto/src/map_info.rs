//! Buffer references embedded in RAW payloads.
//!
//! A RAW payload sent by a session starts with a map descriptor:
//!
//! ```text
//! 0        4          8
//! +--------+----------+-------------- ... ---+------------------------+
//! | tag    | offset   |   application data   | handle[0..tag] (u32)   |
//! +--------+----------+-------------- ... ---+------------------------+
//!                                            ^ payload + offset
//! ```
//!
//! `tag` counts the buffer handles (0 to 3). Before transmission every handle
//! is replaced in place by the device address of the buffer it names.

use std::ops::Range;

use crate::{BufferHandle, DeviceAddr, ProtocolError};

/// Number of buffer handles a RAW payload references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MapType {
    /// No buffers.
    None = 0,
    /// One buffer.
    OneBuf = 1,
    /// Two buffers.
    TwoBuf = 2,
    /// Three buffers.
    ThreeBuf = 3,
}

impl MapType {
    /// Decode a descriptor tag.
    pub fn from_u32(tag: u32) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::OneBuf),
            2 => Ok(Self::TwoBuf),
            3 => Ok(Self::ThreeBuf),
            other => Err(ProtocolError::InvalidMapType(other)),
        }
    }

    /// Handles carried by a payload with this tag.
    pub fn buffer_count(self) -> usize {
        self as usize
    }
}

/// Parsed map descriptor of a RAW payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapDescriptor {
    /// How many handles follow at `offset`.
    pub map_type: MapType,
    /// Byte offset of the handle array inside the payload.
    pub offset: i32,
}

impl MapDescriptor {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Descriptor for `map_type` handles starting at `offset`.
    pub fn new(map_type: MapType, offset: i32) -> Self {
        Self { map_type, offset }
    }

    /// Encoded form, to be placed at the start of a payload.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&(self.map_type as u32).to_le_bytes());
        out[4..].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Read and validate the descriptor at the start of `payload`.
    ///
    /// The tag is checked first; the handle array is only bounds-checked when
    /// the tag announces at least one handle.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < Self::SIZE {
            return Err(ProtocolError::Truncated { expected: Self::SIZE, actual: payload.len() });
        }

        let tag = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let map_type = MapType::from_u32(tag)?;
        let offset = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);

        let descriptor = Self { map_type, offset };
        if map_type != MapType::None {
            descriptor.handle_range(payload.len())?;
        }
        Ok(descriptor)
    }

    /// Byte range of the handle array inside a payload of `len` bytes.
    pub fn handle_range(&self, len: usize) -> Result<Range<usize>, ProtocolError> {
        let count = self.map_type.buffer_count();
        let out_of_bounds =
            || ProtocolError::MapOutOfBounds { offset: i64::from(self.offset), count, len };

        let start = usize::try_from(self.offset).map_err(|_| out_of_bounds())?;
        let end = start
            .checked_add(count * std::mem::size_of::<BufferHandle>())
            .ok_or_else(out_of_bounds)?;
        if end > len {
            return Err(out_of_bounds());
        }
        Ok(start..end)
    }
}

/// Replace every buffer handle referenced by `payload` with the device
/// address `resolve` returns for it.
///
/// Handles are processed in array order and overwritten in place. The first
/// error aborts the rewrite and is returned; handles before it stay
/// rewritten, so a failed payload must not be transmitted or reused.
///
/// Returns the number of handles rewritten.
pub fn rewrite_buffer_refs<F, E>(payload: &mut [u8], mut resolve: F) -> Result<usize, E>
where
    F: FnMut(BufferHandle) -> Result<DeviceAddr, E>,
    E: From<ProtocolError>,
{
    let descriptor = MapDescriptor::parse(payload)?;
    if descriptor.map_type == MapType::None {
        return Ok(0);
    }

    let range = descriptor.handle_range(payload.len())?;
    let mut rewritten = 0;
    for slot in payload[range].chunks_exact_mut(4) {
        let handle = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
        let device_addr = resolve(handle)?;
        slot.copy_from_slice(&device_addr.to_le_bytes());
        rewritten += 1;
    }
    Ok(rewritten)
}
