//! Per-session registry of pinned buffers.
//!
//! Registering a buffer pins it (makes it resident and describes it as a
//! list of host-physical ranges) and keeps it pinned until it is
//! unregistered or the owning session closes. RAW payloads refer to
//! registered buffers by handle; the session translates the recorded base
//! address into a device address when the payload is sent.

use std::{collections::HashMap, sync::Arc};

use omx_proto::BufferHandle;

use crate::{BufferError, PinError, translate::PhysAddr};

/// Caller description of the memory to register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Reference to the shareable memory object (for example an exported
    /// DMA buffer), interpreted only by the [`BufferPinner`].
    pub source: u64,
    /// Size of the buffer in bytes.
    pub len: usize,
}

/// One contiguous host-physical piece of a pinned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    /// Page-aligned start of the range.
    pub phys: PhysAddr,
    /// Offset of the buffer data inside the first page.
    pub offset: u32,
    /// Length in bytes.
    pub len: usize,
}

/// A buffer held resident by a [`BufferPinner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedBuffer {
    /// Pinner-private identifier of the mapping.
    pub token: u64,
    /// Scatter list of the buffer, in buffer order.
    pub ranges: Vec<PhysRange>,
}

impl PinnedBuffer {
    /// Host-physical address of the first byte of the buffer.
    pub fn base(&self) -> Option<PhysAddr> {
        self.ranges.first().map(|range| range.phys + u64::from(range.offset))
    }
}

/// Makes caller buffers resident for remote access.
pub trait BufferPinner: Send + Sync {
    /// Pin `buffer` and describe its physical layout.
    fn pin(&self, buffer: &BufferDescriptor) -> Result<PinnedBuffer, PinError>;

    /// Release a mapping returned by [`BufferPinner::pin`].
    fn unpin(&self, pinned: PinnedBuffer) -> Result<(), PinError>;
}

#[derive(Debug)]
struct Registration {
    pinned: PinnedBuffer,
    base: PhysAddr,
}

/// Handle to pinned-mapping table owned by one session.
///
/// Not synchronized on its own: the owning session keeps it behind its lock.
pub struct BufferRegistry {
    pinner: Arc<dyn BufferPinner>,
    entries: HashMap<BufferHandle, Registration>,
}

impl BufferRegistry {
    /// Empty registry pinning through `pinner`.
    pub fn new(pinner: Arc<dyn BufferPinner>) -> Self {
        Self { pinner, entries: HashMap::new() }
    }

    /// Pin `buffer` and record it under `handle`.
    ///
    /// Returns the host-physical base address. Any pin acquired here is
    /// released again if the registration does not complete.
    pub fn register(
        &mut self,
        handle: BufferHandle,
        buffer: &BufferDescriptor,
    ) -> Result<PhysAddr, BufferError> {
        if self.entries.contains_key(&handle) {
            return Err(BufferError::AlreadyRegistered(handle));
        }

        let pinned = self
            .pinner
            .pin(buffer)
            .map_err(|source| BufferError::PinFailed { handle, source })?;

        let Some(base) = pinned.base() else {
            self.release(handle, pinned);
            return Err(BufferError::PinFailed {
                handle,
                source: PinError("pinned buffer has no physical ranges".to_string()),
            });
        };

        if self.entries.try_reserve(1).is_err() {
            self.release(handle, pinned);
            return Err(BufferError::OutOfMemory);
        }

        tracing::debug!(handle, base = format_args!("{base:#x}"), "buffer pinned");
        self.entries.insert(handle, Registration { pinned, base });
        Ok(base)
    }

    /// Host-physical base address of a registered buffer.
    pub fn lookup(&self, handle: BufferHandle) -> Result<PhysAddr, BufferError> {
        self.entries.get(&handle).map(|entry| entry.base).ok_or(BufferError::NotFound(handle))
    }

    /// Remove `handle` and release its pin.
    ///
    /// The entry is gone even if the pinner fails to release it; that
    /// failure is logged.
    pub fn unregister(&mut self, handle: BufferHandle) -> Result<(), BufferError> {
        let entry = self.entries.remove(&handle).ok_or(BufferError::NotFound(handle))?;
        self.release(handle, entry.pinned);
        Ok(())
    }

    /// Unregister everything. Returns how many entries were released.
    pub fn drain(&mut self) -> usize {
        let entries: Vec<_> = self.entries.drain().collect();
        let count = entries.len();
        for (handle, entry) in entries {
            self.release(handle, entry.pinned);
        }
        count
    }

    /// Number of registered buffers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn release(&self, handle: BufferHandle, pinned: PinnedBuffer) {
        if let Err(e) = self.pinner.unpin(pinned) {
            tracing::error!(handle, "unpinning buffer failed: {}", e);
        }
    }
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry").field("entries", &self.entries.len()).finish()
    }
}
