//! Fake memory map and buffer pinner.

use std::collections::HashMap;

use omx_core::{
    BufferDescriptor, BufferPinner, MapError, MemoryMapper, PhysAddr, PhysRange, PinError,
    PinnedBuffer, RemoteId,
};
use parking_lot::Mutex;

/// One linear region of host memory visible to a remote processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Host-physical start.
    pub phys: PhysAddr,
    /// Device address of `phys`.
    pub device: u64,
    /// Size in bytes.
    pub len: u64,
}

impl Window {
    fn translate(&self, phys: PhysAddr) -> Option<u64> {
        let offset = phys.checked_sub(self.phys)?;
        (offset < self.len).then(|| self.device + offset)
    }
}

/// [`MemoryMapper`] backed by a per-remote table of windows.
///
/// Remapping a remote (for example after a simulated restart) replaces its
/// windows; sessions pick up the new layout on their next write.
#[derive(Debug, Default)]
pub struct TableMapper {
    windows: Mutex<HashMap<RemoteId, Vec<Window>>>,
}

impl TableMapper {
    /// Empty map: every lookup fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `len` bytes at `phys` visible to `remote` at `device`.
    pub fn map(&self, remote: RemoteId, phys: PhysAddr, device: u64, len: u64) {
        self.windows.lock().entry(remote).or_default().push(Window { phys, device, len });
    }

    /// Drop every window of `remote`.
    pub fn unmap_all(&self, remote: RemoteId) {
        self.windows.lock().remove(&remote);
    }
}

impl MemoryMapper for TableMapper {
    fn physical_to_device(&self, remote: RemoteId, phys: PhysAddr) -> Result<u64, MapError> {
        self.windows
            .lock()
            .get(&remote)
            .and_then(|windows| windows.iter().find_map(|window| window.translate(phys)))
            .ok_or_else(|| MapError(format!("{phys:#x} is not mapped for remote {remote}")))
    }
}

#[derive(Debug, Default)]
struct PinnerState {
    /// Scatter lists of the buffers that can be pinned, by descriptor source.
    buffers: HashMap<u64, Vec<PhysRange>>,
    /// Live pins: token to source.
    pinned: HashMap<u64, u64>,
    next_token: u64,
    unpinned: usize,
}

/// [`BufferPinner`] over a table of pre-declared buffers.
#[derive(Debug, Default)]
pub struct FakePinner {
    state: Mutex<PinnerState>,
}

impl FakePinner {
    /// Pinner that knows no buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a contiguous buffer at `phys` for descriptor source `source`.
    pub fn add_buffer(&self, source: u64, phys: PhysAddr, len: usize) {
        self.add_scatter(source, vec![PhysRange { phys, offset: 0, len }]);
    }

    /// Declare a buffer with an explicit scatter list (may be empty).
    pub fn add_scatter(&self, source: u64, ranges: Vec<PhysRange>) {
        self.state.lock().buffers.insert(source, ranges);
    }

    /// Number of pins currently held.
    pub fn pinned(&self) -> usize {
        self.state.lock().pinned.len()
    }

    /// Number of successful unpins so far.
    pub fn unpinned(&self) -> usize {
        self.state.lock().unpinned
    }
}

impl BufferPinner for FakePinner {
    fn pin(&self, buffer: &BufferDescriptor) -> Result<PinnedBuffer, PinError> {
        let mut state = self.state.lock();
        let ranges = state
            .buffers
            .get(&buffer.source)
            .cloned()
            .ok_or_else(|| PinError(format!("unknown buffer {}", buffer.source)))?;

        state.next_token += 1;
        let token = state.next_token;
        state.pinned.insert(token, buffer.source);
        Ok(PinnedBuffer { token, ranges })
    }

    fn unpin(&self, pinned: PinnedBuffer) -> Result<(), PinError> {
        let mut state = self.state.lock();
        if state.pinned.remove(&pinned.token).is_none() {
            return Err(PinError(format!("token {} is not pinned", pinned.token)));
        }
        state.unpinned += 1;
        Ok(())
    }
}
