//! Host physical to device address translation.

use std::sync::Arc;

use omx_proto::DeviceAddr;

use crate::{MapError, TranslateError, channel::RemoteId};

/// Host physical address.
pub type PhysAddr = u64;

/// Remote processor memory map (IOMMU view of host memory).
pub trait MemoryMapper: Send + Sync {
    /// Device address under which `remote` sees host address `phys`.
    fn physical_to_device(&self, remote: RemoteId, phys: PhysAddr) -> Result<u64, MapError>;
}

/// Translates host physical addresses for one remote endpoint.
///
/// Stateless apart from the shared mapper, so any number of sessions may
/// translate concurrently.
#[derive(Clone)]
pub struct AddressTranslator {
    mapper: Arc<dyn MemoryMapper>,
}

impl AddressTranslator {
    /// Translator backed by `mapper`.
    pub fn new(mapper: Arc<dyn MemoryMapper>) -> Self {
        Self { mapper }
    }

    /// Device address of `phys` on `remote`.
    ///
    /// `remote` is `None` when the caller can no longer reach the endpoint
    /// (failed session or unbound service); that yields
    /// [`TranslateError::Unavailable`] without consulting the mapper.
    pub fn translate(
        &self,
        remote: Option<RemoteId>,
        phys: PhysAddr,
    ) -> Result<DeviceAddr, TranslateError> {
        let remote = remote.ok_or(TranslateError::Unavailable)?;

        let device = self.mapper.physical_to_device(remote, phys).map_err(|source| {
            tracing::error!(remote, phys = format_args!("{phys:#x}"), "pa to da failed: {}", source);
            TranslateError::Rejected { phys, source }
        })?;

        DeviceAddr::try_from(device).map_err(|_| TranslateError::OutOfRange { phys, device })
    }
}

impl std::fmt::Debug for AddressTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressTranslator").finish_non_exhaustive()
    }
}
