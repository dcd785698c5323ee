//! Error types for sessions, buffers and services.

use omx_proto::{BufferHandle, ProtocolError};
use thiserror::Error;

use crate::translate::PhysAddr;

/// Failure reported by a [`crate::Channel`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The channel has been torn down.
    #[error("transport closed")]
    Closed,

    /// No local endpoint address is left to hand out.
    #[error("no endpoint address available")]
    AddressExhausted,

    /// The message could not be queued for the remote side.
    #[error("send failed: {reason}")]
    Send {
        /// Transport specific description.
        reason: String,
    },
}

/// Failure of the remote processor memory map lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MapError(pub String);

/// Failure of the buffer pinning collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PinError(pub String);

/// Errors from physical to device address translation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// Remote endpoint not reachable (session failed or no transport bound).
    #[error("remote endpoint unavailable")]
    Unavailable,

    /// The memory map refused the address.
    #[error("no device mapping for {phys:#x}: {source}")]
    Rejected {
        /// Host physical address that was looked up.
        phys: PhysAddr,
        /// Mapper error.
        #[source]
        source: MapError,
    },

    /// The mapping exists but does not fit the 32-bit device address space.
    #[error("device address {device:#x} for {phys:#x} exceeds 32 bits")]
    OutOfRange {
        /// Host physical address that was looked up.
        phys: PhysAddr,
        /// Device address the mapper returned.
        device: u64,
    },
}

/// Errors from a session's buffer registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The handle is already registered in this session.
    #[error("buffer {0} already registered")]
    AlreadyRegistered(BufferHandle),

    /// The handle is not registered in this session.
    #[error("buffer {0} not registered")]
    NotFound(BufferHandle),

    /// Registry storage could not grow.
    #[error("out of memory registering buffer")]
    OutOfMemory,

    /// The buffer could not be pinned.
    #[error("pinning buffer {handle} failed: {source}")]
    PinFailed {
        /// Handle being registered.
        handle: BufferHandle,
        /// Pinner error.
        #[source]
        source: PinError,
    },
}

/// Errors from the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Every minor identity is in use.
    #[error("no minor available (limit {max})")]
    NoMinorAvailable {
        /// Configured service limit.
        max: usize,
    },

    /// No service with that name exists.
    #[error("service not found: {0}")]
    NotFound(String),
}

/// Errors returned to session callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// `connect` on a connected session.
    #[error("session already connected")]
    AlreadyConnected,

    /// Data operation before a successful connect.
    #[error("session not connected")]
    NotConnected,

    /// The remote endpoint is gone; the session must be closed.
    #[error("remote endpoint unreachable")]
    Unreachable,

    /// No connect response within the handshake timeout.
    #[error("connect handshake timed out")]
    Timeout,

    /// A blocking operation was cancelled by the caller.
    #[error("operation interrupted")]
    Interrupted,

    /// Non-blocking read with nothing queued.
    #[error("operation would block")]
    WouldBlock,

    /// Non-blocking open while no transport is bound.
    #[error("no transport bound to service")]
    Busy,

    /// Allocation of session resources failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Buffer registry failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Address translation failure.
    #[error("address translation failed: {0}")]
    Translation(TranslateError),

    /// Message rejected before transmission.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transport refused a send.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Returns true if retrying the same operation later may succeed.
    ///
    /// `Unreachable` is terminal: the session has to be closed and a new one
    /// opened once the service is bound again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::WouldBlock | Self::Timeout | Self::Interrupted | Self::Busy => true,

            Self::AlreadyConnected
            | Self::NotConnected
            | Self::Unreachable
            | Self::OutOfMemory
            | Self::Buffer(_)
            | Self::Translation(_)
            | Self::Protocol(_)
            | Self::Transport(_) => false,
        }
    }
}

impl From<TranslateError> for SessionError {
    fn from(err: TranslateError) -> Self {
        match err {
            TranslateError::Unavailable => Self::Unreachable,
            other => Self::Translation(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        assert!(SessionError::Timeout.is_transient());
        assert!(SessionError::WouldBlock.is_transient());
        assert!(SessionError::Interrupted.is_transient());
    }

    #[test]
    fn unreachable_is_terminal() {
        assert!(!SessionError::Unreachable.is_transient());
    }

    #[test]
    fn unavailable_translation_means_unreachable() {
        assert_eq!(SessionError::from(TranslateError::Unavailable), SessionError::Unreachable);

        let rejected = TranslateError::Rejected { phys: 0x10, source: MapError("hole".into()) };
        assert_eq!(SessionError::from(rejected.clone()), SessionError::Translation(rejected));
    }

    #[test]
    fn error_display() {
        let err = SessionError::from(BufferError::NotFound(7));
        assert_eq!(err.to_string(), "buffer 7 not registered");

        let err = TranslateError::OutOfRange { phys: 0x1000, device: 0x1_0000_0000 };
        assert_eq!(err.to_string(), "device address 0x100000000 for 0x1000 exceeds 32 bits");
    }
}
