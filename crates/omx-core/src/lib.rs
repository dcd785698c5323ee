//! OMX connection service core
//!
//! Host-side gateway that lets clients open sessions to named components on
//! a remote offload processor, exchange datagrams with them and share
//! pinned host buffers by handle.
//!
//! # Architecture
//!
//! ```text
//!  ServiceRegistry ── name ──> Service ──(Binding)──> dyn Channel
//!                                 │                      ▲   │
//!                                 │ weak                 │   │ inbound
//!                                 ▼                      │   ▼
//!                              Session ── send ──────────┘  InboundHandler
//!                                 │
//!                                 ├── BufferRegistry ──> dyn BufferPinner
//!                                 └── AddressTranslator ─> dyn MemoryMapper
//! ```
//!
//! # Components
//!
//! - [`ServiceRegistry`]: services by name, transport binding, crash recovery
//! - [`Session`]: connect handshake, FIFO reads, buffer-rewriting writes
//! - [`BufferRegistry`]: per-session pinned buffers keyed by handle
//! - [`AddressTranslator`]: host physical to device addresses
//! - [`Channel`], [`MemoryMapper`], [`BufferPinner`]: collaborators supplied
//!   by the embedding environment
//!
//! Blocking operations are `async`, take a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) for
//! interruption and never hold a lock across a suspension point.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod readiness;
pub mod service;
pub mod session;
pub mod translate;

pub use buffer::{BufferDescriptor, BufferPinner, BufferRegistry, PhysRange, PinnedBuffer};
pub use channel::{Channel, InboundHandler, RemoteId};
pub use config::{RegistryConfig, SessionConfig};
pub use error::{
    BufferError, MapError, PinError, RegistryError, SessionError, TranslateError, TransportError,
};
pub use readiness::{Readiness, Wait};
pub use service::{Binding, Service, ServiceRegistry};
pub use session::{Session, SessionId, SessionState};
pub use translate::{AddressTranslator, MemoryMapper, PhysAddr};
