//! Transport channel abstraction.
//!
//! The shared-memory transport that moves raw messages between host and
//! remote endpoint addresses lives outside this crate. Everything here talks
//! to it through [`Channel`]; inbound traffic comes back through the
//! [`InboundHandler`] registered for each local endpoint.

use std::sync::Arc;

use omx_proto::EndpointAddr;

use crate::TransportError;

/// Identity of a remote processor, used for address translation.
pub type RemoteId = u32;

/// Receiver of messages addressed to one local endpoint.
///
/// Called from the transport's delivery context, concurrently with any
/// session operation. Implementations must not block on that context.
pub trait InboundHandler: Send + Sync {
    /// A message from `src` arrived for this endpoint.
    fn on_message(&self, data: &[u8], src: EndpointAddr);
}

/// Live transport to a remote endpoint advertising a connection service.
///
/// A channel exists only while the remote endpoint is alive. After a crash
/// the service drops its channel and a new one is bound on restart.
pub trait Channel: Send + Sync {
    /// Remote processor behind this channel.
    fn remote(&self) -> RemoteId;

    /// Address of the remote connection broker (connect and disconnect
    /// requests go there).
    fn broker_addr(&self) -> EndpointAddr;

    /// Send `data` from local endpoint `src` to remote address `dst`.
    fn send(&self, src: EndpointAddr, dst: EndpointAddr, data: &[u8]) -> Result<(), TransportError>;

    /// Allocate a fresh local endpoint whose inbound traffic goes to
    /// `handler`.
    fn create_endpoint(
        &self,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<EndpointAddr, TransportError>;

    /// Release a local endpoint. No delivery to it happens afterwards.
    fn destroy_endpoint(&self, addr: EndpointAddr);
}
