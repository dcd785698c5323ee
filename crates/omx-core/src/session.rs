//! Client sessions.
//!
//! A [`Session`] is one client's connection to a remote component behind a
//! [`Service`]. It owns a local transport endpoint, the FIFO of raw messages
//! received on it and the buffers the client registered.
//!
//! ```text
//!           connect ok
//! Unconnected ---------> Connected
//!      |                     |
//!      | error status,       | crash
//!      | crash               v
//!      +---------------->  Failed  (terminal)
//! ```
//!
//! Inbound traffic arrives on the transport's delivery context through an
//! [`InboundHandler`] holding only a weak reference to the session. All
//! state transitions happen under the session lock; blocking operations
//! wait on [`Notify`] signals outside it.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use omx_proto::{
    BufferHandle, ConnectResponse, DeviceAddr, EndpointAddr, Message, MessageHeader, MessageType,
    rewrite_buffer_refs, split_frame,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    BufferDescriptor, BufferRegistry, Channel, InboundHandler, Readiness, Service, SessionError,
    Wait, translate::PhysAddr,
};

/// Identifier of a session within its service.
pub type SessionId = u64;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Opened, no successful handshake yet.
    Unconnected,
    /// Handshake completed; the destination address is valid.
    Connected,
    /// Remote endpoint gone or connection refused. Never left.
    Failed,
}

struct SessionCore {
    state: SessionState,
    /// Learned from the connect response; meaningful only when connected.
    dst: EndpointAddr,
    queue: VecDeque<Bytes>,
    buffers: BufferRegistry,
    /// Channel the local endpoint lives on. Taken by whoever destroys it.
    endpoint: Option<Arc<dyn Channel>>,
}

impl SessionCore {
    fn ensure_connected(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connected => Ok(()),
            SessionState::Unconnected => Err(SessionError::NotConnected),
            SessionState::Failed => Err(SessionError::Unreachable),
        }
    }
}

pub(crate) struct SessionShared {
    id: SessionId,
    service: Arc<Service>,
    local_addr: EndpointAddr,
    core: Mutex<SessionCore>,
    /// Handshake completion.
    reply: Notify,
    /// Queue became non-empty or the session failed.
    readable: Notify,
}

impl SessionShared {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// Fail the session and release its endpoint. Used by crash recovery.
    ///
    /// Returns `false` if the session had already failed; its endpoint is
    /// still released but waiters are not woken again.
    pub(crate) fn invalidate(&self) -> bool {
        let (newly_failed, endpoint) = {
            let mut core = self.core.lock();
            let previous = std::mem::replace(&mut core.state, SessionState::Failed);
            (previous != SessionState::Failed, core.endpoint.take())
        };

        if newly_failed {
            self.reply.notify_waiters();
            self.readable.notify_waiters();
        }

        if let Some(channel) = endpoint {
            channel.destroy_endpoint(self.local_addr);
        }
        newly_failed
    }

    fn deliver(&self, data: &[u8], src: EndpointAddr) {
        let (header, payload) = match split_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session = self.id, src, "dropping malformed message: {}", e);
                return;
            },
        };

        match header.message_type() {
            Some(MessageType::ConnectResponse) => match ConnectResponse::parse(payload) {
                Ok(response) => self.handle_connect_response(response),
                Err(e) => {
                    tracing::warn!(session = self.id, src, "ignoring connect response: {}", e);
                },
            },
            Some(MessageType::Raw) => self.enqueue(payload),
            _ => {
                tracing::warn!(
                    session = self.id,
                    src,
                    msg_type = header.msg_type(),
                    "unexpected message type"
                );
            },
        }
    }

    fn handle_connect_response(&self, response: ConnectResponse) {
        let failed = {
            let mut core = self.core.lock();
            core.dst = response.addr;
            if !response.is_success() {
                tracing::error!(session = self.id, status = response.status, "connect refused");
                core.state = SessionState::Failed;
            } else if core.state != SessionState::Failed {
                core.state = SessionState::Connected;
            }
            core.state == SessionState::Failed
        };

        if failed {
            self.readable.notify_waiters();
        }
        self.reply.notify_waiters();
    }

    fn enqueue(&self, payload: &[u8]) {
        let mut data = Vec::new();
        if data.try_reserve_exact(payload.len()).is_err() {
            tracing::warn!(session = self.id, len = payload.len(), "out of memory, message dropped");
            return;
        }
        data.extend_from_slice(payload);

        {
            let mut core = self.core.lock();
            if core.queue.try_reserve(1).is_err() {
                tracing::warn!(session = self.id, "out of memory, message dropped");
                return;
            }
            core.queue.push_back(Bytes::from(data));
        }
        self.readable.notify_waiters();
    }

    fn try_dequeue(&self, max_len: usize) -> Result<Option<Bytes>, SessionError> {
        let mut core = self.core.lock();
        core.ensure_connected()?;
        Ok(core.queue.pop_front().map(|mut message| {
            message.truncate(max_len);
            message
        }))
    }
}

struct EndpointHandler {
    session: Weak<SessionShared>,
}

impl InboundHandler for EndpointHandler {
    fn on_message(&self, data: &[u8], src: EndpointAddr) {
        match self.session.upgrade() {
            Some(session) => session.deliver(data, src),
            None => tracing::debug!(src, "message for closed session dropped"),
        }
    }
}

enum Wake {
    Signalled,
    TimedOut,
    Cancelled,
}

/// One client connection to a remote component.
///
/// Dropping a session closes it.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Open a session on `service`.
    ///
    /// With [`Wait::Blocking`] this waits until the service has a transport;
    /// otherwise an unbound service is `Busy`.
    ///
    /// # Errors
    ///
    /// - `SessionError::Busy` if non-blocking and no transport is bound
    /// - `SessionError::Interrupted` if `cancel` fires while waiting
    /// - `SessionError::OutOfMemory` if the local endpoint cannot be created
    /// - `SessionError::Unreachable` if the service is withdrawn or crashes
    ///   while the session is being set up
    pub async fn open(
        service: &Arc<Service>,
        wait: Wait,
        cancel: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let channel = service.wait_bound(wait, cancel).await?;
        let id = service.next_session_id();

        let mut created = Ok(0);
        let shared = Arc::new_cyclic(|weak: &Weak<SessionShared>| {
            let handler = Arc::new(EndpointHandler { session: weak.clone() });
            created = channel.create_endpoint(handler);
            let (local_addr, endpoint) = match &created {
                Ok(addr) => (*addr, Some(Arc::clone(&channel))),
                Err(_) => (0, None),
            };
            SessionShared {
                id,
                service: Arc::clone(service),
                local_addr,
                core: Mutex::new(SessionCore {
                    state: SessionState::Unconnected,
                    dst: 0,
                    queue: VecDeque::new(),
                    buffers: BufferRegistry::new(service.pinner()),
                    endpoint,
                }),
                reply: Notify::new(),
                readable: Notify::new(),
            }
        });

        if let Err(e) = created {
            tracing::error!(service = service.name(), "failed to create endpoint: {}", e);
            return Err(SessionError::OutOfMemory);
        }

        let session = Self { shared };
        if !service.attach(&session.shared, &channel) {
            tracing::warn!(service = service.name(), "transport changed while opening");
            session.shared.invalidate();
            return Err(SessionError::Unreachable);
        }

        tracing::debug!(
            service = service.name(),
            session = id,
            local_addr = session.shared.local_addr,
            "session opened"
        );
        Ok(session)
    }

    /// Connect to the remote component `name` through the service broker.
    ///
    /// Waits up to the configured handshake timeout for the response. A
    /// failed session always reports `Unreachable`, even if the wait also
    /// timed out.
    ///
    /// # Errors
    ///
    /// - `SessionError::AlreadyConnected` if already connected
    /// - `SessionError::Protocol` if `name` does not fit a connect request
    /// - `SessionError::Unreachable` if the session failed or the broker
    ///   refused the connection
    /// - `SessionError::Timeout` if no response arrived in time
    /// - `SessionError::Interrupted` if `cancel` fired first
    /// - `SessionError::Transport` if the request could not be sent
    pub async fn connect(&self, name: &str, cancel: &CancellationToken) -> Result<(), SessionError> {
        if self.state() == SessionState::Connected {
            return Err(SessionError::AlreadyConnected);
        }

        let request = Message::ConnectRequest { name: name.to_string() }.encode()?;

        let reply = self.shared.reply.notified();
        tokio::pin!(reply);
        reply.as_mut().enable();

        {
            let core = self.shared.core.lock();
            match core.state {
                SessionState::Connected => return Err(SessionError::AlreadyConnected),
                SessionState::Failed => return Err(SessionError::Unreachable),
                SessionState::Unconnected => {},
            }
            let channel = core.endpoint.as_ref().ok_or(SessionError::Unreachable)?;
            channel.send(self.shared.local_addr, channel.broker_addr(), &request).map_err(|e| {
                tracing::error!(session = self.shared.id, "sending connect request failed: {}", e);
                e
            })?;
        }
        tracing::debug!(session = self.shared.id, name, "connect request sent");

        let timeout = self.shared.service.config().handshake_timeout;
        let wake = tokio::select! {
            () = &mut reply => Wake::Signalled,
            () = tokio::time::sleep(timeout) => Wake::TimedOut,
            () = cancel.cancelled() => Wake::Cancelled,
        };

        match (self.state(), wake) {
            (SessionState::Failed, _) => Err(SessionError::Unreachable),
            (SessionState::Connected, _) => Ok(()),
            (SessionState::Unconnected, Wake::TimedOut) => Err(SessionError::Timeout),
            (SessionState::Unconnected, Wake::Cancelled) => Err(SessionError::Interrupted),
            (SessionState::Unconnected, Wake::Signalled) => {
                tracing::error!(session = self.shared.id, "woken without a connect response");
                Err(SessionError::Interrupted)
            },
        }
    }

    /// Take the oldest queued message, truncated to `max_len` bytes.
    ///
    /// Messages are datagrams: whatever does not fit in `max_len` is
    /// discarded.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotConnected` before a successful connect
    /// - `SessionError::Unreachable` once the session failed
    /// - `SessionError::WouldBlock` if non-blocking and nothing is queued
    /// - `SessionError::Interrupted` if `cancel` fires while waiting
    pub async fn read(
        &self,
        max_len: usize,
        wait: Wait,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SessionError> {
        loop {
            let readable = self.shared.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            if let Some(message) = self.shared.try_dequeue(max_len)? {
                return Ok(message);
            }
            if wait == Wait::NonBlocking {
                return Err(SessionError::WouldBlock);
            }

            tokio::select! {
                () = &mut readable => {},
                () = cancel.cancelled() => return Err(SessionError::Interrupted),
            }
            // Another reader may have taken the message; wait again.
        }
    }

    /// Send `payload` as a RAW message to the connected destination.
    ///
    /// Payloads longer than the frame allows are truncated; the return
    /// value is the number of payload bytes sent. Buffer handles referenced
    /// by the payload's map descriptor are replaced by device addresses in
    /// the transmitted copy; `payload` itself is not modified.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotConnected` before a successful connect
    /// - `SessionError::Unreachable` once the session failed
    /// - `SessionError::Protocol` if the map descriptor is malformed
    /// - `SessionError::Buffer` if a referenced handle is not registered
    /// - `SessionError::Translation` if a buffer has no device mapping
    /// - `SessionError::Transport` if the transport refused the message
    pub fn write(&self, payload: &[u8]) -> Result<usize, SessionError> {
        self.shared.core.lock().ensure_connected()?;

        let max = self.shared.service.config().max_payload();
        let payload = if payload.len() > max {
            tracing::warn!(session = self.shared.id, len = payload.len(), max, "truncating message");
            &payload[..max]
        } else {
            payload
        };

        let mut frame = Message::raw_frame(payload)?;
        let rewritten = rewrite_buffer_refs(&mut frame[MessageHeader::SIZE..], |handle| {
            self.buffer_address(handle)
        })?;

        let core = self.shared.core.lock();
        core.ensure_connected()?;
        let channel = core.endpoint.as_ref().ok_or(SessionError::Unreachable)?;
        channel.send(self.shared.local_addr, core.dst, &frame).map_err(|e| {
            tracing::error!(session = self.shared.id, dst = core.dst, "send failed: {}", e);
            e
        })?;

        tracing::trace!(session = self.shared.id, len = payload.len(), rewritten, "message sent");
        Ok(payload.len())
    }

    /// Pin `buffer` and make it referable as `handle` in written payloads.
    ///
    /// Returns the host-physical base address of the buffer.
    pub fn register_buffer(
        &self,
        handle: BufferHandle,
        buffer: &BufferDescriptor,
    ) -> Result<PhysAddr, SessionError> {
        Ok(self.shared.core.lock().buffers.register(handle, buffer)?)
    }

    /// Release the buffer registered as `handle`.
    pub fn unregister_buffer(&self, handle: BufferHandle) -> Result<(), SessionError> {
        Ok(self.shared.core.lock().buffers.unregister(handle)?)
    }

    /// Device address of the buffer registered as `handle`, translated for
    /// the remote processor currently behind the session.
    ///
    /// # Errors
    ///
    /// - `SessionError::Buffer` if `handle` is not registered
    /// - `SessionError::Unreachable` if the session failed
    /// - `SessionError::Translation` if the memory map rejects the buffer
    pub fn buffer_address(&self, handle: BufferHandle) -> Result<DeviceAddr, SessionError> {
        let (phys, remote) = {
            let core = self.shared.core.lock();
            let phys = core.buffers.lookup(handle)?;
            let remote = match core.state {
                SessionState::Failed => None,
                _ => core.endpoint.as_ref().map(|channel| channel.remote()),
            };
            (phys, remote)
        };
        Ok(self.shared.service.translator().translate(remote, phys)?)
    }

    /// Current readiness.
    ///
    /// `WRITABLE` is always set since the transport has no flow control. A
    /// failed session also reports `ERROR | READABLE`, so readers wake up
    /// and observe the failure.
    pub fn poll(&self) -> Readiness {
        let core = self.shared.core.lock();
        let mut readiness = Readiness::WRITABLE;
        if core.state == SessionState::Failed {
            readiness |= Readiness::ERROR | Readiness::READABLE;
        } else if !core.queue.is_empty() {
            readiness |= Readiness::READABLE;
        }
        readiness
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.shared.core.lock().state
    }

    /// Destination address, once connected.
    pub fn destination(&self) -> Option<EndpointAddr> {
        let core = self.shared.core.lock();
        (core.state == SessionState::Connected).then_some(core.dst)
    }

    /// Local endpoint address of this session.
    pub fn local_addr(&self) -> EndpointAddr {
        self.shared.local_addr
    }

    /// Identifier of this session within its service.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Service the session was opened on.
    pub fn service(&self) -> &Arc<Service> {
        &self.shared.service
    }

    /// Number of buffers currently registered.
    pub fn buffer_count(&self) -> usize {
        self.shared.core.lock().buffers.len()
    }

    /// Close the session. Same as dropping it.
    pub fn close(self) {}

    fn teardown(&self) {
        let shared = &self.shared;
        let endpoint = {
            let mut core = shared.core.lock();
            if core.state == SessionState::Connected
                && let Some(channel) = &core.endpoint
            {
                send_disconnect(channel.as_ref(), shared.local_addr, core.dst);
            }
            let released = core.buffers.drain();
            if released > 0 {
                tracing::debug!(session = shared.id, released, "released buffers");
            }
            core.queue.clear();
            core.endpoint.take()
        };

        shared.service.detach(shared.id);

        if let Some(channel) = endpoint {
            channel.destroy_endpoint(shared.local_addr);
        }
        tracing::debug!(session = shared.id, local_addr = shared.local_addr, "session closed");
    }
}

fn send_disconnect(channel: &dyn Channel, src: EndpointAddr, dst: EndpointAddr) {
    let result = Message::Disconnect { addr: dst }
        .encode()
        .map_err(SessionError::from)
        .and_then(|bytes| {
            channel.send(src, channel.broker_addr(), &bytes).map_err(SessionError::from)
        });

    match result {
        Ok(()) => tracing::debug!(src, dst, "disconnect sent"),
        Err(e) => tracing::error!(src, dst, "sending disconnect failed: {}", e),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("service", &self.shared.service.name())
            .field("local_addr", &self.shared.local_addr)
            .field("state", &core.state)
            .field("queued", &core.queue.len())
            .field("buffers", &core.buffers.len())
            .finish()
    }
}
