//! In-memory transport with a scripted remote connection broker.
//!
//! Messages sent to the broker address are decoded and answered according
//! to a [`BrokerPolicy`]; messages sent anywhere else are optionally echoed
//! back to the sender. Every delivery goes through a Tokio task, never
//! inline from `send`, so handlers run on a separate context exactly like a
//! real transport's receive path.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use omx_core::{Channel, InboundHandler, RemoteId, TransportError};
use omx_proto::{ConnectResponse, EndpointAddr, Message};
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
};

/// First address handed out to local endpoints.
pub const FIRST_LOCAL_ADDR: EndpointAddr = 1024;

/// How the scripted broker answers connect requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerPolicy {
    /// Accept and tell the session to talk to `addr`.
    Accept {
        /// Destination handed back in the response.
        addr: EndpointAddr,
    },
    /// Refuse with a non-zero `status`.
    Reject {
        /// Error status carried by the response.
        status: u32,
    },
    /// Never answer.
    Silent,
}

/// A message that went through [`LoopbackChannel::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Local sender.
    pub src: EndpointAddr,
    /// Remote destination.
    pub dst: EndpointAddr,
    /// Encoded frame as handed to the transport.
    pub data: Bytes,
}

impl SentMessage {
    /// Decode the frame. `None` if it is malformed.
    pub fn message(&self) -> Option<Message> {
        Message::decode(&self.data).ok()
    }
}

struct Delivery {
    dst: EndpointAddr,
    src: EndpointAddr,
    data: Bytes,
}

struct LoopbackState {
    endpoints: HashMap<EndpointAddr, Arc<dyn InboundHandler>>,
    next_addr: Option<EndpointAddr>,
    policy: BrokerPolicy,
    echo: bool,
    fail_sends: bool,
    closed: bool,
    sent: Vec<SentMessage>,
    destroyed: Vec<EndpointAddr>,
}

struct Shared {
    state: Mutex<LoopbackState>,
    pending: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn finish_delivery(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Loopback [`Channel`] to a simulated remote processor.
pub struct LoopbackChannel {
    remote: RemoteId,
    broker: EndpointAddr,
    shared: Arc<Shared>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
}

impl LoopbackChannel {
    /// Start a loopback transport for `remote` whose broker listens on
    /// `broker`. Must be called from within a Tokio runtime.
    pub fn spawn(remote: RemoteId, broker: EndpointAddr, policy: BrokerPolicy) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(LoopbackState {
                endpoints: HashMap::new(),
                next_addr: Some(FIRST_LOCAL_ADDR),
                policy,
                echo: true,
                fail_sends: false,
                closed: false,
                sent: Vec::new(),
                destroyed: Vec::new(),
            }),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    let handler = shared.state.lock().endpoints.get(&delivery.dst).cloned();
                    match handler {
                        Some(handler) => handler.on_message(&delivery.data, delivery.src),
                        None => tracing::debug!(dst = delivery.dst, "no endpoint, message dropped"),
                    }
                    shared.finish_delivery();
                }
            })
        };

        Arc::new(Self { remote, broker, shared, deliveries: tx, task })
    }

    /// Change how connect requests are answered.
    pub fn set_policy(&self, policy: BrokerPolicy) {
        self.shared.state.lock().policy = policy;
    }

    /// Echo non-broker messages back to their sender (on by default).
    pub fn set_echo(&self, echo: bool) {
        self.shared.state.lock().echo = echo;
    }

    /// Make every subsequent send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.shared.state.lock().fail_sends = fail;
    }

    /// Simulate the remote processor going away: sends fail with
    /// `TransportError::Closed` and no endpoint can be created.
    pub fn shut_down(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.endpoints.clear();
    }

    /// Deliver `frame` to local endpoint `dst` as if `src` had sent it.
    pub fn inject(&self, dst: EndpointAddr, src: EndpointAddr, frame: impl Into<Bytes>) {
        self.queue(Delivery { dst, src, data: frame.into() });
    }

    /// Wait until every queued delivery has been handed to its handler.
    pub async fn settle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.shared.state.lock().sent.clone()
    }

    /// Messages sent to `dst`, in order.
    pub fn sent_to(&self, dst: EndpointAddr) -> Vec<SentMessage> {
        self.shared.state.lock().sent.iter().filter(|m| m.dst == dst).cloned().collect()
    }

    /// Number of live local endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.shared.state.lock().endpoints.len()
    }

    /// Endpoints destroyed so far, in order.
    pub fn destroyed(&self) -> Vec<EndpointAddr> {
        self.shared.state.lock().destroyed.clone()
    }

    fn queue(&self, delivery: Delivery) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.deliveries.send(delivery).is_err() {
            tracing::warn!("delivery task gone, message dropped");
            self.shared.finish_delivery();
        }
    }

    fn answer_broker(&self, policy: BrokerPolicy, src: EndpointAddr, data: &[u8]) {
        let request = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(src, "broker got malformed message: {}", e);
                return;
            },
        };

        let response = match (request, policy) {
            (Message::ConnectRequest { name }, BrokerPolicy::Accept { addr }) => {
                tracing::debug!(src, name = %name, addr, "broker accepted connection");
                ConnectResponse { status: 0, addr }
            },
            (Message::ConnectRequest { name }, BrokerPolicy::Reject { status }) => {
                tracing::debug!(src, name = %name, status, "broker refused connection");
                ConnectResponse { status, addr: 0 }
            },
            (Message::ConnectRequest { name }, BrokerPolicy::Silent) => {
                tracing::debug!(src, name = %name, "broker ignoring connection");
                return;
            },
            (Message::Disconnect { addr }, _) => {
                tracing::debug!(src, addr, "broker got disconnect");
                return;
            },
            (other, _) => {
                tracing::warn!(src, msg_type = ?other.message_type(), "broker got unexpected message");
                return;
            },
        };

        match Message::ConnectResponse(response).encode() {
            Ok(frame) => self.queue(Delivery { dst: src, src: self.broker, data: frame }),
            Err(e) => tracing::error!("encoding connect response failed: {}", e),
        }
    }
}

impl Channel for LoopbackChannel {
    fn remote(&self) -> RemoteId {
        self.remote
    }

    fn broker_addr(&self) -> EndpointAddr {
        self.broker
    }

    fn send(&self, src: EndpointAddr, dst: EndpointAddr, data: &[u8]) -> Result<(), TransportError> {
        let (policy, echo) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.fail_sends {
                return Err(TransportError::Send { reason: "injected failure".to_string() });
            }
            state.sent.push(SentMessage { src, dst, data: Bytes::copy_from_slice(data) });
            (state.policy, state.echo)
        };

        if dst == self.broker {
            self.answer_broker(policy, src, data);
        } else if echo {
            self.queue(Delivery { dst: src, src: dst, data: Bytes::copy_from_slice(data) });
        }
        Ok(())
    }

    fn create_endpoint(
        &self,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<EndpointAddr, TransportError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let addr = state.next_addr.ok_or(TransportError::AddressExhausted)?;
        state.next_addr = addr.checked_add(1);
        state.endpoints.insert(addr, handler);
        Ok(addr)
    }

    fn destroy_endpoint(&self, addr: EndpointAddr) {
        let mut state = self.shared.state.lock();
        state.destroyed.push(addr);
        if state.endpoints.remove(&addr).is_none() && !state.closed {
            tracing::warn!(addr, "destroying unknown endpoint");
        }
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("LoopbackChannel")
            .field("remote", &self.remote)
            .field("broker", &self.broker)
            .field("policy", &state.policy)
            .field("endpoints", &state.endpoints.len())
            .field("closed", &state.closed)
            .finish()
    }
}
