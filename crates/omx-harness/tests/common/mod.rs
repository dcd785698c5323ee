//! Shared fixture for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use omx_core::{RegistryConfig, Service, ServiceRegistry, Session, Wait};
use omx_harness::{BrokerPolicy, FakePinner, LoopbackChannel, TableMapper};
use omx_proto::{BufferHandle, ConnectResponse, MapDescriptor, MapType, Message};
use tokio_util::sync::CancellationToken;

pub const SERVICE: &str = "rpmsg-omx0";
pub const REMOTE: u32 = 1;
pub const BROKER: u32 = 60;
pub const DST: u32 = 42;

/// Buffer sources known to the pinner. 7 and 9 translate to 0x1000 and
/// 0x2000, 11 lies outside the remote's memory map, 13 has no ranges.
pub const MAPPED_A: u64 = 7;
pub const MAPPED_B: u64 = 9;
pub const UNMAPPED: u64 = 11;
pub const EMPTY: u64 = 13;

pub struct Fixture {
    pub registry: ServiceRegistry,
    pub mapper: Arc<TableMapper>,
    pub pinner: Arc<FakePinner>,
    pub channel: Arc<LoopbackChannel>,
    pub service: Arc<Service>,
    pub cancel: CancellationToken,
}

impl Fixture {
    pub fn new(policy: BrokerPolicy) -> Self {
        let mapper = Arc::new(TableMapper::new());
        mapper.map(REMOTE, 0x8000_0000, 0, 0x10_0000);

        let pinner = Arc::new(FakePinner::new());
        pinner.add_buffer(MAPPED_A, 0x8000_1000, 4096);
        pinner.add_buffer(MAPPED_B, 0x8000_2000, 4096);
        pinner.add_buffer(UNMAPPED, 0x9000_0000, 4096);
        pinner.add_scatter(EMPTY, Vec::new());

        let registry =
            ServiceRegistry::new(RegistryConfig::default(), mapper.clone(), pinner.clone());
        let channel = LoopbackChannel::spawn(REMOTE, BROKER, policy);
        let service = registry.bind_transport(SERVICE, channel.clone()).unwrap();

        Self { registry, mapper, pinner, channel, service, cancel: CancellationToken::new() }
    }

    pub fn accepting() -> Self {
        Self::new(BrokerPolicy::Accept { addr: DST })
    }

    pub async fn open(&self) -> Session {
        Session::open(&self.service, Wait::Blocking, &self.cancel).await.unwrap()
    }

    pub async fn connected(&self) -> Session {
        let session = self.open().await;
        session.connect("svcA", &self.cancel).await.unwrap();
        session
    }

    /// Deliver a RAW message to `session` from the connected component.
    pub fn deliver_raw(&self, session: &Session, payload: &[u8]) {
        let frame = Message::Raw(Bytes::copy_from_slice(payload)).encode().unwrap();
        self.channel.inject(session.local_addr(), DST, frame);
    }

    /// Deliver a connect response to `session` from the broker.
    pub fn deliver_response(&self, session: &Session, status: u32, addr: u32) {
        let frame = Message::ConnectResponse(ConnectResponse { status, addr }).encode().unwrap();
        self.channel.inject(session.local_addr(), BROKER, frame);
    }
}

/// RAW payload whose map descriptor points at `handles` right after it,
/// followed by `tail`.
pub fn payload_with_handles(map_type: MapType, handles: &[BufferHandle], tail: &[u8]) -> Vec<u8> {
    let mut payload = MapDescriptor::new(map_type, 8).to_bytes().to_vec();
    for handle in handles {
        payload.extend_from_slice(&handle.to_le_bytes());
    }
    payload.extend_from_slice(tail);
    payload
}

/// Payload carrying no buffer references.
pub fn plain_payload(tail: &[u8]) -> Vec<u8> {
    payload_with_handles(MapType::None, &[], tail)
}

pub fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}
