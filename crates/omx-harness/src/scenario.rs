//! End-to-end scenario over the loopback transport.
//!
//! Binds a service, opens and connects a session, registers a buffer and
//! exchanges seeded random RAW payloads that reference it. Optionally
//! crashes the remote processor, checks that the session observes the
//! failure, and recovers on a fresh transport with a different memory map.

use std::sync::Arc;

use omx_core::{
    BufferDescriptor, PhysAddr, RegistryConfig, RegistryError, RemoteId, Service, ServiceRegistry,
    Session, SessionError, Wait,
};
use omx_proto::{BufferHandle, EndpointAddr, MAX_PAYLOAD_SIZE, MapDescriptor, MapType};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;

use crate::{BrokerPolicy, FakePinner, LoopbackChannel, TableMapper};

/// Remote processor simulated by the scenario.
pub const REMOTE: RemoteId = 1;
/// Broker address of the simulated connection service.
pub const BROKER_ADDR: EndpointAddr = 60;
/// Address the broker hands out to connecting sessions.
pub const COMPONENT_ADDR: EndpointAddr = 100;

const BUFFER_HANDLE: BufferHandle = 1;
const BUFFER_SOURCE: u64 = 1;
const BUFFER_PHYS: PhysAddr = 0x8000_1000;
const BUFFER_LEN: usize = 4096;
const WINDOW_PHYS: PhysAddr = 0x8000_0000;
const WINDOW_LEN: u64 = 0x10_0000;
const DEVICE_BASE: u64 = 0x6000_0000;
const RESTART_DEVICE_BASE: u64 = 0x7000_0000;

/// Descriptor and one handle precede the random body.
const PREFIX_LEN: usize = MapDescriptor::SIZE + 4;

/// Scenario parameters.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Service name the remote processor advertises.
    pub service: String,
    /// Component to connect to through the broker.
    pub component: String,
    /// Payloads to exchange before the crash.
    pub messages: usize,
    /// Crash and recover the remote processor afterwards.
    pub crash: bool,
    /// Seed for payload generation.
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            service: "rpmsg-omx1".to_string(),
            component: "OMX.TI.DUCATI1.VIDEO.H264D".to_string(),
            messages: 16,
            crash: true,
            seed: 0,
        }
    }
}

/// What a scenario run observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioReport {
    /// Payloads echoed back intact.
    pub echoed: usize,
    /// Sessions failed by the simulated crash.
    pub failed_by_crash: usize,
    /// A new session worked on the restarted transport.
    pub recovered: bool,
}

/// Scenario failures.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// Service registry refused an operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The echo did not match the payload after buffer rewriting.
    #[error("echo {index} does not match the sent payload")]
    EchoMismatch {
        /// Index of the exchange.
        index: usize,
    },

    /// A session kept working after its remote processor crashed.
    #[error("session did not observe the crash")]
    CrashNotObserved,
}

/// Run the scenario on the current Tokio runtime.
pub async fn run(config: &ScenarioConfig) -> Result<ScenarioReport, ScenarioError> {
    let mapper = Arc::new(TableMapper::new());
    mapper.map(REMOTE, WINDOW_PHYS, DEVICE_BASE, WINDOW_LEN);
    let pinner = Arc::new(FakePinner::new());
    pinner.add_buffer(BUFFER_SOURCE, BUFFER_PHYS, BUFFER_LEN);

    let registry = ServiceRegistry::new(RegistryConfig::default(), mapper.clone(), pinner.clone());
    let cancel = CancellationToken::new();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut report = ScenarioReport::default();

    let channel = LoopbackChannel::spawn(REMOTE, BROKER_ADDR, BrokerPolicy::Accept {
        addr: COMPONENT_ADDR,
    });
    let service = registry.bind_transport(&config.service, channel.clone())?;
    let session = open_connected(&service, &config.component, &cancel).await?;

    for index in 0..config.messages {
        exchange(&session, &mut rng, index, &cancel).await?;
        report.echoed += 1;
    }
    tracing::info!(echoed = report.echoed, "exchange complete");

    if !config.crash {
        return Ok(report);
    }

    report.failed_by_crash = registry.handle_crash(&config.service)?;
    channel.shut_down();
    match session.read(MAX_PAYLOAD_SIZE, Wait::Blocking, &cancel).await {
        Err(SessionError::Unreachable) => {},
        _ => return Err(ScenarioError::CrashNotObserved),
    }
    session.close();
    tracing::info!(failed = report.failed_by_crash, "crash observed");

    mapper.unmap_all(REMOTE);
    mapper.map(REMOTE, WINDOW_PHYS, RESTART_DEVICE_BASE, WINDOW_LEN);
    let channel = LoopbackChannel::spawn(REMOTE, BROKER_ADDR, BrokerPolicy::Accept {
        addr: COMPONENT_ADDR,
    });
    let service = registry.bind_transport(&config.service, channel)?;
    let session = open_connected(&service, &config.component, &cancel).await?;
    exchange(&session, &mut rng, config.messages, &cancel).await?;
    report.echoed += 1;
    report.recovered = true;
    tracing::info!("recovered after restart");

    session.close();
    Ok(report)
}

async fn open_connected(
    service: &Arc<Service>,
    component: &str,
    cancel: &CancellationToken,
) -> Result<Session, ScenarioError> {
    let session = Session::open(service, Wait::Blocking, cancel).await?;
    session.connect(component, cancel).await?;
    session.register_buffer(BUFFER_HANDLE, &BufferDescriptor {
        source: BUFFER_SOURCE,
        len: BUFFER_LEN,
    })?;
    Ok(session)
}

async fn exchange(
    session: &Session,
    rng: &mut ChaCha8Rng,
    index: usize,
    cancel: &CancellationToken,
) -> Result<(), ScenarioError> {
    let mut payload = vec![0u8; PREFIX_LEN + rng.gen_range(0..=MAX_PAYLOAD_SIZE - PREFIX_LEN)];
    payload[..MapDescriptor::SIZE]
        .copy_from_slice(&MapDescriptor::new(MapType::OneBuf, 8).to_bytes());
    payload[MapDescriptor::SIZE..PREFIX_LEN].copy_from_slice(&BUFFER_HANDLE.to_le_bytes());
    rng.fill(&mut payload[PREFIX_LEN..]);

    session.write(&payload)?;
    let echo = session.read(MAX_PAYLOAD_SIZE, Wait::Blocking, cancel).await?;
    let device = session.buffer_address(BUFFER_HANDLE)?;

    let intact = echo.len() == payload.len()
        && echo[..MapDescriptor::SIZE] == payload[..MapDescriptor::SIZE]
        && echo[MapDescriptor::SIZE..PREFIX_LEN] == device.to_le_bytes()
        && echo[PREFIX_LEN..] == payload[PREFIX_LEN..];
    if !intact {
        return Err(ScenarioError::EchoMismatch { index });
    }

    tracing::debug!(index, len = payload.len(), device = format_args!("{device:#x}"), "echo verified");
    Ok(())
}
