//! Crash recovery and service lifecycle tests.
//!
//! A crash fails every open session exactly once but keeps the service, so a
//! restarted remote processor binds to the same identity and new sessions
//! work again (with whatever memory map the restart installed).

mod common;

use std::{sync::Arc, time::Duration};

use common::{DST, Fixture, MAPPED_A, REMOTE, SERVICE, payload_with_handles, u32_at};
use omx_core::{
    Binding, BufferDescriptor, RegistryConfig, RegistryError, ServiceRegistry, Session,
    SessionError, SessionState, Wait,
};
use omx_harness::{BrokerPolicy, FakePinner, LoopbackChannel, TableMapper};
use omx_proto::MapType;
use tokio_util::sync::CancellationToken;

fn restart(fixture: &Fixture) -> Arc<LoopbackChannel> {
    let channel = LoopbackChannel::spawn(REMOTE, 60, BrokerPolicy::Accept { addr: DST });
    let service = fixture.registry.bind_transport(SERVICE, channel.clone()).unwrap();
    assert!(Arc::ptr_eq(&service, &fixture.service));
    channel
}

#[tokio::test(start_paused = true)]
async fn crash_fails_every_session_once() {
    let fixture = Fixture::accepting();
    let connected = fixture.connected().await;
    let pending = fixture.open().await;

    assert_eq!(fixture.registry.handle_crash(SERVICE), Ok(2));

    assert_eq!(connected.state(), SessionState::Failed);
    assert_eq!(pending.state(), SessionState::Failed);
    assert!(!fixture.service.is_bound());
    assert!(matches!(fixture.service.binding(), Binding::Unbound));
    // Sessions stay attached until their owners close them.
    assert_eq!(fixture.service.session_count(), 2);
    assert_eq!(fixture.channel.endpoint_count(), 0);

    let mut destroyed = fixture.channel.destroyed();
    destroyed.sort_unstable();
    let mut expected = vec![connected.local_addr(), pending.local_addr()];
    expected.sort_unstable();
    assert_eq!(destroyed, expected);
}

#[tokio::test(start_paused = true)]
async fn repeated_crash_counts_only_newly_failed_sessions() {
    let fixture = Fixture::accepting();
    let stale = fixture.connected().await;
    assert_eq!(fixture.registry.handle_crash(SERVICE), Ok(1));

    let _channel = restart(&fixture);
    let fresh = fixture.connected().await;
    assert_eq!(fixture.service.session_count(), 2);

    assert_eq!(fixture.registry.handle_crash(SERVICE), Ok(1));
    assert_eq!(stale.state(), SessionState::Failed);
    assert_eq!(fresh.state(), SessionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn refused_session_is_not_counted_by_crash() {
    let fixture = Fixture::new(BrokerPolicy::Reject { status: 5 });
    let refused = fixture.open().await;
    assert_eq!(refused.connect("svcA", &fixture.cancel).await, Err(SessionError::Unreachable));
    assert_eq!(fixture.channel.endpoint_count(), 1);

    assert_eq!(fixture.registry.handle_crash(SERVICE), Ok(0));
    // The endpoint kept after the refusal is still released.
    assert_eq!(fixture.channel.endpoint_count(), 0);
    assert_eq!(fixture.channel.destroyed(), vec![refused.local_addr()]);
}

#[tokio::test(start_paused = true)]
async fn failed_session_stays_failed_after_rebind() {
    let fixture = Fixture::accepting();
    let old = fixture.connected().await;
    old.register_buffer(7, &BufferDescriptor { source: MAPPED_A, len: 4096 }).unwrap();

    fixture.registry.handle_crash(SERVICE).unwrap();
    let _channel = restart(&fixture);

    assert_eq!(old.state(), SessionState::Failed);
    assert_eq!(old.write(&payload_with_handles(MapType::None, &[], b"")), Err(SessionError::Unreachable));
    assert_eq!(old.buffer_address(7), Err(SessionError::Unreachable));
    assert_eq!(old.connect("svcA", &fixture.cancel).await, Err(SessionError::Unreachable));
}

#[tokio::test(start_paused = true)]
async fn new_session_works_after_restart() {
    let fixture = Fixture::accepting();
    let old = fixture.connected().await;
    fixture.registry.handle_crash(SERVICE).unwrap();
    old.close();
    assert_eq!(fixture.service.session_count(), 0);

    let channel = restart(&fixture);
    let session = fixture.connected().await;
    assert_eq!(session.destination(), Some(DST));

    let payload = payload_with_handles(MapType::None, &[], b"again");
    session.write(&payload).unwrap();
    let echo = session.read(64, Wait::Blocking, &fixture.cancel).await.unwrap();
    assert_eq!(&echo[..], &payload[..]);
    assert_eq!(channel.sent_to(DST).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_with_new_memory_map_is_honored() {
    let fixture = Fixture::accepting();
    fixture.registry.handle_crash(SERVICE).unwrap();

    fixture.mapper.unmap_all(REMOTE);
    fixture.mapper.map(REMOTE, 0x8000_0000, 0x4000_0000, 0x10_0000);
    let channel = restart(&fixture);
    channel.set_echo(false);

    let session = fixture.connected().await;
    session.register_buffer(7, &BufferDescriptor { source: MAPPED_A, len: 4096 }).unwrap();
    session.write(&payload_with_handles(MapType::OneBuf, &[7], b"")).unwrap();

    let sent = channel.sent_to(DST);
    assert_eq!(u32_at(&sent[0].data[12..], 8), 0x4000_1000);
}

#[tokio::test(start_paused = true)]
async fn open_waits_for_restart() {
    let fixture = Fixture::accepting();
    fixture.registry.handle_crash(SERVICE).unwrap();

    assert_eq!(
        Session::open(&fixture.service, Wait::NonBlocking, &fixture.cancel).await.unwrap_err(),
        SessionError::Busy
    );

    let (opened, channel) = tokio::join!(
        Session::open(&fixture.service, Wait::Blocking, &fixture.cancel),
        async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            restart(&fixture)
        }
    );

    let session = opened.unwrap();
    assert_eq!(session.state(), SessionState::Unconnected);
    assert_eq!(channel.endpoint_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn waiting_open_can_be_cancelled() {
    let mapper = Arc::new(TableMapper::new());
    let pinner = Arc::new(FakePinner::new());
    let registry = ServiceRegistry::new(RegistryConfig::default(), mapper, pinner);
    let service = registry.find_or_create(SERVICE).unwrap();
    let cancel = CancellationToken::new();

    let (opened, ()) = tokio::join!(Session::open(&service, Wait::Blocking, &cancel), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    assert_eq!(opened.unwrap_err(), SessionError::Interrupted);
    assert_eq!(service.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn withdraw_fails_sessions_and_frees_minor() {
    let fixture = Fixture::accepting();
    let session = fixture.connected().await;
    let minor = fixture.service.minor();

    assert_eq!(fixture.registry.withdraw(SERVICE), Ok(1));

    assert_eq!(session.state(), SessionState::Failed);
    assert!(fixture.registry.get(SERVICE).is_none());
    assert_eq!(
        Session::open(&fixture.service, Wait::Blocking, &fixture.cancel).await.unwrap_err(),
        SessionError::Unreachable
    );

    let replacement = fixture.registry.find_or_create("rpmsg-omx9").unwrap();
    assert_eq!(replacement.minor(), minor);
}

#[tokio::test(start_paused = true)]
async fn registry_runs_out_of_minors() {
    let fixture = Fixture::accepting();
    for index in 1..8 {
        let channel = LoopbackChannel::spawn(REMOTE, 60, BrokerPolicy::Silent);
        fixture.registry.bind_transport(&format!("rpmsg-omx{index}"), channel).unwrap();
    }

    let channel = LoopbackChannel::spawn(REMOTE, 60, BrokerPolicy::Silent);
    assert_eq!(
        fixture.registry.bind_transport("rpmsg-omx8", channel).unwrap_err(),
        RegistryError::NoMinorAvailable { max: 8 }
    );

    let minors: Vec<_> = fixture.registry.services().iter().map(|s| s.minor()).collect();
    assert_eq!(minors, (0..8).collect::<Vec<u32>>());
}

#[tokio::test(start_paused = true)]
async fn crash_of_unknown_service_is_not_found() {
    let fixture = Fixture::accepting();
    assert_eq!(
        fixture.registry.handle_crash("missing"),
        Err(RegistryError::NotFound("missing".to_string()))
    );
    assert!(fixture.service.is_bound());
}
