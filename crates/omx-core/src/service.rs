//! Service Registry
//!
//! Tracks the remote connection services by name and survives remote
//! endpoint crashes.
//!
//! ## Responsibilities
//!
//! - Service identity: one [`Service`] per advertised name, each with a
//!   unique minor number out of a fixed pool
//! - Transport binding: install a [`Channel`] when the remote endpoint comes
//!   up, wake sessions waiting to open
//! - Crash recovery: fail every open session and drop the channel, keeping
//!   the service so a restarted endpoint can bind to it again
//!
//! ## Design
//!
//! - Two-phase lifecycle: identity lives as long as the registry entry,
//!   the binding is an explicit [`Binding`] tag that crash recovery flips
//! - Sessions are held weakly so a crash sweep never keeps a closed session
//!   alive; a closing session removes itself through [`Service::detach`]
//! - Lock order is service, then session. Sessions never take the service
//!   lock while holding their own.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    AddressTranslator, BufferPinner, Channel, MemoryMapper, RegistryConfig, RegistryError,
    SessionConfig, SessionError, Wait,
    session::{SessionId, SessionShared},
};

/// Transport binding of a service.
#[derive(Clone)]
pub enum Binding {
    /// No remote endpoint is reachable.
    Unbound,
    /// The remote endpoint is alive behind this channel.
    Bound(Arc<dyn Channel>),
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbound => f.write_str("Unbound"),
            Self::Bound(channel) => f.debug_tuple("Bound").field(&channel.remote()).finish(),
        }
    }
}

struct ServiceInner {
    binding: Binding,
    sessions: BTreeMap<SessionId, Weak<SessionShared>>,
    withdrawn: bool,
}

/// One remote endpoint offering named connection brokering.
pub struct Service {
    name: String,
    minor: u32,
    inner: Mutex<ServiceInner>,
    /// Signalled whenever the binding changes or the service is withdrawn.
    bound: Notify,
    translator: AddressTranslator,
    pinner: Arc<dyn BufferPinner>,
    config: SessionConfig,
    next_session_id: AtomicU64,
}

impl Service {
    fn new(
        name: String,
        minor: u32,
        translator: AddressTranslator,
        pinner: Arc<dyn BufferPinner>,
        config: SessionConfig,
    ) -> Self {
        Self {
            name,
            minor,
            inner: Mutex::new(ServiceInner {
                binding: Binding::Unbound,
                sessions: BTreeMap::new(),
                withdrawn: false,
            }),
            bound: Notify::new(),
            translator,
            pinner,
            config,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Advertised service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Minor identity assigned by the registry.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Current transport binding.
    pub fn binding(&self) -> Binding {
        self.inner.lock().binding.clone()
    }

    /// Whether a transport is currently bound.
    pub fn is_bound(&self) -> bool {
        matches!(self.inner.lock().binding, Binding::Bound(_))
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Session limits for this service.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    pub(crate) fn pinner(&self) -> Arc<dyn BufferPinner> {
        Arc::clone(&self.pinner)
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Wait until a transport is bound and return it.
    pub(crate) async fn wait_bound(
        &self,
        wait: Wait,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Channel>, SessionError> {
        loop {
            let bound = self.bound.notified();
            tokio::pin!(bound);
            bound.as_mut().enable();

            {
                let inner = self.inner.lock();
                if inner.withdrawn {
                    return Err(SessionError::Unreachable);
                }
                if let Binding::Bound(channel) = &inner.binding {
                    return Ok(Arc::clone(channel));
                }
            }

            if wait == Wait::NonBlocking {
                return Err(SessionError::Busy);
            }

            tokio::select! {
                () = &mut bound => {},
                () = cancel.cancelled() => return Err(SessionError::Interrupted),
            }
        }
    }

    /// Add a freshly opened session, provided `channel` is still the bound
    /// transport. Returns false if the binding changed since the session's
    /// endpoint was created on it.
    pub(crate) fn attach(&self, session: &Arc<SessionShared>, channel: &Arc<dyn Channel>) -> bool {
        let mut inner = self.inner.lock();
        match &inner.binding {
            Binding::Bound(current) if Arc::ptr_eq(current, channel) => {
                inner.sessions.insert(session.id(), Arc::downgrade(session));
                true
            },
            _ => false,
        }
    }

    /// Remove a closing session. Unknown ids are ignored.
    pub(crate) fn detach(&self, id: SessionId) {
        if self.inner.lock().sessions.remove(&id).is_none() {
            tracing::debug!(service = %self.name, session = id, "session already detached");
        }
    }

    fn bind(&self, channel: Arc<dyn Channel>) {
        {
            let mut inner = self.inner.lock();
            if let Binding::Bound(_) = inner.binding {
                tracing::warn!(service = %self.name, "replacing live transport binding");
            }
            inner.binding = Binding::Bound(channel);
        }
        self.bound.notify_waiters();
    }

    /// Drop the transport and fail every open session. Returns how many
    /// sessions moved to `Failed`; sessions that had already failed are
    /// not counted.
    fn unbind_and_fail(&self) -> usize {
        let mut inner = self.inner.lock();
        if let Binding::Unbound = std::mem::replace(&mut inner.binding, Binding::Unbound) {
            tracing::warn!(service = %self.name, "transport already unbound");
        }

        inner
            .sessions
            .values()
            .filter_map(Weak::upgrade)
            .filter(|session| session.invalidate())
            .count()
    }

    fn withdraw(&self) -> usize {
        let failed = self.unbind_and_fail();
        self.inner.lock().withdrawn = true;
        self.bound.notify_waiters();
        failed
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("minor", &self.minor)
            .field("binding", &inner.binding)
            .field("sessions", &inner.sessions.len())
            .finish()
    }
}

#[derive(Default)]
struct Services {
    by_name: HashMap<String, Arc<Service>>,
    minors: BTreeSet<u32>,
}

/// Name to [`Service`] mapping with crash recovery.
///
/// The registry lock only guards the map itself and is never held while a
/// service or session lock is taken.
pub struct ServiceRegistry {
    config: RegistryConfig,
    translator: AddressTranslator,
    pinner: Arc<dyn BufferPinner>,
    services: Mutex<Services>,
}

impl ServiceRegistry {
    /// Empty registry whose services translate through `mapper` and pin
    /// through `pinner`.
    pub fn new(
        config: RegistryConfig,
        mapper: Arc<dyn MemoryMapper>,
        pinner: Arc<dyn BufferPinner>,
    ) -> Self {
        Self {
            config,
            translator: AddressTranslator::new(mapper),
            pinner,
            services: Mutex::new(Services::default()),
        }
    }

    /// Look up `name`, creating an unbound service with the lowest free
    /// minor if it does not exist yet.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NoMinorAvailable` if every minor is taken
    pub fn find_or_create(&self, name: &str) -> Result<Arc<Service>, RegistryError> {
        let mut services = self.services.lock();
        if let Some(service) = services.by_name.get(name) {
            return Ok(Arc::clone(service));
        }

        let max = self.config.max_services;
        let minor = (0..max)
            .filter_map(|m| u32::try_from(m).ok())
            .find(|m| !services.minors.contains(m))
            .ok_or(RegistryError::NoMinorAvailable { max })?;

        let service = Arc::new(Service::new(
            name.to_string(),
            minor,
            self.translator.clone(),
            Arc::clone(&self.pinner),
            self.config.session.clone(),
        ));
        services.minors.insert(minor);
        services.by_name.insert(name.to_string(), Arc::clone(&service));

        tracing::info!(service = name, minor, "service created");
        Ok(service)
    }

    /// Service registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.lock().by_name.get(name).cloned()
    }

    /// All registered services, ordered by minor.
    pub fn services(&self) -> Vec<Arc<Service>> {
        let mut all: Vec<_> = self.services.lock().by_name.values().cloned().collect();
        all.sort_by_key(|service| service.minor());
        all
    }

    /// A remote endpoint advertising `name` became reachable through
    /// `channel`.
    ///
    /// Reuses the existing service after a crash, otherwise creates one.
    /// Sessions blocked in open are woken.
    pub fn bind_transport(
        &self,
        name: &str,
        channel: Arc<dyn Channel>,
    ) -> Result<Arc<Service>, RegistryError> {
        let service = self.find_or_create(name)?;
        tracing::info!(
            service = name,
            remote = channel.remote(),
            broker = channel.broker_addr(),
            "new connection service channel"
        );
        service.bind(channel);
        Ok(service)
    }

    /// The remote endpoint behind `name` crashed.
    ///
    /// Every open session is failed and its endpoint invalidated; the
    /// service stays registered, unbound, for a later
    /// [`ServiceRegistry::bind_transport`]. Returns the number of sessions
    /// that moved to `Failed`; sessions that had already failed are not
    /// counted.
    pub fn handle_crash(&self, name: &str) -> Result<usize, RegistryError> {
        let service = self.get(name).ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let failed = service.unbind_and_fail();
        tracing::warn!(service = name, failed, "remote endpoint crashed");
        Ok(failed)
    }

    /// The remote endpoint behind `name` is gone for good.
    ///
    /// Removes the service and recycles its minor. Sessions still open on
    /// it fail, and pending opens return `Unreachable`.
    pub fn withdraw(&self, name: &str) -> Result<usize, RegistryError> {
        let service = {
            let mut services = self.services.lock();
            let service = services
                .by_name
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            services.minors.remove(&service.minor());
            service
        };

        let failed = service.withdraw();
        tracing::info!(service = name, minor = service.minor(), failed, "service withdrawn");
        Ok(failed)
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("config", &self.config)
            .field("services", &self.services.lock().by_name.len())
            .finish()
    }
}
