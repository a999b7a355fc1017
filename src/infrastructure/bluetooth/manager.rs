//! Discovery Manager
//!
//! Finds the desk, hands out the current [`DeskSession`] and re-acquires the
//! desk whenever the link or the adapter goes away.
//!
//! ```text
//! AdapterOff ──powered on──▶ Scanning ──match──▶ Binding ──connected──▶ Owning
//!     ▲                         ▲                                         │
//!     └──────powered off────────┴──────────────link lost──────────────────┘
//! ```

use crate::domain::models::{DeskEvent, DeviceAddress};
use crate::domain::settings::Config;
use crate::infrastructure::bluetooth::protocol::CONTROL_SERVICE_UUID;
use crate::infrastructure::bluetooth::session::{DeskSession, SessionConfig};
use crate::infrastructure::bluetooth::transport::{
    AdapterEvent, Advertisement, BleAdapter, BleError, DeskLink,
};
use futures::StreamExt;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Delay before retrying a failed scan
pub const SCAN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay before reopening the adapter after its event loop failed or ended
pub const ADAPTER_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bind only to this desk. Without it, the first peripheral advertising
    /// the desk control service is used.
    pub desk_address: Option<DeviceAddress>,
    pub session: SessionConfig,
}

impl From<&Config> for ManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            desk_address: config.desk_address.clone(),
            session: SessionConfig::from(config),
        }
    }
}

pub enum ManagerState<L: DeskLink> {
    AdapterOff,
    Scanning,
    /// A desk was selected and its session is connecting
    Binding(Arc<DeskSession<L>>),
    Owning(Arc<DeskSession<L>>),
}

impl<L: DeskLink> ManagerState<L> {
    pub fn session(&self) -> Option<&Arc<DeskSession<L>>> {
        match self {
            Self::Binding(session) | Self::Owning(session) => Some(session),
            Self::AdapterOff | Self::Scanning => None,
        }
    }
}

impl<L: DeskLink> Clone for ManagerState<L> {
    fn clone(&self) -> Self {
        match self {
            Self::AdapterOff => Self::AdapterOff,
            Self::Scanning => Self::Scanning,
            Self::Binding(session) => Self::Binding(Arc::clone(session)),
            Self::Owning(session) => Self::Owning(Arc::clone(session)),
        }
    }
}

impl<L: DeskLink> fmt::Debug for ManagerState<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterOff => f.write_str("AdapterOff"),
            Self::Scanning => f.write_str("Scanning"),
            Self::Binding(session) => write!(f, "Binding({})", session.address()),
            Self::Owning(session) => write!(f, "Owning({})", session.address()),
        }
    }
}

struct ManagerInner<A: BleAdapter> {
    adapter: A,
    config: ManagerConfig,
    state: watch::Sender<ManagerState<A::Link>>,
    bound_id: Mutex<Option<A::Id>>,
    probing: AsyncMutex<()>,
    events: broadcast::Sender<DeskEvent>,
}

pub struct DeskManager<A: BleAdapter> {
    inner: Arc<ManagerInner<A>>,
}

impl<A: BleAdapter> Clone for DeskManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: BleAdapter> DeskManager<A> {
    pub fn new(adapter: A, config: ManagerConfig) -> Self {
        let (state, _) = watch::channel(ManagerState::AdapterOff);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                adapter,
                config,
                state,
                bound_id: Mutex::new(None),
                probing: AsyncMutex::new(()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeskEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ManagerState<A::Link> {
        self.inner.state.borrow().clone()
    }

    /// The session of the desk currently being bound or owned, ready or not.
    pub fn current_session(&self) -> Option<Arc<DeskSession<A::Link>>> {
        self.inner.state.borrow().session().cloned()
    }

    /// Wait until a desk session is connected and owned.
    ///
    /// Every call subscribes afresh, so a session lost after a previous call
    /// resolved is never handed out again.
    pub async fn await_session(&self) -> Option<Arc<DeskSession<A::Link>>> {
        let mut state = self.inner.state.subscribe();
        let owning = state
            .wait_for(|state| matches!(state, ManagerState::Owning(_)))
            .await
            .ok()?;
        owning.session().cloned()
    }

    /// Process adapter events until the adapter's event stream ends.
    pub async fn run(&self) -> Result<(), BleError> {
        info!("Starting BLE");
        let mut events = self.inner.adapter.events().await?;

        if self.inner.adapter.is_powered_on().await.unwrap_or(false) {
            self.on_powered_on();
        }

        while let Some(event) = events.next().await {
            match event {
                AdapterEvent::PoweredOn => self.on_powered_on(),
                AdapterEvent::PoweredOff => self.on_powered_off().await,
                AdapterEvent::Discovered(id) => {
                    if self.current_session().is_none() {
                        let manager = self.clone();
                        tokio::spawn(async move { manager.process_peripheral(id).await });
                    }
                }
                AdapterEvent::Disconnected(id) => self.on_disconnected(&id).await,
            }
        }

        warn!("Adapter event stream ended");
        Ok(())
    }

    /// Keep the event loop alive for the life of the daemon. A missing or
    /// vanished adapter is treated like a powered-off one and retried every
    /// [`ADAPTER_RETRY_DELAY`].
    pub async fn run_with_retry(&self) {
        loop {
            match self.run().await {
                Ok(()) => warn!("BLE event loop ended, restarting"),
                Err(e) => warn!("Bluetooth unavailable, retrying in {:?}: {}", ADAPTER_RETRY_DELAY, e),
            }
            self.on_powered_off().await;
            tokio::time::sleep(ADAPTER_RETRY_DELAY).await;
        }
    }

    fn on_powered_on(&self) {
        debug!("Adapter powered on");
        let powered_up = self.inner.state.send_if_modified(|state| {
            if matches!(state, ManagerState::AdapterOff) {
                *state = ManagerState::Scanning;
                true
            } else {
                false
            }
        });
        if powered_up {
            self.start_scanning();
        }
    }

    async fn on_powered_off(&self) {
        debug!("Adapter powered off");
        let previous = self.inner.state.send_replace(ManagerState::AdapterOff);
        self.lock_bound_id().take();

        if let Some(session) = previous.session() {
            session.disconnect().await;
            let _ = self
                .inner
                .events
                .send(DeskEvent::SessionLost(session.address().clone()));
        }
    }

    async fn on_disconnected(&self, id: &A::Id) {
        {
            let mut bound_id = self.lock_bound_id();
            if bound_id.as_ref() != Some(id) {
                return;
            }
            bound_id.take();
        }

        let mut lost = None;
        self.inner.state.send_if_modified(|state| match state.session() {
            Some(session) => {
                lost = Some(Arc::clone(session));
                *state = ManagerState::Scanning;
                true
            }
            None => false,
        });

        if let Some(session) = lost {
            info!(address = %session.address(), "Desk disconnected, going back to scanning");
            // stops a binding session from retrying in the background
            session.disconnect().await;
            let _ = self
                .inner
                .events
                .send(DeskEvent::SessionLost(session.address().clone()));
            self.start_scanning();
        }
    }

    fn lock_bound_id(&self) -> std::sync::MutexGuard<'_, Option<A::Id>> {
        self.inner
            .bound_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start scanning in the background, retrying failures every
    /// [`SCAN_RETRY_DELAY`] while the adapter stays powered and no desk is bound.
    fn start_scanning(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if manager.current_session().is_some() {
                    return;
                }
                match manager.inner.adapter.start_scan().await {
                    Ok(()) => {
                        info!("Scanning for desk");
                        return;
                    }
                    Err(e) => warn!("Failed to start scan, retrying: {}", e),
                }

                tokio::time::sleep(SCAN_RETRY_DELAY).await;
                if !manager.inner.adapter.is_powered_on().await.unwrap_or(false) {
                    return;
                }
            }
        });
    }

    fn is_candidate(&self, advertisement: &Advertisement) -> bool {
        let wanted = self.inner.config.desk_address.as_ref();
        if wanted.is_some() && wanted == advertisement.address.as_ref() {
            return true;
        }
        advertisement.services.contains(&CONTROL_SERVICE_UUID)
    }

    async fn process_peripheral(&self, id: A::Id) {
        let advertisement = match self.inner.adapter.advertisement(&id).await {
            Ok(advertisement) => advertisement,
            Err(e) => {
                debug!(?id, "Could not read advertisement: {}", e);
                return;
            }
        };
        if !self.is_candidate(&advertisement) {
            return;
        }

        let link = match self.inner.adapter.link(&id).await {
            Ok(link) => link,
            Err(e) => {
                warn!(?id, "Could not open desk peripheral: {}", e);
                return;
            }
        };

        let address = if self.inner.config.desk_address.is_some() {
            let Some(address) = self.ensure_address_known(&link, advertisement.address).await else {
                return;
            };
            address
        } else {
            match advertisement.address.filter(|address| !address.is_unresolved()) {
                Some(address) => address,
                None => {
                    let fallback = DeviceAddress::new(format!("{id:?}"));
                    debug!(%fallback, "Address not advertised, naming desk by peripheral id");
                    fallback
                }
            }
        };
        let _ = self.inner.events.send(DeskEvent::Discovered(address.clone()));

        if let Some(wanted) = &self.inner.config.desk_address {
            if *wanted != address {
                info!(%address, "Discovered a desk, but not the configured one");
                return;
            }
        }

        self.bind(id, link, address).await;
    }

    /// Some platforms only reveal a peripheral's address after a connection
    /// attempt, which matters only when a configured address has to match.
    /// Probe once with connect-then-disconnect; only one probe runs
    /// at a time and peripherals arriving meanwhile are skipped until their
    /// next advertisement.
    async fn ensure_address_known(
        &self,
        link: &A::Link,
        advertised: Option<DeviceAddress>,
    ) -> Option<DeviceAddress> {
        if let Some(address) = advertised.filter(|address| !address.is_unresolved()) {
            return Some(address);
        }

        let Ok(_probing) = self.inner.probing.try_lock() else {
            debug!("Address probe already running, skipping peripheral");
            return None;
        };

        debug!("Probing peripheral to resolve its address");
        if let Err(e) = link.connect().await {
            warn!("Address probe failed: {}", e);
            return None;
        }
        if let Err(e) = link.disconnect().await {
            debug!("Ignoring disconnect error after probe: {}", e);
        }

        let address = link.address().await;
        (!address.is_unresolved()).then_some(address)
    }

    async fn bind(&self, id: A::Id, link: A::Link, address: DeviceAddress) {
        let session = Arc::new(DeskSession::new(
            link,
            address.clone(),
            self.inner.config.session.clone(),
            self.inner.events.clone(),
        ));

        let bound = self.inner.state.send_if_modified(|state| {
            if matches!(state, ManagerState::Scanning) {
                *state = ManagerState::Binding(Arc::clone(&session));
                true
            } else {
                false
            }
        });
        if !bound {
            debug!(%address, "Another desk was bound first");
            return;
        }
        *self.lock_bound_id() = Some(id);
        info!(%address, "Found desk");

        if let Err(e) = self.inner.adapter.stop_scan().await {
            debug!("Ignoring stop scan error: {}", e);
        }

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.maintain_connection().await {
                debug!(address = %session.address(), "Gave up connecting: {}", e);
                return;
            }
            manager.promote(&session);
        });
    }

    /// Move a bound session to `Owning` unless it was replaced while connecting.
    fn promote(&self, session: &Arc<DeskSession<A::Link>>) {
        let promoted = self.inner.state.send_if_modified(|state| match state {
            ManagerState::Binding(bound) if Arc::ptr_eq(bound, session) => {
                *state = ManagerState::Owning(Arc::clone(session));
                true
            }
            _ => false,
        });

        if promoted {
            let _ = self
                .inner
                .events
                .send(DeskEvent::SessionReady(session.address().clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{MockAdapter, MockDesk};

    const DESK: &str = "E8:5B:5B:24:22:E4";
    const OTHER_DESK: &str = "C4:11:22:33:44:55";

    fn manager_with(adapter: &MockAdapter, desk_address: Option<&str>) -> DeskManager<MockAdapter> {
        let manager = DeskManager::new(
            adapter.clone(),
            ManagerConfig {
                desk_address: desk_address.map(DeviceAddress::new),
                session: SessionConfig {
                    max_position_cm: 58.0,
                    connect_timeout: Duration::from_secs(5),
                },
            },
        );
        let runner = manager.clone();
        tokio::spawn(async move { runner.run().await });
        manager
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_binds_first_peripheral_with_control_service() {
        let adapter = MockAdapter::new();
        adapter.add_desk(1, "11:22:33:44:55:66", vec![], MockDesk::at(0.0));
        let link = adapter.add_idasen(2, DESK, MockDesk::at(42.0));
        let manager = manager_with(&adapter, None);

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));
        adapter.emit(AdapterEvent::Discovered(2));

        let session = manager.await_session().await.unwrap();
        assert_eq!(session.address(), &DeviceAddress::new(DESK));
        assert_eq!(session.position_cm(), 42.0);
        assert_eq!(link.desk().connects, 1);
        assert!(!adapter.state().scanning);
        assert_eq!(adapter.state().scan_stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_address_wins() {
        let adapter = MockAdapter::new();
        adapter.add_idasen(1, OTHER_DESK, MockDesk::at(10.0));
        adapter.add_desk(2, DESK, vec![], MockDesk::at(20.0));
        let manager = manager_with(&adapter, Some(DESK));
        let mut events = manager.subscribe();

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));
        settle().await;
        assert!(manager.current_session().is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            DeskEvent::Discovered(DeviceAddress::new(OTHER_DESK))
        );

        adapter.emit(AdapterEvent::Discovered(2));
        let session = manager.await_session().await.unwrap();
        assert_eq!(session.address(), &DeviceAddress::new(DESK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_address_is_probed() {
        let adapter = MockAdapter::new();
        let mut desk = MockDesk::at(30.0);
        desk.address_hidden_until_connect = true;
        let link = adapter.add_idasen(1, DESK, desk);
        let manager = manager_with(&adapter, Some(DESK));

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));

        let session = manager.await_session().await.unwrap();
        assert_eq!(session.address(), &DeviceAddress::new(DESK));
        // probe connect + session connect
        assert_eq!(link.desk().connects, 2);
        assert_eq!(link.desk().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_address_binds_without_configured_desk() {
        let adapter = MockAdapter::new();
        let mut desk = MockDesk::at(30.0);
        desk.address_hidden_until_connect = true;
        let link = adapter.add_idasen(1, DESK, desk);
        let manager = manager_with(&adapter, None);

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));

        let session = manager.await_session().await.unwrap();
        assert_eq!(session.address(), &DeviceAddress::new("1"));
        assert_eq!(session.position_cm(), 30.0);
        // no connect-then-disconnect round before binding
        assert_eq!(link.desk().connects, 1);
        assert_eq!(link.desk().disconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_while_binding_stops_retries() {
        let adapter = MockAdapter::new();
        let mut desk = MockDesk::at(30.0);
        desk.failing_connects = 1000;
        let link = adapter.add_idasen(1, DESK, desk);
        let manager = manager_with(&adapter, None);

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));
        settle().await;
        assert!(matches!(manager.state(), ManagerState::Binding(_)));

        adapter.emit(AdapterEvent::Disconnected(1));
        settle().await;
        assert!(matches!(manager.state(), ManagerState::Scanning));

        let attempts = link.desk().connect_attempts;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(link.desk().connect_attempts, attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_rearms_and_rescans() {
        let adapter = MockAdapter::new();
        adapter.add_idasen(1, DESK, MockDesk::at(30.0));
        let manager = manager_with(&adapter, None);

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));
        let first = manager.await_session().await.unwrap();

        adapter.emit(AdapterEvent::Disconnected(1));
        settle().await;

        assert!(manager.current_session().is_none());
        assert!(matches!(manager.state(), ManagerState::Scanning));
        assert!(adapter.state().scanning);
        assert_eq!(adapter.state().scan_starts, 2);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), manager.await_session())
                .await
                .is_err()
        );

        adapter.emit(AdapterEvent::Discovered(1));
        let second = manager.await_session().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_of_other_peripheral_is_ignored() {
        let adapter = MockAdapter::new();
        adapter.add_idasen(1, DESK, MockDesk::at(30.0));
        let manager = manager_with(&adapter, None);

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));
        manager.await_session().await.unwrap();

        adapter.emit(AdapterEvent::Disconnected(7));
        settle().await;
        assert!(matches!(manager.state(), ManagerState::Owning(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_is_retried() {
        let adapter = MockAdapter::new();
        adapter.state().failing_scans = 1;
        let _manager = manager_with(&adapter, None);

        adapter.emit(AdapterEvent::PoweredOn);
        settle().await;
        assert_eq!(adapter.state().scan_starts, 1);
        assert!(!adapter.state().scanning);

        tokio::time::sleep(SCAN_RETRY_DELAY).await;
        assert_eq!(adapter.state().scan_starts, 2);
        assert!(adapter.state().scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_adapter_is_retried() {
        let adapter = MockAdapter::new();
        adapter.state().failing_event_streams = 2;
        adapter.add_idasen(1, DESK, MockDesk::at(30.0));
        let manager = DeskManager::new(
            adapter.clone(),
            ManagerConfig {
                desk_address: None,
                session: SessionConfig::from(&Config::default()),
            },
        );
        let runner = manager.clone();
        tokio::spawn(async move { runner.run_with_retry().await });

        adapter.emit(AdapterEvent::PoweredOn);
        settle().await;
        assert!(matches!(manager.state(), ManagerState::AdapterOff));
        assert_eq!(adapter.state().scan_starts, 0);

        tokio::time::sleep(ADAPTER_RETRY_DELAY).await;
        assert_eq!(adapter.state().scan_starts, 0);

        tokio::time::sleep(ADAPTER_RETRY_DELAY).await;
        assert!(adapter.state().scanning);
        adapter.emit(AdapterEvent::Discovered(1));
        let session = manager.await_session().await.unwrap();
        assert_eq!(session.position_cm(), 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_loss_drops_session() {
        let adapter = MockAdapter::new();
        let link = adapter.add_idasen(1, DESK, MockDesk::at(30.0));
        let manager = manager_with(&adapter, None);

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));
        let session = manager.await_session().await.unwrap();

        adapter.emit(AdapterEvent::PoweredOff);
        settle().await;

        assert!(matches!(manager.state(), ManagerState::AdapterOff));
        assert_eq!(link.desk().disconnects, 1);
        assert!(matches!(
            session.maintain_connection().await,
            Err(BleError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connection_keeps_binding_until_ready() {
        let adapter = MockAdapter::new();
        let mut desk = MockDesk::at(30.0);
        desk.failing_connects = 1;
        adapter.add_idasen(1, DESK, desk);
        let manager = manager_with(&adapter, None);

        adapter.emit(AdapterEvent::PoweredOn);
        adapter.emit(AdapterEvent::Discovered(1));
        settle().await;
        assert!(matches!(manager.state(), ManagerState::Binding(_)));

        let session = manager.await_session().await.unwrap();
        assert_eq!(session.position_cm(), 30.0);
    }
}
