//! Desk Session
//!
//! Owns the link to one desk, keeps its position current and drives the motor
//! in a closed loop towards a target height.
//!
//! A move keeps re-issuing the direction opcode (the desk stops on its own if
//! commands dry up), polls the position, and stops once it is within
//! [`STOP_TOLERANCE_CM`] of the target or the desk has stalled for
//! [`STALL_LIMIT`] consecutive polls. Starting a new move cancels the running
//! one and waits for its stop command before the first new motor write.

use crate::domain::models::{ConnectionState, DeskEvent, DeviceAddress};
use crate::domain::settings::Config;
use crate::infrastructure::bluetooth::protocol::{self, DeskCommand};
use crate::infrastructure::bluetooth::transport::{BleError, DeskCharacteristics, DeskLink};
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Distance from the target at which a move counts as arrived
pub const STOP_TOLERANCE_CM: f64 = 1.0;
/// Delay between position polls while moving
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Minimum spacing between repeated motor commands
pub const COMMAND_REFRESH: Duration = Duration::from_millis(300);
/// Consecutive non-progress polls after which the desk is considered stopped
pub const STALL_LIMIT: u32 = 5;
/// Delay before retrying a failed connection
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_position_cm: f64,
    pub connect_timeout: Duration,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_position_cm: config.desk_max_position,
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Ble(#[from] BleError),
    #[error("move task aborted: {0}")]
    Aborted(#[from] JoinError),
}

/// How a call to [`DeskSession::move_to`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Already within tolerance, no motor command was sent
    AlreadyThere,
    Reached,
    /// The desk stopped making progress (end stop or obstruction)
    Stalled,
    /// Superseded by a newer move or an explicit stop
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn towards(target_cm: f64, current_cm: f64) -> Self {
        if target_cm > current_cm {
            Self::Up
        } else {
            Self::Down
        }
    }

    fn remaining(self, current_cm: f64, target_cm: f64) -> f64 {
        match self {
            Self::Up => target_cm - current_cm,
            Self::Down => current_cm - target_cm,
        }
    }

    fn command(self) -> DeskCommand {
        match self {
            Self::Up => DeskCommand::Up,
            Self::Down => DeskCommand::Down,
        }
    }
}

struct LinkState<C> {
    connection: ConnectionState,
    characteristics: Option<DeskCharacteristics<C>>,
    /// `None` until the first frame arrives
    position_cm: Option<f64>,
    speed: u16,
    notifier: Option<JoinHandle<()>>,
}

struct ActiveMove {
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl ActiveMove {
    async fn cancel_and_wait(mut self) {
        self.cancel.cancel();
        // A dropped sender means the task is gone, which is just as final.
        let _ = self.finished.wait_for(|finished| *finished).await;
    }
}

pub struct DeskSession<L: DeskLink> {
    link: L,
    address: DeviceAddress,
    config: SessionConfig,
    state: Mutex<LinkState<L::Characteristic>>,
    connect_lock: AsyncMutex<()>,
    current_move: AsyncMutex<Option<ActiveMove>>,
    moving: AtomicBool,
    disconnect_requested: AtomicBool,
    events: broadcast::Sender<DeskEvent>,
}

impl<L: DeskLink> DeskSession<L> {
    pub fn new(
        link: L,
        address: DeviceAddress,
        config: SessionConfig,
        events: broadcast::Sender<DeskEvent>,
    ) -> Self {
        Self {
            link,
            address,
            config,
            state: Mutex::new(LinkState {
                connection: ConnectionState::Disconnected,
                characteristics: None,
                position_cm: None,
                speed: 0,
                notifier: None,
            }),
            connect_lock: AsyncMutex::new(()),
            current_move: AsyncMutex::new(None),
            moving: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            events,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn position_cm(&self) -> f64 {
        self.lock_state().position_cm.unwrap_or_default()
    }

    pub fn speed(&self) -> u16 {
        self.lock_state().speed
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_state().connection
    }

    pub fn is_moving(&self) -> bool {
        self.moving.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState<L::Characteristic>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_characteristics(&self) -> Option<DeskCharacteristics<L::Characteristic>> {
        let state = self.lock_state();
        match state.connection {
            ConnectionState::Ready => state.characteristics.clone(),
            _ => None,
        }
    }

    /// Connect, resolve characteristics, read the initial position and
    /// subscribe to notifications. Returns immediately when already ready.
    pub async fn ensure_connection(
        self: &Arc<Self>,
    ) -> Result<DeskCharacteristics<L::Characteristic>, BleError> {
        if let Some(characteristics) = self.ready_characteristics() {
            return Ok(characteristics);
        }

        let _connecting = self.connect_lock.lock().await;

        // Another caller may have finished while we waited for the lock.
        if let Some(characteristics) = self.ready_characteristics() {
            return Ok(characteristics);
        }
        if self.disconnect_requested.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }

        self.lock_state().connection = ConnectionState::Connecting;
        match self.establish().await {
            Ok(characteristics) => Ok(characteristics),
            Err(e) => {
                self.lock_state().connection = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<DeskCharacteristics<L::Characteristic>, BleError> {
        info!(address = %self.address, "Connecting to desk");

        if !self.link.is_connected().await? {
            tokio::time::timeout(self.config.connect_timeout, self.link.connect())
                .await
                .map_err(|_| BleError::Timeout(self.config.connect_timeout))??;
        }

        let characteristics = self.link.discover().await?;

        let initial = self.link.read(&characteristics.position).await?;
        self.update_position(&initial);

        let notifications = self.link.subscribe(&characteristics.position).await?;
        let notifier = tokio::spawn(forward_notifications(Arc::downgrade(self), notifications));

        let mut state = self.lock_state();
        if let Some(previous) = state.notifier.replace(notifier) {
            previous.abort();
        }
        state.characteristics = Some(characteristics.clone());
        state.connection = ConnectionState::Ready;
        drop(state);

        info!(address = %self.address, position_cm = self.position_cm(), "Desk ready");
        Ok(characteristics)
    }

    /// Keep trying to connect until it works or the session is explicitly
    /// disconnected.
    pub async fn maintain_connection(self: &Arc<Self>) -> Result<(), BleError> {
        loop {
            match self.ensure_connection().await {
                Ok(_) => return Ok(()),
                Err(e) if self.disconnect_requested.load(Ordering::SeqCst) => return Err(e),
                Err(e) => {
                    warn!(address = %self.address, "Failed to connect to desk: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Apply a position payload. Frames repeating the stored position are
    /// dropped without touching the speed or emitting an event.
    pub fn update_position(&self, bytes: &[u8]) -> bool {
        let frame = match protocol::decode_position(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(address = %self.address, "Ignoring position frame: {}", e);
                return false;
            }
        };

        {
            let mut state = self.lock_state();
            if state.position_cm == Some(frame.position_cm) {
                return false;
            }
            state.position_cm = Some(frame.position_cm);
            state.speed = frame.speed;
        }

        let _ = self.events.send(DeskEvent::PositionChanged {
            position_cm: frame.position_cm,
            speed: frame.speed,
        });
        true
    }

    async fn read_position(self: &Arc<Self>) -> Result<(), BleError> {
        let characteristics = self.ensure_connection().await?;
        let bytes = self.link.read(&characteristics.position).await?;
        self.update_position(&bytes);
        Ok(())
    }

    async fn send_command(self: &Arc<Self>, command: DeskCommand) -> Result<(), BleError> {
        let characteristics = self.ensure_connection().await?;
        self.link
            .write_without_response(&characteristics.control, command.as_bytes())
            .await
    }

    /// Move the desk to `target_cm`, clamped to the configured maximum.
    ///
    /// Any move already in flight is cancelled and awaited first, so its stop
    /// command always precedes this move's first motor command.
    pub async fn move_to(self: &Arc<Self>, target_cm: f64) -> Result<MoveOutcome, SessionError> {
        let target_cm = target_cm.min(self.config.max_position_cm);

        let mut current_move = self.current_move.lock().await;
        if let Some(previous) = current_move.take() {
            self.moving.store(false, Ordering::SeqCst);
            previous.cancel_and_wait().await;
        }

        self.ensure_connection().await?;
        let current_cm = self.position_cm();
        if (current_cm - target_cm).abs() <= STOP_TOLERANCE_CM {
            debug!(address = %self.address, current_cm, target_cm, "Desk already at target");
            return Ok(MoveOutcome::AlreadyThere);
        }

        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);
        *current_move = Some(ActiveMove {
            cancel: cancel.clone(),
            finished: finished_rx,
        });
        self.moving.store(true, Ordering::SeqCst);
        drop(current_move);

        // The loop runs detached so a caller giving up mid-move never skips
        // the stop command.
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = session.drive(target_cm, &cancel).await;
            session.moving.store(false, Ordering::SeqCst);
            let _ = finished_tx.send(true);
            outcome
        });

        Ok(task.await??)
    }

    async fn drive(
        self: &Arc<Self>,
        target_cm: f64,
        cancel: &CancellationToken,
    ) -> Result<MoveOutcome, BleError> {
        let start_cm = self.position_cm();
        let direction = Direction::towards(target_cm, start_cm);
        info!(address = %self.address, start_cm, target_cm, ?direction, "Moving desk");

        let mut last_position = start_cm;
        let mut last_speed = 0u16;
        let mut stalled_polls = 0u32;
        let mut last_command: Option<Instant> = None;
        let mut outcome = MoveOutcome::Reached;

        loop {
            if cancel.is_cancelled() {
                outcome = MoveOutcome::Cancelled;
                break;
            }
            if direction.remaining(self.position_cm(), target_cm) <= STOP_TOLERANCE_CM {
                break;
            }

            if last_command.map_or(true, |sent| sent.elapsed() >= COMMAND_REFRESH) {
                self.send_command(direction.command()).await?;
                last_command = Some(Instant::now());
            }

            tokio::time::sleep(POLL_INTERVAL).await;
            self.read_position().await?;

            let (position, speed) = {
                let state = self.lock_state();
                (state.position_cm.unwrap_or_default(), state.speed)
            };
            if position == last_position || (last_speed != 0 && speed == 0) {
                stalled_polls += 1;
            } else {
                stalled_polls = 0;
            }

            if stalled_polls >= STALL_LIMIT {
                warn!(address = %self.address, position, target_cm, "Desk stalled, stopping");
                outcome = MoveOutcome::Stalled;
                break;
            }

            last_position = position;
            last_speed = speed;
        }

        self.send_command(DeskCommand::Stop).await?;
        info!(address = %self.address, position_cm = self.position_cm(), ?outcome, "Move finished");
        Ok(outcome)
    }

    /// Cancel the running move, if any, and wait until it has sent its stop.
    pub async fn stop_moving(&self) {
        let mut current_move = self.current_move.lock().await;
        self.moving.store(false, Ordering::SeqCst);
        if let Some(previous) = current_move.take() {
            previous.cancel_and_wait().await;
        }
    }

    /// Drop the link on purpose. No reconnect will be attempted afterwards.
    pub async fn disconnect(&self) {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        self.mark_disconnected();
        if let Err(e) = self.link.disconnect().await {
            debug!(address = %self.address, "Ignoring disconnect error: {}", e);
        }
    }

    /// Record that the transport reported the link as gone.
    pub fn mark_disconnected(&self) {
        let mut state = self.lock_state();
        state.connection = ConnectionState::Disconnected;
        state.characteristics = None;
        if let Some(notifier) = state.notifier.take() {
            notifier.abort();
        }
    }
}

async fn forward_notifications<L: DeskLink>(
    session: Weak<DeskSession<L>>,
    mut notifications: BoxStream<'static, Vec<u8>>,
) {
    while let Some(bytes) = notifications.next().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.update_position(&bytes);
    }
    debug!("Position notifications ended");
}
