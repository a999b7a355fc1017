//! In-memory desk and adapter used by the unit tests.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::protocol::{encode_position, DeskCommand, CONTROL_SERVICE_UUID};
use crate::infrastructure::bluetooth::transport::{
    AdapterEvent, Advertisement, BleAdapter, BleError, DeskCharacteristics, DeskLink,
};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Simulated desk. While a direction command is active every position read
/// moves the desk by `step_cm`, bounded by `min_cm..=max_cm`.
#[derive(Debug)]
pub struct MockDesk {
    pub position_cm: f64,
    pub speed: u16,
    pub step_cm: f64,
    pub min_cm: f64,
    pub max_cm: f64,
    pub motion: Option<DeskCommand>,
    pub writes: Vec<(Instant, DeskCommand)>,
    pub reads: usize,
    pub connected: bool,
    pub connects: usize,
    pub connect_attempts: usize,
    pub disconnects: usize,
    pub subscriptions: usize,
    pub failing_connects: usize,
    pub failing_writes: bool,
    pub missing_control: bool,
    /// Address only becomes known after the first connection
    pub address_hidden_until_connect: bool,
    notify_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl MockDesk {
    pub fn at(position_cm: f64) -> Self {
        Self {
            position_cm,
            speed: 0,
            step_cm: 0.0,
            min_cm: 0.0,
            max_cm: 65.0,
            motion: None,
            writes: Vec::new(),
            reads: 0,
            connected: false,
            connects: 0,
            connect_attempts: 0,
            disconnects: 0,
            subscriptions: 0,
            failing_connects: 0,
            failing_writes: false,
            missing_control: false,
            address_hidden_until_connect: false,
            notify_tx: None,
        }
    }

    pub fn moving_by(mut self, step_cm: f64) -> Self {
        self.step_cm = step_cm;
        self.max_cm = self.max_cm.max(self.position_cm);
        self
    }

    pub fn commands(&self) -> Vec<DeskCommand> {
        self.writes.iter().map(|(_, command)| *command).collect()
    }

    fn advance(&mut self) {
        let delta = match self.motion {
            Some(DeskCommand::Up) => self.step_cm,
            Some(DeskCommand::Down) => -self.step_cm,
            _ => 0.0,
        };
        let next = (self.position_cm + delta).clamp(self.min_cm, self.max_cm);
        self.speed = if next == self.position_cm { 0 } else { 100 };
        self.position_cm = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCharacteristic {
    Position,
    Control,
}

#[derive(Clone)]
pub struct MockLink {
    address: DeviceAddress,
    desk: Arc<Mutex<MockDesk>>,
}

impl MockLink {
    pub fn new(desk: MockDesk) -> Self {
        Self::with_address(DeviceAddress::new("E8:5B:5B:24:22:E4"), desk)
    }

    pub fn with_address(address: DeviceAddress, desk: MockDesk) -> Self {
        Self {
            address,
            desk: Arc::new(Mutex::new(desk)),
        }
    }

    pub fn desk(&self) -> MutexGuard<'_, MockDesk> {
        self.desk.lock().unwrap()
    }

    pub fn notify(&self, bytes: Vec<u8>) {
        if let Some(tx) = &self.desk().notify_tx {
            let _ = tx.send(bytes);
        }
    }

    fn visible_address(&self) -> DeviceAddress {
        let desk = self.desk();
        if desk.address_hidden_until_connect && desk.connects == 0 {
            DeviceAddress::new("00:00:00:00:00:00")
        } else {
            self.address.clone()
        }
    }
}

impl DeskLink for MockLink {
    type Characteristic = MockCharacteristic;

    async fn address(&self) -> DeviceAddress {
        self.visible_address()
    }

    async fn is_connected(&self) -> Result<bool, BleError> {
        Ok(self.desk().connected)
    }

    async fn connect(&self) -> Result<(), BleError> {
        let mut desk = self.desk();
        desk.connect_attempts += 1;
        if desk.failing_connects > 0 {
            desk.failing_connects -= 1;
            return Err(BleError::Transport("connection refused".to_string()));
        }
        desk.connected = true;
        desk.connects += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let mut desk = self.desk();
        desk.connected = false;
        desk.disconnects += 1;
        desk.notify_tx = None;
        Ok(())
    }

    async fn discover(&self) -> Result<DeskCharacteristics<MockCharacteristic>, BleError> {
        if self.desk().missing_control {
            return Err(BleError::MissingCharacteristic("control"));
        }
        Ok(DeskCharacteristics {
            position: MockCharacteristic::Position,
            control: MockCharacteristic::Control,
        })
    }

    async fn read(&self, characteristic: &MockCharacteristic) -> Result<Vec<u8>, BleError> {
        assert_eq!(*characteristic, MockCharacteristic::Position);
        let mut desk = self.desk();
        desk.reads += 1;
        desk.advance();
        Ok(encode_position(desk.position_cm, desk.speed))
    }

    async fn write_without_response(
        &self,
        characteristic: &MockCharacteristic,
        data: &[u8],
    ) -> Result<(), BleError> {
        assert_eq!(*characteristic, MockCharacteristic::Control);
        let mut desk = self.desk();
        if desk.failing_writes {
            return Err(BleError::Transport("write failed".to_string()));
        }
        let command = DeskCommand::from_bytes(data).expect("unknown opcode");
        desk.writes.push((Instant::now(), command));
        desk.motion = match command {
            DeskCommand::Stop => None,
            direction => Some(direction),
        };
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &MockCharacteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>, BleError> {
        assert_eq!(*characteristic, MockCharacteristic::Position);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut desk = self.desk();
        desk.subscriptions += 1;
        desk.notify_tx = Some(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|bytes| (bytes, rx))
        })
        .boxed())
    }
}

struct MockPeripheral {
    services: Vec<Uuid>,
    link: MockLink,
}

#[derive(Default)]
pub struct MockAdapterState {
    pub powered: bool,
    pub scanning: bool,
    pub scan_starts: usize,
    pub scan_stops: usize,
    pub failing_scans: usize,
    /// Event stream requests that fail as if no adapter were present
    pub failing_event_streams: usize,
    peripherals: HashMap<u32, MockPeripheral>,
}

/// Adapter whose events are pushed by the test through [`MockAdapter::emit`].
#[derive(Clone)]
pub struct MockAdapter {
    state: Arc<Mutex<MockAdapterState>>,
    events_tx: mpsc::UnboundedSender<AdapterEvent<u32>>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent<u32>>>>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::default(),
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockAdapterState> {
        self.state.lock().unwrap()
    }

    /// Register a peripheral; returns its link so tests can inspect the desk.
    pub fn add_desk(&self, id: u32, address: &str, services: Vec<Uuid>, desk: MockDesk) -> MockLink {
        let link = MockLink::with_address(DeviceAddress::new(address), desk);
        self.state().peripherals.insert(
            id,
            MockPeripheral {
                services,
                link: link.clone(),
            },
        );
        link
    }

    pub fn add_idasen(&self, id: u32, address: &str, desk: MockDesk) -> MockLink {
        self.add_desk(id, address, vec![CONTROL_SERVICE_UUID], desk)
    }

    pub fn emit(&self, event: AdapterEvent<u32>) {
        if matches!(event, AdapterEvent::PoweredOn) {
            self.state().powered = true;
        }
        if matches!(event, AdapterEvent::PoweredOff) {
            let mut state = self.state();
            state.powered = false;
            state.scanning = false;
        }
        let _ = self.events_tx.send(event);
    }
}

impl BleAdapter for MockAdapter {
    type Id = u32;
    type Link = MockLink;

    async fn events(&self) -> Result<BoxStream<'static, AdapterEvent<u32>>, BleError> {
        {
            let mut state = self.state();
            if state.failing_event_streams > 0 {
                state.failing_event_streams -= 1;
                return Err(BleError::NoAdapter);
            }
        }
        let rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BleError::Transport("events already taken".to_string()))?;
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn is_powered_on(&self) -> Result<bool, BleError> {
        Ok(self.state().powered)
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        let mut state = self.state();
        state.scan_starts += 1;
        if state.failing_scans > 0 {
            state.failing_scans -= 1;
            return Err(BleError::Transport("adapter busy".to_string()));
        }
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        let mut state = self.state();
        state.scan_stops += 1;
        state.scanning = false;
        Ok(())
    }

    async fn advertisement(&self, id: &u32) -> Result<Advertisement, BleError> {
        let state = self.state();
        let peripheral = state
            .peripherals
            .get(id)
            .ok_or_else(|| BleError::Transport(format!("unknown peripheral {id}")))?;
        Ok(Advertisement {
            address: Some(peripheral.link.visible_address()),
            services: peripheral.services.clone(),
        })
    }

    async fn link(&self, id: &u32) -> Result<MockLink, BleError> {
        self.state()
            .peripherals
            .get(id)
            .map(|peripheral| peripheral.link.clone())
            .ok_or_else(|| BleError::Transport(format!("unknown peripheral {id}")))
    }
}
