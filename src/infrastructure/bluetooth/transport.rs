//! BLE Transport Capabilities
//!
//! The session and discovery logic only talk to the radio through these two
//! traits. [`btle`](super::btle) implements them on top of btleplug; tests use
//! an in-memory mock.

use crate::domain::models::DeviceAddress;
use futures::stream::BoxStream;
use std::fmt;
use std::future::Future;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BleError {
    #[error("bluetooth transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?} while connecting")]
    Timeout(std::time::Duration),
    #[error("missing {0} characteristic")]
    MissingCharacteristic(&'static str),
    #[error("position frame too short ({0} bytes)")]
    InvalidFrame(usize),
    #[error("desk was explicitly disconnected")]
    Disconnected,
    #[error("no bluetooth adapter available")]
    NoAdapter,
}

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// The two characteristics a desk must expose before it is usable.
#[derive(Debug, Clone)]
pub struct DeskCharacteristics<C> {
    pub position: C,
    pub control: C,
}

/// Connection to a single desk peripheral.
pub trait DeskLink: Send + Sync + 'static {
    type Characteristic: Clone + Send + Sync + 'static;

    /// Address as currently known by the platform, possibly unresolved.
    fn address(&self) -> impl Future<Output = DeviceAddress> + Send;

    fn is_connected(&self) -> impl Future<Output = Result<bool, BleError>> + Send;

    fn connect(&self) -> impl Future<Output = Result<(), BleError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), BleError>> + Send;

    /// Discover services and resolve the position and control characteristics.
    fn discover(
        &self,
    ) -> impl Future<Output = Result<DeskCharacteristics<Self::Characteristic>, BleError>> + Send;

    fn read(
        &self,
        characteristic: &Self::Characteristic,
    ) -> impl Future<Output = Result<Vec<u8>, BleError>> + Send;

    /// Fire-and-forget write; the desk does not acknowledge motor commands.
    fn write_without_response(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
    ) -> impl Future<Output = Result<(), BleError>> + Send;

    /// Enable notifications and return the stream of notified payloads.
    fn subscribe(
        &self,
        characteristic: &Self::Characteristic,
    ) -> impl Future<Output = Result<BoxStream<'static, Vec<u8>>, BleError>> + Send;
}

/// Adapter-level happenings, already narrowed to what discovery needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent<I> {
    PoweredOn,
    PoweredOff,
    Discovered(I),
    Disconnected(I),
}

#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub address: Option<DeviceAddress>,
    pub services: Vec<Uuid>,
}

/// A local BLE central.
pub trait BleAdapter: Send + Sync + 'static {
    type Id: Clone + Eq + fmt::Debug + Send + Sync + 'static;
    type Link: DeskLink;

    fn events(
        &self,
    ) -> impl Future<Output = Result<BoxStream<'static, AdapterEvent<Self::Id>>, BleError>> + Send;

    fn is_powered_on(&self) -> impl Future<Output = Result<bool, BleError>> + Send;

    fn start_scan(&self) -> impl Future<Output = Result<(), BleError>> + Send;

    fn stop_scan(&self) -> impl Future<Output = Result<(), BleError>> + Send;

    fn advertisement(
        &self,
        id: &Self::Id,
    ) -> impl Future<Output = Result<Advertisement, BleError>> + Send;

    fn link(&self, id: &Self::Id) -> impl Future<Output = Result<Self::Link, BleError>> + Send;
}
