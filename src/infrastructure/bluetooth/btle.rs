//! btleplug Transport
//!
//! Binds the transport traits to the platform BLE stack (BlueZ, CoreBluetooth
//! or WinRT, whichever btleplug picks for the host).

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::protocol::{
    CONTROL_CHAR_UUID, CONTROL_SERVICE_UUID, POSITION_CHAR_UUID, POSITION_SERVICE_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    AdapterEvent, Advertisement, BleAdapter, BleError, DeskCharacteristics, DeskLink,
};
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// The first BLE adapter found on this host.
///
/// The adapter is looked up on first use, and again on the next call when
/// none was present, so a daemon can start before bluetooth does.
#[derive(Default)]
pub struct BtleAdapter {
    adapter: OnceCell<Adapter>,
}

impl BtleAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look the adapter up immediately, failing if there is none.
    pub async fn first_available() -> Result<Self, BleError> {
        let adapter = Self::new();
        adapter.adapter().await?;
        Ok(adapter)
    }

    async fn adapter(&self) -> Result<&Adapter, BleError> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(BleError::NoAdapter)?;

                info!(
                    "Using bluetooth adapter: {}",
                    adapter.adapter_info().await.unwrap_or_default()
                );
                Ok::<_, BleError>(adapter)
            })
            .await
    }
}

fn translate_event(event: CentralEvent) -> Option<AdapterEvent<PeripheralId>> {
    match event {
        CentralEvent::StateUpdate(CentralState::PoweredOn) => Some(AdapterEvent::PoweredOn),
        CentralEvent::StateUpdate(CentralState::PoweredOff) => Some(AdapterEvent::PoweredOff),
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(AdapterEvent::Discovered(id)),
        CentralEvent::DeviceDisconnected(id) => Some(AdapterEvent::Disconnected(id)),
        _ => None,
    }
}

impl BleAdapter for BtleAdapter {
    type Id = PeripheralId;
    type Link = BtleLink;

    async fn events(&self) -> Result<BoxStream<'static, AdapterEvent<PeripheralId>>, BleError> {
        let events = self.adapter().await?.events().await?;
        Ok(events
            .filter_map(|event| futures::future::ready(translate_event(event)))
            .boxed())
    }

    async fn is_powered_on(&self) -> Result<bool, BleError> {
        Ok(self.adapter().await?.adapter_state().await? == CentralState::PoweredOn)
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        self.adapter().await?.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter().await?.stop_scan().await?;
        Ok(())
    }

    async fn advertisement(&self, id: &PeripheralId) -> Result<Advertisement, BleError> {
        let peripheral = self.adapter().await?.peripheral(id).await?;
        let services = peripheral
            .properties()
            .await?
            .map(|properties| properties.services)
            .unwrap_or_default();

        Ok(Advertisement {
            address: Some(DeviceAddress::new(peripheral.address().to_string())),
            services,
        })
    }

    async fn link(&self, id: &PeripheralId) -> Result<BtleLink, BleError> {
        let peripheral = self.adapter().await?.peripheral(id).await?;
        Ok(BtleLink { peripheral })
    }
}

/// A desk peripheral as seen by btleplug
pub struct BtleLink {
    peripheral: Peripheral,
}

impl DeskLink for BtleLink {
    type Characteristic = Characteristic;

    async fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.peripheral.address().to_string())
    }

    async fn is_connected(&self) -> Result<bool, BleError> {
        Ok(self.peripheral.is_connected().await?)
    }

    async fn connect(&self) -> Result<(), BleError> {
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover(&self) -> Result<DeskCharacteristics<Characteristic>, BleError> {
        self.peripheral.discover_services().await?;

        let characteristics = self.peripheral.characteristics();
        debug!("Found {} characteristics", characteristics.len());

        let find = |service, uuid| {
            characteristics
                .iter()
                .find(|characteristic| {
                    characteristic.service_uuid == service && characteristic.uuid == uuid
                })
                .cloned()
        };

        let position = find(POSITION_SERVICE_UUID, POSITION_CHAR_UUID)
            .ok_or(BleError::MissingCharacteristic("position"))?;
        let control = find(CONTROL_SERVICE_UUID, CONTROL_CHAR_UUID)
            .ok_or(BleError::MissingCharacteristic("control"))?;

        Ok(DeskCharacteristics { position, control })
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, BleError> {
        Ok(self.peripheral.read(characteristic).await?)
    }

    async fn write_without_response(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
    ) -> Result<(), BleError> {
        self.peripheral
            .write(characteristic, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &Characteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>, BleError> {
        self.peripheral.subscribe(characteristic).await?;

        let uuid = characteristic.uuid;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |notification| {
                futures::future::ready((notification.uuid == uuid).then_some(notification.value))
            })
            .boxed())
    }
}
