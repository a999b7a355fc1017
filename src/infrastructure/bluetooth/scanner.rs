//! One-shot desk scan used by `--scan`.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::protocol::CONTROL_SERVICE_UUID;
use crate::infrastructure::bluetooth::transport::{AdapterEvent, BleAdapter, BleError};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

/// Scan for `duration` and return the addresses of every peripheral
/// advertising the desk control service, in discovery order.
pub async fn scan_for_desks<A: BleAdapter>(
    adapter: &A,
    duration: Duration,
) -> Result<Vec<DeviceAddress>, BleError> {
    let mut events = adapter.events().await?;
    adapter.start_scan().await?;
    info!("Scanning for desks for {:?}", duration);

    let mut found = Vec::new();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.next() => match event {
                Some(AdapterEvent::Discovered(id)) => {
                    let advertisement = match adapter.advertisement(&id).await {
                        Ok(advertisement) => advertisement,
                        Err(e) => {
                            debug!(?id, "Skipping peripheral: {}", e);
                            continue;
                        }
                    };
                    if !advertisement.services.contains(&CONTROL_SERVICE_UUID) {
                        continue;
                    }
                    if let Some(address) = advertisement.address {
                        if !found.contains(&address) {
                            info!(%address, "Found desk");
                            found.push(address);
                        }
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        debug!("Ignoring stop scan error: {}", e);
    }
    Ok(found)
}
