// btleplug transport for the TxRx manager
//
// Every `Transport` call returns immediately; the btleplug future runs on a spawned task and
// its outcome is posted back as a `TransportEvent`. Peripherals are keyed by their platform
// id string, which is what the manager sees as a device address.

use anyhow::{Context, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use txrx_core::{Transport, TransportError, TransportEvent, TransportEventSender};
use uuid::Uuid;

pub struct BtleplugTransport {
    adapter: Adapter,
    runtime: Handle,
    events: TransportEventSender,
    ready: Arc<AtomicBool>,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start pumping its events
    pub async fn new(events: TransportEventSender) -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to start Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .context("No Bluetooth adapter found")?;

        let powered = matches!(adapter.adapter_state().await, Ok(CentralState::PoweredOn));
        tracing::info!("Bluetooth adapter ready: {}", powered);

        let transport = Self {
            adapter,
            runtime: Handle::current(),
            events,
            ready: Arc::new(AtomicBool::new(powered)),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        };
        transport.spawn_central_pump().await?;
        Ok(transport)
    }

    async fn spawn_central_pump(&self) -> Result<()> {
        let mut stream = self
            .adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let ready = Arc::clone(&self.ready);
        let peripherals = Arc::clone(&self.peripherals);

        self.runtime.spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if let Some(event) = advertisement(&adapter, &id, &peripherals).await {
                            let _ = events.send(event);
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let _ = events.send(TransportEvent::Disconnected {
                            address: id.to_string(),
                            reason: Some("Link lost".to_string()),
                        });
                    }
                    CentralEvent::StateUpdate(state) => {
                        let powered = matches!(state, CentralState::PoweredOn);
                        ready.store(powered, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::StateChanged { ready: powered });
                    }
                    _ => {}
                }
            }
            tracing::warn!("Adapter event stream ended");
        });
        Ok(())
    }

    fn peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        self.peripherals
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::PeerNotFound(address.to_string()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::CharacteristicNotFound(uuid.to_string()))
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }
}

/// Advertisement event for a discovered or updated peripheral
async fn advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    peripherals: &Mutex<HashMap<String, Peripheral>>,
) -> Option<TransportEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let address = id.to_string();
    peripherals.lock().insert(address.clone(), peripheral);

    Some(TransportEvent::Advertisement {
        address,
        name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi,
    })
}

impl Transport for BtleplugTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::Unavailable);
        }
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                tracing::warn!("Failed to start BLE scan: {}", e);
                let _ = events.send(TransportEvent::ScanFailed {
                    reason: e.to_string(),
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        self.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                tracing::debug!("Failed to stop BLE scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&self, address: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(address)?;
        let events = self.events.clone();
        let address = address.to_string();
        self.spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => TransportEvent::Connected { address },
                Err(e) => TransportEvent::ConnectFailed {
                    address,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn disconnect(&self, address: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(address)?;
        let events = self.events.clone();
        let address = address.to_string();
        self.spawn(async move {
            // Duplicates of the adapter's own event are ignored by the manager
            let reason = match peripheral.disconnect().await {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!("Disconnect of {} failed: {}", address, e);
                    Some(format!("Disconnect failed: {}", e))
                }
            };
            let _ = events.send(TransportEvent::Disconnected { address, reason });
        });
        Ok(())
    }

    fn discover(&self, address: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(address)?;
        let events = self.events.clone();
        let address = address.to_string();
        self.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => TransportEvent::ServicesDiscovered {
                    address,
                    services: peripheral.services().iter().map(|s| s.uuid).collect(),
                    characteristics: peripheral.characteristics().iter().map(|c| c.uuid).collect(),
                },
                Err(e) => TransportEvent::DiscoveryFailed {
                    address,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn subscribe(&self, address: &str, characteristic: Uuid) -> Result<(), TransportError> {
        let peripheral = self.peripheral(address)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        let events = self.events.clone();
        let address = address.to_string();
        self.spawn(async move {
            if let Err(e) = peripheral.subscribe(&target).await {
                let _ = events.send(TransportEvent::ReadFailed {
                    address,
                    reason: e.to_string(),
                });
                return;
            }
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(TransportEvent::ReadFailed {
                        address,
                        reason: e.to_string(),
                    });
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                let _ = events.send(TransportEvent::Notification {
                    address: address.clone(),
                    characteristic: notification.uuid,
                    data: notification.value,
                });
            }
            tracing::debug!("Notification stream of {} ended", address);
        });
        Ok(())
    }

    fn write(&self, address: &str, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let peripheral = self.peripheral(address)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        let events = self.events.clone();
        let address = address.to_string();
        let data = data.to_vec();
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.spawn(async move {
            let event = match peripheral.write(&target, &data, write_type).await {
                Ok(()) => TransportEvent::WriteAcknowledged { address },
                Err(e) => TransportEvent::WriteFailed {
                    address,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }
}
