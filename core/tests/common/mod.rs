//! Shared fixtures for manager integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use txrx_core::{
    event_channel, ChannelDelegate, DeviceInfo, DeviceProfile, Manager, ManagerConfig,
    ManagerHandle, Notification, Transport, TransportError, TransportEvent, TransportEventSender,
};
use uuid::Uuid;

pub const SERVICE: Uuid = Uuid::from_u128(0x0000_1000_0000_1000_8000_0080_5f9b_34fb);
pub const RX: Uuid = Uuid::from_u128(0x0000_1001_0000_1000_8000_0080_5f9b_34fb);
pub const TX: Uuid = Uuid::from_u128(0x0000_1002_0000_1000_8000_0080_5f9b_34fb);
pub const FOREIGN_SERVICE: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Newline-terminated profile with 20-byte packets
pub fn profile() -> DeviceProfile {
    DeviceProfile::new(SERVICE, RX, TX, [0x0A], 20).expect("Valid profile")
}

/// Assert a watchdog fired `millis` after `started` on the paused clock
pub fn assert_elapsed(started: Instant, millis: u64) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(millis) && elapsed < Duration::from_millis(millis + 5),
        "Elapsed {:?}, expected {} ms",
        elapsed,
        millis
    );
}

/// Transport operation as issued by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(String),
    Disconnect(String),
    Discover(String),
    Subscribe(String, Uuid),
    Write(String, Uuid, Vec<u8>),
}

/// Transport recording every call; optionally answers like a well-behaved peripheral
pub struct RecordingTransport {
    ready: AtomicBool,
    /// Answer connect/discover/disconnect with success events
    responsive: AtomicBool,
    /// Acknowledge every write
    auto_ack: AtomicBool,
    calls: Mutex<Vec<Call>>,
    events: TransportEventSender,
}

impl RecordingTransport {
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            ready: AtomicBool::new(true),
            responsive: AtomicBool::new(false),
            auto_ack: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.auto_ack.store(auto_ack, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Payloads written to `address`, in order
    pub fn writes(&self, address: &str) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Write(a, _, data) if a == address => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.send(event).expect("Manager listening");
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn is_responsive(&self) -> bool {
        self.responsive.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        self.record(Call::StartScan(services.to_vec()));
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(Call::StopScan);
        Ok(())
    }

    fn connect(&self, address: &str) -> Result<(), TransportError> {
        self.record(Call::Connect(address.to_string()));
        if self.is_responsive() {
            self.emit(TransportEvent::Connected {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    fn disconnect(&self, address: &str) -> Result<(), TransportError> {
        self.record(Call::Disconnect(address.to_string()));
        if self.is_responsive() {
            self.emit(TransportEvent::Disconnected {
                address: address.to_string(),
                reason: None,
            });
        }
        Ok(())
    }

    fn discover(&self, address: &str) -> Result<(), TransportError> {
        self.record(Call::Discover(address.to_string()));
        if self.is_responsive() {
            self.emit(TransportEvent::ServicesDiscovered {
                address: address.to_string(),
                services: vec![SERVICE],
                characteristics: vec![RX, TX],
            });
        }
        Ok(())
    }

    fn subscribe(&self, address: &str, characteristic: Uuid) -> Result<(), TransportError> {
        self.record(Call::Subscribe(address.to_string(), characteristic));
        Ok(())
    }

    fn write(&self, address: &str, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        self.record(Call::Write(address.to_string(), characteristic, data.to_vec()));
        if self.auto_ack.load(Ordering::SeqCst) {
            self.emit(TransportEvent::WriteAcknowledged {
                address: address.to_string(),
            });
        }
        Ok(())
    }
}

/// A running manager wired to a recording transport and a channel delegate
pub struct Harness {
    pub handle: ManagerHandle,
    pub transport: Arc<RecordingTransport>,
    pub notifications: UnboundedReceiver<Notification>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_config(ManagerConfig::with_profile(profile()))
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let (events_tx, events_rx) = event_channel();
        let transport = Arc::new(RecordingTransport::new(events_tx));
        let (delegate, notifications) = ChannelDelegate::new();
        let handle = Manager::start(transport.clone(), events_rx, Arc::new(delegate), config)
            .expect("Manager starts");
        Self {
            handle,
            transport,
            notifications,
        }
    }

    /// Next notification; with a paused clock this advances time to the next watchdog
    pub async fn next(&mut self) -> Notification {
        self.notifications.recv().await.expect("Notification")
    }

    /// Let the manager and dispatcher tasks process everything queued, without moving time
    pub async fn settle(&self) {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    /// Notifications already delivered
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }

    pub fn advertise(&self, address: &str, name: Option<&str>) {
        self.advertise_services(address, name, vec![SERVICE]);
    }

    pub fn advertise_services(&self, address: &str, name: Option<&str>, services: Vec<Uuid>) {
        self.transport.emit(TransportEvent::Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            services,
            rssi: Some(-55),
        });
    }

    /// Scan, find `devices` as `(address, name)` pairs, stop the scan
    pub async fn discover(&mut self, devices: &[(&str, &str)]) -> Vec<DeviceInfo> {
        self.handle.start_scan().await.expect("Scan starts");
        assert_eq!(self.next().await, Notification::ScanBegan);

        let mut found = Vec::new();
        for (address, name) in devices {
            self.advertise(address, Some(name));
            match self.next().await {
                Notification::DeviceFound(info) => found.push(info),
                other => panic!("Expected DeviceFound, got {:?}", other),
            }
        }

        self.handle.stop_scan().await.expect("Scan stops");
        assert_eq!(self.next().await, Notification::ScanEnded);
        found
    }

    /// Connect `name` against a responsive transport and wait for it to be ready
    pub async fn connect_ready(&mut self, name: &str) -> DeviceInfo {
        self.transport.set_responsive(true);
        self.handle.connect(name).await.expect("Connect issued");
        match self.next().await {
            Notification::Connected(info) => assert_eq!(info.indexed_name, name),
            other => panic!("Expected Connected, got {:?}", other),
        }
        match self.next().await {
            Notification::Ready(info) => info,
            other => panic!("Expected Ready, got {:?}", other),
        }
    }

    /// Deliver notification data on the RX characteristic
    pub fn deliver(&self, address: &str, data: &[u8]) {
        self.transport.emit(TransportEvent::Notification {
            address: address.to_string(),
            characteristic: RX,
            data: data.to_vec(),
        });
    }
}
