//! Precondition tests
//!
//! Every rejected operation must leave the transport untouched. The transport is a strict
//! mock: any call without a matching expectation panics inside the manager task, which
//! surfaces here as a missing reply.
//!
//! Run with: cargo test --test test_preconditions

use mockall::mock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use txrx_core::{
    event_channel, ChannelDelegate, DeviceProfile, Manager, ManagerConfig, ManagerHandle,
    Notification, Transport, TransportError, TransportEvent, TransportEventSender, TxRxError,
};
use uuid::Uuid;

mock! {
    pub Radio {}

    impl Transport for Radio {
        fn is_ready(&self) -> bool;
        fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError>;
        fn stop_scan(&self) -> Result<(), TransportError>;
        fn connect(&self, address: &str) -> Result<(), TransportError>;
        fn disconnect(&self, address: &str) -> Result<(), TransportError>;
        fn discover(&self, address: &str) -> Result<(), TransportError>;
        fn subscribe(&self, address: &str, characteristic: Uuid) -> Result<(), TransportError>;
        fn write(&self, address: &str, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;
    }
}

struct Fixture {
    handle: ManagerHandle,
    events: TransportEventSender,
    notifications: UnboundedReceiver<Notification>,
}

fn start(radio: MockRadio) -> Fixture {
    let (events, events_rx) = event_channel();
    let (delegate, notifications) = ChannelDelegate::new();
    let handle = Manager::start(
        Arc::new(radio),
        events_rx,
        Arc::new(delegate),
        ManagerConfig::with_profile(DeviceProfile::txrx()),
    )
    .expect("Manager starts");
    Fixture {
        handle,
        events,
        notifications,
    }
}

impl Fixture {
    async fn next(&mut self) -> Notification {
        self.notifications.recv().await.expect("Notification")
    }

    /// Scan and find one device per address, named after it
    async fn find(&mut self, addresses: &[&str]) {
        self.handle.start_scan().await.expect("Scan starts");
        assert_eq!(self.next().await, Notification::ScanBegan);
        for address in addresses {
            self.events
                .send(TransportEvent::Advertisement {
                    address: address.to_string(),
                    name: Some(address.replace(':', "")),
                    services: vec![],
                    rssi: None,
                })
                .expect("Manager listening");
            assert!(matches!(self.next().await, Notification::DeviceFound(_)));
        }
    }
}

fn scanning_radio() -> MockRadio {
    let mut radio = MockRadio::new();
    radio.expect_is_ready().return_const(true);
    radio.expect_start_scan().times(1).returning(|_| Ok(()));
    radio.expect_stop_scan().times(1).returning(|| Ok(()));
    radio
}

#[tokio::test]
async fn test_nothing_issued_while_transport_off() {
    let mut radio = MockRadio::new();
    radio.expect_is_ready().return_const(false);
    let fixture = start(radio);

    assert_eq!(
        fixture.handle.start_scan().await,
        Err(TxRxError::TransportUnavailable)
    );
    assert!(!fixture.handle.is_scanning().await.expect("Manager alive"));
    assert_eq!(
        fixture.handle.connect("Nobody").await,
        Err(TxRxError::NotFound("Nobody".to_string()))
    );
}

#[tokio::test]
async fn test_scan_state_rejections() {
    let mut fixture = start(scanning_radio());

    assert_eq!(
        fixture.handle.stop_scan().await,
        Err(TxRxError::ScanNotStarted)
    );
    fixture.find(&["AA:01"]).await;
    assert_eq!(
        fixture.handle.start_scan().await,
        Err(TxRxError::AlreadyScanning)
    );

    // Nothing may touch a link during a scan
    assert_eq!(
        fixture.handle.connect("AA01").await,
        Err(TxRxError::ScanInProgress)
    );
    assert_eq!(
        fixture.handle.disconnect("AA01").await,
        Err(TxRxError::ScanInProgress)
    );
    assert_eq!(
        fixture.handle.send("AA01", vec![1]).await,
        Err(TxRxError::ScanInProgress)
    );

    fixture.handle.stop_scan().await.expect("Scan stops");
    assert_eq!(
        fixture.handle.disconnect("AA01").await,
        Err(TxRxError::NotConnected)
    );
    assert_eq!(
        fixture.handle.send("AA01", vec![1]).await,
        Err(TxRxError::NotConnected)
    );
    assert!(matches!(
        fixture.handle.send("Ghost", vec![1]).await,
        Err(TxRxError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_second_connect_issues_nothing() {
    let mut radio = scanning_radio();
    radio
        .expect_connect()
        .withf(|address| address == "AA:01")
        .times(1)
        .returning(|_| Ok(()));
    // Teardown closes the pending attempt
    radio
        .expect_disconnect()
        .withf(|address| address == "AA:01")
        .times(1)
        .returning(|_| Ok(()));

    let mut fixture = start(radio);
    fixture.find(&["AA:01", "AA:02"]).await;
    fixture.handle.stop_scan().await.expect("Scan stops");

    fixture.handle.connect("AA01").await.expect("Connect issued");
    let err = fixture.handle.connect("AA02").await.expect_err("Rejected");
    assert_eq!(err, TxRxError::AlreadyConnecting);
    assert!(err.is_precondition());
    assert_eq!(
        fixture.handle.connect("AA01").await,
        Err(TxRxError::AlreadyConnecting)
    );

    fixture.handle.shutdown().await.expect("Shutdown");
}

#[tokio::test]
async fn test_empty_payload_rejected_without_write() {
    let mut radio = scanning_radio();
    radio.expect_connect().times(1).returning(|_| Ok(()));
    radio.expect_discover().times(1).returning(|_| Ok(()));
    radio
        .expect_subscribe()
        .withf(|_, characteristic| *characteristic == DeviceProfile::txrx().rx_uuid())
        .times(1)
        .returning(|_, _| Ok(()));
    radio.expect_disconnect().times(1).returning(|_| Ok(()));

    let mut fixture = start(radio);
    fixture.find(&["AA:01"]).await;
    fixture.handle.stop_scan().await.expect("Scan stops");
    assert_eq!(fixture.next().await, Notification::ScanEnded);

    fixture.handle.connect("AA01").await.expect("Connect issued");
    let profile = DeviceProfile::txrx();
    for event in [
        TransportEvent::Connected {
            address: "AA:01".to_string(),
        },
        TransportEvent::ServicesDiscovered {
            address: "AA:01".to_string(),
            services: vec![profile.service_uuid()],
            characteristics: vec![profile.rx_uuid(), profile.tx_uuid()],
        },
    ] {
        fixture.events.send(event).expect("Manager listening");
    }
    assert!(matches!(fixture.next().await, Notification::Connected(_)));
    assert!(matches!(fixture.next().await, Notification::Ready(_)));

    assert!(matches!(
        fixture.handle.send("AA01", Vec::new()).await,
        Err(TxRxError::InvalidParameters(_))
    ));
    assert_eq!(
        fixture.handle.connect("AA01").await,
        Err(TxRxError::AlreadyConnected)
    );

    fixture.handle.shutdown().await.expect("Shutdown");
}
