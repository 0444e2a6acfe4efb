//! Transport abstraction layer
//!
//! The manager drives a radio stack through [`Transport`] and hears back from it through
//! [`TransportEvent`]s pushed on a channel. Every trait method only *issues* the operation:
//! an `Err` means it could not even be started, the outcome arrives later as an event.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sending half handed to transport implementations
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half consumed by the manager task
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the event channel connecting a transport to a manager
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Characteristic-based radio capability consumed by the manager
pub trait Transport: Send + Sync {
    /// Whether the radio is powered and usable
    fn is_ready(&self) -> bool;

    /// Begin advertisement discovery, optionally filtered by service; a discovery that fails
    /// after this returns is reported as `ScanFailed`
    fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError>;

    /// Stop advertisement discovery
    fn stop_scan(&self) -> Result<(), TransportError>;

    /// Open a link; completes with `Connected` or `ConnectFailed`
    fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Close a link; completes with `Disconnected`
    fn disconnect(&self, address: &str) -> Result<(), TransportError>;

    /// Discover services; completes with `ServicesDiscovered` or `DiscoveryFailed`
    fn discover(&self, address: &str) -> Result<(), TransportError>;

    /// Enable notifications; data arrives as `Notification`, failures as `ReadFailed`
    fn subscribe(&self, address: &str, characteristic: Uuid) -> Result<(), TransportError>;

    /// Write one packet; completes with `WriteAcknowledged` or `WriteFailed`
    fn write(&self, address: &str, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;
}

/// Events from the transport to the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEvent {
    /// Radio became usable or was lost
    StateChanged { ready: bool },
    /// An advertisement was received while scanning
    Advertisement {
        address: String,
        name: Option<String>,
        services: Vec<Uuid>,
        rssi: Option<i16>,
    },
    /// Discovery could not be started or stopped running
    ScanFailed { reason: String },
    /// Link established
    Connected { address: String },
    /// Link could not be established
    ConnectFailed { address: String, reason: String },
    /// Service discovery completed
    ServicesDiscovered {
        address: String,
        services: Vec<Uuid>,
        characteristics: Vec<Uuid>,
    },
    /// Service discovery failed
    DiscoveryFailed { address: String, reason: String },
    /// The last written packet was acknowledged
    WriteAcknowledged { address: String },
    /// The last written packet was rejected
    WriteFailed { address: String, reason: String },
    /// Notification data arrived
    Notification {
        address: String,
        characteristic: Uuid,
        data: Vec<u8>,
    },
    /// Notifications could not be enabled or read
    ReadFailed { address: String, reason: String },
    /// Link closed, requested or not
    Disconnected {
        address: String,
        reason: Option<String>,
    },
}

impl TransportEvent {
    /// Address of the peripheral the event concerns
    pub fn address(&self) -> Option<&str> {
        match self {
            TransportEvent::StateChanged { .. } | TransportEvent::ScanFailed { .. } => None,
            TransportEvent::Advertisement { address, .. }
            | TransportEvent::Connected { address }
            | TransportEvent::ConnectFailed { address, .. }
            | TransportEvent::ServicesDiscovered { address, .. }
            | TransportEvent::DiscoveryFailed { address, .. }
            | TransportEvent::WriteAcknowledged { address }
            | TransportEvent::WriteFailed { address, .. }
            | TransportEvent::Notification { address, .. }
            | TransportEvent::ReadFailed { address, .. }
            | TransportEvent::Disconnected { address, .. } => Some(address),
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::StateChanged { ready } => write!(f, "StateChanged {{ ready: {} }}", ready),
            TransportEvent::Advertisement { address, name, .. } => {
                write!(f, "Advertisement {{ address: {}, name: {:?} }}", address, name)
            }
            TransportEvent::ScanFailed { reason } => write!(f, "ScanFailed {{ reason: {} }}", reason),
            TransportEvent::Connected { address } => write!(f, "Connected {{ address: {} }}", address),
            TransportEvent::ConnectFailed { address, reason } => {
                write!(f, "ConnectFailed {{ address: {}, reason: {} }}", address, reason)
            }
            TransportEvent::ServicesDiscovered {
                address,
                services,
                characteristics,
            } => write!(
                f,
                "ServicesDiscovered {{ address: {}, services: {}, characteristics: {} }}",
                address,
                services.len(),
                characteristics.len()
            ),
            TransportEvent::DiscoveryFailed { address, reason } => {
                write!(f, "DiscoveryFailed {{ address: {}, reason: {} }}", address, reason)
            }
            TransportEvent::WriteAcknowledged { address } => {
                write!(f, "WriteAcknowledged {{ address: {} }}", address)
            }
            TransportEvent::WriteFailed { address, reason } => {
                write!(f, "WriteFailed {{ address: {}, reason: {} }}", address, reason)
            }
            TransportEvent::Notification { address, data, .. } => {
                write!(f, "Notification {{ address: {}, data_len: {} }}", address, data.len())
            }
            TransportEvent::ReadFailed { address, reason } => {
                write!(f, "ReadFailed {{ address: {}, reason: {} }}", address, reason)
            }
            TransportEvent::Disconnected { address, reason } => {
                write!(f, "Disconnected {{ address: {}, reason: {:?} }}", address, reason)
            }
        }
    }
}
