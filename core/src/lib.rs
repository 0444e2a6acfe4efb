// TxRx Core — serial-style data exchange over BLE characteristics
//
// Scan, connect, chunked send and terminator-framed receive, every phase bounded by a
// watchdog. The radio itself lives behind the `Transport` trait.

pub mod config;
pub mod delegate;
pub mod device;
pub mod error;
pub mod framing;
pub mod manager;
pub mod profile;
pub mod transport;
pub mod watchdog;

pub use config::{ManagerConfig, TimeoutConfig};
pub use delegate::{ChannelDelegate, Notification, TxRxDelegate};
pub use device::{ConnectionStatus, Device, DeviceInfo, TransferStatus, UNNAMED_DEVICE};
pub use error::{ErrorKind, TransportError, TxRxError};
pub use manager::{Manager, ManagerHandle};
pub use profile::DeviceProfile;
pub use transport::{
    event_channel, Transport, TransportEvent, TransportEventReceiver, TransportEventSender,
};
pub use watchdog::Phase;

/// Crate version, reported by hosts in their diagnostics
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
