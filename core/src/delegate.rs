//! Delegate callbacks
//!
//! The manager reports every asynchronous outcome as a [`Notification`]. Notifications are
//! queued in order and delivered to the registered [`TxRxDelegate`] by a dispatcher task, so
//! a slow delegate never stalls transport event processing.

use crate::device::DeviceInfo;
use crate::error::TxRxError;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Asynchronous outcome reported by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    // Scan side
    ScanBegan,
    DeviceFound(DeviceInfo),
    ScanEnded,
    ScanError(TxRxError),
    /// A device-level failure outside connect/read/write, e.g. a disconnect timeout
    DeviceError { device: DeviceInfo, error: TxRxError },
    InternalError(TxRxError),

    // Data side
    ConnectError { device: DeviceInfo, error: TxRxError },
    Connected(DeviceInfo),
    Ready(DeviceInfo),
    ReadError { device: DeviceInfo, error: TxRxError },
    WriteError { device: DeviceInfo, error: TxRxError },
    SentData(DeviceInfo),
    /// One complete frame, terminator stripped; may arrive unsolicited
    ReceivedData { device: DeviceInfo, data: Vec<u8> },
    Disconnected(DeviceInfo),
    DeviceInternalError { device: DeviceInfo, error: TxRxError },
}

impl Notification {
    /// Device the notification concerns, if any
    pub fn device(&self) -> Option<&DeviceInfo> {
        match self {
            Notification::ScanBegan
            | Notification::ScanEnded
            | Notification::ScanError(_)
            | Notification::InternalError(_) => None,
            Notification::DeviceFound(device)
            | Notification::Connected(device)
            | Notification::Ready(device)
            | Notification::SentData(device)
            | Notification::Disconnected(device)
            | Notification::DeviceError { device, .. }
            | Notification::ConnectError { device, .. }
            | Notification::ReadError { device, .. }
            | Notification::WriteError { device, .. }
            | Notification::ReceivedData { device, .. }
            | Notification::DeviceInternalError { device, .. } => Some(device),
        }
    }

    /// Error carried by the notification, if any
    pub fn error(&self) -> Option<&TxRxError> {
        match self {
            Notification::ScanError(error) | Notification::InternalError(error) => Some(error),
            Notification::DeviceError { error, .. }
            | Notification::ConnectError { error, .. }
            | Notification::ReadError { error, .. }
            | Notification::WriteError { error, .. }
            | Notification::DeviceInternalError { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Receiver of manager outcomes
///
/// Every method has an empty default so implementors only override what they care about.
/// Hosts that would rather consume a stream override [`TxRxDelegate::handle`] or use
/// [`ChannelDelegate`].
pub trait TxRxDelegate: Send + Sync {
    fn device_scan_began(&self) {}
    fn device_found(&self, _device: &DeviceInfo) {}
    fn device_scan_ended(&self) {}
    fn device_scan_error(&self, _error: &TxRxError) {}
    fn device_error(&self, _device: &DeviceInfo, _error: &TxRxError) {}
    fn internal_error(&self, _error: &TxRxError) {}

    fn device_connect_error(&self, _device: &DeviceInfo, _error: &TxRxError) {}
    fn device_connected(&self, _device: &DeviceInfo) {}
    fn device_ready(&self, _device: &DeviceInfo) {}
    fn device_read_error(&self, _device: &DeviceInfo, _error: &TxRxError) {}
    fn device_write_error(&self, _device: &DeviceInfo, _error: &TxRxError) {}
    fn sent_data(&self, _device: &DeviceInfo) {}
    fn received_data(&self, _device: &DeviceInfo, _data: &[u8]) {}
    fn device_disconnected(&self, _device: &DeviceInfo) {}
    fn device_internal_error(&self, _device: &DeviceInfo, _error: &TxRxError) {}

    /// Route a notification to the matching callback
    fn handle(&self, notification: Notification) {
        match &notification {
            Notification::ScanBegan => self.device_scan_began(),
            Notification::DeviceFound(device) => self.device_found(device),
            Notification::ScanEnded => self.device_scan_ended(),
            Notification::ScanError(error) => self.device_scan_error(error),
            Notification::DeviceError { device, error } => self.device_error(device, error),
            Notification::InternalError(error) => self.internal_error(error),
            Notification::ConnectError { device, error } => self.device_connect_error(device, error),
            Notification::Connected(device) => self.device_connected(device),
            Notification::Ready(device) => self.device_ready(device),
            Notification::ReadError { device, error } => self.device_read_error(device, error),
            Notification::WriteError { device, error } => self.device_write_error(device, error),
            Notification::SentData(device) => self.sent_data(device),
            Notification::ReceivedData { device, data } => self.received_data(device, data),
            Notification::Disconnected(device) => self.device_disconnected(device),
            Notification::DeviceInternalError { device, error } => {
                self.device_internal_error(device, error)
            }
        }
    }
}

/// Delegate forwarding every notification into a channel
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TxRxDelegate for ChannelDelegate {
    fn handle(&self, notification: Notification) {
        // Receiver dropped: the host stopped listening
        let _ = self.tx.send(notification);
    }
}

/// FIFO bridge from the manager task to the delegate's execution context
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Dispatcher {
    /// Spawn the dispatcher task on `runtime`
    pub(crate) fn spawn(delegate: Arc<dyn TxRxDelegate>, runtime: &Handle) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let task = runtime.spawn(async move {
            while let Some(notification) = rx.recv().await {
                delegate.handle(notification);
            }
        });
        (Self { tx }, task)
    }

    pub(crate) fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::warn!("Delegate dispatcher stopped, notification dropped");
        }
    }
}
