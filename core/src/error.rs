//! Error taxonomy for the TxRx manager
//!
//! Every failure reported by the manager is a [`TxRxError`]. Callers usually only need the
//! coarse [`ErrorKind`]: precondition violations mean "nothing happened, try again later",
//! timeouts and transport failures mean "something was attempted and failed".

use crate::watchdog::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a [`TxRxError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Radio switched off, unavailable, or lost
    TransportUnready,
    /// Operation attempted in the wrong state; no transport call was made
    PreconditionViolation,
    /// A watchdog expired before the phase completed
    Timeout,
    /// The transport reported a failure
    TransportFailure,
    /// The operation referenced an unknown device
    NotFound,
    /// Unexpected state inside the manager
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TransportUnready => write!(f, "TransportUnready"),
            ErrorKind::PreconditionViolation => write!(f, "PreconditionViolation"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::TransportFailure => write!(f, "TransportFailure"),
            ErrorKind::NotFound => write!(f, "NotFound"),
            ErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

/// Errors reported by the manager, synchronously or through the delegate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxRxError {
    #[error("Bluetooth is not online yet")]
    TransportUnavailable,

    #[error("Device scan already started")]
    AlreadyScanning,
    #[error("Device scan not started")]
    ScanNotStarted,
    #[error("Operation is not permitted during device scan")]
    ScanInProgress,
    #[error("Already connecting to a device")]
    AlreadyConnecting,
    #[error("Already connected to device")]
    AlreadyConnected,
    #[error("Device not connected")]
    NotConnected,
    #[error("Already trying to disconnect device")]
    AlreadyDisconnecting,
    #[error("Already sending data to device")]
    AlreadySending,
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Timeout while scanning for devices")]
    ScanTimedOut,
    #[error("Timeout while connecting to device")]
    ConnectTimedOut,
    #[error("Device disconnection timed out")]
    DisconnectTimedOut,
    #[error("Timeout while sending data to device")]
    SendTimedOut,
    #[error("Timeout while receiving data from device")]
    ReceiveTimedOut,

    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Device service or characteristics not discovered: {0}")]
    ServiceNotDiscovered(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error("Device disconnected")]
    DeviceDisconnected,

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxRxError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TxRxError::TransportUnavailable => ErrorKind::TransportUnready,
            TxRxError::AlreadyScanning
            | TxRxError::ScanNotStarted
            | TxRxError::ScanInProgress
            | TxRxError::AlreadyConnecting
            | TxRxError::AlreadyConnected
            | TxRxError::NotConnected
            | TxRxError::AlreadyDisconnecting
            | TxRxError::AlreadySending
            | TxRxError::InvalidParameters(_) => ErrorKind::PreconditionViolation,
            TxRxError::ScanTimedOut
            | TxRxError::ConnectTimedOut
            | TxRxError::DisconnectTimedOut
            | TxRxError::SendTimedOut
            | TxRxError::ReceiveTimedOut => ErrorKind::Timeout,
            TxRxError::ScanFailed(_)
            | TxRxError::ConnectFailed(_)
            | TxRxError::ServiceNotDiscovered(_)
            | TxRxError::WriteFailed(_)
            | TxRxError::ReadFailed(_)
            | TxRxError::DeviceDisconnected => ErrorKind::TransportFailure,
            TxRxError::NotFound(_) => ErrorKind::NotFound,
            TxRxError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Phase that expired, for timeout errors
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TxRxError::ScanTimedOut => Some(Phase::Scan),
            TxRxError::ConnectTimedOut => Some(Phase::Connect),
            TxRxError::DisconnectTimedOut => Some(Phase::Disconnect),
            TxRxError::SendTimedOut => Some(Phase::Send),
            TxRxError::ReceiveTimedOut => Some(Phase::Receive),
            _ => None,
        }
    }

    /// Timeout error reported when a watchdog of `phase` expires
    pub fn timed_out(phase: Phase) -> Self {
        match phase {
            Phase::Scan => TxRxError::ScanTimedOut,
            Phase::Connect => TxRxError::ConnectTimedOut,
            Phase::Disconnect => TxRxError::DisconnectTimedOut,
            Phase::Send => TxRxError::SendTimedOut,
            Phase::Receive => TxRxError::ReceiveTimedOut,
        }
    }

    /// True when the operation was rejected before anything was attempted
    pub fn is_precondition(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PreconditionViolation | ErrorKind::NotFound | ErrorKind::TransportUnready
        )
    }
}

/// Errors raised by a transport collaborator when issuing an operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable")]
    Unavailable,
    #[error("Peer not found: {0}")]
    PeerNotFound(String),
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),
    #[error("Transport operation failed: {0}")]
    Failed(String),
}
