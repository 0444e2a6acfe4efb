//! Per-peripheral state
//!
//! A [`Device`] is owned and mutated exclusively by the manager task. Everything outside the
//! manager sees a [`DeviceInfo`] snapshot instead.

use crate::framing::{FrameAssembler, OutboundTransfer};
use crate::profile::DeviceProfile;
use crate::watchdog::{Phase, WatchdogExpiry, WatchdogTimer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Name given to peripherals that do not advertise one
pub const UNNAMED_DEVICE: &str = "Unnamed device";

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Link up, service discovery not yet issued
    Connected,
    Discovering,
    Ready,
    Disconnecting,
}

impl ConnectionStatus {
    /// True for every state of a connect attempt that has not reached `Ready`
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Discovering
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connecting => write!(f, "Connecting"),
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Discovering => write!(f, "Discovering"),
            ConnectionStatus::Ready => write!(f, "Ready"),
            ConnectionStatus::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Outbound transfer state, meaningful only while `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Idle,
    Sending,
    AwaitingSendAck,
}

/// Snapshot of a device handed to callers and delegates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    /// Name disambiguated among devices advertising the same name
    pub indexed_name: String,
    /// Transport-level identity
    pub address: String,
    pub rssi: Option<i16>,
    pub connection_status: ConnectionStatus,
    pub transfer_status: TransferStatus,
}

impl DeviceInfo {
    pub fn is_ready(&self) -> bool {
        self.connection_status == ConnectionStatus::Ready
    }

    /// Link is up, whether or not discovery has completed
    pub fn is_connected(&self) -> bool {
        matches!(
            self.connection_status,
            ConnectionStatus::Connected | ConnectionStatus::Discovering | ConnectionStatus::Ready
        )
    }
}

/// Mutable state of one peripheral
#[derive(Debug)]
pub struct Device {
    name: String,
    indexed_name: String,
    address: String,
    rssi: Option<i16>,
    profile: Arc<DeviceProfile>,
    connection_status: ConnectionStatus,
    transfer_status: TransferStatus,
    inbound: FrameAssembler,
    outbound: Option<OutboundTransfer>,
    /// A write of an abandoned transfer whose outcome may still arrive, until this deadline
    orphaned_write_until: Option<Instant>,
    watchdog: Option<WatchdogTimer>,
}

impl Device {
    pub(crate) fn new(
        name: String,
        indexed_name: String,
        address: String,
        rssi: Option<i16>,
        profile: Arc<DeviceProfile>,
    ) -> Self {
        let inbound = FrameAssembler::new(profile.terminator());
        Self {
            name,
            indexed_name,
            address,
            rssi,
            profile,
            connection_status: ConnectionStatus::Disconnected,
            transfer_status: TransferStatus::Idle,
            inbound,
            outbound: None,
            orphaned_write_until: None,
            watchdog: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indexed_name(&self) -> &str {
        &self.indexed_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    pub fn transfer_status(&self) -> TransferStatus {
        self.transfer_status
    }

    pub fn bytes_to_send(&self) -> usize {
        self.outbound.as_ref().map_or(0, |t| t.bytes_to_send())
    }

    pub fn bytes_sent(&self) -> usize {
        self.outbound.as_ref().map_or(0, |t| t.bytes_sent())
    }

    pub fn total_bytes_sent(&self) -> usize {
        self.outbound.as_ref().map_or(0, |t| t.total_bytes_sent())
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            indexed_name: self.indexed_name.clone(),
            address: self.address.clone(),
            rssi: self.rssi,
            connection_status: self.connection_status,
            transfer_status: self.transfer_status,
        }
    }

    pub(crate) fn update_advertisement(&mut self, name: Option<&str>, rssi: Option<i16>) {
        if let Some(name) = name {
            self.name = name.to_string();
        }
        if rssi.is_some() {
            self.rssi = rssi;
        }
    }

    /// Leaving `Ready` always drops any transfer in progress
    pub(crate) fn set_connection_status(&mut self, status: ConnectionStatus) {
        self.connection_status = status;
        if status != ConnectionStatus::Ready {
            self.transfer_status = TransferStatus::Idle;
            self.outbound = None;
            self.orphaned_write_until = None;
        }
    }

    // ------------------------------------------------------------------
    // Watchdog
    // ------------------------------------------------------------------

    /// Arm a watchdog for `phase`, cancelling whichever one was active
    pub(crate) fn arm_watchdog(
        &mut self,
        phase: Phase,
        interval: Duration,
        expiry_tx: &mpsc::UnboundedSender<WatchdogExpiry>,
    ) {
        self.cancel_watchdog();
        self.watchdog = Some(WatchdogTimer::schedule(
            Some(self.indexed_name.clone()),
            phase,
            interval,
            expiry_tx.clone(),
        ));
    }

    pub(crate) fn cancel_watchdog(&mut self) {
        if let Some(timer) = self.watchdog.take() {
            timer.cancel();
        }
    }

    /// Cancel the active watchdog only if it guards `phase`
    pub(crate) fn cancel_watchdog_for(&mut self, phase: Phase) {
        if self.watchdog_phase() == Some(phase) {
            self.cancel_watchdog();
        }
    }

    pub fn watchdog_phase(&self) -> Option<Phase> {
        self.watchdog.as_ref().map(|timer| timer.phase())
    }

    /// Claim an expiry if it belongs to the current arming
    pub(crate) fn take_expired_watchdog(&mut self, expiry: &WatchdogExpiry) -> bool {
        match &self.watchdog {
            Some(timer) if timer.id() == expiry.timer_id && timer.phase() == expiry.phase => {
                self.watchdog = None;
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    pub(crate) fn begin_send(&mut self, data: Vec<u8>) {
        self.outbound = Some(OutboundTransfer::new(data, self.profile.max_packet_size()));
        self.transfer_status = TransferStatus::Sending;
    }

    /// Next chunk to write; marks the device as awaiting its acknowledgement
    pub(crate) fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let chunk = self.outbound.as_mut()?.next_chunk()?;
        self.transfer_status = TransferStatus::AwaitingSendAck;
        Some(chunk)
    }

    /// Acknowledge the in-flight chunk; `None` if nothing was awaiting an ack
    pub(crate) fn acknowledge_chunk(&mut self) -> Option<usize> {
        if self.transfer_status != TransferStatus::AwaitingSendAck {
            return None;
        }
        let acked = self.outbound.as_mut()?.acknowledge();
        self.transfer_status = TransferStatus::Sending;
        Some(acked)
    }

    pub(crate) fn is_send_complete(&self) -> bool {
        self.outbound.as_ref().is_some_and(|t| t.is_complete())
    }

    pub(crate) fn finish_send(&mut self) {
        self.outbound = None;
        self.transfer_status = TransferStatus::Idle;
    }

    /// Abandon the transfer; a chunk still in flight is remembered for up to `grace`
    pub(crate) fn abandon_send(&mut self, grace: Duration) {
        if self.transfer_status == TransferStatus::AwaitingSendAck {
            self.orphaned_write_until = Some(Instant::now() + grace);
        }
        self.finish_send();
    }

    /// Whether an abandoned write may still be answered by the transport
    pub(crate) fn has_orphaned_write(&mut self) -> bool {
        match self.orphaned_write_until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                self.orphaned_write_until = None;
                false
            }
            None => false,
        }
    }

    /// Claim a write outcome for the abandoned write, if one is outstanding
    pub(crate) fn take_orphaned_write(&mut self) -> bool {
        if self.transfer_status != TransferStatus::Idle {
            return false;
        }
        self.orphaned_write_until.take().is_some()
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Append a delivery, returning the frames it completed
    pub(crate) fn append_inbound(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.inbound.push(data)
    }

    pub fn has_partial_frame(&self) -> bool {
        !self.inbound.is_empty()
    }

    pub(crate) fn reset_received_data(&mut self) {
        self.inbound.clear();
    }

    /// Return to `Disconnected` with no timer, no transfer and empty buffers
    pub(crate) fn reset_states(&mut self) {
        self.cancel_watchdog();
        self.set_connection_status(ConnectionStatus::Disconnected);
        self.reset_received_data();
    }
}
