//! Device family profiles
//!
//! A profile names the GATT service a device family exposes, the two characteristics used
//! for data exchange, and how data is framed on them.

use crate::error::TxRxError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Service of the stock TxRx serial-over-BLE firmware
pub const TXRX_SERVICE_UUID: Uuid = Uuid::from_u128(0x175f8f23_a570_49bd_9627_815a6a27de2a);

/// Characteristic the stock firmware notifies inbound data on
pub const TXRX_RX_UUID: Uuid = Uuid::from_u128(0x1cce1ea8_bd34_4813_a00a_c76e028fadcb);

/// Characteristic the stock firmware accepts writes on
pub const TXRX_TX_UUID: Uuid = Uuid::from_u128(0xcacc07ff_ffff_4c48_8fae_a9ef71b75e26);

/// Command terminator of the stock firmware
pub const TXRX_TERMINATOR: &[u8] = b"\r\n";

/// Largest single write the stock firmware accepts
pub const TXRX_MAX_PACKET_SIZE: usize = 20;

/// Immutable addressing and framing description of a device family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    service_uuid: Uuid,
    /// Peripheral to us (notifications)
    rx_uuid: Uuid,
    /// Us to peripheral (writes)
    tx_uuid: Uuid,
    terminator: Vec<u8>,
    max_packet_size: usize,
}

impl DeviceProfile {
    /// Create a profile, rejecting an empty terminator or a zero packet size
    pub fn new(
        service_uuid: Uuid,
        rx_uuid: Uuid,
        tx_uuid: Uuid,
        terminator: impl Into<Vec<u8>>,
        max_packet_size: usize,
    ) -> Result<Self, TxRxError> {
        let profile = Self {
            service_uuid,
            rx_uuid,
            tx_uuid,
            terminator: terminator.into(),
            max_packet_size,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Profile of the stock TxRx firmware
    pub fn txrx() -> Self {
        Self {
            service_uuid: TXRX_SERVICE_UUID,
            rx_uuid: TXRX_RX_UUID,
            tx_uuid: TXRX_TX_UUID,
            terminator: TXRX_TERMINATOR.to_vec(),
            max_packet_size: TXRX_MAX_PACKET_SIZE,
        }
    }

    /// Validate the profile (used after deserialization too)
    pub fn validate(&self) -> Result<(), TxRxError> {
        if self.terminator.is_empty() {
            return Err(TxRxError::InvalidParameters(
                "Profile terminator must not be empty".to_string(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(TxRxError::InvalidParameters(
                "Profile max packet size must be > 0".to_string(),
            ));
        }
        if self.rx_uuid == self.tx_uuid {
            return Err(TxRxError::InvalidParameters(
                "Profile rx and tx characteristics must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    pub fn rx_uuid(&self) -> Uuid {
        self.rx_uuid
    }

    pub fn tx_uuid(&self) -> Uuid {
        self.tx_uuid
    }

    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Whether an advertisement listing `services` belongs to this family
    pub fn matches(&self, services: &[Uuid]) -> bool {
        services.contains(&self.service_uuid)
    }

    /// Append the terminator to a command payload
    pub fn encode_command(&self, payload: &[u8]) -> Vec<u8> {
        let mut command = Vec::with_capacity(payload.len() + self.terminator.len());
        command.extend_from_slice(payload);
        command.extend_from_slice(&self.terminator);
        command
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::txrx()
    }
}
