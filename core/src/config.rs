//! Manager configuration
//!
//! The only tunables are the watchdog interval of each phase (milliseconds, keyed by phase
//! name), the device profiles the manager recognizes and the runtime delegate callbacks run
//! on.

use crate::error::TxRxError;
use crate::profile::DeviceProfile;
use crate::watchdog::Phase;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::runtime::Handle;

/// Default scan bound in milliseconds
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 10_000;
/// Default connect + discovery bound in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20_000;
/// Default disconnect bound in milliseconds
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 2_000;
/// Default per-chunk send bound in milliseconds
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 1_000;
/// Default inter-delivery receive bound in milliseconds
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 2_000;

/// Watchdog interval per phase, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub scan: u64,
    pub connect: u64,
    pub disconnect: u64,
    pub send: u64,
    pub receive: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan: DEFAULT_SCAN_TIMEOUT_MS,
            connect: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect: DEFAULT_DISCONNECT_TIMEOUT_MS,
            send: DEFAULT_SEND_TIMEOUT_MS,
            receive: DEFAULT_RECEIVE_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    /// Interval of `phase` in milliseconds
    pub fn millis(&self, phase: Phase) -> u64 {
        match phase {
            Phase::Scan => self.scan,
            Phase::Connect => self.connect,
            Phase::Disconnect => self.disconnect,
            Phase::Send => self.send,
            Phase::Receive => self.receive,
        }
    }

    /// Interval of `phase`
    pub fn interval(&self, phase: Phase) -> Duration {
        Duration::from_millis(self.millis(phase))
    }

    /// Set the interval of `phase`; zero is rejected
    pub fn set(&mut self, phase: Phase, millis: u64) -> Result<(), TxRxError> {
        if millis == 0 {
            return Err(TxRxError::InvalidParameters(format!(
                "Timeout for {} must be > 0 ms",
                phase
            )));
        }
        match phase {
            Phase::Scan => self.scan = millis,
            Phase::Connect => self.connect = millis,
            Phase::Disconnect => self.disconnect = millis,
            Phase::Send => self.send = millis,
            Phase::Receive => self.receive = millis,
        }
        Ok(())
    }

    /// Validate every interval (used after deserialization)
    pub fn validate(&self) -> Result<(), TxRxError> {
        for phase in Phase::ALL {
            if self.millis(phase) == 0 {
                return Err(TxRxError::InvalidParameters(format!(
                    "Timeout for {} must be > 0 ms",
                    phase
                )));
            }
        }
        Ok(())
    }
}

/// Everything needed to start a manager besides the transport and delegate
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub timeouts: TimeoutConfig,
    /// Recognized device families; the first one is the default
    pub profiles: Vec<DeviceProfile>,
    /// Runtime delegate callbacks are dispatched on; the manager's runtime when `None`
    pub callback_runtime: Option<Handle>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            profiles: vec![DeviceProfile::txrx()],
            callback_runtime: None,
        }
    }
}

impl ManagerConfig {
    /// Configuration recognizing a single device family
    pub fn with_profile(profile: DeviceProfile) -> Self {
        Self {
            profiles: vec![profile],
            ..Self::default()
        }
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn callback_runtime(mut self, runtime: Handle) -> Self {
        self.callback_runtime = Some(runtime);
        self
    }

    pub fn validate(&self) -> Result<(), TxRxError> {
        self.timeouts.validate()?;
        if self.profiles.is_empty() {
            return Err(TxRxError::InvalidParameters(
                "At least one device profile is required".to_string(),
            ));
        }
        for profile in &self.profiles {
            profile.validate()?;
        }
        Ok(())
    }
}
