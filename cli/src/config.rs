// Configuration management for the TxRx CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/txrx/config.json
// - Linux: ~/.config/txrx/config.json
// - Windows: %APPDATA%\txrx\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use txrx_core::profile::{
    TXRX_MAX_PACKET_SIZE, TXRX_RX_UUID, TXRX_SERVICE_UUID, TXRX_TERMINATOR, TXRX_TX_UUID,
};
use txrx_core::{DeviceProfile, ManagerConfig, Phase, TimeoutConfig};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Watchdog interval per phase, in milliseconds
    pub timeouts: TimeoutConfig,

    /// Device family to talk to
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub service_uuid: Uuid,
    pub rx_uuid: Uuid,
    pub tx_uuid: Uuid,

    /// Frame terminator, hex encoded
    pub terminator: String,

    pub max_packet_size: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            service_uuid: TXRX_SERVICE_UUID,
            rx_uuid: TXRX_RX_UUID,
            tx_uuid: TXRX_TX_UUID,
            terminator: hex::encode(TXRX_TERMINATOR),
            max_packet_size: TXRX_MAX_PACKET_SIZE,
        }
    }
}

impl ProfileConfig {
    pub fn to_profile(&self) -> Result<DeviceProfile> {
        let terminator = hex::decode(&self.terminator).context("Terminator is not valid hex")?;
        let profile = DeviceProfile::new(
            self.service_uuid,
            self.rx_uuid,
            self.tx_uuid,
            terminator,
            self.max_packet_size,
        )?;
        Ok(profile)
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("txrx");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.timeouts.validate()?;
        self.profile.to_profile()?;
        Ok(())
    }

    /// Manager configuration for this config
    pub fn manager_config(&self) -> Result<ManagerConfig> {
        Ok(ManagerConfig::with_profile(self.profile.to_profile()?).timeouts(self.timeouts))
    }

    /// Set a config value and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(phase) = timeout_phase(key) {
            let millis = value.parse().context("Invalid number of milliseconds")?;
            self.timeouts.set(phase, millis)?;
            return Ok(());
        }

        let mut profile = self.profile.clone();
        match key {
            "service_uuid" => profile.service_uuid = value.parse().context("Invalid UUID")?,
            "rx_uuid" => profile.rx_uuid = value.parse().context("Invalid UUID")?,
            "tx_uuid" => profile.tx_uuid = value.parse().context("Invalid UUID")?,
            "terminator" => profile.terminator = value.to_lowercase(),
            "max_packet_size" => {
                profile.max_packet_size = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        profile.to_profile()?;
        self.profile = profile;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(phase) = timeout_phase(key) {
            return Some(self.timeouts.millis(phase).to_string());
        }
        match key {
            "service_uuid" => Some(self.profile.service_uuid.to_string()),
            "rx_uuid" => Some(self.profile.rx_uuid.to_string()),
            "tx_uuid" => Some(self.profile.tx_uuid.to_string()),
            "terminator" => Some(self.profile.terminator.clone()),
            "max_packet_size" => Some(self.profile.max_packet_size.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = Phase::ALL
            .into_iter()
            .map(|phase| {
                (
                    format!("{}_timeout", phase),
                    format!("{}ms", self.timeouts.millis(phase)),
                )
            })
            .collect();
        entries.extend([
            ("service_uuid".to_string(), self.profile.service_uuid.to_string()),
            ("rx_uuid".to_string(), self.profile.rx_uuid.to_string()),
            ("tx_uuid".to_string(), self.profile.tx_uuid.to_string()),
            ("terminator".to_string(), self.profile.terminator.clone()),
            ("max_packet_size".to_string(), self.profile.max_packet_size.to_string()),
        ]);
        entries
    }

    /// Restore defaults and save
    pub fn reset(&mut self) -> Result<()> {
        *self = Config::default();
        self.save()
    }
}

/// Phase named by a `<phase>_timeout` key
fn timeout_phase(key: &str) -> Option<Phase> {
    key.strip_suffix("_timeout")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.timeouts, TimeoutConfig::default());
        assert_eq!(config.profile.terminator, "0d0a");
        assert_eq!(
            config.profile.to_profile().unwrap(),
            DeviceProfile::txrx()
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = serde_json::from_str(r#"{ "timeouts": { "send": 500 } }"#).unwrap();
        assert_eq!(config.timeouts.send, 500);
        assert_eq!(config.profile, ProfileConfig::default());
    }

    #[test]
    fn test_apply_and_get() {
        let mut config = Config::default();
        config.apply("connect_timeout", "5000").unwrap();
        assert_eq!(config.get("connect_timeout").as_deref(), Some("5000"));

        config.apply("terminator", "0A").unwrap();
        assert_eq!(config.get("terminator").as_deref(), Some("0a"));
        assert_eq!(config.profile.to_profile().unwrap().terminator(), b"\n");
    }

    #[test]
    fn test_apply_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.apply("send_timeout", "0").is_err());
        assert!(config.apply("terminator", "").is_err());
        assert!(config.apply("max_packet_size", "0").is_err());
        assert!(config.apply("rx_uuid", "not-a-uuid").is_err());
        assert!(config.apply("bogus", "1").is_err());
        assert_eq!(config, Config::default());
    }
}
