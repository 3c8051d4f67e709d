//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use protocol::{DEVICE_PRODUCT_ID, DEVICE_VENDOR_ID, TrustedKeys};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub hid: HidSettings,
    #[serde(default)]
    pub udp: UdpSettings,
    #[serde(default)]
    pub listen: ListenSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub log_level: String,
    /// Persisted state file (shell-expanded)
    pub state_path: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            state_path: "~/.local/share/hw-bridge/state.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HidSettings {
    /// VID:PID patterns of devices to expose
    pub filters: Vec<String>,
}

impl Default for HidSettings {
    fn default() -> Self {
        Self {
            filters: vec![format!("{:#06x}:{:#06x}", DEVICE_VENDOR_ID, DEVICE_PRODUCT_ID)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UdpSettings {
    /// Emulator ports exposed as virtual devices
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSettings {
    /// Maximum enumerations per listen call
    pub iterations: u32,
    /// Pause between enumerations
    pub delay_ms: u64,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            iterations: 60,
            delay_ms: 500,
        }
    }
}

impl ListenSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProtocolSettings {
    /// Hex SEC1 public keys allowed to sign configurations
    #[serde(default)]
    pub trusted_keys: Vec<String>,
}

/// Parsed `VID:PID` filter, `*` matching anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor: Option<u16>,
    pub product: Option<u16>,
}

impl DeviceFilter {
    pub fn matches(&self, vendor: u16, product: u16) -> bool {
        self.vendor.is_none_or(|v| v == vendor) && self.product.is_none_or(|p| p == product)
    }

    fn parse_id(id: &str, name: &str) -> Result<Option<u16>> {
        if id == "*" {
            return Ok(None);
        }

        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x1234')", name, id))?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!("Invalid {} '{}', hex part must be 1-4 digits", name, id));
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
    }
}

impl FromStr for DeviceFilter {
    type Err = anyhow::Error;

    fn from_str(filter: &str) -> Result<Self> {
        let parts: Vec<&str> = filter.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x534c:0x0001' or '0x534c:*')",
                filter
            ));
        }

        Ok(Self {
            vendor: Self::parse_id(parts[0], "VID")?,
            product: Self::parse_id(parts[1], "PID")?,
        })
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::search(&Self::candidates())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load the first configuration file on the search path, or defaults
    ///
    /// A file that exists but cannot be used yields defaults plus the error,
    /// for the caller to report once logging is up.
    pub fn load_or_default() -> (Self, Option<anyhow::Error>) {
        Self::load_first(&Self::candidates())
    }

    fn load_first(candidates: &[PathBuf]) -> (Self, Option<anyhow::Error>) {
        let Some(path) = Self::search(candidates) else {
            return (Self::default(), None);
        };
        match Self::load(Some(path)) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    fn candidates() -> Vec<PathBuf> {
        vec![Self::default_path(), PathBuf::from("/etc/hw-bridge/bridge.toml")]
    }

    fn search(candidates: &[PathBuf]) -> Option<PathBuf> {
        candidates.iter().find(|p| p.exists()).cloned()
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hw-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/hw-bridge/bridge.toml")
        }
    }

    /// Expanded path of the persisted state file
    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.bridge.state_path).as_ref())
    }

    pub fn device_filters(&self) -> Result<Vec<DeviceFilter>> {
        self.hid.filters.iter().map(|f| f.parse()).collect()
    }

    pub fn trusted_keys(&self) -> Result<TrustedKeys> {
        TrustedKeys::from_hex(&self.protocol.trusted_keys).context("Invalid trusted key")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        self.device_filters()?;
        self.trusted_keys()?;

        if self.listen.iterations == 0 {
            return Err(anyhow!("listen.iterations must be at least 1"));
        }

        Ok(())
    }
}
