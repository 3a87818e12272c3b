//! Configuration model for the bridge.
//!
//! Timeouts, retry policy, scan behaviour, and the GATT UUID triple live
//! here. The UUIDs are opaque configuration for platform link adapters;
//! the core never interprets them.

use crate::error::{BridgeError, BridgeResult};
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Keybridge";
const APP_NAME: &str = "keybridge";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// Default directory for the key store and preferences.
pub fn default_data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_local_dir().to_path_buf())
}

/// Default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("keybridge.toml"))
}

/// GATT service/characteristic triple (Nordic-UART-style by default):
/// one write characteristic toward the dongle, one notify characteristic
/// back from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GattCfg {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,

    #[serde(default = "default_write_uuid")]
    pub write_uuid: String,

    #[serde(default = "default_notify_uuid")]
    pub notify_uuid: String,
}

fn default_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}

fn default_write_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}

fn default_notify_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}

impl Default for GattCfg {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            write_uuid: default_write_uuid(),
            notify_uuid: default_notify_uuid(),
        }
    }
}

/// Bounded waits for every awaited transport step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutCfg {
    /// Full connect budget for manual attempts.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Shortened connect budget for the auto-connect fast path.
    #[serde(default = "default_fast_connect_ms")]
    pub fast_connect_ms: u64,

    /// Per-write budget for writes with response.
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,

    /// Window for the unsolicited server hello after notifications go up.
    #[serde(default = "default_hello_wait_ms")]
    pub hello_wait_ms: u64,

    /// Shortened hello window for silent auto-connect candidates.
    #[serde(default = "default_fast_hello_wait_ms")]
    pub fast_hello_wait_ms: u64,

    /// Ordinary request/reply budget inside a session.
    #[serde(default = "default_reply_ms")]
    pub reply_ms: u64,

    /// Budget for the typing echo, which waits on the dongle replaying
    /// the whole string as HID events.
    #[serde(default = "default_type_reply_ms")]
    pub type_reply_ms: u64,

    /// How long to wait for a link to report down during teardown.
    #[serde(default = "default_disconnect_ms")]
    pub disconnect_ms: u64,
}

fn default_connect_ms() -> u64 {
    10_000
}

fn default_fast_connect_ms() -> u64 {
    3_500
}

fn default_write_ms() -> u64 {
    10_000
}

fn default_hello_wait_ms() -> u64 {
    2_000
}

fn default_fast_hello_wait_ms() -> u64 {
    1_200
}

fn default_reply_ms() -> u64 {
    3_000
}

fn default_type_reply_ms() -> u64 {
    6_000
}

fn default_disconnect_ms() -> u64 {
    2_000
}

impl Default for TimeoutCfg {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            fast_connect_ms: default_fast_connect_ms(),
            write_ms: default_write_ms(),
            hello_wait_ms: default_hello_wait_ms(),
            fast_hello_wait_ms: default_fast_hello_wait_ms(),
            reply_ms: default_reply_ms(),
            type_reply_ms: default_type_reply_ms(),
            disconnect_ms: default_disconnect_ms(),
        }
    }
}

/// Transport retry policy for a single connect attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryCfg {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    250
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay(),
        }
    }
}

/// Scan and auto-connect pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCfg {
    /// RSSI sweep duration when ranking fallback candidates.
    #[serde(default = "default_rssi_scan_ms")]
    pub rssi_scan_ms: u64,

    /// Auto-connect suppression window after a deliberate disconnect.
    #[serde(default = "default_suppress_ms")]
    pub suppress_auto_connect_ms: u64,
}

fn default_rssi_scan_ms() -> u64 {
    800
}

fn default_suppress_ms() -> u64 {
    4_000
}

impl Default for ScanCfg {
    fn default() -> Self {
        Self {
            rssi_scan_ms: default_rssi_scan_ms(),
            suppress_auto_connect_ms: default_suppress_ms(),
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub gatt: GattCfg,

    #[serde(default)]
    pub timeouts: TimeoutCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(default)]
    pub scan: ScanCfg,
}

impl BridgeConfig {
    /// Read a TOML config file from disk.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|err| BridgeError::Config(format!("{}: {err}", path.display())))
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> BridgeResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist as pretty TOML.
    pub fn save(&self, path: &Path) -> BridgeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = toml::to_string_pretty(self)
            .map_err(|err| BridgeError::Config(err.to_string()))?;
        fs::write(path, payload)?;
        Ok(())
    }

    /// Best-effort validation pass returning human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.retry.max_attempts == 0 {
            issues.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.timeouts.connect_ms == 0 {
            issues.push("timeouts.connect_ms must be greater than 0".to_string());
        }
        if self.timeouts.hello_wait_ms == 0 {
            issues.push("timeouts.hello_wait_ms must be greater than 0".to_string());
        }
        if self.timeouts.fast_connect_ms > self.timeouts.connect_ms {
            issues.push(
                "timeouts.fast_connect_ms must not exceed timeouts.connect_ms".to_string(),
            );
        }
        if self.scan.rssi_scan_ms == 0 {
            issues.push("scan.rssi_scan_ms must be greater than 0".to_string());
        }
        for (label, uuid) in [
            ("gatt.service_uuid", &self.gatt.service_uuid),
            ("gatt.write_uuid", &self.gatt.write_uuid),
            ("gatt.notify_uuid", &self.gatt.notify_uuid),
        ] {
            if uuid.trim().is_empty() {
                issues.push(format!("{label} must not be empty"));
            }
        }
        issues
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn fast_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.fast_connect_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.write_ms)
    }

    pub fn hello_wait(&self) -> Duration {
        Duration::from_millis(self.timeouts.hello_wait_ms)
    }

    pub fn fast_hello_wait(&self) -> Duration {
        Duration::from_millis(self.timeouts.fast_hello_wait_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.reply_ms)
    }

    pub fn type_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.type_reply_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.disconnect_ms)
    }

    pub fn rssi_scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan.rssi_scan_ms)
    }

    pub fn suppress_window(&self) -> Duration {
        Duration::from_millis(self.scan.suppress_auto_connect_ms)
    }
}
