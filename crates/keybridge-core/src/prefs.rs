//! User preferences persisted between runs.
//!
//! Owned by a small store; the orchestrator reads the selection and writes
//! the auto-disable latch, the UI writes everything else.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A remapped volume key: the HID tap it should produce on the dongle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTap {
    pub mods: u8,
    pub usage: u8,
}

/// Volume-key remaps; `None` leaves the key with its normal meaning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeKeys {
    #[serde(default)]
    pub up: Option<KeyTap>,

    #[serde(default)]
    pub down: Option<KeyTap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    /// Address of the preferred dongle, when one has been chosen.
    #[serde(default)]
    pub selected_address: Option<String>,

    #[serde(default)]
    pub selected_name: Option<String>,

    /// Master toggle for routing input to the external dongle.
    #[serde(default = "default_true")]
    pub use_external: bool,

    /// Set by the orchestrator when auto-connect gave up; cleared by the
    /// next successful connect or an explicit user re-enable.
    #[serde(default)]
    pub disabled_by_error: bool,

    /// Keyboard layout code pushed to the dongle (e.g. `FI`, `US_INTL`).
    #[serde(default)]
    pub layout: Option<String>,

    /// Append a newline to every typed string.
    #[serde(default)]
    pub append_newline: bool,

    /// Mirror typed input into the local UI as well.
    #[serde(default)]
    pub share_input: bool,

    #[serde(default)]
    pub volume_keys: VolumeKeys,

    /// Which remote panel the UI opens by default.
    #[serde(default)]
    pub panel: Option<String>,

    #[serde(default = "default_true")]
    pub plugin_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            selected_address: None,
            selected_name: None,
            use_external: true,
            disabled_by_error: false,
            layout: None,
            append_newline: false,
            share_input: false,
            volume_keys: VolumeKeys::default(),
            panel: None,
            plugin_enabled: true,
        }
    }
}

impl Preferences {
    /// Record `address`/`name` as the preferred dongle and clear the
    /// auto-disable latch; a working device supersedes old failures.
    pub fn select(&mut self, address: &str, name: Option<&str>) {
        self.selected_address = Some(address.to_string());
        self.selected_name = name.map(str::to_string);
        self.disabled_by_error = false;
    }

    /// Drop the selection, e.g. when the user forgets the device.
    pub fn clear_selection(&mut self) {
        self.selected_address = None;
        self.selected_name = None;
    }
}

/// On-disk store for [`Preferences`] (TOML, atomic replace).
pub struct PrefStore {
    path: PathBuf,
}

impl PrefStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load preferences, falling back to defaults when the file is absent.
    pub fn read(&self) -> BridgeResult<Preferences> {
        if !self.path.exists() {
            return Ok(Preferences::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        toml::from_str(&contents)
            .map_err(|err| BridgeError::Config(format!("{}: {err}", self.path.display())))
    }

    /// Persist preferences atomically (write-temp-then-rename).
    pub fn write(&self, prefs: &Preferences) -> BridgeResult<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let payload =
            toml::to_string_pretty(prefs).map_err(|err| BridgeError::Config(err.to_string()))?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.as_file_mut().write_all(payload.as_bytes())?;
        temp.as_file_mut().flush()?;
        temp.persist(&self.path)
            .map_err(|err| BridgeError::Io(err.error))?;
        Ok(())
    }
}
