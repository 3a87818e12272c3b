//! Shared fixtures for the end-to-end suites.

#![allow(dead_code)]

use keybridge_core::keystore::KeyStore;
use keybridge_core::sim::{SimDongle, SimDongleConfig, SimLink};
use keybridge_core::{
    BridgeConfig, Orchestrator, PasswordPrompt, PasswordRequest, PrefStore,
};
use std::path::Path;
use tempfile::TempDir;
use zeroize::Zeroizing;

pub const PRIMARY: &str = "AA:BB:CC:DD:EE:01";
pub const APP_KEY: [u8; 32] = [0x42; 32];

/// Prompt that always supplies the same password.
pub struct StaticPrompt(pub &'static str);

impl PasswordPrompt for StaticPrompt {
    fn request_password(&self, _request: &PasswordRequest) -> Option<Zeroizing<String>> {
        Some(Zeroizing::new(self.0.to_string()))
    }
}

/// Prompt standing in for a user dismissing the dialog.
pub struct CancelPrompt;

impl PasswordPrompt for CancelPrompt {
    fn request_password(&self, _request: &PasswordRequest) -> Option<Zeroizing<String>> {
        None
    }
}

/// Defaults with retry pacing collapsed so failure paths stay fast.
pub fn quick_config() -> BridgeConfig {
    let mut cfg = BridgeConfig::default();
    cfg.retry.max_attempts = 1;
    cfg.retry.base_delay_ms = 1;
    cfg
}

pub fn key_store(dir: &Path) -> KeyStore {
    KeyStore::open(dir.join("keys")).unwrap()
}

pub fn pref_store(dir: &Path) -> PrefStore {
    PrefStore::new(dir.join("prefs.toml"))
}

pub fn orchestrator(link: SimLink, dir: &Path) -> Orchestrator<SimLink> {
    Orchestrator::new(link, quick_config(), key_store(dir), pref_store(dir)).unwrap()
}

/// A dongle at [`PRIMARY`] already provisioned on both sides.
pub fn provisioned_harness(
    cfg: SimDongleConfig,
) -> (Orchestrator<SimLink>, SimDongle, TempDir) {
    let dir = TempDir::new().unwrap();
    let dongle = SimDongle::new(cfg);
    dongle.set_app_key(APP_KEY);

    let mut link = SimLink::new();
    link.add_peer(PRIMARY, dongle.clone(), -60, true, Some("desk dongle"));

    let keys = key_store(dir.path());
    keys.put(PRIMARY, &APP_KEY).unwrap();

    let orchestrator =
        Orchestrator::new(link, quick_config(), keys, pref_store(dir.path())).unwrap();
    (orchestrator, dongle, dir)
}
