//! Recovery when the stored app key no longer matches the dongle.

mod common;

use common::*;
use keybridge_core::sim::{SimDongle, SimDongleConfig, SimLink};
use keybridge_core::{BridgeError, HandshakeFault};
use std::sync::Arc;
use tempfile::TempDir;

const DONGLE_KEY: [u8; 32] = [0xD1; 32];
const STALE_KEY: [u8; 32] = [0x0F; 32];

fn mismatched_harness() -> (keybridge_core::Orchestrator<SimLink>, SimDongle, TempDir) {
    let dir = TempDir::new().unwrap();
    let dongle = SimDongle::new(SimDongleConfig::default());
    dongle.set_app_key(DONGLE_KEY);

    let mut link = SimLink::new();
    link.add_peer(PRIMARY, dongle.clone(), -58, true, None);

    let keys = key_store(dir.path());
    keys.put(PRIMARY, &STALE_KEY).unwrap();
    let bridge =
        keybridge_core::Orchestrator::new(link, quick_config(), keys, pref_store(dir.path()))
            .unwrap();
    (bridge, dongle, dir)
}

#[tokio::test]
async fn badmac_triggers_reprovision_and_reconnect() {
    let (mut bridge, dongle, _dir) = mismatched_harness();
    bridge.set_prompt(Arc::new(StaticPrompt("pw")));

    let report = bridge.connect(PRIMARY, true).await.unwrap();
    assert!(report
        .events
        .iter()
        .any(|e| e.message.contains("re-provisioning")));

    // The dongle kept its key; the host replaced its stale copy.
    let stored = bridge.key_store().get(PRIMARY).unwrap();
    assert_eq!(&stored[..], &DONGLE_KEY[..]);

    bridge.send_string("recovered").await.unwrap();
    assert_eq!(dongle.typed(), vec!["recovered".to_string()]);
}

#[tokio::test]
async fn badmac_without_prompt_fails_and_keeps_the_stored_key() {
    let (mut bridge, _dongle, _dir) = mismatched_harness();

    let err = bridge.connect(PRIMARY, false).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Handshake(HandshakeFault::BadMac)
    ));
    // Silent paths must not wipe the key: only a prompt-allowed recovery
    // may re-provision.
    let stored = bridge.key_store().get(PRIMARY).unwrap();
    assert_eq!(&stored[..], &STALE_KEY[..]);
}
