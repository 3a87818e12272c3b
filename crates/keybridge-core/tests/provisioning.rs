//! APPKEY provisioning flows against a fresh or misbehaving dongle.

mod common;

use common::*;
use keybridge_core::sim::{SimDongle, SimDongleConfig, SimLink};
use keybridge_core::{
    BridgeError, HandshakeFault, Orchestrator, ProvisioningFault,
};
use std::sync::Arc;
use tempfile::TempDir;

/// A dongle at [`PRIMARY`] with no key on either side.
fn fresh_harness(cfg: SimDongleConfig) -> (Orchestrator<SimLink>, SimDongle, TempDir) {
    let dir = TempDir::new().unwrap();
    let dongle = SimDongle::new(cfg);
    let mut link = SimLink::new();
    link.add_peer(PRIMARY, dongle.clone(), -55, true, Some("new dongle"));
    let bridge = orchestrator(link, dir.path());
    (bridge, dongle, dir)
}

#[tokio::test]
async fn fresh_device_provisions_with_wrapped_delivery() {
    let (mut bridge, dongle, _dir) = fresh_harness(SimDongleConfig::default());
    bridge.set_prompt(Arc::new(StaticPrompt("pw")));

    bridge.connect(PRIMARY, true).await.unwrap();

    let dongle_key = dongle.app_key().expect("dongle generated a key");
    let stored = bridge.key_store().get(PRIMARY).expect("key stored");
    assert_eq!(&stored[..], &dongle_key[..]);
    assert_eq!(dongle.challenges_issued(), 1);

    bridge.send_string("provisioned").await.unwrap();
    assert_eq!(dongle.typed(), vec!["provisioned".to_string()]);
}

#[tokio::test]
async fn legacy_raw_delivery_is_still_accepted() {
    let (mut bridge, dongle, _dir) = fresh_harness(SimDongleConfig {
        wrapped_delivery: false,
        ..SimDongleConfig::default()
    });
    bridge.set_prompt(Arc::new(StaticPrompt("pw")));

    bridge.connect(PRIMARY, true).await.unwrap();

    let dongle_key = dongle.app_key().unwrap();
    let stored = bridge.key_store().get(PRIMARY).unwrap();
    assert_eq!(&stored[..], &dongle_key[..]);
}

#[tokio::test]
async fn sloppy_password_entry_succeeds_via_normalized_retry() {
    let (mut bridge, dongle, _dir) = fresh_harness(SimDongleConfig::default());
    // A trailing newline and leading space, as pasted from a manager.
    bridge.set_prompt(Arc::new(StaticPrompt(" pw\n")));

    bridge.connect(PRIMARY, true).await.unwrap();

    // The rejected first proof forced a fresh challenge for the retry.
    assert_eq!(dongle.challenges_issued(), 2);
    assert!(bridge.key_store().contains(PRIMARY));
}

#[tokio::test]
async fn genuinely_wrong_password_is_classified() {
    let (mut bridge, dongle, _dir) = fresh_harness(SimDongleConfig::default());
    bridge.set_prompt(Arc::new(StaticPrompt("nope")));

    let err = bridge.connect(PRIMARY, true).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Provisioning(ProvisioningFault::BadPassword)
    ));
    // No normalized retry: the folded form is identical.
    assert_eq!(dongle.challenges_issued(), 1);
    assert!(!bridge.key_store().contains(PRIMARY));
}

#[tokio::test]
async fn cancelled_prompt_aborts_cleanly() {
    let (mut bridge, _dongle, _dir) = fresh_harness(SimDongleConfig::default());
    bridge.set_prompt(Arc::new(CancelPrompt));

    let err = bridge.connect(PRIMARY, true).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"), "got: {err}");
    assert!(!bridge.key_store().contains(PRIMARY));
}

#[tokio::test]
async fn silent_connect_refuses_to_provision() {
    let (mut bridge, dongle, _dir) = fresh_harness(SimDongleConfig::default());

    let err = bridge.connect(PRIMARY, false).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Handshake(HandshakeFault::MissingAppKey)
    ));
    assert_eq!(dongle.challenges_issued(), 0);
}

#[tokio::test]
async fn provisioning_is_idempotent_unless_forced() {
    let (mut bridge, dongle, _dir) = fresh_harness(SimDongleConfig::default());
    dongle.set_app_key(APP_KEY);
    bridge.key_store().put(PRIMARY, &APP_KEY).unwrap();
    bridge.set_prompt(Arc::new(StaticPrompt("pw")));

    let report = bridge.provision(PRIMARY, false).await.unwrap();
    assert!(report
        .events
        .iter()
        .any(|e| e.message.contains("nothing to do")));
    assert_eq!(dongle.challenges_issued(), 0);

    // Forced refetch re-runs the exchange; the dongle hands out its
    // existing key.
    bridge.provision(PRIMARY, true).await.unwrap();
    assert_eq!(dongle.challenges_issued(), 1);
    let stored = bridge.key_store().get(PRIMARY).unwrap();
    assert_eq!(&stored[..], &APP_KEY[..]);
}

#[tokio::test]
async fn already_provisioned_refusal_is_classified() {
    let (mut bridge, dongle, _dir) = fresh_harness(SimDongleConfig {
        refuse_reprovision: true,
        ..SimDongleConfig::default()
    });
    dongle.set_app_key(APP_KEY);
    bridge.set_prompt(Arc::new(StaticPrompt("pw")));

    let err = bridge.connect(PRIMARY, true).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Provisioning(ProvisioningFault::AlreadyProvisioned)
    ));
}
