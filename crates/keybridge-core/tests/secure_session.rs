//! End-to-end flows over an established secure session.

mod common;

use common::*;
use keybridge_core::sim::SimDongleConfig;
use keybridge_core::{BridgeError, BridgeLevel, CryptoFault};

#[tokio::test]
async fn cold_start_happy_path_types_a_string() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    let state = bridge.observe();

    let report = bridge.connect(PRIMARY, false).await.unwrap();
    assert!(report
        .events
        .iter()
        .any(|e| e.level == BridgeLevel::Success));

    {
        let snapshot = state.borrow();
        assert!(snapshot.ble_up);
        assert!(snapshot.secure_up);
        assert_eq!(snapshot.current_target.as_deref(), Some(PRIMARY));
        assert!(!snapshot.fast_keys_enabled);
    }

    bridge.send_string("hello").await.unwrap();
    assert_eq!(dongle.typed(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn single_byte_notification_chunks_still_work() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig {
        chunk: 1,
        ..SimDongleConfig::default()
    });

    bridge.connect(PRIMARY, false).await.unwrap();
    bridge.send_string("chunked transport").await.unwrap();
    assert_eq!(bridge.get_layout().await.unwrap(), "US");
    assert_eq!(dongle.typed(), vec!["chunked transport".to_string()]);
}

#[tokio::test]
async fn newline_preference_is_applied_to_the_sent_bytes() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    bridge
        .update_preferences(|p| p.append_newline = true)
        .unwrap();

    bridge.connect(PRIMARY, false).await.unwrap();
    bridge.send_string("hello").await.unwrap();
    assert_eq!(dongle.typed(), vec!["hello\n".to_string()]);
}

#[tokio::test]
async fn corrupted_typing_echo_fails_the_integrity_check() {
    let (mut bridge, _dongle, _dir) = provisioned_harness(SimDongleConfig {
        corrupt_type_digest: true,
        ..SimDongleConfig::default()
    });

    bridge.connect(PRIMARY, false).await.unwrap();
    let err = bridge.send_string("hello").await.unwrap_err();
    assert!(err.to_string().contains("integrity"), "got: {err}");
    // A bad echo is an operation failure, not a channel failure.
    assert!(bridge.connection_state().secure_up);
}

#[tokio::test]
async fn nonzero_typing_status_is_reported() {
    let (mut bridge, _dongle, _dir) = provisioned_harness(SimDongleConfig {
        fail_type_status: Some(3),
        ..SimDongleConfig::default()
    });

    bridge.connect(PRIMARY, false).await.unwrap();
    let err = bridge.send_string("hello").await.unwrap_err();
    assert!(err.to_string().contains("status 3"), "got: {err}");
}

#[tokio::test]
async fn oversized_text_is_rejected_before_it_touches_the_session() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    bridge.connect(PRIMARY, false).await.unwrap();

    let huge = "x".repeat(2_000);
    let err = bridge.send_string(&huge).await.unwrap_err();
    assert!(matches!(err, BridgeError::Framing(_)));
    assert!(dongle.typed().is_empty());

    // The session is untouched; normal traffic continues.
    bridge.send_string("still alive").await.unwrap();
    assert_eq!(dongle.typed(), vec!["still alive".to_string()]);
}

#[tokio::test]
async fn layout_roundtrip_updates_dongle_and_preferences() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    bridge.connect(PRIMARY, false).await.unwrap();

    assert_eq!(bridge.get_layout().await.unwrap(), "US");
    bridge.set_layout("FI").await.unwrap();
    assert_eq!(dongle.layout(), "FI");
    assert_eq!(bridge.preferences().layout.as_deref(), Some("FI"));
    assert_eq!(bridge.get_layout().await.unwrap(), "FI");

    let info = bridge.get_info().await.unwrap();
    assert!(info.contains("LAYOUT=FI"));
}

#[tokio::test]
async fn fast_keys_gate_the_raw_tap_path() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    bridge.connect(PRIMARY, false).await.unwrap();

    bridge.enable_fast_keys().await.unwrap();
    assert!(bridge.connection_state().fast_keys_enabled);

    bridge.raw_key_tap(0x02, 0x04, None).await.unwrap();
    bridge.raw_key_tap(0x00, 0x05, Some(3)).await.unwrap();
    assert_eq!(dongle.taps(), vec![(0x02, 0x04, 1), (0x00, 0x05, 3)]);

    let err = bridge.raw_key_tap(0x00, 0x06, Some(0)).await.unwrap_err();
    assert!(matches!(err, BridgeError::Config(_)));
}

#[tokio::test]
async fn volume_key_remaps_fire_raw_taps() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    bridge
        .update_preferences(|p| {
            p.volume_keys.up = Some(keybridge_core::prefs::KeyTap {
                mods: 0x00,
                usage: 0x52,
            })
        })
        .unwrap();

    bridge.connect(PRIMARY, false).await.unwrap();
    bridge.enable_fast_keys().await.unwrap();

    assert!(bridge.volume_key_tap(true).await.unwrap());
    assert!(!bridge.volume_key_tap(false).await.unwrap());
    assert_eq!(dongle.taps(), vec![(0x00, 0x52, 1)]);
}

#[tokio::test]
async fn disconnect_drops_every_layer_of_state() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    bridge.connect(PRIMARY, false).await.unwrap();
    bridge.enable_fast_keys().await.unwrap();

    bridge.disconnect(false).await;

    let state = bridge.connection_state();
    assert!(!state.ble_up);
    assert!(!state.secure_up);
    assert!(!state.fast_keys_enabled);
    assert!(state.current_target.is_none());
    assert!(!dongle.session_live());
}

#[tokio::test]
async fn forced_rehello_fails_one_operation_then_recovers() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    bridge.connect(PRIMARY, false).await.unwrap();
    bridge.send_string("first").await.unwrap();

    // The dongle restarts its session and announces a fresh hello.
    dongle.force_rehello();

    let err = bridge.send_string("second").await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Crypto(CryptoFault::SessionRestart)
    ));
    assert!(!bridge.connection_state().secure_up);

    // The next operation re-handshakes transparently.
    bridge.send_string("third").await.unwrap();
    assert_eq!(
        dongle.typed(),
        vec!["first".to_string(), "third".to_string()]
    );
}

#[tokio::test]
async fn factory_reset_wipes_both_sides() {
    let (mut bridge, dongle, _dir) = provisioned_harness(SimDongleConfig::default());
    bridge.connect(PRIMARY, false).await.unwrap();

    bridge.factory_reset().await.unwrap();

    assert_eq!(dongle.factory_resets(), 1);
    assert!(dongle.app_key().is_none());
    assert!(!bridge.key_store().contains(PRIMARY));
    assert!(!bridge.connection_state().secure_up);
}
