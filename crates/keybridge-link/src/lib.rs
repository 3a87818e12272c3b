#![forbid(unsafe_code)]

//! Transport contracts shared across the keybridge workspace.
//!
//! The core crate drives one dongle at a time through the [`BleLink`]
//! capability trait and never touches a concrete GATT stack. Platform
//! adapters implement the trait against their native BLE driver; the
//! in-repo dongle simulator implements it in memory for tests.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// A dongle as seen by the radio: stable address, optional advertised name,
/// bond state, and the signal strength from the most recent sighting.
///
/// Identities are created during scans and refreshed on rescan or bond
/// events; no single component owns them exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DongleIdentity {
    /// Opaque, stable device address. Treated as a key, never parsed.
    pub address: String,
    pub name: Option<String>,
    pub bonded: bool,
    /// Last observed RSSI in dBm, when the backend reports one.
    pub rssi: Option<i16>,
}

impl DongleIdentity {
    /// Render a concise human-readable summary for prompts and logs.
    pub fn describe(&self) -> String {
        let mut traits = Vec::new();
        if let Some(name) = self.name.as_deref() {
            if !name.is_empty() {
                traits.push(name.trim().to_string());
            }
        }
        if self.bonded {
            traits.push("bonded".to_string());
        }
        if let Some(rssi) = self.rssi {
            traits.push(format!("{rssi} dBm"));
        }
        if traits.is_empty() {
            self.address.clone()
        } else {
            format!("{} ({})", self.address, traits.join(", "))
        }
    }
}

/// Whether a GATT write expects a link-layer acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Errors surfaced by a link implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("link is not connected")]
    NotConnected,

    #[error("GATT write rejected: {0}")]
    WriteRejected(String),

    #[error("enabling notifications failed: {0}")]
    SubscribeFailed(String),

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Single-owner GATT session capability consumed by the bridge core.
///
/// Implementations hold at most one active connection. A reconnect to the
/// current address reuses the link; connecting to a different address must
/// tear the old link down (and wait for the disconnect) first. Adapter
/// policy that the core does not observe directly, but that real backends
/// must honor before resolving [`BleLink::connect`]:
///
/// - request high link priority, then negotiate a larger MTU (target ~185
///   bytes, falling back gracefully on rejection);
/// - discover services and write the notification descriptor for the
///   configured notify characteristic;
/// - drop stale callbacks from any previous GATT handle.
///
/// Notifications have exactly one consumer. Chunks that arrive while no
/// read is pending are buffered FIFO and handed out in order.
#[allow(async_fn_in_trait)]
pub trait BleLink {
    /// Scan for nearby dongles for up to `duration`.
    async fn scan(&mut self, duration: Duration) -> Result<Vec<DongleIdentity>, LinkError>;

    /// Passive RSSI sweep over `targets`; absent entries were not seen.
    async fn scan_for_rssi(
        &mut self,
        targets: &[String],
        duration: Duration,
    ) -> Result<HashMap<String, i16>, LinkError>;

    /// Connect and prepare the notification channel. Resolves only once
    /// services are discovered and the notify descriptor is written.
    async fn connect(
        &mut self,
        address: &str,
        timeout: Option<Duration>,
    ) -> Result<(), LinkError>;

    /// Write raw bytes to the dongle's write characteristic.
    async fn write(&mut self, payload: &[u8], kind: WriteKind) -> Result<(), LinkError>;

    /// Tear down the active connection, if any.
    async fn disconnect(&mut self);

    /// Wait until the link reports down; `false` on timeout.
    async fn await_disconnected(&mut self, timeout: Duration) -> bool;

    /// Next buffered or incoming notification chunk; `None` on timeout.
    async fn next_notification(&mut self, timeout: Duration) -> Option<Vec<u8>>;

    /// Initiate bonding with a device.
    async fn pair(&mut self, address: &str) -> Result<(), LinkError>;

    /// Remove an existing bond.
    async fn unpair(&mut self, address: &str) -> Result<(), LinkError>;

    /// Wait for the bond with `address` to complete; `false` on timeout.
    async fn await_bonded(&mut self, address: &str, timeout: Duration) -> bool;

    /// Whether a connection is currently established.
    fn is_up(&self) -> bool;

    /// Address of the connected dongle, if any.
    fn current_address(&self) -> Option<&str>;

    /// Devices known to the backend (bond table plus recent scan results).
    fn known_devices(&self) -> Vec<DongleIdentity>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_includes_name_bond_and_rssi() {
        let id = DongleIdentity {
            address: "AA:BB:CC:DD:EE:FF".into(),
            name: Some("Keybridge Dongle".into()),
            bonded: true,
            rssi: Some(-61),
        };
        let summary = id.describe();
        assert!(summary.contains("AA:BB:CC:DD:EE:FF"));
        assert!(summary.contains("Keybridge Dongle"));
        assert!(summary.contains("bonded"));
        assert!(summary.contains("-61 dBm"));
    }

    #[test]
    fn describe_falls_back_to_address() {
        let id = DongleIdentity {
            address: "11:22:33:44:55:66".into(),
            name: None,
            bonded: false,
            rssi: None,
        };
        assert_eq!(id.describe(), "11:22:33:44:55:66");
    }

    #[test]
    fn link_error_display_is_stable() {
        let err = LinkError::ConnectFailed {
            address: "AA:BB".into(),
            reason: "no advertisement".into(),
        };
        assert_eq!(err.to_string(), "connect to AA:BB failed: no advertisement");
    }
}
