#![forbid(unsafe_code)]

//! Secure host bridge for a BLE keyboard dongle.
//!
//! Owns one radio link at a time, provisions the long-lived per-dongle
//! app key, runs the MTLS-style handshake, and layers a replay-protected
//! encrypted frame protocol under the typing and control verbs. The
//! concrete GATT driver stays behind the `keybridge-link` contracts so
//! the whole stack runs unmodified against the in-memory simulator.

pub mod channel;
pub mod config;
mod crypto;
pub mod error;
pub mod frame;
mod handshake;
pub mod keystore;
pub mod logging;
mod ops;
pub mod password;
pub mod prefs;
pub mod session;
pub mod sim;
pub mod wire;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult, CryptoFault, HandshakeFault, ProvisioningFault};
pub use frame::{Frame, Framer};
pub use keystore::{AppKey, KeyStore};
pub use password::{PasswordPrompt, PasswordRequest};
pub use prefs::{PrefStore, Preferences};
pub use session::{
    BridgeEvent, BridgeLevel, ConnectPhase, ConnectReport, ConnectionState, Orchestrator,
};
