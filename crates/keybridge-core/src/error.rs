//! Error taxonomy for the bridge core.
//!
//! Device-reported `0xFF` reasons are classified into stable fault enums so
//! user-visible strings never echo raw dongle bytes unless no class matches.

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Unified error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing selection, disabled toggle, absent prompt, bad parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// A connect attempt is already running; the new request was refused
    /// without perturbing the ongoing one.
    #[error("a connect attempt is already in progress")]
    Busy,

    #[error("transport error: {0}")]
    Transport(#[from] keybridge_link::LinkError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningFault),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeFault),

    #[error("secure channel error: {0}")]
    Crypto(#[from] CryptoFault),

    /// Unexpected op, malformed reply, empty info text.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Classified dongle refusals during APPKEY provisioning (A-phase `0xFF`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisioningFault {
    #[error("dongle is locked to another host; factory reset required")]
    LockedNeedsReset,

    #[error("dongle already holds an app key for this host")]
    AlreadyProvisioned,

    #[error("dongle firmware lacks key-derivation support")]
    KdfMissing,

    #[error("dongle refused to release the app key")]
    FetchBlocked,

    #[error("the dongle rejected the password")]
    BadPassword,

    #[error("dongle had no pending challenge for the proof")]
    NoPendingChallenge,

    #[error("dongle is rate-limiting provisioning attempts")]
    RateLimited,

    #[error("dongle failed to send the app key")]
    SendFailed,

    /// No known class matched; the device's own reason is surfaced.
    #[error("dongle reported: {0}")]
    Device(String),
}

impl ProvisioningFault {
    /// Map a device `0xFF` reason onto a stable classification.
    pub fn classify(reason: &str) -> Self {
        let trimmed = reason.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.contains("locked_single_need_reset") || lower.contains("locked") {
            Self::LockedNeedsReset
        } else if lower.contains("already set") {
            Self::AlreadyProvisioned
        } else if lower.contains("kdf missing") {
            Self::KdfMissing
        } else if lower.contains("get_appkey blocked") {
            Self::FetchBlocked
        } else if lower.contains("bad proof") || lower.contains("hmac fail") {
            Self::BadPassword
        } else if lower.contains("no pending chal") {
            Self::NoPendingChallenge
        } else if lower.contains("rate") {
            Self::RateLimited
        } else if lower.contains("send fail") {
            Self::SendFailed
        } else {
            Self::Device(trimmed.to_string())
        }
    }

    pub fn is_bad_password(&self) -> bool {
        matches!(self, Self::BadPassword)
    }
}

/// Classified failures while establishing the secure session (B-phase).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeFault {
    /// The dongle rejected our key-exchange MAC: the stored app key does
    /// not match the dongle's. Recoverable by re-provisioning.
    #[error("dongle rejected the key-exchange proof; stored app key is stale")]
    BadMac,

    #[error("dongle failed to derive session keys")]
    Derive,

    #[error("server finish MAC did not verify")]
    FinishMismatch,

    #[error("no app key stored for this dongle")]
    MissingAppKey,

    /// The unsolicited server hello never arrived in its window.
    #[error("no server hello received")]
    NoHello,

    #[error("dongle reported: {0}")]
    Device(String),
}

impl HandshakeFault {
    /// Map a device `0xFF` reason onto a stable classification.
    pub fn classify(reason: &str) -> Self {
        let trimmed = reason.trim();
        if trimmed.contains("BADMAC") {
            Self::BadMac
        } else if trimmed.contains("DERIVE") {
            Self::Derive
        } else {
            Self::Device(trimmed.to_string())
        }
    }

    /// Whether wiping the stored app key and re-provisioning can recover.
    pub fn invalidates_app_key(&self) -> bool {
        matches!(self, Self::BadMac | Self::FinishMismatch)
    }
}

/// Secure-channel failures. Any of these abandons the live session.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CryptoFault {
    #[error("envelope MAC mismatch")]
    MacMismatch,

    #[error("envelope does not match its declared layout")]
    LengthMismatch,

    #[error("send counter exhausted; session must be re-established")]
    SequenceWrap,

    /// A fresh server hello arrived where encrypted traffic was expected:
    /// the dongle discarded the session and wants a new handshake.
    #[error("dongle forced a new handshake")]
    SessionRestart,
}
