//! Password prompting and normalization.
//!
//! Passwords live in [`Zeroizing`] buffers and are wiped on every exit
//! path. The UI owns a single prompt implementation; the orchestrator
//! consults it during provisioning and refuses silent flows while a prompt
//! is outstanding.

use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

/// Context handed to the prompt so the UI can say which dongle is asking
/// and whether this is a retry after a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRequest {
    pub address: String,
    pub name: Option<String>,
    pub retry: bool,
}

/// Capability the UI provides for collecting the dongle password.
pub trait PasswordPrompt: Send + Sync {
    /// Ask the user for the password. `None` means the user cancelled.
    fn request_password(&self, request: &PasswordRequest) -> Option<Zeroizing<String>>;
}

/// NFKC-fold and strip surrounding whitespace.
///
/// Used for the single retry after a `bad proof` rejection: passwords keyed
/// in with a stray newline or composed characters from a soft keyboard
/// still authenticate against firmware that stored the folded form.
pub fn normalized(password: &str) -> Zeroizing<String> {
    let folded = Zeroizing::new(password.nfkc().collect::<String>());
    Zeroizing::new(folded.trim().to_string())
}
