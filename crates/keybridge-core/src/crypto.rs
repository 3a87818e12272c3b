//! Shared crypto helpers for the handshake, secure channel, and key store.
//!
//! All MAC tags on the wire are 16-byte truncations of HMAC-SHA256, and all
//! symmetric encryption is AES-128-CTR keyed from the first 16 bytes of a
//! 32-byte derived key.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Truncated tag length used throughout the wire protocol.
pub(crate) const TAG_LEN: usize = 16;

/// HMAC-SHA256 over the concatenation of `parts`.
pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Zeroizing<[u8; 32]> {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    Zeroizing::new(mac.finalize().into_bytes().into())
}

/// First 16 bytes of the HMAC-SHA256 over `parts`.
pub(crate) fn hmac_tag16(key: &[u8], parts: &[&[u8]]) -> [u8; TAG_LEN] {
    let full = hmac_sha256(key, parts);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    tag
}

/// Constant-time tag comparison; length mismatch is a plain failure.
pub(crate) fn tags_match(expected: &[u8], got: &[u8]) -> bool {
    expected.len() == got.len() && bool::from(expected.ct_eq(got))
}

/// PBKDF2-HMAC-SHA256 password verifier.
pub(crate) fn password_verifier(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Zeroizing<[u8; 32]> {
    let mut out = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations.max(1), &mut out[..]);
    out
}

/// HKDF-SHA256 extract-and-expand to 32 bytes.
pub(crate) fn hkdf_expand32(salt: &[u8], ikm: &[u8], info: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut out[..])
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

/// Apply the AES-128-CTR keystream in place. Only the first 16 bytes of the
/// 32-byte key material are used.
pub(crate) fn aes_ctr_apply(key: &[u8; 32], iv: &[u8; TAG_LEN], data: &mut [u8]) {
    let key16: &[u8; 16] = key[..16].try_into().expect("key is 32 bytes");
    let mut cipher = Aes128Ctr::new(key16.into(), iv.into());
    cipher.apply_keystream(data);
}
