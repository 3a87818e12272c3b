//! At-rest storage for per-dongle app keys.
//!
//! Slots are keyed by a hash of the device address so raw addresses never
//! appear in storage. Key material is sealed through the [`KeyWrap`]
//! capability before it touches disk; platforms with a hardware-backed
//! non-exportable key implement the trait against it, and [`FileWrap`] is
//! the portable software fallback.

use crate::crypto::{self, TAG_LEN};
use crate::error::{BridgeError, BridgeResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// App keys are always exactly 32 bytes.
pub const APP_KEY_LEN: usize = 32;

/// A 32-byte per-dongle secret, wiped from memory on drop.
pub type AppKey = Zeroizing<[u8; APP_KEY_LEN]>;

const WRAP_SECRET_FILE: &str = "wrap.secret";
const SLOT_SUFFIX: &str = ".key";
const WRAP_IV_LEN: usize = 16;

/// Stable 128-bit slot identifier for a device address.
///
/// `SHA-256(lowercase(trim(address)))[0..16]`, hex encoded. Addresses that
/// differ only in case or surrounding whitespace share a slot.
pub fn slot_id(device_id: &str) -> String {
    let canonical = device_id.trim().to_lowercase();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..16])
}

/// Capability seam for the wrapping key.
///
/// `wrap` failures propagate: a caller must refuse to proceed without a
/// stored key. `unwrap_key` treats every decode, tag, or size failure as
/// "no key" and returns `None`.
pub trait KeyWrap {
    fn wrap(&self, plain: &[u8]) -> BridgeResult<Vec<u8>>;
    fn unwrap_key(&self, sealed: &[u8]) -> Option<Zeroizing<Vec<u8>>>;
}

/// Software wrap backed by a machine-local secret file.
///
/// Encrypt-then-MAC: a random 16-byte IV, AES-128-CTR under an
/// encryption subkey, and a truncated HMAC-SHA256 tag under a separate MAC
/// subkey, both derived from the wrap secret. Weaker than a hardware-held
/// asymmetric key because the secret is exportable by anything that can
/// read the file; the 0o600 mode is the only barrier.
pub struct FileWrap {
    secret: Zeroizing<[u8; 32]>,
}

impl FileWrap {
    /// Load the wrap secret from `dir`, creating it on first use.
    pub fn load_or_create(dir: &Path) -> BridgeResult<Self> {
        let path = dir.join(WRAP_SECRET_FILE);
        if path.exists() {
            let raw = fs::read(&path)?;
            if raw.len() != 32 {
                return Err(BridgeError::Config(format!(
                    "wrap secret at {} is {} bytes, expected 32",
                    path.display(),
                    raw.len()
                )));
            }
            let mut secret = Zeroizing::new([0u8; 32]);
            secret.copy_from_slice(&raw);
            return Ok(Self { secret });
        }

        let mut secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut secret[..]);
        write_private_file(&path, &secret[..])?;
        Ok(Self { secret })
    }

    fn enc_key(&self) -> Zeroizing<[u8; 32]> {
        crypto::hmac_sha256(&self.secret[..], &[b"WRAPENC"])
    }

    fn mac_key(&self) -> Zeroizing<[u8; 32]> {
        crypto::hmac_sha256(&self.secret[..], &[b"WRAPMAC"])
    }
}

impl KeyWrap for FileWrap {
    fn wrap(&self, plain: &[u8]) -> BridgeResult<Vec<u8>> {
        let mut iv = [0u8; WRAP_IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut cipher = plain.to_vec();
        crypto::aes_ctr_apply(&self.enc_key(), &iv, &mut cipher);
        let tag = crypto::hmac_tag16(&self.mac_key()[..], &[&iv, &cipher]);

        let mut out = Vec::with_capacity(WRAP_IV_LEN + cipher.len() + TAG_LEN);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&cipher);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn unwrap_key(&self, sealed: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        if sealed.len() < WRAP_IV_LEN + TAG_LEN {
            return None;
        }
        let (iv, rest) = sealed.split_at(WRAP_IV_LEN);
        let (cipher, tag) = rest.split_at(rest.len() - TAG_LEN);

        let expected = crypto::hmac_tag16(&self.mac_key()[..], &[iv, cipher]);
        if !crypto::tags_match(&expected, tag) {
            return None;
        }

        let iv: [u8; WRAP_IV_LEN] = iv.try_into().ok()?;
        let mut plain = Zeroizing::new(cipher.to_vec());
        crypto::aes_ctr_apply(&self.enc_key(), &iv, &mut plain);
        Some(plain)
    }
}

/// Persists, retrieves, and wipes per-dongle app keys.
pub struct KeyStore<W = FileWrap> {
    dir: PathBuf,
    wrap: W,
}

impl KeyStore<FileWrap> {
    /// Open a store rooted at `dir` with the file-backed software wrap.
    pub fn open(dir: impl Into<PathBuf>) -> BridgeResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let wrap = FileWrap::load_or_create(&dir)?;
        Ok(Self { dir, wrap })
    }
}

impl<W: KeyWrap> KeyStore<W> {
    /// Open a store with a caller-provided wrap implementation.
    pub fn with_wrap(dir: impl Into<PathBuf>, wrap: W) -> BridgeResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, wrap })
    }

    fn slot_path(&self, device_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", slot_id(device_id), SLOT_SUFFIX))
    }

    /// Seal and persist a 32-byte app key for `device_id`.
    pub fn put(&self, device_id: &str, key: &[u8; APP_KEY_LEN]) -> BridgeResult<()> {
        let sealed = self.wrap.wrap(key)?;
        let encoded = BASE64.encode(sealed);
        write_private_file(&self.slot_path(device_id), encoded.as_bytes())
    }

    /// Retrieve the app key for `device_id`.
    ///
    /// Any missing slot, decode failure, tag mismatch, or size mismatch
    /// yields `None`; this never raises.
    pub fn get(&self, device_id: &str) -> Option<AppKey> {
        let text = fs::read_to_string(self.slot_path(device_id)).ok()?;
        let sealed = BASE64.decode(text.trim()).ok()?;
        let plain = self.wrap.unwrap_key(&sealed)?;
        if plain.len() != APP_KEY_LEN {
            return None;
        }
        let mut key = Zeroizing::new([0u8; APP_KEY_LEN]);
        key.copy_from_slice(&plain);
        Some(key)
    }

    /// Whether a usable key is stored for `device_id`.
    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    /// Remove the slot ciphertext. The wrap secret is retained so
    /// re-provisioning the same device stays fast.
    pub fn clear(&self, device_id: &str) -> BridgeResult<()> {
        match fs::remove_file(self.slot_path(device_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Write `contents` atomically with owner-only permissions.
fn write_private_file(path: &Path, contents: &[u8]) -> BridgeResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file_mut().flush()?;
    #[cfg(unix)]
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
    temp.persist(path)
        .map_err(|err| BridgeError::Io(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn slot_id_canonicalizes_case_and_whitespace() {
        let a = slot_id("AA:BB:CC:DD:EE:FF");
        let b = slot_id("  aa:bb:cc:dd:ee:ff\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32); // 16 bytes, hex
        assert_ne!(a, slot_id("AA:BB:CC:DD:EE:00"));
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let key = [0x5Au8; APP_KEY_LEN];

        store.put("AA:BB:CC:DD:EE:FF", &key).unwrap();
        let loaded = store.get("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(&loaded[..], &key[..]);
        assert!(store.contains("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn missing_slot_is_none() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        assert!(store.get("11:22:33:44:55:66").is_none());
    }

    #[test]
    fn tampered_ciphertext_is_none() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let addr = "AA:BB:CC:DD:EE:FF";
        store.put(addr, &[0x11; APP_KEY_LEN]).unwrap();

        let path = dir.path().join(format!("{}{}", slot_id(addr), SLOT_SUFFIX));
        let mut sealed = BASE64.decode(fs::read_to_string(&path).unwrap().trim()).unwrap();
        sealed[WRAP_IV_LEN + 3] ^= 0x80;
        fs::write(&path, BASE64.encode(sealed)).unwrap();

        assert!(store.get(addr).is_none());
    }

    #[test]
    fn garbage_slot_contents_are_none() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let addr = "AA:BB:CC:DD:EE:FF";
        let path = dir.path().join(format!("{}{}", slot_id(addr), SLOT_SUFFIX));
        fs::write(&path, "not base64 at all !!!").unwrap();
        assert!(store.get(addr).is_none());
    }

    #[test]
    fn clear_removes_only_the_slot() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let addr = "AA:BB:CC:DD:EE:FF";
        store.put(addr, &[0x22; APP_KEY_LEN]).unwrap();

        store.clear(addr).unwrap();
        assert!(store.get(addr).is_none());
        // Clearing twice is fine.
        store.clear(addr).unwrap();
        // The wrap secret survives, so a fresh put still works.
        assert!(dir.path().join(WRAP_SECRET_FILE).exists());
        store.put(addr, &[0x33; APP_KEY_LEN]).unwrap();
        assert!(store.contains(addr));
    }

    #[test]
    fn reopened_store_reads_existing_slots() {
        let dir = tempdir().unwrap();
        let key = [0x77u8; APP_KEY_LEN];
        {
            let store = KeyStore::open(dir.path()).unwrap();
            store.put("AA:BB", &key).unwrap();
        }
        let store = KeyStore::open(dir.path()).unwrap();
        assert_eq!(&store.get("AA:BB").unwrap()[..], &key[..]);
    }

    #[cfg(unix)]
    #[test]
    fn secret_and_slots_are_owner_only() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        store.put("AA:BB", &[0x44; APP_KEY_LEN]).unwrap();

        let secret_mode = fs::metadata(dir.path().join(WRAP_SECRET_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(secret_mode & 0o777, 0o600);
    }
}
