//! The secure envelope: replay-protected, MAC-verified AES-CTR frames
//! carried inside outer `0xB3` frames.
//!
//! Both directions share one key set but use distinct direction bytes in
//! the IV and MAC derivations, so host→dongle and dongle→host keystreams
//! never collide. Sequence counters advance monotonically and the session
//! is abandoned before either counter can wrap and reuse an IV.

use crate::crypto::{self, TAG_LEN};
use crate::error::CryptoFault;
use crate::frame::{op, Frame, HEADER_LEN};
use zeroize::Zeroizing;

/// Direction byte for frames the host sends.
const DIR_CLIENT: u8 = b'C';
/// Direction byte for frames the dongle sends.
const DIR_SERVER: u8 = b'S';

/// Envelope bytes around the ciphertext: `seq(2) || clen(2) || ... || mac`.
const ENVELOPE_OVERHEAD: usize = 4 + TAG_LEN;

/// Longest inner payload whose envelope still fits inside
/// [`crate::frame::MAX_PAYLOAD`]. Anything larger would be dropped by the
/// receiving framer's length sanity check.
pub const MAX_INNER_PAYLOAD: usize =
    crate::frame::MAX_PAYLOAD - ENVELOPE_OVERHEAD - HEADER_LEN;

/// Which end of the channel this state machine speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Dongle,
}

impl Role {
    fn send_dir(self) -> u8 {
        match self {
            Role::Host => DIR_CLIENT,
            Role::Dongle => DIR_SERVER,
        }
    }

    fn recv_dir(self) -> u8 {
        match self {
            Role::Host => DIR_SERVER,
            Role::Dongle => DIR_CLIENT,
        }
    }
}

/// Per-session subkeys. Exist only while the session is live; zeroized on
/// drop.
pub struct SessionKeys {
    k_enc: Zeroizing<[u8; 32]>,
    k_mac: Zeroizing<[u8; 32]>,
    k_iv: Zeroizing<[u8; 32]>,
}

impl SessionKeys {
    /// Derive the ENC/MAC/IV subkeys from the HKDF session key.
    pub fn derive(session_key: &[u8]) -> Self {
        Self {
            k_enc: crypto::hmac_sha256(session_key, &[b"ENC"]),
            k_mac: crypto::hmac_sha256(session_key, &[b"MAC"]),
            k_iv: crypto::hmac_sha256(session_key, &[b"IVK"]),
        }
    }

    pub(crate) fn mac_key(&self) -> &[u8] {
        &self.k_mac[..]
    }
}

/// Live secure-session state: session id, subkeys, and both counters.
pub struct SessionState {
    sid: u32,
    role: Role,
    seq_out: u16,
    seq_in: u16,
    keys: SessionKeys,
}

impl SessionState {
    pub fn new(sid: u32, keys: SessionKeys, role: Role) -> Self {
        Self {
            sid,
            role,
            seq_out: 0,
            seq_in: 0,
            keys,
        }
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn seq_out(&self) -> u16 {
        self.seq_out
    }

    pub fn seq_in(&self) -> u16 {
        self.seq_in
    }

    fn iv_for(&self, dir: u8, seq: u16) -> [u8; TAG_LEN] {
        crypto::hmac_tag16(
            &self.keys.k_iv[..],
            &[b"IV1", &self.sid.to_be_bytes(), &[dir], &seq.to_be_bytes()],
        )
    }

    /// Seal an inner application frame into an outer envelope frame.
    ///
    /// Refuses to send once the counter reaches `0xFFFF`: the session must
    /// be re-established instead of reusing an IV.
    pub fn seal(&mut self, inner: &Frame) -> Result<Frame, CryptoFault> {
        if self.seq_out == u16::MAX {
            return Err(CryptoFault::SequenceWrap);
        }
        let seq = self.seq_out;
        let dir = self.role.send_dir();
        let sid_be = self.sid.to_be_bytes();
        let seq_be = seq.to_be_bytes();

        let iv = self.iv_for(dir, seq);
        let mut cipher = inner.encode();
        crypto::aes_ctr_apply(&self.keys.k_enc, &iv, &mut cipher);
        let mac = crypto::hmac_tag16(
            &self.keys.k_mac[..],
            &[b"ENCM", &sid_be, &[dir], &seq_be, &cipher],
        );

        let mut payload = Vec::with_capacity(4 + cipher.len() + TAG_LEN);
        payload.extend_from_slice(&seq_be);
        payload.extend_from_slice(&(cipher.len() as u16).to_be_bytes());
        payload.extend_from_slice(&cipher);
        payload.extend_from_slice(&mac);

        self.seq_out = self.seq_out.wrapping_add(1);
        Ok(Frame::new(op::ENVELOPE, payload))
    }

    /// Open an envelope frame.
    ///
    /// `Ok(None)` means the frame was a replay (or arrived out of order)
    /// and was dropped without touching the counter. Any `Err` abandons
    /// the session: the caller must discard this state.
    pub fn open(&mut self, outer: &Frame) -> Result<Option<Frame>, CryptoFault> {
        let payload = &outer.payload;
        if payload.len() < 4 + TAG_LEN {
            return Err(CryptoFault::LengthMismatch);
        }
        let seq = u16::from_be_bytes([payload[0], payload[1]]);
        let clen = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        if payload.len() != 4 + clen + TAG_LEN {
            return Err(CryptoFault::LengthMismatch);
        }
        if seq != self.seq_in {
            return Ok(None);
        }
        if seq == u16::MAX {
            // An honest peer abandons before sending this sequence number.
            return Err(CryptoFault::SequenceWrap);
        }

        let dir = self.role.recv_dir();
        let sid_be = self.sid.to_be_bytes();
        let seq_be = seq.to_be_bytes();
        let cipher = &payload[4..4 + clen];
        let mac = &payload[4 + clen..];

        let expected = crypto::hmac_tag16(
            &self.keys.k_mac[..],
            &[b"ENCM", &sid_be, &[dir], &seq_be, cipher],
        );
        if !crypto::tags_match(&expected, mac) {
            return Err(CryptoFault::MacMismatch);
        }

        let iv = self.iv_for(dir, seq);
        let mut plain = cipher.to_vec();
        crypto::aes_ctr_apply(&self.keys.k_enc, &iv, &mut plain);

        if plain.len() < HEADER_LEN {
            return Err(CryptoFault::LengthMismatch);
        }
        let inner_len = u16::from_le_bytes([plain[1], plain[2]]) as usize;
        if plain.len() != HEADER_LEN + inner_len {
            return Err(CryptoFault::LengthMismatch);
        }

        self.seq_in = self.seq_in.wrapping_add(1);
        Ok(Some(Frame {
            op: plain[0],
            payload: plain[HEADER_LEN..].to_vec(),
        }))
    }
}
