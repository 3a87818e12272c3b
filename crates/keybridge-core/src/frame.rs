//! Wire framing: `[op u8][len u16 LE][payload]` frames reassembled from
//! arbitrary notification chunks, with one-byte resync on implausible
//! headers.
//!
//! The framer is a pure byte-to-frame transducer. Semantic interpretation
//! of the op byte happens in the layers above.

/// Wire op codes. Directionality and payload layouts are documented on the
/// protocol table; the framer itself treats them as opaque.
pub mod op {
    /// Generic empty acknowledgement (S→C).
    pub const ACK: u8 = 0x00;
    /// Request an APPKEY challenge (C→S, empty).
    pub const KEY_REQUEST: u8 = 0xA0;
    /// APPKEY material: raw 32 bytes or `cipher(32) || mac(16)` (S→C).
    pub const KEY_MATERIAL: u8 = 0xA1;
    /// APPKEY challenge: `salt(16) || iters(4 LE) || chal(16)` (S→C).
    pub const KEY_CHALLENGE: u8 = 0xA2;
    /// APPKEY proof: HMAC-SHA256, 32 bytes (C→S).
    pub const KEY_PROOF: u8 = 0xA3;
    /// Server hello: `srvPub(65) || sid(4 BE)` (S→C).
    pub const SERVER_HELLO: u8 = 0xB0;
    /// Client hello: `cliPub(65) || mac(16)` (C→S).
    pub const CLIENT_HELLO: u8 = 0xB1;
    /// Server finish: `mac(16)` (S→C).
    pub const SERVER_FINISH: u8 = 0xB2;
    /// Secure envelope: `seq(2 BE) || clen(2 BE) || cipher || mac(16)`.
    pub const ENVELOPE: u8 = 0xB3;
    /// Set keyboard layout: UTF-8 code (C→S).
    pub const SET_LAYOUT: u8 = 0xC0;
    /// Request the info text (C→S, empty).
    pub const GET_INFO: u8 = 0xC1;
    /// Info text: ASCII `KEY=value; ...` fields (S→C).
    pub const INFO: u8 = 0xC2;
    /// Factory reset (C→S, empty).
    pub const FACTORY_RESET: u8 = 0xC4;
    /// Enable raw-fast key mode: `[0x01]` (C→S).
    pub const FAST_KEYS: u8 = 0xC8;
    /// Type a string: UTF-8 bytes (C→S).
    pub const TYPE_TEXT: u8 = 0xD0;
    /// Typing result: `status(1) || md5(16)` (S→C).
    pub const TYPE_RESULT: u8 = 0xD1;
    /// Raw key tap: `[mods][usage]` or `[mods][usage][repeat]` (C→S).
    pub const KEY_TAP: u8 = 0xE0;
    /// Error: UTF-8 reason (S→C).
    pub const ERROR: u8 = 0xFF;
}

/// Frames longer than this are implausible and trigger resync.
pub const MAX_PAYLOAD: usize = 1024;
/// Op byte plus the little-endian length.
pub const HEADER_LEN: usize = 3;

/// A single decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub op: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(op: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            op,
            payload: payload.into(),
        }
    }

    pub fn empty(op: u8) -> Self {
        Self {
            op,
            payload: Vec::new(),
        }
    }

    /// Serialize to the on-wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.op);
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn is_error(&self) -> bool {
        self.op == op::ERROR
    }

    /// UTF-8 reason carried by an error frame (lossy).
    pub fn error_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Reassembles notification chunks into complete frames.
///
/// Owns the only accumulation buffer; chunk boundaries carry no meaning.
/// Headers announcing more than [`MAX_PAYLOAD`] bytes are treated as
/// garbage and the buffer advances one byte at a time until a plausible
/// header lines up again. Trailing partial frames are kept for the next
/// chunk.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
    resyncs: u64,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
            if len > MAX_PAYLOAD {
                // Implausible header: resync one byte forward.
                self.buf.remove(0);
                self.resyncs += 1;
                continue;
            }
            if self.buf.len() < HEADER_LEN + len {
                break;
            }
            let rest = self.buf.split_off(HEADER_LEN + len);
            let raw = std::mem::replace(&mut self.buf, rest);
            frames.push(Frame {
                op: raw[0],
                payload: raw[HEADER_LEN..].to_vec(),
            });
        }
        frames
    }

    /// Bytes currently held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// How many garbage bytes have been skipped since construction.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Drop any partial state, e.g. across a reconnect.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(op: u8, payload: &[u8]) -> Frame {
        Frame::new(op, payload.to_vec())
    }

    #[test]
    fn encode_layout_matches_wire_format() {
        let encoded = frame(op::TYPE_TEXT, b"hi").encode();
        assert_eq!(encoded, vec![0xD0, 0x02, 0x00, b'h', b'i']);
    }

    #[test]
    fn reassembles_regardless_of_chunk_boundaries() {
        let frames = vec![
            frame(op::SERVER_HELLO, &[0xAB; 69]),
            frame(op::ACK, &[]),
            frame(op::INFO, b"LAYOUT=FI; VER=1"),
        ];
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode());
        }

        // Every chunk size from pathological to generous must yield the
        // same frame sequence.
        for chunk_size in [1, 2, 3, 7, 20, wire.len()] {
            let mut framer = Framer::new();
            let mut seen = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                seen.extend(framer.push(chunk));
            }
            assert_eq!(seen, frames, "chunk size {chunk_size}");
            assert_eq!(framer.pending(), 0);
        }
    }

    #[test]
    fn resyncs_over_garbage_between_frames() {
        let first = frame(op::ACK, &[]);
        let second = frame(op::TYPE_RESULT, &[0u8; 17]);
        let mut wire = first.encode();
        // Garbage whose length fields are implausible (> MAX_PAYLOAD).
        wire.extend_from_slice(&[0x5A, 0xFF, 0xFF, 0xEE, 0xFF, 0x7F]);
        wire.extend_from_slice(&second.encode());

        let mut framer = Framer::new();
        let seen = framer.push(&wire);
        assert_eq!(seen, vec![first, second]);
        assert!(framer.resyncs() > 0);
    }

    #[test]
    fn oversize_header_does_not_produce_a_frame() {
        let mut framer = Framer::new();
        // len = 0xFFFF, far past MAX_PAYLOAD.
        let seen = framer.push(&[0xD0, 0xFF, 0xFF]);
        assert!(seen.is_empty());
    }

    #[test]
    fn partial_frame_is_held_until_completed() {
        let full = frame(op::INFO, b"LAYOUT=SE");
        let wire = full.encode();
        let mut framer = Framer::new();
        assert!(framer.push(&wire[..4]).is_empty());
        assert_eq!(framer.pending(), 4);
        let seen = framer.push(&wire[4..]);
        assert_eq!(seen, vec![full]);
    }

    #[test]
    fn multiple_frames_in_one_chunk_all_emitted() {
        let frames = vec![frame(op::ACK, &[]), frame(op::ACK, &[]), frame(op::ERROR, b"nope")];
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode());
        }
        let mut framer = Framer::new();
        assert_eq!(framer.push(&wire), frames);
    }

    #[test]
    fn clear_drops_partial_state() {
        let mut framer = Framer::new();
        framer.push(&[0xD0, 0x10]);
        assert!(framer.pending() > 0);
        framer.clear();
        assert_eq!(framer.pending(), 0);
    }
}
