//! High-level dongle verbs layered on the secure channel.
//!
//! Every verb except the raw key tap travels inside an envelope and waits
//! for a specific inner reply op. The tap goes out as a plain frame with
//! no acknowledgement to keep its latency down.

use crate::channel::{SessionState, MAX_INNER_PAYLOAD};
use crate::crypto;
use crate::error::{BridgeError, BridgeResult, CryptoFault};
use crate::frame::{op, Frame};
use crate::wire::Wire;
use keybridge_link::{BleLink, WriteKind};
use md5::{Digest, Md5};
use std::time::Duration;

/// Seal `inner`, send it, and wait for the envelope carrying `expect`.
///
/// Replayed envelopes are dropped silently. A plain server hello mid-wait
/// means the dongle discarded the session; the caller must tear down and
/// re-handshake.
pub(crate) async fn exchange<L: BleLink>(
    wire: &mut Wire<L>,
    session: &mut SessionState,
    inner: Frame,
    expect: u8,
    timeout: Duration,
    what: &'static str,
) -> BridgeResult<Frame> {
    let outer = session.seal(&inner)?;
    wire.send(&outer, WriteKind::WithResponse).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(BridgeError::Timeout(what));
        }
        let frame = wire.recv(deadline - now, what).await?;
        match frame.op {
            op::ENVELOPE => match session.open(&frame)? {
                Some(reply) => {
                    if reply.is_error() {
                        return Err(BridgeError::Protocol(format!(
                            "dongle reported: {}",
                            reply.error_reason()
                        )));
                    }
                    if reply.op != expect {
                        return Err(BridgeError::Protocol(format!(
                            "expected op 0x{expect:02X}, got 0x{:02X}",
                            reply.op
                        )));
                    }
                    return Ok(reply);
                }
                None => continue,
            },
            op::SERVER_HELLO => return Err(CryptoFault::SessionRestart.into()),
            other => {
                log::debug!("ignoring plain frame op 0x{other:02X} inside a secure session");
            }
        }
    }
}

/// Exchange that expects the empty generic acknowledgement.
async fn exchange_ack<L: BleLink>(
    wire: &mut Wire<L>,
    session: &mut SessionState,
    inner: Frame,
    timeout: Duration,
    what: &'static str,
) -> BridgeResult<()> {
    let reply = exchange(wire, session, inner, op::ACK, timeout, what).await?;
    if !reply.payload.is_empty() {
        return Err(BridgeError::Protocol(
            "acknowledgement carried unexpected payload".into(),
        ));
    }
    Ok(())
}

/// Type `text` on the dongle and verify the echoed MD5 over the exact
/// bytes sent. Success requires `status == 0` and a digest match.
pub(crate) async fn send_string<L: BleLink>(
    wire: &mut Wire<L>,
    session: &mut SessionState,
    text: &str,
    append_newline: bool,
    timeout: Duration,
) -> BridgeResult<()> {
    let mut bytes = text.as_bytes().to_vec();
    if append_newline {
        bytes.push(b'\n');
    }
    if bytes.len() > MAX_INNER_PAYLOAD {
        return Err(BridgeError::Framing(format!(
            "text is {} bytes; at most {MAX_INNER_PAYLOAD} fit one frame",
            bytes.len()
        )));
    }
    let expected: [u8; 16] = Md5::digest(&bytes).into();

    let reply = exchange(
        wire,
        session,
        Frame::new(op::TYPE_TEXT, bytes),
        op::TYPE_RESULT,
        timeout,
        "type result",
    )
    .await?;

    if reply.payload.len() != 17 {
        return Err(BridgeError::Protocol(format!(
            "type result has impossible length {}",
            reply.payload.len()
        )));
    }
    let status = reply.payload[0];
    if status != 0 {
        return Err(BridgeError::Protocol(format!(
            "dongle reported typing status {status}"
        )));
    }
    if !crypto::tags_match(&expected, &reply.payload[1..]) {
        return Err(BridgeError::Protocol(
            "typed text failed the integrity check".into(),
        ));
    }
    Ok(())
}

/// Fetch the raw ASCII info text.
pub(crate) async fn get_info<L: BleLink>(
    wire: &mut Wire<L>,
    session: &mut SessionState,
    timeout: Duration,
) -> BridgeResult<String> {
    let reply = exchange(
        wire,
        session,
        Frame::empty(op::GET_INFO),
        op::INFO,
        timeout,
        "info text",
    )
    .await?;
    if reply.payload.is_empty() {
        return Err(BridgeError::Protocol("dongle returned empty info".into()));
    }
    Ok(String::from_utf8_lossy(&reply.payload).into_owned())
}

/// Extract the `LAYOUT=` field from an info text.
pub(crate) fn parse_layout(info: &str) -> Option<String> {
    let bytes = info.as_bytes();
    let mut start = 0;
    while let Some(pos) = info[start..].find("LAYOUT=") {
        let at = start + pos;
        let on_word_boundary = at == 0 || {
            let prev = bytes[at - 1];
            !(prev.is_ascii_alphanumeric() || prev == b'_')
        };
        let value: String = info[at + "LAYOUT=".len()..]
            .chars()
            .take_while(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_')
            .collect();
        if on_word_boundary && !value.is_empty() {
            return Some(value);
        }
        start = at + "LAYOUT=".len();
    }
    None
}

pub(crate) async fn get_layout<L: BleLink>(
    wire: &mut Wire<L>,
    session: &mut SessionState,
    timeout: Duration,
) -> BridgeResult<String> {
    let info = get_info(wire, session, timeout).await?;
    parse_layout(&info)
        .ok_or_else(|| BridgeError::Protocol("info text carries no layout field".into()))
}

pub(crate) async fn set_layout<L: BleLink>(
    wire: &mut Wire<L>,
    session: &mut SessionState,
    code: &str,
    timeout: Duration,
) -> BridgeResult<()> {
    if code.trim().is_empty() {
        return Err(BridgeError::Config("layout code must not be empty".into()));
    }
    exchange_ack(
        wire,
        session,
        Frame::new(op::SET_LAYOUT, code.as_bytes().to_vec()),
        timeout,
        "layout ack",
    )
    .await
}

pub(crate) async fn factory_reset<L: BleLink>(
    wire: &mut Wire<L>,
    session: &mut SessionState,
    timeout: Duration,
) -> BridgeResult<()> {
    exchange_ack(
        wire,
        session,
        Frame::empty(op::FACTORY_RESET),
        timeout,
        "factory reset ack",
    )
    .await
}

pub(crate) async fn enable_fast_keys<L: BleLink>(
    wire: &mut Wire<L>,
    session: &mut SessionState,
    timeout: Duration,
) -> BridgeResult<()> {
    exchange_ack(
        wire,
        session,
        Frame::new(op::FAST_KEYS, vec![0x01]),
        timeout,
        "fast keys ack",
    )
    .await
}

/// Fire a single HID tap as a plain frame. No acknowledgement follows.
pub(crate) async fn raw_key_tap<L: BleLink>(
    wire: &mut Wire<L>,
    mods: u8,
    usage: u8,
    repeat: Option<u8>,
) -> BridgeResult<()> {
    let payload = match repeat {
        None => vec![mods, usage],
        Some(0) => {
            return Err(BridgeError::Config(
                "raw key repeat must be between 1 and 255".into(),
            ))
        }
        Some(count) => vec![mods, usage, count],
    };
    wire.send(&Frame::new(op::KEY_TAP, payload), WriteKind::WithoutResponse)
        .await
}
