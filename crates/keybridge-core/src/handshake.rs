//! The two subprotocols that bootstrap a secure session.
//!
//! APPKEY provisioning turns a user password into possession of the
//! dongle's long-lived 32-byte secret; MTLS establishment turns that
//! secret plus an ephemeral P-256 exchange into per-session channel keys.
//! Both run over plain frames on a fresh link.

use crate::channel::{Role, SessionKeys, SessionState};
use crate::crypto::{self, TAG_LEN};
use crate::error::{BridgeError, BridgeResult, HandshakeFault, ProvisioningFault};
use crate::frame::{op, Frame};
use crate::keystore::{AppKey, APP_KEY_LEN};
use crate::password::{self, PasswordPrompt, PasswordRequest};
use crate::wire::Wire;
use keybridge_link::{BleLink, WriteKind};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use std::time::Duration;
use zeroize::Zeroizing;

/// Uncompressed SEC1 P-256 point.
pub(crate) const PUB_KEY_LEN: usize = 65;
const HELLO_LEN: usize = PUB_KEY_LEN + 4;
const WRAPPED_KEY_LEN: usize = APP_KEY_LEN + TAG_LEN;

const LABEL_PROOF: &[u8] = b"APPKEY";
const LABEL_WRAP_KEY: &[u8] = b"AKWRAP";
const LABEL_WRAP_MAC: &[u8] = b"AKMAC";
const LABEL_WRAP_IV: &[u8] = b"AKIV";
const LABEL_KEY_EXCHANGE: &[u8] = b"KEYX";
const LABEL_SESSION_INFO: &[u8] = b"MT1";
const LABEL_FINISH: &[u8] = b"SFIN";

/// The dongle's provisioning challenge (`A2`).
pub(crate) struct Challenge {
    pub salt: [u8; 16],
    pub iterations: u32,
    pub chal: [u8; 16],
}

/// The dongle's unsolicited session offer (`B0`).
pub(crate) struct ServerHello {
    pub srv_pub: [u8; PUB_KEY_LEN],
    pub sid: u32,
}

/// Run APPKEY provisioning against a freshly connected dongle.
///
/// Collects the password once. If the dongle rejects the proof and the
/// NFKC-folded, whitespace-trimmed form differs from what was typed, a
/// single retry runs against a freshly issued challenge.
pub(crate) async fn provision<L: BleLink>(
    wire: &mut Wire<L>,
    prompt: &dyn PasswordPrompt,
    request: &PasswordRequest,
    reply_timeout: Duration,
) -> BridgeResult<AppKey> {
    let challenge = request_challenge(wire, reply_timeout).await?;
    let password = prompt
        .request_password(request)
        .ok_or_else(|| BridgeError::Config("password entry was cancelled".into()))?;

    match prove_and_fetch(wire, &challenge, password.as_bytes(), reply_timeout).await {
        Ok(key) => Ok(key),
        Err(BridgeError::Provisioning(fault)) if fault.is_bad_password() => {
            let folded = password::normalized(&password);
            if folded.as_str() == password.as_str() {
                return Err(fault.into());
            }
            log::info!("dongle rejected the password; retrying once with the normalized form");
            let fresh = request_challenge(wire, reply_timeout).await?;
            prove_and_fetch(wire, &fresh, folded.as_bytes(), reply_timeout).await
        }
        Err(err) => Err(err),
    }
}

async fn request_challenge<L: BleLink>(
    wire: &mut Wire<L>,
    reply_timeout: Duration,
) -> BridgeResult<Challenge> {
    wire.send(&Frame::empty(op::KEY_REQUEST), WriteKind::WithResponse)
        .await?;
    let reply = recv_provisioning(wire, op::KEY_CHALLENGE, reply_timeout, "app-key challenge")
        .await?;
    parse_challenge(&reply.payload)
}

pub(crate) fn parse_challenge(payload: &[u8]) -> BridgeResult<Challenge> {
    if payload.len() != 36 {
        return Err(BridgeError::Protocol(format!(
            "app-key challenge has impossible length {}",
            payload.len()
        )));
    }
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&payload[..16]);
    let iterations = u32::from_le_bytes(payload[16..20].try_into().expect("four bytes"));
    let mut chal = [0u8; 16];
    chal.copy_from_slice(&payload[20..36]);
    Ok(Challenge {
        salt,
        iterations,
        chal,
    })
}

async fn prove_and_fetch<L: BleLink>(
    wire: &mut Wire<L>,
    challenge: &Challenge,
    password: &[u8],
    reply_timeout: Duration,
) -> BridgeResult<AppKey> {
    let verifier = crypto::password_verifier(password, &challenge.salt, challenge.iterations);
    let proof = crypto::hmac_sha256(&verifier[..], &[LABEL_PROOF, &challenge.chal]);
    wire.send(
        &Frame::new(op::KEY_PROOF, proof[..].to_vec()),
        WriteKind::WithResponse,
    )
    .await?;
    let reply =
        recv_provisioning(wire, op::KEY_MATERIAL, reply_timeout, "app-key material").await?;
    unwrap_key_material(challenge, &verifier[..], &reply.payload)
}

/// Recover the 32-byte app key from an `A1` payload: either the legacy raw
/// form or `cipher(32) || mac(16)` wrapped under the password verifier.
pub(crate) fn unwrap_key_material(
    challenge: &Challenge,
    verifier: &[u8],
    payload: &[u8],
) -> BridgeResult<AppKey> {
    match payload.len() {
        APP_KEY_LEN => {
            let mut key = Zeroizing::new([0u8; APP_KEY_LEN]);
            key.copy_from_slice(payload);
            Ok(key)
        }
        WRAPPED_KEY_LEN => {
            let (cipher, mac) = payload.split_at(APP_KEY_LEN);
            let wrap_key = crypto::hmac_sha256(verifier, &[LABEL_WRAP_KEY, &challenge.chal]);
            let expected = crypto::hmac_tag16(
                &wrap_key[..],
                &[LABEL_WRAP_MAC, &challenge.chal, cipher],
            );
            if !crypto::tags_match(&expected, mac) {
                return Err(BridgeError::Protocol(
                    "app-key wrap MAC did not verify".into(),
                ));
            }
            let iv = crypto::hmac_tag16(verifier, &[LABEL_WRAP_IV, &challenge.chal]);
            let mut key = Zeroizing::new([0u8; APP_KEY_LEN]);
            key.copy_from_slice(cipher);
            crypto::aes_ctr_apply(&wrap_key, &iv, &mut key[..]);
            Ok(key)
        }
        other => Err(BridgeError::Protocol(format!(
            "app-key material has impossible length {other}"
        ))),
    }
}

/// Seal a 32-byte app key into the wrapped `A1` form. The inverse of
/// [`unwrap_key_material`]; the dongle side of the exchange.
pub(crate) fn wrap_key_material(
    challenge: &Challenge,
    verifier: &[u8],
    key: &[u8; APP_KEY_LEN],
) -> Vec<u8> {
    let wrap_key = crypto::hmac_sha256(verifier, &[LABEL_WRAP_KEY, &challenge.chal]);
    let iv = crypto::hmac_tag16(verifier, &[LABEL_WRAP_IV, &challenge.chal]);
    let mut cipher = key.to_vec();
    crypto::aes_ctr_apply(&wrap_key, &iv, &mut cipher);
    let mac = crypto::hmac_tag16(&wrap_key[..], &[LABEL_WRAP_MAC, &challenge.chal, &cipher]);
    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(&cipher);
    out.extend_from_slice(&mac);
    out
}

/// The password proof the dongle expects for `challenge`.
pub(crate) fn proof_for(verifier: &[u8], chal: &[u8; 16]) -> Zeroizing<[u8; 32]> {
    crypto::hmac_sha256(verifier, &[LABEL_PROOF, chal])
}

async fn recv_provisioning<L: BleLink>(
    wire: &mut Wire<L>,
    expect: u8,
    timeout: Duration,
    what: &'static str,
) -> BridgeResult<Frame> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(BridgeError::Timeout(what));
        }
        let frame = wire.recv(deadline - now, what).await?;
        if frame.op == expect {
            return Ok(frame);
        }
        if frame.is_error() {
            return Err(ProvisioningFault::classify(&frame.error_reason()).into());
        }
        // Typically the unsolicited server hello queued at connect time.
        log::debug!("ignoring frame op 0x{:02X} while waiting for {what}", frame.op);
    }
}

/// Wait for the dongle's unsolicited `B0` within `window`.
pub(crate) async fn await_server_hello<L: BleLink>(
    wire: &mut Wire<L>,
    window: Duration,
) -> BridgeResult<ServerHello> {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(HandshakeFault::NoHello.into());
        }
        let frame = match wire.recv(deadline - now, "server hello").await {
            Ok(frame) => frame,
            Err(BridgeError::Timeout(_)) => return Err(HandshakeFault::NoHello.into()),
            Err(err) => return Err(err),
        };
        match frame.op {
            op::SERVER_HELLO => return parse_server_hello(&frame.payload),
            op::ERROR => {
                return Err(HandshakeFault::classify(&frame.error_reason()).into());
            }
            other => log::debug!("ignoring frame op 0x{other:02X} while waiting for hello"),
        }
    }
}

pub(crate) fn parse_server_hello(payload: &[u8]) -> BridgeResult<ServerHello> {
    if payload.len() != HELLO_LEN {
        return Err(BridgeError::Protocol(format!(
            "server hello has impossible length {}",
            payload.len()
        )));
    }
    let mut srv_pub = [0u8; PUB_KEY_LEN];
    srv_pub.copy_from_slice(&payload[..PUB_KEY_LEN]);
    let sid = u32::from_be_bytes(payload[PUB_KEY_LEN..].try_into().expect("four bytes"));
    Ok(ServerHello { srv_pub, sid })
}

/// Answer a server hello and verify the finish MAC, yielding live session
/// state on success.
pub(crate) async fn establish<L: BleLink>(
    wire: &mut Wire<L>,
    app_key: &[u8; APP_KEY_LEN],
    hello: ServerHello,
    reply_timeout: Duration,
) -> BridgeResult<SessionState> {
    let secret = EphemeralSecret::random(&mut OsRng);
    let cli_point = PublicKey::from(&secret).to_encoded_point(false);
    let cli_pub = cli_point.as_bytes();
    let sid_be = hello.sid.to_be_bytes();

    let mac = crypto::hmac_tag16(
        app_key,
        &[LABEL_KEY_EXCHANGE, &sid_be, &hello.srv_pub, cli_pub],
    );
    let mut payload = Vec::with_capacity(PUB_KEY_LEN + TAG_LEN);
    payload.extend_from_slice(cli_pub);
    payload.extend_from_slice(&mac);
    wire.send(&Frame::new(op::CLIENT_HELLO, payload), WriteKind::WithResponse)
        .await?;

    let finish = recv_handshake(wire, op::SERVER_FINISH, reply_timeout, "server finish").await?;
    if finish.payload.len() != TAG_LEN {
        return Err(BridgeError::Protocol(format!(
            "server finish has impossible length {}",
            finish.payload.len()
        )));
    }

    let srv_key = PublicKey::from_sec1_bytes(&hello.srv_pub).map_err(|_| {
        BridgeError::Protocol("server public key is not a valid P-256 point".into())
    })?;
    let shared = secret.diffie_hellman(&srv_key);
    let session_key = crypto::hkdf_expand32(
        app_key,
        shared.raw_secret_bytes().as_slice(),
        &session_info(hello.sid, &hello.srv_pub, cli_pub),
    );
    let keys = SessionKeys::derive(&session_key[..]);

    let expected = crypto::hmac_tag16(
        keys.mac_key(),
        &[LABEL_FINISH, &sid_be, &hello.srv_pub, cli_pub],
    );
    if !crypto::tags_match(&expected, &finish.payload) {
        return Err(HandshakeFault::FinishMismatch.into());
    }

    Ok(SessionState::new(hello.sid, keys, Role::Host))
}

/// HKDF info binding the session key to both public keys and the sid.
pub(crate) fn session_info(sid: u32, srv_pub: &[u8], cli_pub: &[u8]) -> Vec<u8> {
    let mut info = Vec::with_capacity(LABEL_SESSION_INFO.len() + 4 + srv_pub.len() + cli_pub.len());
    info.extend_from_slice(LABEL_SESSION_INFO);
    info.extend_from_slice(&sid.to_be_bytes());
    info.extend_from_slice(srv_pub);
    info.extend_from_slice(cli_pub);
    info
}

/// The `KEYX` tag the dongle checks on a client hello.
pub(crate) fn key_exchange_tag(
    app_key: &[u8],
    sid: u32,
    srv_pub: &[u8],
    cli_pub: &[u8],
) -> [u8; TAG_LEN] {
    crypto::hmac_tag16(
        app_key,
        &[LABEL_KEY_EXCHANGE, &sid.to_be_bytes(), srv_pub, cli_pub],
    )
}

/// The `SFIN` tag proving both sides derived the same subkeys.
pub(crate) fn finish_tag(
    keys: &SessionKeys,
    sid: u32,
    srv_pub: &[u8],
    cli_pub: &[u8],
) -> [u8; TAG_LEN] {
    crypto::hmac_tag16(
        keys.mac_key(),
        &[LABEL_FINISH, &sid.to_be_bytes(), srv_pub, cli_pub],
    )
}

async fn recv_handshake<L: BleLink>(
    wire: &mut Wire<L>,
    expect: u8,
    timeout: Duration,
    what: &'static str,
) -> BridgeResult<Frame> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(BridgeError::Timeout(what));
        }
        let frame = wire.recv(deadline - now, what).await?;
        if frame.op == expect {
            return Ok(frame);
        }
        if frame.is_error() {
            return Err(HandshakeFault::classify(&frame.error_reason()).into());
        }
        log::debug!("ignoring frame op 0x{:02X} while waiting for {what}", frame.op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge() -> Challenge {
        Challenge {
            salt: [0x11; 16],
            iterations: 1_000,
            chal: [0x22; 16],
        }
    }

    #[test]
    fn challenge_parse_roundtrip() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0xAA; 16]);
        payload.extend_from_slice(&10_000u32.to_le_bytes());
        payload.extend_from_slice(&[0xBB; 16]);

        let parsed = parse_challenge(&payload).unwrap();
        assert_eq!(parsed.salt, [0xAA; 16]);
        assert_eq!(parsed.iterations, 10_000);
        assert_eq!(parsed.chal, [0xBB; 16]);

        assert!(parse_challenge(&payload[..35]).is_err());
    }

    #[test]
    fn server_hello_parse_roundtrip() {
        let mut payload = vec![0x04u8];
        payload.extend_from_slice(&[0xCD; 64]);
        payload.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());

        let hello = parse_server_hello(&payload).unwrap();
        assert_eq!(hello.sid, 0xDEAD_BEEF);
        assert_eq!(hello.srv_pub[0], 0x04);

        assert!(parse_server_hello(&payload[..68]).is_err());
    }

    #[test]
    fn wrapped_key_material_roundtrips() {
        let chal = challenge();
        let verifier = crypto::password_verifier(b"pw", &chal.salt, chal.iterations);
        let key = [0x5Cu8; APP_KEY_LEN];

        let wrapped = wrap_key_material(&chal, &verifier[..], &key);
        assert_eq!(wrapped.len(), WRAPPED_KEY_LEN);

        let recovered = unwrap_key_material(&chal, &verifier[..], &wrapped).unwrap();
        assert_eq!(&recovered[..], &key[..]);
    }

    #[test]
    fn tampered_wrap_mac_is_rejected() {
        let chal = challenge();
        let verifier = crypto::password_verifier(b"pw", &chal.salt, chal.iterations);
        let mut wrapped = wrap_key_material(&chal, &verifier[..], &[0x5C; APP_KEY_LEN]);
        wrapped[40] ^= 0x01;
        assert!(unwrap_key_material(&chal, &verifier[..], &wrapped).is_err());
    }

    #[test]
    fn legacy_raw_key_material_is_accepted() {
        let chal = challenge();
        let verifier = crypto::password_verifier(b"pw", &chal.salt, chal.iterations);
        let key = [0x77u8; APP_KEY_LEN];
        let recovered = unwrap_key_material(&chal, &verifier[..], &key).unwrap();
        assert_eq!(&recovered[..], &key[..]);
    }

    #[test]
    fn odd_key_material_lengths_are_rejected() {
        let chal = challenge();
        let verifier = crypto::password_verifier(b"pw", &chal.salt, chal.iterations);
        assert!(unwrap_key_material(&chal, &verifier[..], &[0u8; 31]).is_err());
        assert!(unwrap_key_material(&chal, &verifier[..], &[0u8; 47]).is_err());
        assert!(unwrap_key_material(&chal, &verifier[..], &[0u8; 49]).is_err());
    }

    #[test]
    fn proof_matches_between_host_and_dongle_for_the_same_password() {
        let chal = challenge();
        let host = crypto::password_verifier(b"hunter2", &chal.salt, chal.iterations);
        let dongle = crypto::password_verifier(b"hunter2", &chal.salt, chal.iterations);
        assert_eq!(
            &proof_for(&host[..], &chal.chal)[..],
            &proof_for(&dongle[..], &chal.chal)[..]
        );

        let wrong = crypto::password_verifier(b"hunter3", &chal.salt, chal.iterations);
        assert_ne!(
            &proof_for(&host[..], &chal.chal)[..],
            &proof_for(&wrong[..], &chal.chal)[..]
        );
    }
}
