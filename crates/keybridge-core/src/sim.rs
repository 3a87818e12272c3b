//! In-memory dongle and link for protocol tests and host-side simulation.
//!
//! [`SimDongle`] speaks the full wire protocol from the device side:
//! provisioning responder, MTLS responder with its own ephemeral P-256
//! key, envelope peer with mirrored counters, and handlers for every
//! application op. [`SimLink`] exposes a table of dongles through the
//! [`BleLink`] trait, with configurable notification chunking so the
//! framer gets exercised end to end. Handles are cheap clones around
//! shared state, so a test can keep observing a dongle after moving the
//! link into an orchestrator.

use crate::channel::{Role, SessionKeys, SessionState};
use crate::crypto;
use crate::frame::{op, Frame, Framer};
use crate::handshake;
use keybridge_link::{BleLink, DongleIdentity, LinkError, WriteKind};
use md5::{Digest, Md5};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zeroize::Zeroizing;

const DEFAULT_LAYOUT: &str = "US";

/// Behaviour knobs for a simulated dongle.
#[derive(Debug, Clone)]
pub struct SimDongleConfig {
    /// Password the dongle's provisioning verifier was derived from.
    pub password: String,
    pub iterations: u32,
    /// Deliver the app key in the wrapped `cipher || mac` form instead of
    /// the legacy raw form.
    pub wrapped_delivery: bool,
    /// Refuse `A0` once an app key exists.
    pub refuse_reprovision: bool,
    /// Never send the unsolicited server hello.
    pub suppress_hello: bool,
    /// Notification chunk size; `0` delivers whole frames.
    pub chunk: usize,
    /// Corrupt the echoed typing digest.
    pub corrupt_type_digest: bool,
    /// Report this nonzero status in the typing result.
    pub fail_type_status: Option<u8>,
}

impl Default for SimDongleConfig {
    fn default() -> Self {
        Self {
            password: "pw".to_string(),
            iterations: 10_000,
            wrapped_delivery: true,
            refuse_reprovision: false,
            suppress_hello: false,
            chunk: 0,
            corrupt_type_digest: false,
            fail_type_status: None,
        }
    }
}

struct PendingChallenge {
    salt: [u8; 16],
    chal: [u8; 16],
    verifier: Zeroizing<[u8; 32]>,
}

struct HelloState {
    secret: EphemeralSecret,
    srv_pub: [u8; 65],
    sid: u32,
}

struct DongleInner {
    cfg: SimDongleConfig,
    app_key: Option<Zeroizing<[u8; 32]>>,
    pending: Option<PendingChallenge>,
    hello: Option<HelloState>,
    session: Option<SessionState>,
    next_sid: u32,
    layout: String,
    fast_keys: bool,
    typed: Vec<String>,
    taps: Vec<(u8, u8, u8)>,
    factory_resets: u32,
    challenges_issued: u32,
    out: VecDeque<Vec<u8>>,
    framer: Framer,
}

impl DongleInner {
    fn new(cfg: SimDongleConfig) -> Self {
        Self {
            cfg,
            app_key: None,
            pending: None,
            hello: None,
            session: None,
            next_sid: 0x1000,
            layout: DEFAULT_LAYOUT.to_string(),
            fast_keys: false,
            typed: Vec::new(),
            taps: Vec::new(),
            factory_resets: 0,
            challenges_issued: 0,
            out: VecDeque::new(),
            framer: Framer::new(),
        }
    }

    fn on_connect(&mut self) {
        self.session = None;
        self.fast_keys = false;
        self.pending = None;
        self.hello = None;
        self.framer.clear();
        self.out.clear();
        if !self.cfg.suppress_hello {
            self.emit_hello();
        }
    }

    fn on_disconnect(&mut self) {
        self.session = None;
        self.fast_keys = false;
        self.hello = None;
        self.framer.clear();
        self.out.clear();
    }

    fn emit_hello(&mut self) {
        let secret = EphemeralSecret::random(&mut OsRng);
        let point = PublicKey::from(&secret).to_encoded_point(false);
        let mut srv_pub = [0u8; 65];
        srv_pub.copy_from_slice(point.as_bytes());
        let sid = self.next_sid;
        self.next_sid = self.next_sid.wrapping_add(1);

        let mut payload = Vec::with_capacity(69);
        payload.extend_from_slice(&srv_pub);
        payload.extend_from_slice(&sid.to_be_bytes());
        self.hello = Some(HelloState {
            secret,
            srv_pub,
            sid,
        });
        self.push_frame(Frame::new(op::SERVER_HELLO, payload));
    }

    fn handle_write(&mut self, bytes: &[u8]) {
        let frames = self.framer.push(bytes);
        for frame in frames {
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.op {
            op::KEY_REQUEST => self.handle_key_request(),
            op::KEY_PROOF => self.handle_key_proof(&frame.payload),
            op::CLIENT_HELLO => self.handle_client_hello(&frame.payload),
            op::ENVELOPE => self.handle_envelope(&frame),
            op::KEY_TAP => self.handle_key_tap(&frame.payload),
            other => self.push_error(&format!("unexpected op 0x{other:02X}")),
        }
    }

    fn handle_key_request(&mut self) {
        if self.cfg.refuse_reprovision && self.app_key.is_some() {
            return self.push_error("already set");
        }
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut chal = [0u8; 16];
        OsRng.fill_bytes(&mut chal);
        let verifier =
            crypto::password_verifier(self.cfg.password.as_bytes(), &salt, self.cfg.iterations);
        self.pending = Some(PendingChallenge {
            salt,
            chal,
            verifier,
        });
        self.challenges_issued += 1;

        let mut payload = Vec::with_capacity(36);
        payload.extend_from_slice(&salt);
        payload.extend_from_slice(&self.cfg.iterations.to_le_bytes());
        payload.extend_from_slice(&chal);
        self.push_frame(Frame::new(op::KEY_CHALLENGE, payload));
    }

    fn handle_key_proof(&mut self, payload: &[u8]) {
        let Some(pending) = self.pending.take() else {
            return self.push_error("no pending chal");
        };
        let expected = handshake::proof_for(&pending.verifier[..], &pending.chal);
        if payload.len() != 32 || !crypto::tags_match(&expected[..], payload) {
            return self.push_error("bad proof");
        }

        let key: [u8; 32] = **self.app_key.get_or_insert_with(|| {
            let mut fresh = [0u8; 32];
            OsRng.fill_bytes(&mut fresh);
            Zeroizing::new(fresh)
        });

        let challenge = handshake::Challenge {
            salt: pending.salt,
            iterations: self.cfg.iterations,
            chal: pending.chal,
        };
        let material = if self.cfg.wrapped_delivery {
            handshake::wrap_key_material(&challenge, &pending.verifier[..], &key)
        } else {
            key.to_vec()
        };
        self.push_frame(Frame::new(op::KEY_MATERIAL, material));
    }

    fn handle_client_hello(&mut self, payload: &[u8]) {
        let Some(hello) = self.hello.take() else {
            return self.push_error("no pending hello");
        };
        if payload.len() != 81 {
            return self.push_error("bad hello");
        }
        let (cli_pub, mac) = payload.split_at(65);

        let Some(app_key) = self.app_key.clone() else {
            return self.push_error("BADMAC");
        };
        let expected =
            handshake::key_exchange_tag(&app_key[..], hello.sid, &hello.srv_pub, cli_pub);
        if !crypto::tags_match(&expected, mac) {
            return self.push_error("BADMAC");
        }

        let Ok(cli_key) = PublicKey::from_sec1_bytes(cli_pub) else {
            return self.push_error("DERIVE");
        };
        let shared = hello.secret.diffie_hellman(&cli_key);
        let session_key = crypto::hkdf_expand32(
            &app_key[..],
            shared.raw_secret_bytes().as_slice(),
            &handshake::session_info(hello.sid, &hello.srv_pub, cli_pub),
        );
        let keys = SessionKeys::derive(&session_key[..]);
        let finish = handshake::finish_tag(&keys, hello.sid, &hello.srv_pub, cli_pub);

        self.session = Some(SessionState::new(hello.sid, keys, Role::Dongle));
        self.push_frame(Frame::new(op::SERVER_FINISH, finish.to_vec()));
    }

    fn handle_envelope(&mut self, frame: &Frame) {
        let inner = {
            let Some(session) = self.session.as_mut() else {
                return self.push_error("no session");
            };
            match session.open(frame) {
                Ok(Some(inner)) => inner,
                Ok(None) => return,
                Err(_) => {
                    self.session = None;
                    self.fast_keys = false;
                    return self.push_error("HMAC fail");
                }
            }
        };

        let reply = self.handle_secure_op(inner);
        let sealed = match self.session.as_mut() {
            Some(session) => session.seal(&reply),
            None => return,
        };
        match sealed {
            Ok(outer) => self.push_frame(outer),
            Err(_) => {
                self.session = None;
                self.fast_keys = false;
                self.push_error("send fail");
            }
        }
    }

    fn handle_secure_op(&mut self, inner: Frame) -> Frame {
        match inner.op {
            op::TYPE_TEXT => {
                let mut digest: [u8; 16] = Md5::digest(&inner.payload).into();
                self.typed
                    .push(String::from_utf8_lossy(&inner.payload).into_owned());
                if self.cfg.corrupt_type_digest {
                    digest[0] ^= 0xFF;
                }
                let mut payload = Vec::with_capacity(17);
                payload.push(self.cfg.fail_type_status.unwrap_or(0));
                payload.extend_from_slice(&digest);
                Frame::new(op::TYPE_RESULT, payload)
            }
            op::GET_INFO => Frame::new(
                op::INFO,
                format!("VER=1.4.2; LAYOUT={}; MODE=NORMAL", self.layout).into_bytes(),
            ),
            op::SET_LAYOUT => match String::from_utf8(inner.payload.clone()) {
                Ok(code) if !code.trim().is_empty() => {
                    self.layout = code;
                    Frame::empty(op::ACK)
                }
                _ => Frame::new(op::ERROR, b"bad layout".to_vec()),
            },
            op::FACTORY_RESET => {
                self.app_key = None;
                self.layout = DEFAULT_LAYOUT.to_string();
                self.fast_keys = false;
                self.factory_resets += 1;
                Frame::empty(op::ACK)
            }
            op::FAST_KEYS => {
                if inner.payload == [0x01] {
                    self.fast_keys = true;
                    Frame::empty(op::ACK)
                } else {
                    Frame::new(op::ERROR, b"bad mode".to_vec())
                }
            }
            other => Frame::new(
                op::ERROR,
                format!("unexpected op 0x{other:02X}").into_bytes(),
            ),
        }
    }

    fn handle_key_tap(&mut self, payload: &[u8]) {
        // Raw taps ride outside the envelope; they only count with a live
        // session in fast-keys mode.
        if self.session.is_none() || !self.fast_keys {
            return;
        }
        match payload {
            [mods, usage] => self.taps.push((*mods, *usage, 1)),
            [mods, usage, repeat] if *repeat >= 1 => self.taps.push((*mods, *usage, *repeat)),
            _ => {}
        }
    }

    fn push_frame(&mut self, frame: Frame) {
        let encoded = frame.encode();
        if self.cfg.chunk == 0 {
            self.out.push_back(encoded);
        } else {
            for chunk in encoded.chunks(self.cfg.chunk) {
                self.out.push_back(chunk.to_vec());
            }
        }
    }

    fn push_error(&mut self, reason: &str) {
        self.push_frame(Frame::new(op::ERROR, reason.as_bytes().to_vec()));
    }
}

/// Cloneable handle to a simulated dongle.
#[derive(Clone)]
pub struct SimDongle {
    inner: Arc<Mutex<DongleInner>>,
}

impl SimDongle {
    pub fn new(cfg: SimDongleConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DongleInner::new(cfg))),
        }
    }

    /// Install a provisioned app key, as if a host had paired earlier.
    pub fn set_app_key(&self, key: [u8; 32]) {
        self.inner.lock().unwrap().app_key = Some(Zeroizing::new(key));
    }

    /// The dongle's current app key, when provisioned.
    pub fn app_key(&self) -> Option<[u8; 32]> {
        self.inner.lock().unwrap().app_key.as_ref().map(|k| **k)
    }

    /// Strings the dongle has replayed as HID typing.
    pub fn typed(&self) -> Vec<String> {
        self.inner.lock().unwrap().typed.clone()
    }

    /// Raw taps received as `(mods, usage, repeat)`.
    pub fn taps(&self) -> Vec<(u8, u8, u8)> {
        self.inner.lock().unwrap().taps.clone()
    }

    pub fn layout(&self) -> String {
        self.inner.lock().unwrap().layout.clone()
    }

    pub fn factory_resets(&self) -> u32 {
        self.inner.lock().unwrap().factory_resets
    }

    /// How many provisioning challenges have been issued.
    pub fn challenges_issued(&self) -> u32 {
        self.inner.lock().unwrap().challenges_issued
    }

    /// Whether the dongle currently holds a live secure session.
    pub fn session_live(&self) -> bool {
        self.inner.lock().unwrap().session.is_some()
    }

    /// Discard the session and push a fresh unsolicited hello, as a real
    /// dongle does after an internal restart.
    pub fn force_rehello(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.session = None;
        inner.fast_keys = false;
        inner.emit_hello();
    }

    /// Adjust behaviour knobs mid-test.
    pub fn configure(&self, change: impl FnOnce(&mut SimDongleConfig)) {
        change(&mut self.inner.lock().unwrap().cfg);
    }

    fn on_connect(&self) {
        self.inner.lock().unwrap().on_connect();
    }

    fn on_disconnect(&self) {
        self.inner.lock().unwrap().on_disconnect();
    }

    fn handle_write(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().handle_write(bytes);
    }

    fn pop_notification(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().out.pop_front()
    }
}

struct SimPeer {
    dongle: SimDongle,
    rssi: i16,
    bonded: bool,
    name: Option<String>,
    reachable: bool,
}

/// [`BleLink`] over a table of simulated dongles.
///
/// Time is collapsed: replies are queued synchronously by the dongle, so
/// an empty notification queue stands in for a timeout.
pub struct SimLink {
    peers: Vec<(String, SimPeer)>,
    connected: Option<String>,
}

impl Default for SimLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLink {
    pub fn new() -> Self {
        Self {
            peers: Vec::new(),
            connected: None,
        }
    }

    pub fn add_peer(
        &mut self,
        address: &str,
        dongle: SimDongle,
        rssi: i16,
        bonded: bool,
        name: Option<&str>,
    ) {
        self.peers.push((
            address.to_string(),
            SimPeer {
                dongle,
                rssi,
                bonded,
                name: name.map(str::to_string),
                reachable: true,
            },
        ));
    }

    pub fn set_reachable(&mut self, address: &str, reachable: bool) {
        if let Some((_, peer)) = self.peers.iter_mut().find(|(a, _)| a == address) {
            peer.reachable = reachable;
        }
    }

    pub fn set_rssi(&mut self, address: &str, rssi: i16) {
        if let Some((_, peer)) = self.peers.iter_mut().find(|(a, _)| a == address) {
            peer.rssi = rssi;
        }
    }

    fn peer(&self, address: &str) -> Option<&SimPeer> {
        self.peers
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, p)| p)
    }

    fn connected_dongle(&self) -> Option<SimDongle> {
        let address = self.connected.as_deref()?;
        self.peer(address).map(|p| p.dongle.clone())
    }

    fn identity(address: &str, peer: &SimPeer) -> DongleIdentity {
        DongleIdentity {
            address: address.to_string(),
            name: peer.name.clone(),
            bonded: peer.bonded,
            rssi: Some(peer.rssi),
        }
    }
}

impl BleLink for SimLink {
    async fn scan(&mut self, _duration: Duration) -> Result<Vec<DongleIdentity>, LinkError> {
        Ok(self
            .peers
            .iter()
            .filter(|(_, p)| p.reachable)
            .map(|(a, p)| Self::identity(a, p))
            .collect())
    }

    async fn scan_for_rssi(
        &mut self,
        targets: &[String],
        _duration: Duration,
    ) -> Result<HashMap<String, i16>, LinkError> {
        Ok(targets
            .iter()
            .filter_map(|address| {
                self.peer(address)
                    .filter(|p| p.reachable)
                    .map(|p| (address.clone(), p.rssi))
            })
            .collect())
    }

    async fn connect(
        &mut self,
        address: &str,
        _timeout: Option<Duration>,
    ) -> Result<(), LinkError> {
        if self.connected.as_deref() == Some(address) {
            return Ok(());
        }
        if let Some(dongle) = self.connected_dongle() {
            dongle.on_disconnect();
            self.connected = None;
        }
        let Some(peer) = self.peer(address) else {
            return Err(LinkError::ConnectFailed {
                address: address.to_string(),
                reason: "unknown device".into(),
            });
        };
        if !peer.reachable {
            return Err(LinkError::ConnectFailed {
                address: address.to_string(),
                reason: "no response".into(),
            });
        }
        let dongle = peer.dongle.clone();
        self.connected = Some(address.to_string());
        dongle.on_connect();
        Ok(())
    }

    async fn write(&mut self, payload: &[u8], _kind: WriteKind) -> Result<(), LinkError> {
        match self.connected_dongle() {
            Some(dongle) => {
                dongle.handle_write(payload);
                Ok(())
            }
            None => Err(LinkError::NotConnected),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(dongle) = self.connected_dongle() {
            dongle.on_disconnect();
        }
        self.connected = None;
    }

    async fn await_disconnected(&mut self, _timeout: Duration) -> bool {
        self.connected.is_none()
    }

    async fn next_notification(&mut self, _timeout: Duration) -> Option<Vec<u8>> {
        // Synchronous simulation: an empty queue means nothing more is
        // coming, which stands in for the timeout elapsing.
        self.connected_dongle()?.pop_notification()
    }

    async fn pair(&mut self, address: &str) -> Result<(), LinkError> {
        match self.peers.iter_mut().find(|(a, _)| a == address) {
            Some((_, peer)) => {
                peer.bonded = true;
                Ok(())
            }
            None => Err(LinkError::ConnectFailed {
                address: address.to_string(),
                reason: "unknown device".into(),
            }),
        }
    }

    async fn unpair(&mut self, address: &str) -> Result<(), LinkError> {
        if let Some((_, peer)) = self.peers.iter_mut().find(|(a, _)| a == address) {
            peer.bonded = false;
        }
        Ok(())
    }

    async fn await_bonded(&mut self, address: &str, _timeout: Duration) -> bool {
        self.peer(address).is_some_and(|p| p.bonded)
    }

    fn is_up(&self) -> bool {
        self.connected.is_some()
    }

    fn current_address(&self) -> Option<&str> {
        self.connected.as_deref()
    }

    fn known_devices(&self) -> Vec<DongleIdentity> {
        self.peers
            .iter()
            .map(|(a, p)| Self::identity(a, p))
            .collect()
    }
}
