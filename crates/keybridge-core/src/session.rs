//! Session orchestration: owns the link, the secure session, and the
//! auto-connect policy.
//!
//! All protocol state lives in one [`Orchestrator`] value constructed at
//! startup; there are no process-wide singletons. Exclusive `&mut`
//! entry points serialize state mutations, the `connect_in_progress` flag
//! short-circuits reentrant attempts from nested recovery paths, and UI
//! observers follow a `watch` channel instead of reaching into the state.

use crate::channel::SessionState;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, HandshakeFault};
use crate::handshake;
use crate::keystore::{KeyStore, KeyWrap};
use crate::ops;
use crate::password::{PasswordPrompt, PasswordRequest};
use crate::prefs::{PrefStore, Preferences};
use crate::wire::Wire;
use keybridge_link::{BleLink, DongleIdentity, LinkError};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Phase of the current connect attempt, driven by the event dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Idle,
    Connecting,
    WaitingHello,
    Handshaking,
    Secure,
    Failed,
}

/// Snapshot published to UI observers after every state change.
///
/// Invariants: `secure_up` implies `ble_up`; when `ble_up` drops, both
/// `secure_up` and `fast_keys_enabled` drop before any operation can
/// observe the state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub ble_up: bool,
    pub secure_up: bool,
    pub current_target: Option<String>,
    pub fast_keys_enabled: bool,
}

/// Severity levels for user-facing progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of progress produced during a connect or provisioning run.
#[derive(Debug, Clone)]
pub struct BridgeEvent {
    pub level: BridgeLevel,
    pub message: String,
}

/// Aggregated report returned by connect entry points.
#[derive(Debug, Clone)]
pub struct ConnectReport {
    pub title: String,
    pub events: Vec<BridgeEvent>,
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: BridgeLevel, message: impl Into<String>) -> BridgeEvent {
    BridgeEvent {
        level,
        message: message.into(),
    }
}

/// Owns one dongle link and the secure session riding on it.
pub struct Orchestrator<L: BleLink, W: KeyWrap = crate::keystore::FileWrap> {
    wire: Wire<L>,
    cfg: BridgeConfig,
    keys: KeyStore<W>,
    prefs: Preferences,
    pref_store: PrefStore,
    prompt: Option<Arc<dyn PasswordPrompt>>,
    prompt_engaged: bool,
    session: Option<SessionState>,
    phase: ConnectPhase,
    connect_in_progress: bool,
    suppress_until: Option<Instant>,
    fast_keys: bool,
    state_tx: watch::Sender<ConnectionState>,
}

impl<L: BleLink, W: KeyWrap> Orchestrator<L, W> {
    pub fn new(
        link: L,
        cfg: BridgeConfig,
        keys: KeyStore<W>,
        pref_store: PrefStore,
    ) -> BridgeResult<Self> {
        let prefs = pref_store.read()?;
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Ok(Self {
            wire: Wire::new(link),
            cfg,
            keys,
            prefs,
            pref_store,
            prompt: None,
            prompt_engaged: false,
            session: None,
            phase: ConnectPhase::Idle,
            connect_in_progress: false,
            suppress_until: None,
            fast_keys: false,
            state_tx,
        })
    }

    /// Subscribe to connection-state changes.
    pub fn observe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current connection-state snapshot.
    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn phase(&self) -> ConnectPhase {
        self.phase
    }

    pub fn preferences(&self) -> &Preferences {
        &self.prefs
    }

    pub fn key_store(&self) -> &KeyStore<W> {
        &self.keys
    }

    /// Apply a preference change and persist it.
    pub fn update_preferences(
        &mut self,
        change: impl FnOnce(&mut Preferences),
    ) -> BridgeResult<()> {
        change(&mut self.prefs);
        self.pref_store.write(&self.prefs)
    }

    /// Install the UI's password prompt. The slot holds one prompt.
    pub fn set_prompt(&mut self, prompt: Arc<dyn PasswordPrompt>) {
        self.prompt = Some(prompt);
    }

    /// Release the prompt slot, e.g. on UI teardown.
    pub fn clear_prompt(&mut self) {
        self.prompt = None;
        self.prompt_engaged = false;
    }

    fn persist_prefs(&self) -> BridgeResult<()> {
        self.pref_store.write(&self.prefs)
    }

    fn publish(&self) {
        let state = ConnectionState {
            ble_up: self.wire.link.is_up(),
            secure_up: self.session.is_some(),
            current_target: self.wire.link.current_address().map(str::to_string),
            fast_keys_enabled: self.fast_keys,
        };
        self.state_tx.send_replace(state);
    }

    fn drop_session(&mut self, reason: &str) {
        if self.session.take().is_some() {
            log::info!("secure session dropped: {reason}");
        }
        self.fast_keys = false;
        if self.phase == ConnectPhase::Secure {
            self.phase = ConnectPhase::Idle;
        }
        self.publish();
    }

    fn device_name(&self, address: &str) -> Option<String> {
        self.wire
            .link
            .known_devices()
            .into_iter()
            .find(|d| d.address == address)
            .and_then(|d| d.name)
    }

    /// Connect to `address` and establish a secure session. Manual entry
    /// point: may prompt for a password when `allow_prompt` is set.
    ///
    /// On success the dongle becomes the persisted primary and any
    /// auto-disable latch is cleared.
    pub async fn connect(
        &mut self,
        address: &str,
        allow_prompt: bool,
    ) -> BridgeResult<ConnectReport> {
        if self.connect_in_progress {
            return Err(BridgeError::Busy);
        }
        self.connect_in_progress = true;
        let result = self
            .connect_attempt(
                address,
                allow_prompt,
                self.cfg.connect_timeout(),
                self.cfg.hello_wait(),
            )
            .await;
        self.connect_in_progress = false;

        match result {
            Ok(events) => {
                let name = self.device_name(address);
                self.prefs.select(address, name.as_deref());
                self.persist_prefs()?;
                Ok(ConnectReport {
                    title: format!("Connected to {address}"),
                    events,
                })
            }
            Err(err) => {
                self.phase = ConnectPhase::Failed;
                self.publish();
                Err(err)
            }
        }
    }

    /// Silent startup entry point: fast path to the remembered dongle,
    /// then an RSSI-ranked sweep over every bonded dongle with a stored
    /// app key. Never prompts.
    pub async fn auto_connect(&mut self) -> BridgeResult<ConnectReport> {
        if !self.prefs.use_external {
            return Err(BridgeError::Config(
                "external keyboard output is disabled".into(),
            ));
        }
        if self.prefs.disabled_by_error {
            return Err(BridgeError::Config(
                "auto-connect is disabled after repeated failures; connect manually to re-enable"
                    .into(),
            ));
        }
        if let Some(until) = self.suppress_until {
            if Instant::now() < until {
                return Err(BridgeError::Config(
                    "auto-connect suppressed after a deliberate disconnect".into(),
                ));
            }
            self.suppress_until = None;
        }
        if self.prompt_engaged {
            return Err(BridgeError::Config(
                "password prompt in use; silent auto-connect skipped".into(),
            ));
        }
        if self.connect_in_progress {
            return Err(BridgeError::Busy);
        }
        let primary = self
            .prefs
            .selected_address
            .clone()
            .ok_or_else(|| BridgeError::Config("no dongle selected".into()))?;

        self.connect_in_progress = true;
        let outcome = self.auto_connect_sweep(&primary).await;
        self.connect_in_progress = false;

        match outcome {
            Ok((winner, events)) => {
                let name = self.device_name(&winner);
                self.prefs.select(&winner, name.as_deref());
                self.persist_prefs()?;
                Ok(ConnectReport {
                    title: format!("Auto-connected to {winner}"),
                    events,
                })
            }
            Err(err) => {
                self.phase = ConnectPhase::Failed;
                self.prefs.disabled_by_error = true;
                self.persist_prefs()?;
                self.publish();
                log::warn!("auto-connect exhausted all candidates: {err}");
                Err(err)
            }
        }
    }

    async fn auto_connect_sweep(
        &mut self,
        primary: &str,
    ) -> BridgeResult<(String, Vec<BridgeEvent>)> {
        let mut events = Vec::new();
        let fast_connect = self.cfg.fast_connect_timeout();
        let fast_hello = self.cfg.fast_hello_wait();

        match self
            .connect_attempt(primary, false, fast_connect, fast_hello)
            .await
        {
            Ok(mut attempt_events) => {
                events.append(&mut attempt_events);
                return Ok((primary.to_string(), events));
            }
            Err(err) => {
                log::info!("fast path to {primary} failed: {err}");
                events.push(event(
                    BridgeLevel::Warn,
                    format!("fast path to {primary} failed: {err}"),
                ));
            }
        }

        // Remaining candidates: bonded dongles we hold a key for.
        let candidates: Vec<String> = self
            .wire
            .link
            .known_devices()
            .into_iter()
            .filter(|d| d.bonded && d.address != primary && self.keys.contains(&d.address))
            .map(|d| d.address)
            .collect();
        if candidates.is_empty() {
            return Err(BridgeError::Config(
                "no dongle reachable; auto-connect disabled until re-enabled".into(),
            ));
        }

        let rssi = self
            .wire
            .link
            .scan_for_rssi(&candidates, self.cfg.rssi_scan_duration())
            .await
            .unwrap_or_default();

        // Strongest signal first; dongles the sweep saw outrank the ones it
        // did not; ties break on input order.
        let mut ranked: Vec<(usize, String)> = candidates.into_iter().enumerate().collect();
        ranked.sort_by(|(left_idx, left), (right_idx, right)| {
            match (rssi.get(left), rssi.get(right)) {
                (Some(l), Some(r)) => r.cmp(l).then(left_idx.cmp(right_idx)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => left_idx.cmp(right_idx),
            }
        });

        for (_, address) in ranked {
            match self
                .connect_attempt(&address, false, fast_connect, fast_hello)
                .await
            {
                Ok(mut attempt_events) => {
                    events.append(&mut attempt_events);
                    return Ok((address, events));
                }
                Err(err) => {
                    log::info!("candidate {address} failed: {err}");
                    events.push(event(
                        BridgeLevel::Warn,
                        format!("candidate {address} failed: {err}"),
                    ));
                }
            }
        }

        Err(BridgeError::Config(
            "no dongle reachable; auto-connect disabled until re-enabled".into(),
        ))
    }

    /// One full attempt: transport connect, key availability, hello,
    /// handshake, plus the bounded recovery branches.
    async fn connect_attempt(
        &mut self,
        address: &str,
        allow_prompt: bool,
        connect_timeout: Duration,
        hello_wait: Duration,
    ) -> BridgeResult<Vec<BridgeEvent>> {
        let mut events = Vec::new();
        self.drop_session("starting a new connect attempt");
        // Always start from a fresh link: the hello is only sent on a new
        // connection, and a stale notification queue must not leak into
        // the handshake.
        self.reconnect(address, connect_timeout, &mut events).await?;

        if self.keys.get(address).is_none() {
            if !allow_prompt {
                return Err(HandshakeFault::MissingAppKey.into());
            }
            self.provision_over_link(address, false, &mut events).await?;
            // Fresh link so the hello and notification stream restart clean.
            self.reconnect(address, connect_timeout, &mut events).await?;
        }

        match self.run_handshake(address, hello_wait, &mut events).await {
            Ok(()) => {}
            Err(BridgeError::Handshake(fault))
                if fault.invalidates_app_key() && allow_prompt && self.prompt.is_some() =>
            {
                events.push(event(
                    BridgeLevel::Warn,
                    format!("stored app key rejected ({fault}); re-provisioning"),
                ));
                self.keys.clear(address)?;
                self.reconnect(address, connect_timeout, &mut events).await?;
                self.provision_over_link(address, true, &mut events).await?;
                self.reconnect(address, connect_timeout, &mut events).await?;
                self.run_handshake(address, hello_wait, &mut events).await?;
            }
            Err(BridgeError::Handshake(HandshakeFault::NoHello)) => {
                events.push(event(
                    BridgeLevel::Warn,
                    "no server hello; reconnecting for one retry",
                ));
                self.reconnect(address, connect_timeout, &mut events).await?;
                self.run_handshake(address, hello_wait, &mut events).await?;
            }
            Err(err) => return Err(err),
        }

        events.push(event(
            BridgeLevel::Success,
            format!("secure session established with {address}"),
        ));
        Ok(events)
    }

    async fn transport_connect(
        &mut self,
        address: &str,
        timeout: Duration,
        events: &mut Vec<BridgeEvent>,
    ) -> BridgeResult<()> {
        self.phase = ConnectPhase::Connecting;
        let mut last: Option<LinkError> = None;
        for attempt in 1..=self.cfg.retry.max_attempts.max(1) {
            self.wire.reset();
            match self.wire.link.connect(address, Some(timeout)).await {
                Ok(()) => {
                    self.publish();
                    events.push(event(BridgeLevel::Info, format!("link up to {address}")));
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("connect attempt {attempt} to {address} failed: {err}");
                    last = Some(err);
                    if attempt < self.cfg.retry.max_attempts {
                        tokio::time::sleep(Duration::from_millis(self.cfg.retry.base_delay_ms))
                            .await;
                    }
                }
            }
        }
        self.publish();
        Err(BridgeError::Transport(
            last.unwrap_or(LinkError::NotConnected),
        ))
    }

    async fn reconnect(
        &mut self,
        address: &str,
        timeout: Duration,
        events: &mut Vec<BridgeEvent>,
    ) -> BridgeResult<()> {
        self.wire.link.disconnect().await;
        let _ = self
            .wire
            .link
            .await_disconnected(self.cfg.disconnect_timeout())
            .await;
        self.wire.reset();
        self.transport_connect(address, timeout, events).await
    }

    async fn provision_over_link(
        &mut self,
        address: &str,
        retry: bool,
        events: &mut Vec<BridgeEvent>,
    ) -> BridgeResult<()> {
        let prompt = self
            .prompt
            .clone()
            .ok_or_else(|| BridgeError::Config("no password prompt registered".into()))?;
        let request = PasswordRequest {
            address: address.to_string(),
            name: self.device_name(address),
            retry,
        };

        self.prompt_engaged = true;
        let result = handshake::provision(
            &mut self.wire,
            prompt.as_ref(),
            &request,
            self.cfg.reply_timeout(),
        )
        .await;
        self.prompt_engaged = false;

        let key = result?;
        self.keys.put(address, &key)?;
        events.push(event(
            BridgeLevel::Security,
            format!("app key provisioned and stored for {address}"),
        ));
        Ok(())
    }

    async fn run_handshake(
        &mut self,
        address: &str,
        hello_wait: Duration,
        events: &mut Vec<BridgeEvent>,
    ) -> BridgeResult<()> {
        let app_key = self
            .keys
            .get(address)
            .ok_or(BridgeError::Handshake(HandshakeFault::MissingAppKey))?;

        self.phase = ConnectPhase::WaitingHello;
        self.publish();
        let hello = handshake::await_server_hello(&mut self.wire, hello_wait).await?;

        self.phase = ConnectPhase::Handshaking;
        self.publish();
        let session =
            handshake::establish(&mut self.wire, &app_key, hello, self.cfg.reply_timeout())
                .await?;

        events.push(event(
            BridgeLevel::Info,
            format!("session {:#010x} keys derived", session.sid()),
        ));
        self.session = Some(session);
        self.phase = ConnectPhase::Secure;
        self.publish();
        Ok(())
    }

    /// Provision `address` without establishing a session afterwards.
    /// A no-op when a key is already stored, unless `force_fetch` is set.
    pub async fn provision(
        &mut self,
        address: &str,
        force_fetch: bool,
    ) -> BridgeResult<ConnectReport> {
        if self.connect_in_progress {
            return Err(BridgeError::Busy);
        }
        if !force_fetch && self.keys.contains(address) {
            return Ok(ConnectReport {
                title: format!("Provisioning {address}"),
                events: vec![event(
                    BridgeLevel::Info,
                    "app key already stored; nothing to do",
                )],
            });
        }

        self.connect_in_progress = true;
        let result = self.provision_run(address).await;
        self.connect_in_progress = false;
        result.map(|events| ConnectReport {
            title: format!("Provisioned {address}"),
            events,
        })
    }

    async fn provision_run(&mut self, address: &str) -> BridgeResult<Vec<BridgeEvent>> {
        let mut events = Vec::new();
        self.drop_session("provisioning requested");
        self.transport_connect(address, self.cfg.connect_timeout(), &mut events)
            .await?;
        self.provision_over_link(address, false, &mut events).await?;
        Ok(events)
    }

    /// Tear the link down. With `suppress_auto_connect`, the auto-connect
    /// entry point stays inert for the configured window; credential
    /// injection flows use this to release the radio without racing an
    /// immediate reconnect.
    pub async fn disconnect(&mut self, suppress_auto_connect: bool) {
        self.drop_session("disconnect requested");
        self.wire.link.disconnect().await;
        let _ = self
            .wire
            .link
            .await_disconnected(self.cfg.disconnect_timeout())
            .await;
        self.wire.reset();
        if suppress_auto_connect {
            self.suppress_until = Some(Instant::now() + self.cfg.suppress_window());
        }
        self.phase = ConnectPhase::Idle;
        self.publish();
    }

    /// Scan for nearby dongles, feeding the UI's device list. Refused
    /// while a connect owns the radio.
    pub async fn scan_devices(&mut self, duration: Duration) -> BridgeResult<Vec<DongleIdentity>> {
        if self.connect_in_progress {
            return Err(BridgeError::Busy);
        }
        Ok(self.wire.link.scan(duration).await?)
    }

    /// Devices the link backend already knows: bond table plus scan cache.
    pub fn known_devices(&self) -> Vec<DongleIdentity> {
        self.wire.link.known_devices()
    }

    /// Bond with a dongle ahead of connecting; `Ok(false)` when the bond
    /// did not complete within `timeout`.
    pub async fn pair_device(&mut self, address: &str, timeout: Duration) -> BridgeResult<bool> {
        self.wire.link.pair(address).await?;
        Ok(self.wire.link.await_bonded(address, timeout).await)
    }

    /// Drop the stored key, bond, and selection for `address`.
    pub async fn forget_device(&mut self, address: &str) -> BridgeResult<()> {
        if self.wire.link.current_address() == Some(address) {
            self.disconnect(false).await;
        }
        self.keys.clear(address)?;
        let _ = self.wire.link.unpair(address).await;
        if self.prefs.selected_address.as_deref() == Some(address) {
            self.prefs.clear_selection();
            self.persist_prefs()?;
        }
        Ok(())
    }

    /// Establish a session if none is live. Silent: re-handshakes never
    /// prompt, so a stale key fails here and needs a manual connect.
    async fn ensure_secure(&mut self) -> BridgeResult<()> {
        if !self.wire.link.is_up() {
            self.drop_session("link is down");
        }
        if self.session.is_some() {
            return Ok(());
        }
        let address = self
            .wire
            .link
            .current_address()
            .map(str::to_string)
            .or_else(|| self.prefs.selected_address.clone())
            .ok_or_else(|| BridgeError::Config("no dongle selected".into()))?;

        if self.connect_in_progress {
            return Err(BridgeError::Busy);
        }
        self.connect_in_progress = true;
        let result = self
            .connect_attempt(
                &address,
                false,
                self.cfg.connect_timeout(),
                self.cfg.hello_wait(),
            )
            .await;
        self.connect_in_progress = false;
        result.map(|_| ())
    }

    /// Abandon the session on failures that poison it, so the next verb
    /// starts from a clean handshake.
    fn settle<T>(&mut self, result: BridgeResult<T>) -> BridgeResult<T> {
        match &result {
            Err(BridgeError::Crypto(fault)) => {
                self.drop_session(&format!("secure channel failure: {fault}"));
            }
            Err(BridgeError::Transport(err)) => {
                self.drop_session(&format!("transport failure: {err}"));
            }
            _ => {}
        }
        result
    }

    /// Type `text` on the dongle, honoring the newline preference, and
    /// verify the echoed MD5.
    pub async fn send_string(&mut self, text: &str) -> BridgeResult<()> {
        self.ensure_secure().await?;
        let append = self.prefs.append_newline;
        let timeout = self.cfg.type_reply_timeout();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::Config("no secure session".into()))?;
        let result = ops::send_string(&mut self.wire, session, text, append, timeout).await;
        self.settle(result)
    }

    /// Fetch the dongle's raw info text.
    pub async fn get_info(&mut self) -> BridgeResult<String> {
        self.ensure_secure().await?;
        let timeout = self.cfg.reply_timeout();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::Config("no secure session".into()))?;
        let result = ops::get_info(&mut self.wire, session, timeout).await;
        self.settle(result)
    }

    /// Read the active keyboard layout from the dongle.
    pub async fn get_layout(&mut self) -> BridgeResult<String> {
        self.ensure_secure().await?;
        let timeout = self.cfg.reply_timeout();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::Config("no secure session".into()))?;
        let result = ops::get_layout(&mut self.wire, session, timeout).await;
        self.settle(result)
    }

    /// Push a layout code to the dongle and remember it in preferences.
    pub async fn set_layout(&mut self, code: &str) -> BridgeResult<()> {
        self.ensure_secure().await?;
        let timeout = self.cfg.reply_timeout();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::Config("no secure session".into()))?;
        let result = ops::set_layout(&mut self.wire, session, code, timeout).await;
        let result = self.settle(result);
        if result.is_ok() {
            self.prefs.layout = Some(code.to_string());
            self.persist_prefs()?;
        }
        result
    }

    /// Factory-reset the dongle. Wipes the stored app key afterwards: the
    /// reset destroyed the dongle's copy, so ours is stale.
    pub async fn factory_reset(&mut self) -> BridgeResult<()> {
        self.ensure_secure().await?;
        let timeout = self.cfg.reply_timeout();
        let address = self.wire.link.current_address().map(str::to_string);
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::Config("no secure session".into()))?;
        let result = ops::factory_reset(&mut self.wire, session, timeout).await;
        let result = self.settle(result);
        if result.is_ok() {
            if let Some(address) = address {
                self.keys.clear(&address)?;
            }
            self.drop_session("factory reset completed");
        }
        result
    }

    /// Switch the dongle into raw-fast key mode for this session.
    pub async fn enable_fast_keys(&mut self) -> BridgeResult<()> {
        self.ensure_secure().await?;
        let timeout = self.cfg.reply_timeout();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::Config("no secure session".into()))?;
        let result = ops::enable_fast_keys(&mut self.wire, session, timeout).await;
        let result = self.settle(result);
        if result.is_ok() {
            self.fast_keys = true;
            self.publish();
        }
        result
    }

    /// Fire a single HID tap. Requires a live session with raw-fast mode
    /// enabled; the frame goes out unencrypted with no acknowledgement.
    pub async fn raw_key_tap(
        &mut self,
        mods: u8,
        usage: u8,
        repeat: Option<u8>,
    ) -> BridgeResult<()> {
        self.ensure_secure().await?;
        if !self.fast_keys {
            return Err(BridgeError::Config(
                "raw key mode is not enabled for this session".into(),
            ));
        }
        let result = ops::raw_key_tap(&mut self.wire, mods, usage, repeat).await;
        self.settle(result)
    }

    /// Fire the remapped tap for a volume key, when one is configured.
    /// Returns `false` when the key has no remap.
    pub async fn volume_key_tap(&mut self, up: bool) -> BridgeResult<bool> {
        let tap = if up {
            self.prefs.volume_keys.up
        } else {
            self.prefs.volume_keys.down
        };
        match tap {
            Some(tap) => {
                self.raw_key_tap(tap.mods, tap.usage, None).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
