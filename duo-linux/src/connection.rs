//! Connection manager: race-dial candidate addresses, handshake, single-session lifecycle,
//! and discovery-driven auto-reconnect.
//!
//! States: `Idle -> Dialing -> Open -> Ready -> Closing -> Idle`. Every attempt and every
//! installed session carries an epoch; a task acting on a stale epoch does nothing, so
//! concurrent dials, timers and readers never leak into the current session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duo_core::network::is_dial_admissible;
use duo_core::protocol::{PeerInfo, WakeUpTarget, PEER_INFO, PROTOCOL_VERSION};
use duo_core::{decode_envelope, encode_envelope, CryptoAdapter, Envelope, PeerAddress, SessionKey};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::events::{ConnectionEvent, ConnectionStatus, SessionEvent, EVENT_CAPACITY};
use crate::store::{LastPeer, SessionStore};
use crate::transport::{socket_url, Dialer, EnvelopeSink, Link};
use crate::LocalIdentity;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Dialing,
    /// Transport open, handshake pending. Sending is allowed.
    Open,
    Ready,
    Closing,
}

/// Why a connect attempt or session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectFailure {
    #[error("no candidate address is on an admissible network")]
    NoAdmissibleAddress,
    #[error("no candidate address could be reached in time")]
    DialTimeout,
    #[error("peer never completed the handshake (shared key is likely wrong)")]
    HandshakeTimeout,
    #[error("transport closed unexpectedly")]
    TransportClosedUnexpectedly,
    #[error("attempt superseded by another connect or disconnect")]
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub expanded_networking: bool,
    pub auto_reconnect: bool,
    /// Key for wake-up connects when no last peer key is stored.
    pub default_key: Option<SessionKey>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            expanded_networking: false,
            auto_reconnect: true,
            default_key: None,
        }
    }
}

/// One connect call: every address is a candidate for the same peer.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub addresses: Vec<String>,
    pub port: u16,
    pub key: Option<SessionKey>,
    pub manual: bool,
}

type HandshakeResult = Result<(), ConnectFailure>;

struct Session {
    epoch: u64,
    address: String,
    port: u16,
    candidates: Vec<String>,
    key: Option<SessionKey>,
    manual: bool,
    outbound: mpsc::UnboundedSender<String>,
    handshake_done: AtomicBool,
    handshake_tx: Mutex<Option<oneshot::Sender<HandshakeResult>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn resolve(&self, result: HandshakeResult) {
        if let Some(tx) = self.handshake_tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    /// Stop the session's tasks. The link closes once the last `outbound` clone drops.
    fn shutdown(&self) {
        if let Some(h) = self.reader.lock().take() {
            h.abort();
        }
        if let Some(h) = self.timer.lock().take() {
            h.abort();
        }
    }
}

struct Slot {
    state: LinkState,
    epoch: u64,
    session: Option<Arc<Session>>,
}

struct Inner<D> {
    dialer: D,
    crypto: Arc<dyn CryptoAdapter>,
    store: Arc<dyn SessionStore>,
    identity: LocalIdentity,
    settings: ConnectionSettings,
    expanded_networking: AtomicBool,
    auto_reconnect: AtomicBool,
    slot: Mutex<Slot>,
    events: broadcast::Sender<ConnectionEvent>,
    feed: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    peers: Mutex<Option<watch::Receiver<Vec<PeerAddress>>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the single transport session. Cheap to clone; clones share state.
pub struct ConnectionManager<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for ConnectionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Dialer> ConnectionManager<D> {
    pub fn new(
        dialer: D,
        crypto: Arc<dyn CryptoAdapter>,
        store: Arc<dyn SessionStore>,
        identity: LocalIdentity,
        settings: ConnectionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                dialer,
                crypto,
                store,
                identity,
                expanded_networking: AtomicBool::new(settings.expanded_networking),
                auto_reconnect: AtomicBool::new(settings.auto_reconnect),
                settings,
                slot: Mutex::new(Slot {
                    state: LinkState::Idle,
                    epoch: 0,
                    session: None,
                }),
                events,
                feed: Mutex::new(None),
                peers: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    /// Race-dial the candidates and wait for the handshake. Resolves once the session is
    /// `Ready` or the attempt has failed; the manager is back in `Idle` on failure.
    pub async fn connect(&self, request: ConnectRequest) -> Result<(), ConnectFailure> {
        self.inner.connect(request).await
    }

    /// Close the session, stop timers and auto-reconnect. Idempotent.
    pub fn disconnect(&self, manual: bool) {
        self.inner.disconnect(manual);
    }

    /// Encrypt (when keyed) and queue an envelope. Allowed in `Open` and `Ready`.
    pub fn send_message(&self, envelope: &Envelope) -> bool {
        self.inner.send_message(envelope)
    }

    pub fn state(&self) -> LinkState {
        self.inner.slot.lock().state
    }

    /// True only after the handshake.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Ready
    }

    /// Address of the current session, if any.
    pub fn connected_address(&self) -> Option<(String, u16)> {
        let slot = self.inner.slot.lock();
        slot.session.as_ref().map(|s| (s.address.clone(), s.port))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Inbound envelopes and session closures, in order and never dropped.
    /// Replaces any previously attached feed.
    pub fn session_feed(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.feed.lock() = Some(tx);
        rx
    }

    /// Feed of discovered peers used by auto-reconnect.
    pub fn attach_discovery(&self, peers: watch::Receiver<Vec<PeerAddress>>) {
        *self.inner.peers.lock() = Some(peers);
    }

    /// Start waiting for the last peer if we are idle and allowed to reconnect.
    pub fn resume_auto_reconnect(&self) {
        if self.state() == LinkState::Idle {
            self.inner.start_auto_reconnect();
        }
    }

    pub fn is_auto_reconnecting(&self) -> bool {
        self.inner
            .reconnect
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.inner.cancel_auto_reconnect();
        }
    }

    pub fn set_expanded_networking(&self, enabled: bool) {
        self.inner.expanded_networking.store(enabled, Ordering::SeqCst);
    }

    /// Peer asked (over discovery) to be reconnected. Ignored while a session exists.
    pub async fn handle_wake_up(&self, target: WakeUpTarget) -> Result<(), ConnectFailure> {
        if self.state() != LinkState::Idle {
            debug!(ip = %target.ip, "Ignoring wake-up request, session already active");
            return Ok(());
        }
        info!(ip = %target.ip, port = target.port, name = %target.name, "Wake-up request, reconnecting");
        let key = self
            .inner
            .store
            .last_peer()
            .and_then(|p| p.key)
            .or_else(|| self.inner.settings.default_key.clone());
        self.connect(ConnectRequest {
            addresses: vec![target.ip],
            port: target.port,
            key,
            manual: false,
        })
        .await
    }
}

impl<D: Dialer> EnvelopeSink for ConnectionManager<D> {
    fn send_envelope(&self, envelope: &Envelope) -> bool {
        self.send_message(envelope)
    }
}

impl<D: Dialer> Inner<D> {
    async fn connect(self: &Arc<Self>, request: ConnectRequest) -> Result<(), ConnectFailure> {
        if request.manual {
            self.cancel_auto_reconnect();
        }
        let expanded = self.expanded_networking.load(Ordering::SeqCst);
        let mut candidates: Vec<String> = Vec::new();
        for ip in &request.addresses {
            let ip = ip.trim().to_string();
            if is_dial_admissible(&ip, expanded) && !candidates.contains(&ip) {
                candidates.push(ip);
            }
        }
        if candidates.is_empty() {
            warn!(addresses = ?request.addresses, "No admissible address to connect to");
            self.publish_status(false, Some(ConnectFailure::NoAdmissibleAddress), None);
            return Err(ConnectFailure::NoAdmissibleAddress);
        }

        let (epoch, previous) = {
            let mut slot = self.slot.lock();
            slot.epoch += 1;
            slot.state = LinkState::Dialing;
            (slot.epoch, slot.session.take())
        };
        if let Some(old) = previous {
            info!(address = %old.address, "Replacing existing session");
            old.shutdown();
            self.forward(SessionEvent::Closed);
            old.resolve(Err(ConnectFailure::Superseded));
            self.publish_status(false, None, None);
        }

        info!(candidates = ?candidates, port = request.port, manual = request.manual, "Dialing");
        let Some((address, link)) = self.race_dial(&candidates, request.port).await else {
            let mut slot = self.slot.lock();
            if slot.epoch != epoch {
                return Err(ConnectFailure::Superseded);
            }
            slot.state = LinkState::Idle;
            drop(slot);
            warn!(candidates = ?candidates, "Dial timed out");
            self.publish_status(false, Some(ConnectFailure::DialTimeout), None);
            return Err(ConnectFailure::DialTimeout);
        };

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let session = Arc::new(Session {
            epoch,
            address: address.clone(),
            port: request.port,
            candidates,
            key: request.key.clone(),
            manual: request.manual,
            outbound: link.outbound,
            handshake_done: AtomicBool::new(false),
            handshake_tx: Mutex::new(Some(handshake_tx)),
            reader: Mutex::new(None),
            timer: Mutex::new(None),
        });

        {
            let mut slot = self.slot.lock();
            if slot.epoch != epoch || slot.state != LinkState::Dialing {
                debug!(address = %address, "Dial won after attempt was superseded, discarding link");
                return Err(ConnectFailure::Superseded);
            }
            slot.state = LinkState::Open;
            slot.session = Some(session.clone());
        }
        info!(address = %address, port = request.port, "Transport open, awaiting handshake");

        *session.reader.lock() = Some(tokio::spawn(self.clone().read_loop(epoch, link.inbound)));
        *session.timer.lock() = Some(tokio::spawn(self.clone().handshake_timer(epoch)));
        if !self.is_current(epoch) {
            session.shutdown();
        }

        let hello = PeerInfo {
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            device_type: self.identity.kind,
            version: PROTOCOL_VERSION,
        };
        match Envelope::new(PEER_INFO, &hello) {
            Ok(env) => {
                self.send_message(&env);
            }
            Err(e) => warn!(error = %e, "Failed to encode peerInfo"),
        }

        drop(session);
        match handshake_rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnectFailure::Superseded),
        }
    }

    /// Dial every candidate at once. First link wins; the rest are aborted or dropped.
    async fn race_dial(self: &Arc<Self>, candidates: &[String], port: u16) -> Option<(String, Link)> {
        let mut attempts = JoinSet::new();
        for ip in candidates {
            let inner = self.clone();
            let ip = ip.clone();
            let url = socket_url(&ip, port);
            attempts.spawn(async move {
                let result = inner.dialer.dial(&url).await;
                (ip, result)
            });
        }
        let winner = tokio::time::timeout(self.settings.dial_timeout, async {
            while let Some(joined) = attempts.join_next().await {
                match joined {
                    Ok((ip, Ok(link))) => return Some((ip, link)),
                    Ok((ip, Err(e))) => debug!(ip = %ip, error = %e, "Dial attempt failed"),
                    Err(e) => debug!(error = %e, "Dial attempt aborted"),
                }
            }
            None
        })
        .await
        .ok()
        .flatten();
        attempts.abort_all();
        winner
    }

    async fn read_loop(self: Arc<Self>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(frame) = inbound.recv().await {
            let Some(session) = self.current_session(epoch) else {
                return;
            };
            let text = match &session.key {
                Some(key) => match self.crypto.decrypt(key, &frame) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(error = %e, "Dropping frame that does not decrypt");
                        continue;
                    }
                },
                None => frame,
            };
            let envelope = match decode_envelope(&text) {
                Ok(env) => env,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed envelope");
                    continue;
                }
            };
            if envelope.is(PEER_INFO) && !session.handshake_done.load(Ordering::SeqCst) {
                match envelope.payload::<PeerInfo>() {
                    Ok(info) => self.complete_handshake(&session, info),
                    Err(e) => warn!(error = %e, "Ignoring malformed peerInfo"),
                }
            }
            self.forward(SessionEvent::Message(envelope.clone()));
            let _ = self.events.send(ConnectionEvent::Message(envelope));
        }
        self.on_transport_closed(epoch);
    }

    fn complete_handshake(&self, session: &Session, info: PeerInfo) {
        {
            let mut slot = self.slot.lock();
            if slot.epoch != session.epoch || slot.state != LinkState::Open {
                return;
            }
            slot.state = LinkState::Ready;
        }
        session.handshake_done.store(true, Ordering::SeqCst);
        if let Some(h) = session.timer.lock().take() {
            h.abort();
        }
        info!(peer = %info.name, id = %info.id, address = %session.address, "Handshake complete");
        self.store.set_manually_disconnected(false);
        self.store.set_last_peer(LastPeer {
            id: info.id.clone(),
            name: info.name.clone(),
            kind: info.device_type,
            addresses: session.candidates.clone(),
            port: session.port,
            key: session.key.clone(),
        });
        self.publish_status(true, None, Some(info.name));
        session.resolve(Ok(()));
    }

    async fn handshake_timer(self: Arc<Self>, epoch: u64) {
        tokio::time::sleep(self.settings.handshake_timeout).await;
        let Some(session) = self.current_session(epoch) else {
            return;
        };
        if session.handshake_done.load(Ordering::SeqCst) {
            return;
        }
        // Detach our own handle so shutdown does not abort this task mid-cleanup.
        drop(session.timer.lock().take());
        let Some(session) = self.take_session(Some(epoch)) else {
            return;
        };
        session.shutdown();
        self.forward(SessionEvent::Closed);
        warn!(address = %session.address, "Handshake timed out, closing transport");
        if session.manual {
            self.store.set_manually_disconnected(true);
        }
        self.finish_close();
        self.publish_status(false, Some(ConnectFailure::HandshakeTimeout), None);
        session.resolve(Err(ConnectFailure::HandshakeTimeout));
        if !session.manual {
            self.start_auto_reconnect();
        }
    }

    fn on_transport_closed(self: &Arc<Self>, epoch: u64) {
        let Some(session) = self.take_session(Some(epoch)) else {
            return;
        };
        drop(session.reader.lock().take());
        session.shutdown();
        self.forward(SessionEvent::Closed);
        self.finish_close();
        warn!(address = %session.address, "Transport closed unexpectedly");
        self.publish_status(false, Some(ConnectFailure::TransportClosedUnexpectedly), None);
        session.resolve(Err(ConnectFailure::TransportClosedUnexpectedly));
        self.start_auto_reconnect();
    }

    fn disconnect(&self, manual: bool) {
        self.cancel_auto_reconnect();
        if manual {
            self.store.set_manually_disconnected(true);
        }
        if let Some(session) = self.take_session(None) {
            session.shutdown();
            self.forward(SessionEvent::Closed);
            session.resolve(Err(ConnectFailure::Superseded));
            info!(address = %session.address, manual, "Disconnected");
            self.publish_status(false, None, None);
        }
        self.finish_close();
    }

    fn send_message(&self, envelope: &Envelope) -> bool {
        let session = {
            let slot = self.slot.lock();
            match slot.state {
                LinkState::Open | LinkState::Ready => slot.session.clone(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return false;
        };
        let text = match encode_envelope(envelope) {
            Ok(t) => t,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
                return false;
            }
        };
        let frame = match &session.key {
            Some(key) => match self.crypto.encrypt(key, &text) {
                Ok(f) => f,
                Err(e) => {
                    warn!(kind = %envelope.kind, error = %e, "Failed to encrypt envelope");
                    return false;
                }
            },
            None => text,
        };
        session.outbound.send(frame).is_ok()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.slot.lock().epoch == epoch
    }

    fn current_session(&self, epoch: u64) -> Option<Arc<Session>> {
        let slot = self.slot.lock();
        match &slot.session {
            Some(s) if slot.epoch == epoch => Some(s.clone()),
            _ => None,
        }
    }

    /// Move to `Closing` and take the session. With `Some(epoch)`, only if still current.
    fn take_session(&self, epoch: Option<u64>) -> Option<Arc<Session>> {
        let mut slot = self.slot.lock();
        if let Some(e) = epoch {
            if slot.epoch != e || slot.session.is_none() {
                return None;
            }
        }
        slot.epoch += 1;
        slot.state = LinkState::Closing;
        slot.session.take()
    }

    fn finish_close(&self) {
        let mut slot = self.slot.lock();
        if slot.state == LinkState::Closing {
            slot.state = LinkState::Idle;
        }
    }

    fn forward(&self, event: SessionEvent) {
        let mut feed = self.feed.lock();
        if let Some(tx) = feed.as_ref() {
            if tx.send(event).is_err() {
                *feed = None;
            }
        }
    }

    fn publish_status(&self, connected: bool, failure: Option<ConnectFailure>, peer: Option<String>) {
        let _ = self.events.send(ConnectionEvent::Status(ConnectionStatus {
            connected,
            failure,
            peer,
        }));
    }

    fn start_auto_reconnect(self: &Arc<Self>) {
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        if self.store.manually_disconnected() {
            debug!("Not auto-reconnecting: manually disconnected");
            return;
        }
        let Some(target) = self.store.last_peer() else {
            return;
        };
        let Some(peers) = self.peers.lock().clone() else {
            debug!("Not auto-reconnecting: no discovery feed attached");
            return;
        };
        let mut guard = self.reconnect.lock();
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        info!(peer = %target.name, id = %target.id, "Auto-reconnect waiting for peer presence");
        *guard = Some(tokio::spawn(self.clone().auto_reconnect_loop(target, peers)));
    }

    fn cancel_auto_reconnect(&self) {
        if let Some(h) = self.reconnect.lock().take() {
            if !h.is_finished() {
                debug!("Auto-reconnect cancelled");
            }
            h.abort();
        }
    }

    /// Purely discovery-driven: each peer-table update is one chance to reconnect.
    async fn auto_reconnect_loop(
        self: Arc<Self>,
        target: LastPeer,
        mut peers: watch::Receiver<Vec<PeerAddress>>,
    ) {
        loop {
            if !self.auto_reconnect.load(Ordering::SeqCst) || self.store.manually_disconnected() {
                break;
            }
            let observed = peers
                .borrow_and_update()
                .iter()
                .find(|p| p.id == target.id)
                .cloned();
            let idle = self.slot.lock().state == LinkState::Idle;
            if let (Some(peer), true) = (observed, idle) {
                let request = ConnectRequest {
                    addresses: peer.ip_list(),
                    port: peer.port,
                    key: target.key.clone(),
                    manual: false,
                };
                match self.connect(request).await {
                    Ok(()) => {
                        info!(peer = %target.name, "Auto-reconnect succeeded");
                        if matches!(self.slot.lock().state, LinkState::Open | LinkState::Ready) {
                            break;
                        }
                    }
                    Err(e) => debug!(peer = %target.name, error = %e, "Auto-reconnect attempt failed"),
                }
            }
            if peers.changed().await.is_err() {
                debug!("Discovery feed closed, auto-reconnect stops");
                break;
            }
        }
    }
}
