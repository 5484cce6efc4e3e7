use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tradewire_store::TrustStore;

use crate::client::RelayClient;
use crate::envelope::Envelope;
use crate::error::{NetError, Result};
use crate::session::{
    bind_session_listener, dial_candidate, read_token_line, write_token_line, SessionChannel,
};
use crate::wire::{SessionDescription, SignalMessage, TransportCandidate};

const EVENT_BUFFER: usize = 64;
const MAX_BUFFERED_CANDIDATES: usize = 16;
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const DIAL_RETRY_PAUSE: Duration = Duration::from_millis(300);

/// Tunables for negotiation. Defaults match production behavior; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub bind_ip: IpAddr,
    /// Bound on every wait for a remote reply or channel.
    pub negotiation_timeout: Duration,
    /// Fixed pause before a reconnect attempt.
    pub reconnect_backoff: Duration,
    /// Reconnect ceiling per pair before giving up.
    pub max_retries: u32,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            negotiation_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    AwaitingAnswer,
    AwaitingChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating(NegotiationPhase),
    Open,
    Closed,
}

/// Lifecycle notifications surfaced to the owning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened { peer_id: String },
    Closed { peer_id: String },
    GaveUp { peer_id: String },
}

struct Session {
    remote_peer: String,
    role: Role,
    state: SessionState,
    token: String,
    channel: Option<SessionChannel>,
    accept_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    attempts: u32,
}

impl Session {
    fn abort_tasks(&mut self) {
        if let Some(handle) = self.accept_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.reconnect_task.take() {
            handle.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

struct NegotiatorInner {
    self_id: String,
    relay: RelayClient,
    store: TrustStore,
    config: NegotiatorConfig,
    /// One entry per unordered peer pair; each session's transitions are
    /// serialized by its own mutex while different pairs proceed in
    /// parallel.
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    /// Candidates that raced ahead of their offer, keyed by remote peer.
    pending_candidates: DashMap<String, Vec<TransportCandidate>>,
    /// Answers that raced ahead of their session entry.
    pending_answers: DashMap<String, SessionDescription>,
    /// Pairs torn down on purpose. Offers from these peers are refused
    /// until the next explicit `connect_to_peer`, so a remote reconnect
    /// cannot undo a local disconnect.
    parted: DashSet<String>,
    inbound_tx: mpsc::Sender<(String, Envelope)>,
    closed_tx: mpsc::Sender<String>,
    events: mpsc::Sender<SessionEvent>,
}

/// Ordered key so only one negotiation exists per unordered pair.
fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

/// Client-side component that drives each peer pair from "no channel"
/// to an open bidirectional session and back.
#[derive(Clone)]
pub struct SessionNegotiator {
    inner: Arc<NegotiatorInner>,
}

impl SessionNegotiator {
    /// Returns the negotiator plus the inbound envelope stream and the
    /// session lifecycle event stream.
    pub fn new(
        self_id: String,
        relay: RelayClient,
        store: TrustStore,
        config: NegotiatorConfig,
    ) -> (
        Self,
        mpsc::Receiver<(String, Envelope)>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (closed_tx, mut closed_rx) = mpsc::channel::<String>(EVENT_BUFFER);

        let inner = Arc::new(NegotiatorInner {
            self_id,
            relay,
            store,
            config,
            sessions: DashMap::new(),
            pending_candidates: DashMap::new(),
            pending_answers: DashMap::new(),
            parted: DashSet::new(),
            inbound_tx,
            closed_tx,
            events: events_tx,
        });

        // Transport-close notifications from live channels.
        let watcher = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(remote) = closed_rx.recv().await {
                handle_session_failure(Arc::clone(&watcher), remote, "transport closed".into())
                    .await;
            }
        });

        (Self { inner }, inbound_rx, events_rx)
    }

    /// Start negotiating toward `target`. A second call for an
    /// already-negotiating or open pair is a no-op.
    pub async fn connect_to_peer(&self, target: &str) -> Result<()> {
        if target == self.inner.self_id {
            return Ok(());
        }
        self.inner.parted.remove(target);
        let key = pair_key(&self.inner.self_id, target);
        if let Some(cell) = self.inner.sessions.get(&key).map(|e| Arc::clone(e.value())) {
            let mut session = cell.lock().await;
            match session.state {
                SessionState::Negotiating(_) | SessionState::Open => {
                    debug!("session with {} already in progress", target);
                    return Ok(());
                }
                SessionState::Closed => session.abort_tasks(),
            }
        }
        start_offer(Arc::clone(&self.inner), target.to_string(), 0).await
    }

    /// Route an inbound signaling message. Non-negotiation messages are
    /// ignored; the owner routes those itself.
    pub async fn handle_signal(&self, msg: SignalMessage) {
        match msg {
            SignalMessage::Offer { from, offer, .. } => {
                self.on_offer(from, offer).await;
            }
            SignalMessage::Answer { from, answer, .. } => {
                self.on_answer(from, answer).await;
            }
            SignalMessage::IceCandidate {
                from, candidate, ..
            } => {
                self.on_candidate(from, candidate).await;
            }
            other => debug!("negotiator ignoring signal: {}", other.kind()),
        }
    }

    async fn on_offer(&self, from: String, offer: SessionDescription) {
        let inner = &self.inner;
        if inner.parted.contains(&from) {
            debug!("offer from {} refused, pair was disconnected", from);
            return;
        }
        let key = pair_key(&inner.self_id, &from);

        if let Some(cell) = inner.sessions.get(&key).map(|e| Arc::clone(e.value())) {
            let mut session = cell.lock().await;
            match session.state {
                SessionState::Open => {
                    debug!("offer from {} ignored, channel already open", from);
                    return;
                }
                SessionState::Negotiating(_) => {
                    if session.role == Role::Offerer {
                        // Glare: the lexicographically smaller identity
                        // stays offerer, the other yields.
                        if inner.self_id < from {
                            debug!("glare with {}: keeping our offer", from);
                            return;
                        }
                        info!("glare with {}: yielding to remote offer", from);
                        session.state = SessionState::Closed;
                        session.abort_tasks();
                    } else {
                        debug!("duplicate offer from {} ignored", from);
                        return;
                    }
                }
                SessionState::Closed => session.abort_tasks(),
            }
        }

        start_answer(Arc::clone(inner), from, offer).await;
    }

    async fn on_answer(&self, from: String, answer: SessionDescription) {
        let key = pair_key(&self.inner.self_id, &from);
        let Some(cell) = self.inner.sessions.get(&key).map(|e| Arc::clone(e.value())) else {
            // Answers can race the session entry like candidates do;
            // `start_offer` replays the latest one.
            debug!("answer from {} before a session entry, buffered", from);
            self.inner.pending_answers.insert(from, answer);
            return;
        };
        let mut session = cell.lock().await;
        if session.role == Role::Offerer
            && session.state == SessionState::Negotiating(NegotiationPhase::AwaitingAnswer)
        {
            session.state = SessionState::Negotiating(NegotiationPhase::AwaitingChannel);
            debug!(
                "answer {} applied for {}, waiting for channel",
                answer.session_token, from
            );
        } else {
            debug!("answer from {} in state {:?}, dropped", from, session.state);
        }
    }

    async fn on_candidate(&self, from: String, candidate: TransportCandidate) {
        // Candidates frequently race the offer; buffer them keyed by
        // remote peer and let the dial loop pick them up.
        let mut pending = self.inner.pending_candidates.entry(from).or_default();
        if pending.len() < MAX_BUFFERED_CANDIDATES && !pending.contains(&candidate) {
            pending.push(candidate);
        }
    }

    /// Intentional teardown: cancels in-flight negotiation and any
    /// pending reconnect for this pair only.
    pub async fn disconnect(&self, remote: &str) {
        self.inner.parted.insert(remote.to_string());
        let key = pair_key(&self.inner.self_id, remote);
        let Some((_, cell)) = self.inner.sessions.remove(&key) else {
            return;
        };
        let mut session = cell.lock().await;
        let was_open = session.state == SessionState::Open;
        session.state = SessionState::Closed;
        session.abort_tasks();
        self.inner.pending_candidates.remove(remote);
        self.inner.pending_answers.remove(remote);
        if was_open {
            let _ = self.inner.events.try_send(SessionEvent::Closed {
                peer_id: remote.to_string(),
            });
        }
        info!("session with {} torn down", remote);
    }

    pub async fn send_envelope(&self, remote: &str, envelope: Envelope) -> Result<()> {
        let key = pair_key(&self.inner.self_id, remote);
        let Some(cell) = self.inner.sessions.get(&key).map(|e| Arc::clone(e.value())) else {
            return Err(NetError::NotConnected(remote.to_string()));
        };
        let session = cell.lock().await;
        match (&session.state, &session.channel) {
            (SessionState::Open, Some(channel)) => channel.send(envelope).await,
            _ => Err(NetError::NotConnected(remote.to_string())),
        }
    }

    pub async fn is_connected(&self, remote: &str) -> bool {
        let key = pair_key(&self.inner.self_id, remote);
        match self.inner.sessions.get(&key).map(|e| Arc::clone(e.value())) {
            Some(cell) => cell.lock().await.state == SessionState::Open,
            None => false,
        }
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        let cells: Vec<Arc<Mutex<Session>>> = self
            .inner
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut peers = Vec::new();
        for cell in cells {
            let session = cell.lock().await;
            if session.state == SessionState::Open {
                peers.push(session.remote_peer.clone());
            }
        }
        peers
    }

    pub async fn session_state(&self, remote: &str) -> Option<SessionState> {
        let key = pair_key(&self.inner.self_id, remote);
        match self.inner.sessions.get(&key).map(|e| Arc::clone(e.value())) {
            Some(cell) => Some(cell.lock().await.state),
            None => None,
        }
    }

    /// Tear down every session; used on service stop.
    pub async fn shutdown(&self) {
        let cells: Vec<Arc<Mutex<Session>>> = self
            .inner
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut peers = Vec::with_capacity(cells.len());
        for cell in cells {
            peers.push(cell.lock().await.remote_peer.clone());
        }
        for peer in peers {
            self.disconnect(&peer).await;
        }
    }
}

/// Create an offerer session: bind a listener, advertise it, and wait
/// (bounded) for the answerer to dial in and present the offered token.
/// The session entry lands in the map before the offer leaves, so the
/// remote's answer always finds it.
async fn start_offer(inner: Arc<NegotiatorInner>, target: String, attempts: u32) -> Result<()> {
    let key = pair_key(&inner.self_id, &target);
    let (listener, listen_addr) = bind_session_listener(inner.config.bind_ip).await?;
    let token = Uuid::new_v4().to_string();

    let accept_inner = Arc::clone(&inner);
    let accept_target = target.clone();
    let accept_token = token.clone();
    let timeout = inner.config.negotiation_timeout;
    let accept_task = tokio::spawn(async move {
        let attempt = tokio::time::timeout(timeout, async {
            let (mut stream, _) = listener.accept().await.map_err(NetError::from)?;
            let presented = read_token_line(&mut stream).await?;
            Ok::<_, NetError>((stream, presented))
        })
        .await;
        match attempt {
            Ok(Ok((stream, presented))) if presented == accept_token => {
                open_channel(accept_inner, accept_target, stream).await;
            }
            Ok(Ok(_)) => {
                warn!("rejecting dial for {}: wrong session token", accept_target);
                handle_session_failure(accept_inner, accept_target, "token mismatch".into())
                    .await;
            }
            Ok(Err(e)) => {
                warn!("accept failed for {}: {}", accept_target, e);
                handle_session_failure(accept_inner, accept_target, "accept failed".into()).await;
            }
            Err(_) => {
                warn!("no inbound channel from {} within the bound", accept_target);
                handle_session_failure(accept_inner, accept_target, "negotiation timeout".into())
                    .await;
            }
        }
    });

    let session = Session {
        remote_peer: target.clone(),
        role: Role::Offerer,
        state: SessionState::Negotiating(NegotiationPhase::AwaitingAnswer),
        token: token.clone(),
        channel: None,
        accept_task: Some(accept_task),
        reconnect_task: None,
        attempts,
    };
    let cell = Arc::new(Mutex::new(session));
    if let Some(old) = inner.sessions.insert(key, Arc::clone(&cell)) {
        old.lock().await.abort_tasks();
    }
    if let Some((_, answer)) = inner.pending_answers.remove(&target) {
        let mut session = cell.lock().await;
        if session.state == SessionState::Negotiating(NegotiationPhase::AwaitingAnswer) {
            session.state = SessionState::Negotiating(NegotiationPhase::AwaitingChannel);
            debug!(
                "buffered answer {} applied for {}",
                answer.session_token, target
            );
        }
    }

    inner
        .relay
        .send(SignalMessage::Offer {
            from: inner.self_id.clone(),
            to: target.clone(),
            offer: SessionDescription {
                session_token: token,
                listen_addr: Some(listen_addr),
            },
        })
        .await?;
    inner
        .relay
        .send(SignalMessage::IceCandidate {
            from: inner.self_id.clone(),
            to: target.clone(),
            candidate: TransportCandidate {
                addr: listen_addr,
                priority: 100,
            },
        })
        .await?;

    info!("offering session to {} from {}", target, listen_addr);
    Ok(())
}

/// Create an answerer session for a remote offer: answer back, then
/// dial the offerer's advertised address/candidates.
async fn start_answer(inner: Arc<NegotiatorInner>, from: String, offer: SessionDescription) {
    let key = pair_key(&inner.self_id, &from);
    let token = Uuid::new_v4().to_string();

    let answer = SessionDescription {
        session_token: token.clone(),
        listen_addr: None,
    };
    if let Err(e) = inner
        .relay
        .send(SignalMessage::Answer {
            from: inner.self_id.clone(),
            to: from.clone(),
            answer,
        })
        .await
    {
        warn!("could not relay answer to {}: {}", from, e);
        return;
    }

    let dial_inner = Arc::clone(&inner);
    let dial_from = from.clone();
    let dial_offer = offer.clone();
    let dial_task = tokio::spawn(async move {
        run_dial_loop(dial_inner, dial_from, dial_offer).await;
    });

    let session = Session {
        remote_peer: from.clone(),
        role: Role::Answerer,
        state: SessionState::Negotiating(NegotiationPhase::AwaitingChannel),
        token,
        channel: None,
        accept_task: Some(dial_task),
        reconnect_task: None,
        attempts: 0,
    };
    if let Some(old) = inner
        .sessions
        .insert(key, Arc::new(Mutex::new(session)))
    {
        old.lock().await.abort_tasks();
    }
    info!("answering session offer from {}", from);
}

/// Try the offerer's advertised address plus any buffered candidates
/// until one connects or the negotiation bound elapses.
async fn run_dial_loop(inner: Arc<NegotiatorInner>, remote: String, offer: SessionDescription) {
    let deadline = tokio::time::Instant::now() + inner.config.negotiation_timeout;
    loop {
        let mut targets: Vec<std::net::SocketAddr> = Vec::new();
        if let Some(pending) = inner.pending_candidates.get(&remote) {
            let mut candidates = pending.clone();
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
            targets.extend(candidates.iter().map(|c| c.addr));
        }
        if let Some(addr) = offer.listen_addr {
            if !targets.contains(&addr) {
                targets.push(addr);
            }
        }

        for addr in targets {
            match dial_candidate(addr, DIAL_TIMEOUT).await {
                Ok(mut stream) => {
                    if let Err(e) = write_token_line(&mut stream, &offer.session_token).await {
                        debug!("token presentation to {} failed: {}", remote, e);
                        continue;
                    }
                    open_channel(Arc::clone(&inner), remote.clone(), stream).await;
                    return;
                }
                Err(e) => debug!("candidate {} for {} failed: {}", addr, remote, e),
            }
        }

        if tokio::time::Instant::now() >= deadline {
            warn!("no dialable candidate for {} within the bound", remote);
            handle_session_failure(inner, remote, "negotiation timeout".into()).await;
            return;
        }
        tokio::time::sleep(DIAL_RETRY_PAUSE).await;
    }
}

/// A transport connected: transition the session to Open, record
/// activity on the trust record, and announce it.
async fn open_channel(inner: Arc<NegotiatorInner>, remote: String, stream: tokio::net::TcpStream) {
    let key = pair_key(&inner.self_id, &remote);
    let Some(cell) = inner.sessions.get(&key).map(|e| Arc::clone(e.value())) else {
        return;
    };
    {
        let mut session = cell.lock().await;
        if session.state == SessionState::Open {
            return;
        }
        let channel = SessionChannel::spawn(
            stream,
            remote.clone(),
            inner.inbound_tx.clone(),
            inner.closed_tx.clone(),
        );
        session.channel = Some(channel);
        session.state = SessionState::Open;
        session.attempts = 0;
        debug!("session {} transport connected", session.token);
    }
    inner.pending_candidates.remove(&remote);
    inner.pending_answers.remove(&remote);

    if let Ok(Some(mut conn)) = inner.store.connection_between(&inner.self_id, &remote).await {
        conn.last_activity = Utc::now();
        conn.updated_at = Utc::now();
        if let Err(e) = inner.store.connections.update(&conn).await {
            warn!("could not record session activity: {}", e);
        }
    }

    info!("session open with {}", remote);
    let _ = inner.events.try_send(SessionEvent::Opened { peer_id: remote });
}

/// Shared failure path for negotiation timeouts, dial failures and
/// transport closes. Schedules a bounded reconnect; giving up is
/// reported through the event stream. Returns a boxed future: the
/// retry path re-enters this function through `start_offer`.
fn handle_session_failure(
    inner: Arc<NegotiatorInner>,
    remote: String,
    reason: String,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if inner.parted.contains(&remote) {
            return;
        }
        let key = pair_key(&inner.self_id, &remote);
        let Some(cell) = inner.sessions.get(&key).map(|e| Arc::clone(e.value())) else {
            // Intentionally disconnected; nothing to do.
            return;
        };

        let attempts;
        {
            let mut session = cell.lock().await;
            if session.state == SessionState::Closed {
                return;
            }
            let was_open = session.state == SessionState::Open;
            session.state = SessionState::Closed;
            if let Some(channel) = session.channel.take() {
                channel.close();
            }
            if let Some(handle) = session.reconnect_task.take() {
                handle.abort();
            }
            session.attempts += 1;
            attempts = session.attempts;
            if was_open {
                let _ = inner.events.try_send(SessionEvent::Closed {
                    peer_id: remote.clone(),
                });
            }
        }

        if attempts > inner.config.max_retries {
            warn!("giving up on {} after {} attempts ({})", remote, attempts, reason);
            inner.sessions.remove(&key);
            let _ = inner.events.try_send(SessionEvent::GaveUp { peer_id: remote });
            return;
        }

        info!(
            "session with {} failed ({}), retry {} in {:?}",
            remote, reason, attempts, inner.config.reconnect_backoff
        );
        let retry_inner = Arc::clone(&inner);
        let retry_remote = remote.clone();
        let backoff = inner.config.reconnect_backoff;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Err(e) =
                start_offer(Arc::clone(&retry_inner), retry_remote.clone(), attempts).await
            {
                handle_session_failure(retry_inner, retry_remote, e.to_string()).await;
            }
        });
        cell.lock().await.reconnect_task = Some(handle);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PeerIdentity, RelayClient, RelayEvent};
    use crate::envelope::EnvelopeBody;
    use crate::relay::SignalingRelay;

    fn test_config() -> NegotiatorConfig {
        NegotiatorConfig {
            negotiation_timeout: Duration::from_secs(2),
            reconnect_backoff: Duration::from_millis(200),
            max_retries: 2,
            ..NegotiatorConfig::default()
        }
    }

    async fn spawn_peer(
        relay_addr: std::net::SocketAddr,
        peer_id: &str,
    ) -> (
        SessionNegotiator,
        mpsc::Receiver<(String, Envelope)>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let identity = PeerIdentity {
            peer_id: peer_id.into(),
            name: format!("name-{peer_id}"),
            public_key: format!("pk-{peer_id}"),
        };
        let (client, mut events) = RelayClient::connect(relay_addr, identity).await.unwrap();
        let store = TrustStore::in_memory();
        let (negotiator, inbound, session_events) =
            SessionNegotiator::new(peer_id.to_string(), client, store, test_config());

        // Pump relay traffic into the negotiator, as the service layer does.
        let pump = negotiator.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let RelayEvent::Message(msg) = event {
                    pump.handle_signal(msg).await;
                }
            }
        });

        (negotiator, inbound, session_events)
    }

    async fn wait_opened(events: &mut mpsc::Receiver<SessionEvent>) -> String {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("event stream ended");
            if let SessionEvent::Opened { peer_id } = event {
                return peer_id;
            }
        }
    }

    #[tokio::test]
    async fn test_negotiation_opens_channel_both_sides() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        let (alice, _in_a, mut ev_a) = spawn_peer(addr, "peer_alice").await;
        let (bob, mut in_b, mut ev_b) = spawn_peer(addr, "peer_bob").await;

        alice.connect_to_peer("peer_bob").await.unwrap();

        assert_eq!(wait_opened(&mut ev_a).await, "peer_bob");
        assert_eq!(wait_opened(&mut ev_b).await, "peer_alice");
        assert!(alice.is_connected("peer_bob").await);
        assert!(bob.is_connected("peer_alice").await);

        alice
            .send_envelope(
                "peer_bob",
                Envelope::new(EnvelopeBody::Ping, "peer_alice", "peer_bob"),
            )
            .await
            .unwrap();
        let (from, env) = in_b.recv().await.unwrap();
        assert_eq!(from, "peer_alice");
        assert_eq!(env.body.kind(), "ping");

        relay.shutdown();
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        let (alice, _in_a, mut ev_a) = spawn_peer(addr, "peer_alice").await;
        let (_bob, _in_b, _ev_b) = spawn_peer(addr, "peer_bob").await;

        alice.connect_to_peer("peer_bob").await.unwrap();
        alice.connect_to_peer("peer_bob").await.unwrap();
        wait_opened(&mut ev_a).await;

        assert_eq!(alice.connected_peers().await, vec!["peer_bob".to_string()]);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_glare_resolves_to_single_session() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        let (alice, _in_a, mut ev_a) = spawn_peer(addr, "peer_alice").await;
        let (bob, _in_b, mut ev_b) = spawn_peer(addr, "peer_bob").await;

        // Simultaneous offers from both sides.
        let (ra, rb) = tokio::join!(
            alice.connect_to_peer("peer_bob"),
            bob.connect_to_peer("peer_alice")
        );
        ra.unwrap();
        rb.unwrap();

        wait_opened(&mut ev_a).await;
        wait_opened(&mut ev_b).await;
        assert!(alice.is_connected("peer_bob").await);
        assert!(bob.is_connected("peer_alice").await);
        assert_eq!(alice.connected_peers().await.len(), 1);
        assert_eq!(bob.connected_peers().await.len(), 1);

        relay.shutdown();
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_buffered() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let relay_addr = relay.start().await.unwrap();

        let (bob, _in_b, mut ev_b) = spawn_peer(relay_addr, "peer_bob").await;

        // A hand-rolled offerer whose offer omits the listen address;
        // only the (earlier) candidate reveals where to dial.
        let (listener, listen_addr) = bind_session_listener("127.0.0.1".parse().unwrap())
            .await
            .unwrap();

        bob.handle_signal(SignalMessage::IceCandidate {
            from: "peer_alice".into(),
            to: "peer_bob".into(),
            candidate: TransportCandidate {
                addr: listen_addr,
                priority: 100,
            },
        })
        .await;
        bob.handle_signal(SignalMessage::Offer {
            from: "peer_alice".into(),
            to: "peer_bob".into(),
            offer: SessionDescription {
                session_token: "tok".into(),
                listen_addr: None,
            },
        })
        .await;

        let accepted = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(accepted.is_ok(), "bob never dialed the buffered candidate");
        assert_eq!(wait_opened(&mut ev_b).await, "peer_alice");

        relay.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_cancels_reconnect() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        let (alice, _in_a, mut ev_a) = spawn_peer(addr, "peer_alice").await;
        let (bob, _in_b, mut ev_b) = spawn_peer(addr, "peer_bob").await;

        alice.connect_to_peer("peer_bob").await.unwrap();
        wait_opened(&mut ev_a).await;
        wait_opened(&mut ev_b).await;

        alice.disconnect("peer_bob").await;
        assert!(!alice.is_connected("peer_bob").await);
        assert!(alice.session_state("peer_bob").await.is_none());

        // Bob sees his transport die and retries with fresh offers;
        // alice must refuse them and stay down.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(alice.session_state("peer_bob").await.is_none());

        let gave_up = loop {
            let event = tokio::time::timeout(Duration::from_secs(15), ev_b.recv())
                .await
                .expect("bob never gave up")
                .expect("event stream ended");
            if let SessionEvent::GaveUp { peer_id } = event {
                break peer_id;
            }
        };
        assert_eq!(gave_up, "peer_alice");
        assert!(alice.session_state("peer_bob").await.is_none());
        assert!(!bob.is_connected("peer_alice").await);

        relay.shutdown();
    }

    #[tokio::test]
    async fn test_answer_before_session_is_buffered() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        let (alice, _in_a, _ev_a) = spawn_peer(addr, "peer_alice").await;

        // An answer that arrives before any offer went out must not be
        // lost; the next offer toward that peer picks it up.
        alice
            .handle_signal(SignalMessage::Answer {
                from: "peer_bob".into(),
                to: "peer_alice".into(),
                answer: SessionDescription {
                    session_token: "tok-answer".into(),
                    listen_addr: None,
                },
            })
            .await;

        alice.connect_to_peer("peer_bob").await.unwrap();
        assert_eq!(
            alice.session_state("peer_bob").await,
            Some(SessionState::Negotiating(NegotiationPhase::AwaitingChannel))
        );

        relay.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_session_token_is_rejected() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        let (alice, _in_a, _ev_a) = spawn_peer(addr, "peer_alice").await;

        // Bob is only a relay client here; we dial alice's listener by
        // hand with a token she never offered.
        let identity = PeerIdentity {
            peer_id: "peer_bob".into(),
            name: "bob".into(),
            public_key: "pk-bob".into(),
        };
        let (bob_client, mut bob_events) = RelayClient::connect(addr, identity).await.unwrap();

        alice.connect_to_peer("peer_bob").await.unwrap();

        let offer = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), bob_events.recv())
                .await
                .expect("no offer relayed")
                .expect("relay client stopped");
            if let RelayEvent::Message(SignalMessage::Offer { offer, .. }) = event {
                break offer;
            }
        };

        let mut stream = dial_candidate(offer.listen_addr.unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        write_token_line(&mut stream, "not-the-offered-token")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!alice.is_connected("peer_bob").await);

        bob_client.shutdown();
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_negotiation_times_out_and_gives_up() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        // Bob never registers, so offers to him are silently dropped.
        let (alice, _in_a, mut ev_a) = spawn_peer(addr, "peer_alice").await;
        alice.connect_to_peer("peer_bob").await.unwrap();

        let gave_up = loop {
            let event = tokio::time::timeout(Duration::from_secs(15), ev_a.recv())
                .await
                .expect("no give-up report")
                .expect("event stream ended");
            if let SessionEvent::GaveUp { peer_id } = event {
                break peer_id;
            }
        };
        assert_eq!(gave_up, "peer_bob");
        assert!(alice.session_state("peer_bob").await.is_none());

        relay.shutdown();
    }
}
