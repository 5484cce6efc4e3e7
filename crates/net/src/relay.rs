use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::wire::{encode_line, now_millis, read_bounded_line, DirectoryEntry, SignalMessage};

/// Per-connection outbound buffer. A full buffer means the endpoint is
/// not draining; messages to it are dropped rather than blocking the
/// directory.
const OUTBOUND_BUFFER: usize = 64;

/// Interval between relay-initiated liveness pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

struct RelayEntry {
    name: String,
    public_key: String,
    last_seen: u64,
    /// Sequence number of the connection that owns this registration.
    /// A stale connection closing must not evict a newer registration.
    conn_seq: u64,
    outbound: mpsc::Sender<SignalMessage>,
}

type Directory = Arc<RwLock<HashMap<String, RelayEntry>>>;

/// Signaling relay: registers peers by identity and blindly forwards
/// negotiation payloads between them. Holds no business state; the
/// directory map is the only shared mutable resource.
pub struct SignalingRelay {
    bind_addr: SocketAddr,
    directory: Directory,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
    conn_seq: Arc<AtomicU64>,
}

impl SignalingRelay {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bind_addr,
            directory: Arc::new(RwLock::new(HashMap::new())),
            local_addr: RwLock::new(None),
            shutdown_tx,
            conn_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind and start serving. Returns the bound address (useful when
    /// binding port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write().await = Some(addr);
        info!("signaling relay listening on {}", addr);

        let directory = Arc::clone(&self.directory);
        let conn_seq = Arc::clone(&self.conn_seq);
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                debug!("endpoint connected from {}", peer_addr);
                                let seq = conn_seq.fetch_add(1, Ordering::Relaxed);
                                let directory = Arc::clone(&directory);
                                let shutdown = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    handle_endpoint(stream, directory, seq, shutdown).await;
                                });
                            }
                            Err(e) => {
                                warn!("accept failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("signaling relay shutting down");
                        break;
                    }
                }
            }
        });

        let directory = Arc::clone(&self.directory);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let dir = directory.read().await;
                        for (peer_id, entry) in dir.iter() {
                            if entry.outbound.try_send(SignalMessage::Ping).is_err() {
                                debug!("ping to {} not deliverable", peer_id);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(addr)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn peer_count(&self) -> usize {
        self.directory.read().await.len()
    }

    pub async fn directory_snapshot(&self) -> Vec<DirectoryEntry> {
        snapshot(&*self.directory.read().await)
    }
}

fn snapshot(dir: &HashMap<String, RelayEntry>) -> Vec<DirectoryEntry> {
    dir.iter()
        .map(|(id, entry)| DirectoryEntry {
            id: id.clone(),
            name: entry.name.clone(),
            public_key: entry.public_key.clone(),
            last_seen: entry.last_seen,
        })
        .collect()
}

/// Push the current directory to every connected endpoint. Slow
/// endpoints get the message dropped, never a blocked broadcast.
async fn broadcast_peer_list(directory: &Directory) {
    let dir = directory.read().await;
    let peers = snapshot(&dir);
    for (peer_id, entry) in dir.iter() {
        let msg = SignalMessage::PeerList {
            peers: peers.clone(),
        };
        match entry.outbound.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("peer-list to {} dropped: outbound buffer full", peer_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn handle_endpoint(
    stream: TcpStream,
    directory: Directory,
    conn_seq: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<SignalMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let line = match encode_line(&msg) {
                Ok(line) => line,
                Err(e) => {
                    warn!("failed to encode outbound message: {}", e);
                    continue;
                }
            };
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut registered_id: Option<String> = None;

    loop {
        let line = tokio::select! {
            line = read_bounded_line(&mut reader) => line,
            _ = shutdown.changed() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                // Oversized or broken input closes the endpoint.
                warn!("closing endpoint: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg: SignalMessage = match crate::wire::decode_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                // One bad client must not affect others.
                warn!("dropping malformed signaling message: {}", e);
                continue;
            }
        };

        match msg {
            SignalMessage::Register {
                peer_id,
                name,
                public_key,
            } => {
                if peer_id.is_empty() || name.is_empty() || public_key.is_empty() {
                    let _ = tx.try_send(SignalMessage::Error {
                        message: NetError::InvalidRegistration.to_string(),
                    });
                    continue;
                }
                info!("peer registered: {} ({})", name, peer_id);
                let entry = RelayEntry {
                    name,
                    public_key,
                    last_seen: now_millis(),
                    conn_seq,
                    outbound: tx.clone(),
                };
                // Last registration wins.
                directory.write().await.insert(peer_id.clone(), entry);
                let _ = tx.try_send(SignalMessage::Registered {
                    peer_id: peer_id.clone(),
                });
                registered_id = Some(peer_id);
                broadcast_peer_list(&directory).await;
            }

            SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. } => {
                let target = msg.relay_target().unwrap_or_default().to_string();
                let dir = directory.read().await;
                match dir.get(&target) {
                    Some(entry) => {
                        if entry.outbound.try_send(msg).is_err() {
                            debug!("relay to {} dropped: endpoint not draining", target);
                        }
                    }
                    // No queuing for absent targets; the sender's timeout
                    // handles the missing reply.
                    None => debug!("relay target {} not connected, dropped", target),
                }
            }

            SignalMessage::PeerList { peers } if peers.is_empty() => {
                let dir = directory.read().await;
                let _ = tx.try_send(SignalMessage::PeerList {
                    peers: snapshot(&dir),
                });
            }

            SignalMessage::Ping => {
                let _ = tx.try_send(SignalMessage::Pong);
            }

            SignalMessage::Pong => {
                if let Some(id) = &registered_id {
                    if let Some(entry) = directory.write().await.get_mut(id) {
                        entry.last_seen = now_millis();
                    }
                }
            }

            other => {
                debug!("ignoring unexpected client message: {}", other.kind());
            }
        }
    }

    // Endpoint gone: drop its registration unless a newer connection
    // already replaced it, then tell everyone else.
    if let Some(peer_id) = registered_id {
        let removed = {
            let mut dir = directory.write().await;
            match dir.get(&peer_id) {
                Some(entry) if entry.conn_seq == conn_seq => {
                    dir.remove(&peer_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!("peer disconnected: {}", peer_id);
            broadcast_peer_list(&directory).await;
        }
    }

    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_line;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    struct TestClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, write) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn send(&mut self, msg: &SignalMessage) {
            let line = encode_line(msg).unwrap();
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.write.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> SignalMessage {
            let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .expect("timed out waiting for relay message")
                .unwrap()
                .expect("relay closed connection");
            decode_line(&line).unwrap()
        }

        async fn register(&mut self, peer_id: &str, name: &str) {
            self.send(&SignalMessage::Register {
                peer_id: peer_id.into(),
                name: name.into(),
                public_key: format!("pk-{peer_id}"),
            })
            .await;
            assert!(matches!(self.recv().await, SignalMessage::Registered { .. }));
        }

        /// Read until the next peer-list broadcast.
        async fn next_peer_list(&mut self) -> Vec<DirectoryEntry> {
            loop {
                if let SignalMessage::PeerList { peers } = self.recv().await {
                    return peers;
                }
            }
        }
    }

    async fn start_relay() -> (Arc<SignalingRelay>, SocketAddr) {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();
        (relay, addr)
    }

    #[tokio::test]
    async fn test_register_and_broadcast() {
        let (relay, addr) = start_relay().await;

        let mut alice = TestClient::connect(addr).await;
        alice.register("peer_alice", "alice").await;
        assert_eq!(alice.next_peer_list().await.len(), 1);

        let mut bob = TestClient::connect(addr).await;
        bob.register("peer_bob", "bob").await;

        // Both see the two-entry directory after the second registration.
        assert_eq!(bob.next_peer_list().await.len(), 2);
        assert_eq!(alice.next_peer_list().await.len(), 2);
        assert_eq!(relay.peer_count().await, 2);

        relay.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_registration_rejected() {
        let (relay, addr) = start_relay().await;
        let mut client = TestClient::connect(addr).await;
        client
            .send(&SignalMessage::Register {
                peer_id: "".into(),
                name: "nobody".into(),
                public_key: "pk".into(),
            })
            .await;
        assert!(matches!(client.recv().await, SignalMessage::Error { .. }));
        assert_eq!(relay.peer_count().await, 0);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_offer_relayed_to_target() {
        let (relay, addr) = start_relay().await;
        let mut alice = TestClient::connect(addr).await;
        alice.register("peer_alice", "alice").await;
        let mut bob = TestClient::connect(addr).await;
        bob.register("peer_bob", "bob").await;
        alice.next_peer_list().await;
        bob.next_peer_list().await;

        let offer = SignalMessage::Offer {
            from: "peer_alice".into(),
            to: "peer_bob".into(),
            offer: crate::wire::SessionDescription {
                session_token: "tok".into(),
                listen_addr: Some("127.0.0.1:9999".parse().unwrap()),
            },
        };
        alice.send(&offer).await;
        assert_eq!(bob.recv().await, offer);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_relay_to_unknown_target_is_dropped() {
        let (relay, addr) = start_relay().await;
        let mut alice = TestClient::connect(addr).await;
        alice.register("peer_alice", "alice").await;
        alice.next_peer_list().await;

        alice
            .send(&SignalMessage::Offer {
                from: "peer_alice".into(),
                to: "peer_ghost".into(),
                offer: crate::wire::SessionDescription {
                    session_token: "tok".into(),
                    listen_addr: None,
                },
            })
            .await;

        // Nothing comes back and the relay keeps serving.
        alice.send(&SignalMessage::Ping).await;
        assert_eq!(alice.recv().await, SignalMessage::Pong);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_second_registration_replaces_first() {
        // Scenario: same peer id registered twice; last registration wins.
        let (relay, addr) = start_relay().await;
        let mut first = TestClient::connect(addr).await;
        first.register("peer_dup", "first").await;
        first.next_peer_list().await;

        let mut second = TestClient::connect(addr).await;
        second.register("peer_dup", "second").await;
        let peers = second.next_peer_list().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "second");

        // The stale connection closing must not evict the replacement.
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.peer_count().await, 1);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_unterminated_flood_drops_endpoint() {
        use crate::wire::MAX_LINE_LEN;

        let (relay, addr) = start_relay().await;
        let mut alice = TestClient::connect(addr).await;
        alice.register("peer_alice", "alice").await;
        alice.next_peer_list().await;

        // A line that never ends: the relay must cut the connection at
        // the cap instead of buffering it.
        let mut flood = TestClient::connect(addr).await;
        flood.send_raw(&"z".repeat(MAX_LINE_LEN + 10)).await;
        let closed = tokio::time::timeout(Duration::from_secs(2), flood.lines.next_line()).await;
        assert!(matches!(closed, Ok(Ok(None)) | Ok(Err(_))));

        // Registered endpoints are unaffected.
        alice.send(&SignalMessage::Ping).await;
        assert_eq!(alice.recv().await, SignalMessage::Pong);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_input_does_not_crash_relay() {
        let (relay, addr) = start_relay().await;
        let mut bad = TestClient::connect(addr).await;
        bad.send_raw("this is not json\n").await;
        bad.send_raw("{\"type\":\"quantum\"}\n").await;

        // Same connection still works afterwards.
        bad.register("peer_survivor", "survivor").await;
        assert_eq!(relay.peer_count().await, 1);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_removes_from_directory() {
        let (relay, addr) = start_relay().await;
        let mut alice = TestClient::connect(addr).await;
        alice.register("peer_alice", "alice").await;
        let mut bob = TestClient::connect(addr).await;
        bob.register("peer_bob", "bob").await;
        bob.next_peer_list().await;

        drop(alice);
        // Bob hears about the departure.
        let peers = bob.next_peer_list().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "peer_bob");
        relay.shutdown();
    }
}
