use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::wire::{decode_line, encode_line, read_bounded_line, SignalMessage};

/// Fixed backoff before re-dialing the relay.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reconnect ceiling; giving up is reported, not silently swallowed.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const INBOUND_BUFFER: usize = 64;

/// Identity presented to the relay at registration.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub peer_id: String,
    pub name: String,
    pub public_key: String,
}

/// What the relay connection delivers to its owner.
#[derive(Debug)]
pub enum RelayEvent {
    Message(SignalMessage),
    /// Connection to the relay dropped; a reconnect is scheduled.
    Lost,
    /// Reconnect attempts exhausted; the client is dead.
    Exhausted,
}

/// Client side of the signaling relay link. Registers on connect and
/// re-registers after every reconnect; inbound messages are surfaced on
/// the receiver handed out by [`RelayClient::connect`].
#[derive(Clone)]
pub struct RelayClient {
    outbound: mpsc::Sender<SignalMessage>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayClient {
    pub async fn connect(
        relay_addr: SocketAddr,
        identity: PeerIdentity,
    ) -> Result<(Self, mpsc::Receiver<RelayEvent>)> {
        let stream = TcpStream::connect(relay_addr)
            .await
            .map_err(|e| NetError::RelayUnreachable(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(INBOUND_BUFFER);
        let (out_tx, out_rx) = mpsc::channel::<SignalMessage>(INBOUND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(supervise(
            relay_addr,
            identity,
            Some(stream),
            out_rx,
            event_tx,
            shutdown_rx,
        ));

        Ok((
            Self {
                outbound: out_tx,
                shutdown_tx,
            },
            event_rx,
        ))
    }

    pub async fn send(&self, msg: SignalMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| NetError::ChannelClosed)
    }

    /// Request a fresh directory snapshot from the relay.
    pub async fn request_directory(&self) -> Result<()> {
        self.send(SignalMessage::PeerList { peers: vec![] }).await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn supervise(
    relay_addr: SocketAddr,
    identity: PeerIdentity,
    mut initial: Option<TcpStream>,
    mut out_rx: mpsc::Receiver<SignalMessage>,
    event_tx: mpsc::Sender<RelayEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;
    loop {
        let stream = match initial.take() {
            Some(stream) => stream,
            None => match TcpStream::connect(relay_addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    attempts += 1;
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        warn!("relay unreachable after {} attempts: {}", attempts, e);
                        let _ = event_tx.send(RelayEvent::Exhausted).await;
                        return;
                    }
                    debug!("relay dial failed ({}), retrying in {:?}", e, RECONNECT_DELAY);
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            },
        };

        attempts = 0;
        if run_connection(stream, &identity, &mut out_rx, &event_tx, &mut shutdown)
            .await
            .is_break()
        {
            return;
        }

        info!("relay connection lost, reconnecting in {:?}", RECONNECT_DELAY);
        let _ = event_tx.send(RelayEvent::Lost).await;
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Drives one live relay connection until it breaks or shutdown is
/// requested. Break means stop for good.
async fn run_connection(
    stream: TcpStream,
    identity: &PeerIdentity,
    out_rx: &mut mpsc::Receiver<SignalMessage>,
    event_tx: &mpsc::Sender<RelayEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let register = SignalMessage::Register {
        peer_id: identity.peer_id.clone(),
        name: identity.name.clone(),
        public_key: identity.public_key.clone(),
    };
    let line = match encode_line(&register) {
        Ok(line) => line,
        Err(e) => {
            warn!("could not encode register message: {}", e);
            return ControlFlow::Break(());
        }
    };
    if write_half.write_all(line.as_bytes()).await.is_err() {
        return ControlFlow::Continue(());
    }

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(msg) = outbound else {
                    return ControlFlow::Break(());
                };
                match encode_line(&msg) {
                    Ok(line) => {
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            return ControlFlow::Continue(());
                        }
                    }
                    Err(e) => warn!("dropping unencodable outbound message: {}", e),
                }
            }
            inbound = read_bounded_line(&mut reader) => {
                let line = match inbound {
                    Ok(Some(line)) => line,
                    Ok(None) => return ControlFlow::Continue(()),
                    Err(e) => {
                        warn!("relay read failed: {}", e);
                        return ControlFlow::Continue(());
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line::<SignalMessage>(&line) {
                    Ok(SignalMessage::Ping) => {
                        let pong = match encode_line(&SignalMessage::Pong) {
                            Ok(line) => line,
                            Err(_) => continue,
                        };
                        if write_half.write_all(pong.as_bytes()).await.is_err() {
                            return ControlFlow::Continue(());
                        }
                    }
                    Ok(msg) => {
                        if event_tx.send(RelayEvent::Message(msg)).await.is_err() {
                            return ControlFlow::Break(());
                        }
                    }
                    Err(e) => warn!("dropping malformed relay message: {}", e),
                }
            }
            _ = shutdown.changed() => return ControlFlow::Break(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::SignalingRelay;
    use std::sync::Arc;

    async fn recv_message(rx: &mut mpsc::Receiver<RelayEvent>) -> SignalMessage {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for relay event")
                .expect("relay client stopped");
            if let RelayEvent::Message(msg) = event {
                return msg;
            }
        }
    }

    fn identity(id: &str) -> PeerIdentity {
        PeerIdentity {
            peer_id: id.into(),
            name: format!("name-{id}"),
            public_key: format!("pk-{id}"),
        }
    }

    #[tokio::test]
    async fn test_client_registers_and_sees_directory() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        let (client, mut rx) = RelayClient::connect(addr, identity("peer_a")).await.unwrap();
        assert!(matches!(
            recv_message(&mut rx).await,
            SignalMessage::Registered { .. }
        ));
        let msg = recv_message(&mut rx).await;
        match msg {
            SignalMessage::PeerList { peers } => assert_eq!(peers.len(), 1),
            other => panic!("expected peer-list, got {}", other.kind()),
        }

        client.shutdown();
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_signals_flow_between_clients() {
        let relay = Arc::new(SignalingRelay::new("127.0.0.1:0".parse().unwrap()));
        let addr = relay.start().await.unwrap();

        let (a, mut rx_a) = RelayClient::connect(addr, identity("peer_a")).await.unwrap();
        recv_message(&mut rx_a).await; // registered
        let (_b, mut rx_b) = RelayClient::connect(addr, identity("peer_b")).await.unwrap();
        recv_message(&mut rx_b).await; // registered

        let offer = SignalMessage::Offer {
            from: "peer_a".into(),
            to: "peer_b".into(),
            offer: crate::wire::SessionDescription {
                session_token: "tok".into(),
                listen_addr: None,
            },
        };
        a.send(offer.clone()).await.unwrap();

        loop {
            match recv_message(&mut rx_b).await {
                SignalMessage::PeerList { .. } => continue,
                msg => {
                    assert_eq!(msg, offer);
                    break;
                }
            }
        }
        relay.shutdown();
    }
}
