use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::{NetError, Result};
use crate::wire::{decode_line, encode_line, read_bounded_line};

/// Longest token line the listening side will read before rejecting
/// the dial.
const TOKEN_LINE_CAP: usize = 128;

const OUTBOUND_BUFFER: usize = 64;

/// An established, ordered, reliable duplex channel to one peer,
/// carrying line-JSON envelopes over a direct TCP connection.
pub struct SessionChannel {
    remote_peer: String,
    outbound: mpsc::Sender<Envelope>,
    closed_tx: watch::Sender<bool>,
}

impl SessionChannel {
    /// Wrap an already-connected stream. Inbound envelopes go to
    /// `inbound_tx` tagged with the remote peer id; `closed_tx` is told
    /// the remote peer id once the transport goes away.
    pub fn spawn(
        stream: TcpStream,
        remote_peer: String,
        inbound_tx: mpsc::Sender<(String, Envelope)>,
        closed_tx: mpsc::Sender<String>,
    ) -> Self {
        let (read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);
        let (close_tx, mut close_rx_writer) = watch::channel(false);
        let mut close_rx_reader = close_tx.subscribe();

        let peer = remote_peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => {
                        let Some(envelope) = outbound else { break };
                        match encode_line(&envelope) {
                            Ok(line) => {
                                if write_half.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("dropping unencodable envelope to {}: {}", peer, e),
                        }
                    }
                    _ = close_rx_writer.changed() => break,
                }
            }
        });

        let peer = remote_peer.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                tokio::select! {
                    inbound = read_bounded_line(&mut reader) => {
                        let line = match inbound {
                            Ok(Some(line)) => line,
                            Ok(None) => break,
                            Err(e) => {
                                warn!("session read from {} failed: {}", peer, e);
                                break;
                            }
                        };
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_line::<Envelope>(&line) {
                            Ok(envelope) => {
                                if inbound_tx.send((peer.clone(), envelope)).await.is_err() {
                                    break;
                                }
                            }
                            // Unknown envelope types land here; never fatal.
                            Err(e) => debug!("dropping undecodable envelope from {}: {}", peer, e),
                        }
                    }
                    _ = close_rx_reader.changed() => break,
                }
            }
            let _ = closed_tx.send(peer).await;
        });

        Self {
            remote_peer,
            outbound: out_tx,
            closed_tx: close_tx,
        }
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| NetError::ChannelClosed)
    }

    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

/// Bind an ephemeral listener whose address feeds the local session
/// description and candidates.
pub async fn bind_session_listener(bind_ip: std::net::IpAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind((bind_ip, 0)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Dial a peer's advertised candidate address within a bound.
pub async fn dial_candidate(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetError::ConnectionFailed(e.to_string())),
        Err(_) => Err(NetError::Timeout),
    }
}

/// First line on a freshly dialed session transport: the dialing side
/// presents the session token it was offered.
pub async fn write_token_line(stream: &mut TcpStream, token: &str) -> Result<()> {
    stream.write_all(token.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    Ok(())
}

/// Counterpart to [`write_token_line`]. Byte-wise so nothing past the
/// token line is consumed from the stream.
pub async fn read_token_line(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if buf.len() >= TOKEN_LINE_CAP {
            return Err(NetError::ConnectionFailed("token line too long".into()));
        }
        buf.push(byte);
    }
    String::from_utf8(buf).map_err(|e| NetError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeBody;

    #[tokio::test]
    async fn test_channel_carries_envelopes_both_ways() {
        let (listener, addr) = bind_session_listener("127.0.0.1".parse().unwrap())
            .await
            .unwrap();

        let dialer = tokio::spawn(async move {
            dial_candidate(addr, Duration::from_secs(1)).await.unwrap()
        });
        let (accepted, _) = listener.accept().await.unwrap();
        let dialed = dialer.await.unwrap();

        let (in_a_tx, mut in_a_rx) = mpsc::channel(8);
        let (in_b_tx, mut in_b_rx) = mpsc::channel(8);
        let (closed_tx, _closed_rx) = mpsc::channel(8);

        let a = SessionChannel::spawn(accepted, "peer_b".into(), in_a_tx, closed_tx.clone());
        let b = SessionChannel::spawn(dialed, "peer_a".into(), in_b_tx, closed_tx);

        a.send(Envelope::new(EnvelopeBody::Ping, "peer_a", "peer_b"))
            .await
            .unwrap();
        let (from, env) = in_b_rx.recv().await.unwrap();
        assert_eq!(from, "peer_a");
        assert_eq!(env.body.kind(), "ping");

        b.send(Envelope::new(EnvelopeBody::Pong, "peer_b", "peer_a"))
            .await
            .unwrap();
        let (from, env) = in_a_rx.recv().await.unwrap();
        assert_eq!(from, "peer_b");
        assert_eq!(env.body.kind(), "pong");
    }

    #[tokio::test]
    async fn test_close_notifies_owner() {
        let (listener, addr) = bind_session_listener("127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let dialer = tokio::spawn(async move {
            dial_candidate(addr, Duration::from_secs(1)).await.unwrap()
        });
        let (accepted, _) = listener.accept().await.unwrap();
        let _dialed = dialer.await.unwrap();

        let (in_tx, _in_rx) = mpsc::channel(8);
        let (closed_tx, mut closed_rx) = mpsc::channel(8);
        let channel = SessionChannel::spawn(accepted, "peer_x".into(), in_tx, closed_tx);

        channel.close();
        let closed_peer = tokio::time::timeout(Duration::from_secs(1), closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed_peer, "peer_x");
    }

    #[tokio::test]
    async fn test_token_line_roundtrip() {
        let (listener, addr) = bind_session_listener("127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let dialer = tokio::spawn(async move {
            let mut stream = dial_candidate(addr, Duration::from_secs(1)).await.unwrap();
            write_token_line(&mut stream, "tok-123").await.unwrap();
            stream
        });
        let (mut accepted, _) = listener.accept().await.unwrap();
        let _dialed = dialer.await.unwrap();
        assert_eq!(read_token_line(&mut accepted).await.unwrap(), "tok-123");
    }

    #[tokio::test]
    async fn test_dial_unreachable_fails() {
        let err = dial_candidate("127.0.0.1:1".parse().unwrap(), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NetError::ConnectionFailed(_) | NetError::Timeout
        ));
    }
}
