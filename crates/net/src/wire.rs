use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{NetError, Result};

/// Hard cap on a single signaling line. Oversized input is rejected,
/// never buffered further.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Default signaling relay port.
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Channel description exchanged during negotiation. Opaque to the
/// relay; only the two endpoints interpret it. The offerer advertises
/// the address it listens on, the answerer's acceptance carries none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub session_token: String,
    pub listen_addr: Option<SocketAddr>,
}

/// A transport-path candidate for reaching the advertising peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCandidate {
    pub addr: SocketAddr,
    pub priority: u32,
}

/// One row of the relay's live peer directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub id: String,
    pub name: String,
    pub public_key: String,
    /// Milliseconds since the UNIX epoch.
    pub last_seen: u64,
}

/// Signaling wire protocol, relay <-> client. JSON lines, one message
/// per line. The relay never interprets offer/answer/candidate payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        peer_id: String,
        name: String,
        public_key: String,
    },
    #[serde(rename_all = "camelCase")]
    Registered { peer_id: String },
    Offer {
        from: String,
        to: String,
        offer: SessionDescription,
    },
    Answer {
        from: String,
        to: String,
        answer: SessionDescription,
    },
    IceCandidate {
        from: String,
        to: String,
        candidate: TransportCandidate,
    },
    /// Sent by the relay as the directory snapshot; a client sends the
    /// same type with an empty list to request one.
    PeerList { peers: Vec<DirectoryEntry> },
    Ping,
    Pong,
    Error { message: String },
}

impl SignalMessage {
    /// Target peer id for messages the relay forwards blindly.
    pub fn relay_target(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Register { .. } => "register",
            SignalMessage::Registered { .. } => "registered",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::PeerList { .. } => "peer-list",
            SignalMessage::Ping => "ping",
            SignalMessage::Pong => "pong",
            SignalMessage::Error { .. } => "error",
        }
    }
}

/// Encode a message as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line =
        serde_json::to_string(msg).map_err(|e| NetError::Serialization(e.to_string()))?;
    if line.len() > MAX_LINE_LEN {
        return Err(NetError::MessageTooLarge(line.len()));
    }
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line into a message.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    if line.len() > MAX_LINE_LEN {
        return Err(NetError::MessageTooLarge(line.len()));
    }
    serde_json::from_str(line.trim()).map_err(|e| NetError::Serialization(e.to_string()))
}

/// Read one newline-terminated line, enforcing [`MAX_LINE_LEN`] while
/// reading: an endless unterminated line errors out as soon as the cap
/// is crossed instead of growing the buffer. `Ok(None)` means the
/// stream ended cleanly.
pub async fn read_bounded_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
        return Err(NetError::MessageTooLarge(buf.len()));
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| NetError::Serialization(e.to_string()))
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
