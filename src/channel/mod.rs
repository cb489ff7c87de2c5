//! Framed, bidirectional `AgentMessage` transport over a Unix-domain socket.
//!
//! A [`Channel`] runs in one of two modes:
//!
//! - **Server** ([`Channel::open_server`]): binds the broker's well-known
//!   socket, accepts any number of agent connections, and can route a
//!   message to a specific peer (by the `sender_id` it announced in its
//!   first frame) or [`broadcast`](Channel::broadcast) to all of them.
//! - **Client** ([`Channel::open_client`]): connects to the broker; `send`
//!   writes to that single connection, and the broker is responsible for
//!   routing based on `receiver_id`.
//!
//! Both modes feed every inbound `AgentMessage` into one queue, drained by
//! [`Channel::receive`].

pub mod framing;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{AgentMessage, BROADCAST};
use framing::{encode, FrameDecoder};

/// Errors raised by the [`Channel`] transport.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The server-mode socket could not be bound.
    #[error("failed to bind broker socket at {path}: {source}")]
    Bind {
        /// Socket path that failed to bind.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The client-mode socket could not be connected within the timeout.
    #[error("failed to connect to broker socket at {path}: {source}")]
    Connect {
        /// Socket path that refused the connection.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A send failed because the target peer is no longer connected.
    #[error("write failed, peer disconnected: {0}")]
    Write(String),
    /// The wire codec rejected a frame.
    #[error(transparent)]
    Framing(#[from] framing::FramingError),
}

/// One accepted peer connection (server mode) or the sole upstream
/// connection (client mode).
struct PeerHandle {
    /// Declared identity, learned from the first inbound message's
    /// `sender_id`. `None` until that message arrives.
    agent_id: Option<String>,
    frame_tx: UnboundedSender<Vec<u8>>,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

enum Mode {
    Server {
        socket_path: PathBuf,
        peers: Arc<Mutex<HashMap<u64, PeerHandle>>>,
        next_conn_id: Arc<AtomicU64>,
        accept_handle: JoinHandle<()>,
    },
    Client {
        frame_tx: UnboundedSender<Vec<u8>>,
        read_handle: JoinHandle<()>,
        write_handle: JoinHandle<()>,
    },
}

/// Framed `AgentMessage` transport over a Unix-domain socket.
pub struct Channel {
    mode: Mode,
    inbound_rx: Mutex<UnboundedReceiver<AgentMessage>>,
    inbound_tx: UnboundedSender<AgentMessage>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("mode", &match &self.mode {
                Mode::Server { .. } => "server",
                Mode::Client { .. } => "client",
            })
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Bind a Unix-domain stream socket at `path` in server mode, removing
    /// any stale socket file first, and start the accept loop.
    pub async fn open_server(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path).map_err(|source| ChannelError::Bind {
            path: path.clone(),
            source,
        })?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peers: Arc<Mutex<HashMap<u64, PeerHandle>>> = Arc::new(Mutex::new(HashMap::new()));

        let accept_peers = peers.clone();
        let accept_inbound_tx = inbound_tx.clone();
        let next_conn_id = Arc::new(AtomicU64::new(0));
        let accept_conn_counter = next_conn_id.clone();
        let accept_handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let conn_id = accept_conn_counter.fetch_add(1, Ordering::Relaxed);
                        info!(conn_id, "broker: accepted peer connection");
                        spawn_peer(conn_id, stream, accept_peers.clone(), accept_inbound_tx.clone()).await;
                    }
                    Err(err) => {
                        warn!(%err, "broker: accept() failed, stopping accept loop");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            mode: Mode::Server {
                socket_path: path,
                peers,
                next_conn_id,
                accept_handle,
            },
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx,
        })
    }

    /// Connect to the broker socket at `path`, bounded by `connect_timeout`.
    pub async fn open_client(path: impl AsRef<Path>, connect_timeout: Duration) -> Result<Self, ChannelError> {
        let path = path.as_ref().to_path_buf();
        let stream = tokio::time::timeout(connect_timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| ChannelError::Connect {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| ChannelError::Connect { path: path.clone(), source })?;

        let (read_half, mut write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader_tx = inbound_tx.clone();
        let read_handle = tokio::spawn(async move {
            read_loop(read_half, reader_tx, None).await;
        });
        let write_handle = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            mode: Mode::Client {
                frame_tx,
                read_handle,
                write_handle,
            },
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx,
        })
    }

    /// Serialize `message` and deliver it to its `receiver_id`.
    ///
    /// In client mode, every `send` writes to the single upstream
    /// connection regardless of `receiver_id`; the broker performs routing.
    /// In server mode, `receiver_id == "broadcast"` fans out to every
    /// connected peer; otherwise the message is routed to the peer that
    /// announced that agent id.
    pub async fn send(&self, message: &AgentMessage) -> Result<(), ChannelError> {
        if message.is_broadcast() {
            return self.broadcast(message, None).await;
        }
        let frame = encode(message)?;
        match &self.mode {
            Mode::Client { frame_tx, .. } => frame_tx
                .send(frame)
                .map_err(|_| ChannelError::Write("client channel closed".into())),
            Mode::Server { peers, .. } => {
                let peers = peers.lock().await;
                let target = peers
                    .values()
                    .find(|p| p.agent_id.as_deref() == Some(message.receiver_id.as_str()));
                match target {
                    Some(peer) => peer
                        .frame_tx
                        .send(frame)
                        .map_err(|_| ChannelError::Write(message.receiver_id.clone())),
                    None => Err(ChannelError::Write(message.receiver_id.clone())),
                }
            }
        }
    }

    /// Deliver `message` to every connected peer except `except` (by
    /// declared agent id). Server-mode only; a no-op with zero peers.
    pub async fn broadcast(&self, message: &AgentMessage, except: Option<&str>) -> Result<(), ChannelError> {
        let frame = encode(message)?;
        if let Mode::Server { peers, .. } = &self.mode {
            // Clone the sender list first so we don't hold the lock across I/O.
            let targets: Vec<UnboundedSender<Vec<u8>>> = {
                let peers = peers.lock().await;
                peers
                    .values()
                    .filter(|p| p.agent_id.as_deref() != except)
                    .map(|p| p.frame_tx.clone())
                    .collect()
            };
            for tx in targets {
                let _ = tx.send(frame.clone());
            }
        }
        Ok(())
    }

    /// Dequeue the next inbound message, or `None` if nothing arrives
    /// within `timeout`. Never raises on timeout.
    pub async fn receive(&self, timeout: Duration) -> Option<AgentMessage> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Number of currently connected peers (server mode only; always 0 for
    /// a client-mode channel).
    pub async fn peer_count(&self) -> usize {
        match &self.mode {
            Mode::Server { peers, .. } => peers.lock().await.len(),
            Mode::Client { .. } => 0,
        }
    }

    /// Tear the channel down: abort background tasks, close sockets, and in
    /// server mode unlink the socket file.
    pub async fn close(self) {
        match self.mode {
            Mode::Server {
                socket_path,
                peers,
                accept_handle,
                ..
            } => {
                accept_handle.abort();
                let mut peers = peers.lock().await;
                for (_, peer) in peers.drain() {
                    peer.read_handle.abort();
                    peer.write_handle.abort();
                }
                let _ = std::fs::remove_file(&socket_path);
            }
            Mode::Client {
                read_handle,
                write_handle,
                ..
            } => {
                read_handle.abort();
                write_handle.abort();
            }
        }
    }

    /// Give direct access to the shared inbound sender, used in tests to
    /// inject synthetic messages without a live socket.
    #[cfg(test)]
    pub(crate) fn inbound_sender(&self) -> UnboundedSender<AgentMessage> {
        self.inbound_tx.clone()
    }
}

async fn spawn_peer(
    conn_id: u64,
    stream: UnixStream,
    peers: Arc<Mutex<HashMap<u64, PeerHandle>>>,
    inbound_tx: UnboundedSender<AgentMessage>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let reader_peers = peers.clone();
    let reader_tx = inbound_tx.clone();
    let read_handle = tokio::spawn(async move {
        read_loop(read_half, reader_tx, Some((conn_id, reader_peers))).await;
    });
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut peers = peers.lock().await;
    peers.insert(
        conn_id,
        PeerHandle {
            agent_id: None,
            frame_tx,
            read_handle,
            write_handle,
        },
    );
}

/// Shared read loop for both client and server connections. In server mode
/// `registration` carries the connection id and peer map so the first
/// inbound message's `sender_id` can be recorded for routing; the
/// connection is removed from the map on disconnect.
async fn read_loop(
    mut reader: tokio::net::unix::OwnedReadHalf,
    inbound_tx: UnboundedSender<AgentMessage>,
    registration: Option<(u64, Arc<Mutex<HashMap<u64, PeerHandle>>>)>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("channel: peer disconnected (EOF)");
                break;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(messages) => {
                    for message in messages {
                        if let Some((conn_id, peers)) = &registration {
                            let mut peers = peers.lock().await;
                            if let Some(peer) = peers.get_mut(conn_id) {
                                if peer.agent_id.is_none() {
                                    peer.agent_id = Some(message.sender_id.clone());
                                }
                            }
                        }
                        if inbound_tx.send(message).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "channel: dropping malformed frame");
                }
            },
            Err(err) => {
                warn!(%err, "channel: read error, closing connection");
                break;
            }
        }
    }

    if let Some((conn_id, peers)) = registration {
        peers.lock().await.remove(&conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::Map;
    use std::time::Duration;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("claude_orch_test_{name}_{}.sock", std::process::id()))
    }

    #[tokio::test]
    async fn server_with_zero_peers_broadcasts_without_error() {
        let path = socket_path("zero_peers");
        let server = Channel::open_server(&path).await.unwrap();
        let msg = AgentMessage::new("coordinator", BROADCAST, MessageType::Heartbeat, Map::new());
        assert!(server.broadcast(&msg, None).await.is_ok());
        server.close().await;
    }

    #[tokio::test]
    async fn client_connects_and_exchanges_a_message() {
        let path = socket_path("roundtrip");
        let server = Channel::open_server(&path).await.unwrap();
        // Give the accept loop a moment to be scheduled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let client = Channel::open_client(&path, Duration::from_secs(2)).await.unwrap();

        let msg = AgentMessage::new("agent_001", "coordinator", MessageType::Heartbeat, Map::new());
        client.send(&msg).await.unwrap();

        let received = server.receive(Duration::from_secs(2)).await;
        assert!(received.is_some());
        assert_eq!(received.unwrap().sender_id, "agent_001");

        server.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn receive_times_out_without_raising() {
        let path = socket_path("timeout");
        let server = Channel::open_server(&path).await.unwrap();
        let received = server.receive(Duration::from_millis(50)).await;
        assert!(received.is_none());
        server.close().await;
    }
}
