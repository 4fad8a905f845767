//! TCP transport: long-lived peer connections with redial.
//!
//! Each node listens on its raft port and dials every peer. Writes go out
//! only on connections this node dialed; inbound connections are read-only,
//! with the sending peer identified by the id field of the first message it
//! carries. That split keeps the connection table trivially consistent —
//! there is at most one dialed connection per peer — and the peer's own
//! dialed connection carries traffic in the other direction.
//!
//! A redial task retries unreachable peers every few seconds; a failed
//! write retires the connection and the same task restores it. There are no
//! transport-level heartbeats — AppendEntries is the liveness signal.

use crate::error::{RaftError, Result};
use crate::transport::{InboxSender, Inbox, RaftTransport, INBOX_CAPACITY};
use crate::types::{Message, NodeId};
use crate::wire::{self, FrameDecoder};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

/// Per-connection outbound queue depth; overflow drops frames (lossy link).
const OUTBOUND_QUEUE: usize = 256;

pub struct TcpTransport {
    local_id: NodeId,
    local_addr: SocketAddr,
    peer_addrs: HashMap<NodeId, SocketAddr>,
    inbox_tx: InboxSender,
    /// Writer queue per dialed peer connection.
    conns: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Bytes>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TcpTransport {
    /// Bind the peer listener and return the transport plus the inbox the
    /// dispatcher consumes.
    pub async fn bind(
        local_id: NodeId,
        listen_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
    ) -> Result<(Arc<Self>, Inbox)> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(4);

        let transport = Arc::new(Self {
            local_id,
            local_addr,
            peer_addrs,
            inbox_tx,
            conns: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        });

        transport.spawn_accept_loop(listener);
        tracing::info!(node = %local_id, %local_addr, "peer transport listening");
        Ok((transport, inbox_rx))
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the background task that keeps dialing unreachable peers.
    pub fn start_redial(self: &Arc<Self>, interval: Duration) {
        let transport = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = shutdown.recv() => return,
                }

                let missing: Vec<NodeId> = {
                    let conns = transport.conns.lock();
                    transport
                        .peer_addrs
                        .keys()
                        .copied()
                        .filter(|peer| !conns.contains_key(peer))
                        .collect()
                };

                for peer in missing {
                    if let Err(error) = transport.dial(peer).await {
                        tracing::debug!(%peer, %error, "redial failed");
                    }
                }
            }
        });
    }

    /// Stop the accept/redial/reader tasks and drop all connections.
    pub fn shutdown(&self) {
        self.conns.lock().clear();
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let inbox = self.inbox_tx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(%addr, "inbound peer connection");
                            let _ = stream.set_nodelay(true);
                            // Inbound connections are read-only; replies
                            // travel over our own dialed connection.
                            let (read_half, _write_half) = stream.into_split();
                            spawn_reader(inbox.clone(), read_half, None, shutdown_tx.subscribe());
                        }
                        Err(error) => {
                            tracing::warn!(%error, "peer accept failed");
                        }
                    },
                    _ = shutdown.recv() => return,
                }
            }
        });
    }

    /// Establish the dialed connection to `peer` if missing.
    async fn dial(&self, peer: NodeId) -> Result<()> {
        if self.conns.lock().contains_key(&peer) {
            return Ok(());
        }

        let addr = *self
            .peer_addrs
            .get(&peer)
            .ok_or(RaftError::PeerUnreachable { peer })?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (_read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
        self.conns.lock().insert(peer, tx.clone());

        let conns = Arc::clone(&self.conns);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(error) = write_half.write_all(&frame).await {
                    tracing::debug!(%peer, %error, "peer write failed, closing connection");
                    break;
                }
            }
            // Retire this connection unless a newer dial already replaced it.
            let mut conns = conns.lock();
            if conns.get(&peer).is_some_and(|t| t.same_channel(&tx)) {
                conns.remove(&peer);
            }
        });

        tracing::debug!(%peer, %addr, "connected to peer");
        Ok(())
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn send(&self, target: NodeId, message: Message) -> Result<()> {
        if target == self.local_id {
            return self
                .inbox_tx
                .try_send((self.local_id, message))
                .map_err(|_| RaftError::PeerUnreachable { peer: target });
        }

        let frame = wire::encode(&message);

        let existing = self.conns.lock().get(&target).cloned();
        let tx = match existing {
            Some(tx) => tx,
            None => {
                self.dial(target).await?;
                self.conns
                    .lock()
                    .get(&target)
                    .cloned()
                    .ok_or(RaftError::PeerUnreachable { peer: target })?
            }
        };

        tx.try_send(frame)
            .map_err(|_| RaftError::PeerUnreachable { peer: target })
    }
}

/// Read frames off a connection into the inbox until EOF, error, a
/// malformed frame, or shutdown.
fn spawn_reader(
    inbox: InboxSender,
    mut read_half: OwnedReadHalf,
    mut peer: Option<NodeId>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            let n = tokio::select! {
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(error) => {
                        tracing::debug!(%error, "peer read failed");
                        return;
                    }
                },
                _ = shutdown.recv() => return,
            };

            decoder.extend(&buf[..n]);
            loop {
                match decoder.next() {
                    Ok(Some(message)) => {
                        if peer.is_none() {
                            peer = message.source_id();
                            if let Some(peer) = peer {
                                tracing::debug!(%peer, "identified inbound peer");
                            }
                        }
                        let from = peer.unwrap_or(NodeId::UNKNOWN);
                        if inbox.send((from, message)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(%error, "malformed peer frame, dropping connection");
                        return;
                    }
                }
            }
        }
    });
}
