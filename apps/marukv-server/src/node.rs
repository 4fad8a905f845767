//! Node composition: storage, consensus, transport, and the client endpoint.
//!
//! Client requests only get answers from the leader. Followers answer
//! `+MOVED <leaderId>` when they know one, candidates and leaderless
//! followers answer `+TRYAGAIN`. On the leader every command — reads
//! included — is appended to the replicated log, and the reply waits until
//! the entry is durable on a majority (and applied, where the reply reads
//! the map).

use crate::config::ClusterConfig;
use crate::kv::KvStore;
use crate::resp;
use bytes::{Buf, Bytes, BytesMut};
use maru_raft::log::RaftLog;
use maru_raft::state::RaftCore;
use maru_raft::tcp::TcpTransport;
use maru_raft::transport::{Inbox, RaftTransport};
use maru_raft::{Raft, RaftConfig, RaftError, Role};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

pub struct Node {
    config: ClusterConfig,
    endpoint: Arc<ClientEndpoint>,
    transport: Arc<TcpTransport>,
    inbox: Mutex<Option<Inbox>>,
}

impl Node {
    /// Wire up storage, consensus core, and the peer transport.
    pub async fn new(config: ClusterConfig) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.log_dir)?;

        let log = Arc::new(RaftLog::open(config.log_path())?);
        tracing::info!(path = %config.log_path().display(), last_index = %log.last_index(), "log store opened");

        let (transport, inbox) =
            TcpTransport::bind(config.node_id, config.raft_addr, config.peer_addr_map()).await?;

        let raft_config = RaftConfig::default();
        raft_config.validate().map_err(NodeError::State)?;
        let core = Arc::new(RaftCore::new(
            config.node_id,
            config.peer_ids(),
            raft_config,
            log,
        )?);
        let raft = Arc::new(Raft::new(
            core,
            transport.clone() as Arc<dyn RaftTransport>,
        ));

        let (shutdown_tx, _) = broadcast::channel(4);
        let endpoint = Arc::new(ClientEndpoint {
            kv: Arc::new(KvStore::new()),
            raft,
            shutdown_tx,
        });

        Ok(Self {
            config,
            endpoint,
            transport,
            inbox: Mutex::new(Some(inbox)),
        })
    }

    /// Start consensus and the client endpoint.
    pub async fn start(&self) -> Result<(), NodeError> {
        let inbox = self
            .inbox
            .lock()
            .take()
            .ok_or_else(|| NodeError::State("node already started".into()))?;

        self.endpoint.raft.start(inbox, self.endpoint.kv.clone());
        self.transport
            .start_redial(self.endpoint.raft.core().config().redial_interval);

        let listener = TcpListener::bind(self.config.client_addr).await?;
        tracing::info!(addr = %self.config.client_addr, "client endpoint listening");

        let endpoint = Arc::clone(&self.endpoint);
        let mut shutdown = self.endpoint.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(%addr, "client connected");
                            let endpoint = Arc::clone(&endpoint);
                            tokio::spawn(async move {
                                endpoint.serve(stream).await;
                            });
                        }
                        Err(error) => {
                            tracing::warn!(%error, "client accept failed");
                        }
                    },
                    _ = shutdown.recv() => return,
                }
            }
        });

        Ok(())
    }

    /// Stop consensus, transport, and the client endpoint.
    pub fn shutdown(&self) {
        self.endpoint.raft.shutdown();
        self.transport.shutdown();
        let _ = self.endpoint.shutdown_tx.send(());
    }

    pub fn is_leader(&self) -> bool {
        self.endpoint.raft.is_leader()
    }
}

/// The RESP-speaking client side: one instance shared by all connections.
struct ClientEndpoint {
    kv: Arc<KvStore>,
    raft: Arc<Raft>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ClientEndpoint {
    /// One client connection: buffer reads, peel off complete RESP
    /// commands, answer each in order.
    async fn serve(&self, mut stream: TcpStream) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut buf = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];

        loop {
            let n = tokio::select! {
                read = stream.read(&mut read_buf) => match read {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(error) => {
                        tracing::debug!(%error, "client read failed");
                        return;
                    }
                },
                _ = shutdown.recv() => return,
            };
            buf.extend_from_slice(&read_buf[..n]);

            loop {
                let Ok(text) = std::str::from_utf8(&buf) else {
                    let _ = stream
                        .write_all(resp::encode_error("ERR Protocol error").as_bytes())
                        .await;
                    return;
                };

                match resp::parse_command(text) {
                    Ok(Some((args, consumed))) => {
                        let raw = Bytes::copy_from_slice(&buf[..consumed]);
                        buf.advance(consumed);

                        let response = self.handle_command(args, raw).await;
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let _ = stream
                            .write_all(resp::encode_error("ERR Protocol error").as_bytes())
                            .await;
                        return;
                    }
                }
            }
        }
    }

    /// Answer one parsed command; `raw` is the exact request text that gets
    /// logged on the leader.
    async fn handle_command(&self, args: Vec<String>, raw: Bytes) -> String {
        if args.is_empty() {
            return resp::encode_error("ERR Protocol error");
        }

        match self.raft.role() {
            Role::Candidate => resp::encode_status("TRYAGAIN"),
            Role::Follower => match self.raft.leader() {
                Some(leader) => resp::encode_status(&format!("MOVED {}", leader.0)),
                None => resp::encode_status("TRYAGAIN"),
            },
            Role::Leader => self.handle_command_as_leader(args, raw).await,
        }
    }

    async fn handle_command_as_leader(&self, args: Vec<String>, raw: Bytes) -> String {
        // Every command is replicated uniformly, reads included.
        let index = match self.raft.propose(raw) {
            Ok(index) => index,
            // Lost leadership between the role check and the append.
            Err(RaftError::NotLeader { .. }) => return resp::encode_status("TRYAGAIN"),
            Err(error) => {
                tracing::error!(%error, "propose failed");
                return resp::encode_error("ERR Internal server error");
            }
        };

        let command = args[0].to_uppercase();
        let wait = match command.as_str() {
            // Replies that read the map must see this entry applied.
            "GET" | "DEL" => self.raft.wait_applied(index).await,
            _ => self.raft.wait_committed(index).await,
        };
        if let Err(error) = wait {
            return match error {
                RaftError::CommitTimeout { .. } => resp::encode_error("ERR Commit timeout"),
                _ => resp::encode_error("ERR Internal server error"),
            };
        }

        match command.as_str() {
            "GET" => {
                if args.len() < 2 {
                    return resp::encode_error("ERR Wrong number of arguments for GET command");
                }
                match self.kv.get(&args[1]) {
                    Some(value) => resp::encode_bulk(&value),
                    None => resp::encode_nil(),
                }
            }
            "SET" => {
                if args.len() < 3 {
                    return resp::encode_error("ERR Wrong number of arguments for SET command");
                }
                resp::encode_status("OK")
            }
            "DEL" => {
                if args.len() < 2 {
                    return resp::encode_error("ERR Wrong number of arguments for DEL command");
                }
                resp::encode_integer(self.kv.take_del_count(index).unwrap_or(0))
            }
            _ => resp::encode_error(&format!("ERR Unknown command: {}", args[0])),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("consensus error: {0}")]
    Raft(#[from] RaftError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    State(String),
}
