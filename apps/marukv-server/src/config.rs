//! Cluster configuration.
//!
//! The config file is plain text: the first non-comment line names the
//! local node, the rest name its peers.
//!
//! ```text
//! # local node first
//! follower_info 127.0.0.1:8001
//! follower_info 127.0.0.1:8002
//! follower_info 127.0.0.1:8003
//! ```
//!
//! The listed port serves clients; the raft port is `client_port - 1000`,
//! and a node's id is `client_port mod 10`.

use maru_raft::NodeId;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub id: NodeId,
    pub raft_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's id (client port mod 10).
    pub node_id: NodeId,

    /// Client-facing RESP listener address.
    pub client_addr: SocketAddr,

    /// Peer-facing raft listener address (client port - 1000).
    pub raft_addr: SocketAddr,

    /// The other cluster members.
    pub peers: Vec<PeerConfig>,

    /// Directory for the persistent log and hard-state files.
    pub log_dir: PathBuf,
}

impl ClusterConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path, log_dir: PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read {}: {e}", path.display())))?;

        let mut local: Option<(NodeId, SocketAddr, SocketAddr)> = None;
        let mut peers = Vec::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (id, client_addr, raft_addr) = parse_follower_info(line)
                .ok_or_else(|| ConfigError::Parse {
                    line: line_no + 1,
                    reason: format!("expected `follower_info <ip>:<port>`, found {line:?}"),
                })?;

            if local.is_none() {
                local = Some((id, client_addr, raft_addr));
            } else {
                peers.push(PeerConfig { id, raft_addr });
            }
        }

        let (node_id, client_addr, raft_addr) =
            local.ok_or_else(|| ConfigError::Invalid("config file lists no nodes".into()))?;

        let config = Self {
            node_id,
            client_addr,
            raft_addr,
            peers,
            log_dir,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.node_id.is_known() {
            return Err(ConfigError::Invalid(
                "node id derives to 0 (client port must not end in 0)".into(),
            ));
        }

        let mut seen = HashSet::from([self.node_id]);
        for peer in &self.peers {
            if !peer.id.is_known() {
                return Err(ConfigError::Invalid(format!(
                    "peer {} derives node id 0",
                    peer.raft_addr
                )));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate node id {}",
                    peer.id
                )));
            }
        }

        if (self.peers.len() + 1) % 2 == 0 {
            tracing::warn!(
                cluster_size = self.peers.len() + 1,
                "even cluster size cannot tolerate the usual failure count"
            );
        }

        Ok(())
    }

    /// Peer id → raft address map for the transport.
    pub fn peer_addr_map(&self) -> HashMap<NodeId, SocketAddr> {
        self.peers
            .iter()
            .map(|peer| (peer.id, peer.raft_addr))
            .collect()
    }

    /// The node's persistent log path.
    pub fn log_path(&self) -> PathBuf {
        self.log_dir
            .join(format!("node_{}_raft_log.dat", self.node_id.0))
    }

    /// Cluster membership ids other than this node.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|peer| peer.id).collect()
    }
}

/// Parse one `follower_info <ip>:<port>` line into (id, client, raft).
fn parse_follower_info(line: &str) -> Option<(NodeId, SocketAddr, SocketAddr)> {
    let rest = line.strip_prefix("follower_info")?.trim();
    let (ip, port) = rest.rsplit_once(':')?;
    let ip: IpAddr = ip.trim().parse().ok()?;
    let client_port: u16 = port.trim().parse().ok()?;
    if client_port <= 1000 {
        return None;
    }

    let id = NodeId(u32::from(client_port % 10));
    let client_addr = SocketAddr::new(ip, client_port);
    let raft_addr = SocketAddr::new(ip, client_port - 1000);
    Some((id, client_addr, raft_addr))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
