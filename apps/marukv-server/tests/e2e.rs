//! End-to-end tests: real nodes on loopback ports speaking RESP.
//!
//! Each test uses its own port range so the tests can run concurrently in
//! one binary without colliding.

use marukv_server::config::{ClusterConfig, PeerConfig};
use marukv_server::node::Node;
use maru_raft::NodeId;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Build configs for a cluster of `ids` with client ports `base + id` and
/// raft ports 1000 below.
fn cluster_configs(dir: &Path, base: u16, ids: &[u32]) -> Vec<ClusterConfig> {
    ids.iter()
        .map(|&id| ClusterConfig {
            node_id: NodeId(id),
            client_addr: addr(base + id as u16),
            raft_addr: addr(base - 1000 + id as u16),
            peers: ids
                .iter()
                .filter(|&&peer| peer != id)
                .map(|&peer| PeerConfig {
                    id: NodeId(peer),
                    raft_addr: addr(base - 1000 + peer as u16),
                })
                .collect(),
            log_dir: dir.join(format!("node_{id}")),
        })
        .collect()
}

async fn start_nodes(configs: &[ClusterConfig]) -> Vec<Arc<Node>> {
    let mut nodes = Vec::new();
    for config in configs {
        let node = Arc::new(Node::new(config.clone()).await.expect("node init"));
        node.start().await.expect("node start");
        nodes.push(node);
    }
    nodes
}

/// Send one RESP command and read the reply.
async fn request(stream: &mut TcpStream, args: &[&str]) -> String {
    let mut req = format!("*{}\r\n", args.len());
    for arg in args {
        req.push_str(&format!("${}\r\n{}\r\n", arg.len(), arg));
    }
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut response = String::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .expect("reply within deadline")
            .expect("readable stream");
        if n == 0 {
            break;
        }
        response.push_str(&String::from_utf8_lossy(&buf[..n]));
        if response.ends_with("\r\n") {
            break;
        }
    }
    response
}

/// Probe every node with a SET until one answers `+OK`: that's the leader.
/// Returns its index in `configs`.
async fn find_leader(configs: &[ClusterConfig]) -> usize {
    for _ in 0..60 {
        for (i, config) in configs.iter().enumerate() {
            if let Ok(mut stream) = TcpStream::connect(config.client_addr).await {
                let reply = request(&mut stream, &["SET", "__probe", "1"]).await;
                if reply == "+OK\r\n" {
                    return i;
                }
            }
        }
        sleep(Duration::from_millis(500)).await;
    }
    panic!("no node accepted a write within the deadline");
}

#[tokio::test(flavor = "multi_thread")]
async fn client_flow_through_leader_and_redirects() {
    let dir = TempDir::new().unwrap();
    let configs = cluster_configs(dir.path(), 18080, &[1, 2, 3]);
    let nodes = start_nodes(&configs).await;

    let leader_index = find_leader(&configs).await;
    let leader_id = configs[leader_index].node_id;
    let mut leader = TcpStream::connect(configs[leader_index].client_addr)
        .await
        .unwrap();

    // Writes and reads through the leader.
    assert_eq!(request(&mut leader, &["SET", "a", "1"]).await, "+OK\r\n");
    assert_eq!(request(&mut leader, &["GET", "a"]).await, "$1\r\n1\r\n");
    assert_eq!(request(&mut leader, &["SET", "b", "2"]).await, "+OK\r\n");

    // Multi-token values come back joined by single spaces.
    assert_eq!(
        request(&mut leader, &["SET", "c", "x", "y"]).await,
        "+OK\r\n"
    );
    assert_eq!(request(&mut leader, &["GET", "c"]).await, "$3\r\nx y\r\n");

    // DEL counts only the keys that existed.
    assert_eq!(
        request(&mut leader, &["DEL", "a", "b", "missing"]).await,
        ":2\r\n"
    );
    assert_eq!(
        request(&mut leader, &["GET", "a"]).await,
        "*1\r\n$3\r\nnil\r\n"
    );

    // A follower redirects writes to the leader once it knows one.
    let follower_index = (0..configs.len()).find(|&i| i != leader_index).unwrap();
    let expected = format!("+MOVED {}\r\n", leader_id.0);
    let mut redirected = false;
    for _ in 0..20 {
        let mut follower = TcpStream::connect(configs[follower_index].client_addr)
            .await
            .unwrap();
        let reply = request(&mut follower, &["SET", "a", "9"]).await;
        if reply == expected {
            redirected = true;
            break;
        }
        assert_eq!(reply, "+TRYAGAIN\r\n", "follower must never serve writes");
        sleep(Duration::from_millis(500)).await;
    }
    assert!(redirected, "follower should learn the leader id");

    // The redirected write never happened anywhere.
    assert_eq!(
        request(&mut leader, &["GET", "a"]).await,
        "*1\r\n$3\r\nnil\r\n"
    );

    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_cluster_serves_immediately() {
    let dir = TempDir::new().unwrap();
    let configs = cluster_configs(dir.path(), 18190, &[1]);
    let nodes = start_nodes(&configs).await;

    let leader_index = find_leader(&configs).await;
    let mut stream = TcpStream::connect(configs[leader_index].client_addr)
        .await
        .unwrap();

    assert_eq!(request(&mut stream, &["SET", "k", "v"]).await, "+OK\r\n");
    assert_eq!(request(&mut stream, &["GET", "k"]).await, "$1\r\nv\r\n");
    assert_eq!(request(&mut stream, &["DEL", "k"]).await, ":1\r\n");
    assert_eq!(
        request(&mut stream, &["GET", "k"]).await,
        "*1\r\n$3\r\nnil\r\n"
    );

    // Arity violations are command errors, not protocol errors.
    assert_eq!(
        request(&mut stream, &["SET", "k"]).await,
        "-ERR Wrong number of arguments for SET command\r\n"
    );
    assert_eq!(
        request(&mut stream, &["PING"]).await,
        "-ERR Unknown command: PING\r\n"
    );

    // Non-RESP input is a protocol error and drops the connection.
    let mut garbage = TcpStream::connect(configs[leader_index].client_addr)
        .await
        .unwrap();
    garbage.write_all(b"GET a\r\n").await.unwrap();
    let mut buf = [0u8; 256];
    let n = timeout(Duration::from_secs(5), garbage.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&buf[..n]),
        "-ERR Protocol error\r\n"
    );

    for node in &nodes {
        node.shutdown();
    }
}
