use marukv_server::{config, node};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = match (args.next(), args.next()) {
        (Some(flag), Some(path)) if flag == "--config_path" => path,
        _ => {
            eprintln!("usage: marukv-server --config_path <config_file>");
            std::process::exit(1);
        }
    };

    tracing::info!("loading configuration from {config_path}");
    let config = config::ClusterConfig::load(Path::new(&config_path), PathBuf::from("./log"))?;

    tracing::info!(
        node = %config.node_id,
        client_addr = %config.client_addr,
        raft_addr = %config.raft_addr,
        peers = config.peers.len(),
        "starting MaruKV node"
    );

    let node = Arc::new(node::Node::new(config).await?);
    node.start().await?;

    tracing::info!("MaruKV node is ready");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutdown signal received, stopping");
    node.shutdown();
    Ok(())
}
