use anyhow::Context;
use qlafs_core::{logging, QlafsConfig};
use qlafs_node::TrustNode;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = QlafsConfig::load(config_path.as_deref())
        .with_context(|| format!("loading configuration from {:?}", config_path))?;
    logging::init_from_config(&config.logging)?;

    let node = TrustNode::start(config).context("starting trust node")?;
    let anchoring = node
        .spawn_anchoring()
        .await
        .context("starting anchoring job")?;

    let mut events = node.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %json, "Consensus event"),
                    Err(e) => warn!(error = %e, "Unserializable consensus event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Consensus event log lagging")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!(
        node_id = %node.config().node.node_id,
        "QLAFS node running; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    anchoring.abort();
    event_log.abort();
    if let Some(head) = node.tree_head() {
        info!(tree_size = head.tree_size, root = %head.root_hex(), "Last sealed tree head");
    }
    node.shutdown();
    Ok(())
}

/// `--config <path>`, else the first positional argument, else `QLAFS_CONFIG`.
/// No path at all means built-in defaults.
fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter().skip(1);
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            return match args_iter.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => anyhow::bail!("--config was provided without a path"),
            };
        }
        if !arg.starts_with("--") {
            return Ok(Some(PathBuf::from(arg)));
        }
    }

    Ok(std::env::var_os("QLAFS_CONFIG").map(PathBuf::from))
}
