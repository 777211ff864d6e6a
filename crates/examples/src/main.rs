//! Runs a network of `quorum` nodes on the emulated in-memory network and registers a batch of
//! items, some of them bad, then reports where every item ended up.
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use futures::future::join_all;
use quorum::{
    traits::{
        implementations::{MasterMap, MemoryLedger, MemoryNetwork},
        AsynchronousNetwork, NetworkReliability,
    },
    Node,
};
use quorum_example_types::{item_types::TestItem, node_types::MemoryImpl};
use quorum_types::{
    data::{HashId, NodeId},
    logging::setup_logging,
    traits::item::Item,
    ConsensusThresholds, NodeConfig, NodeConfigFile,
};
use rand::{seq::SliceRandom, Rng};
use tokio::signal::ctrl_c;
use tracing::{info, warn};

/// The command line arguments for the example
#[derive(Parser, Debug)]
#[command(
    name = "emulated-network",
    about = "Runs quorum consensus among nodes on an emulated network"
)]
struct Args {
    /// The number of nodes to start
    #[arg(long, default_value_t = 10)]
    nodes: usize,

    /// The number of items to register
    #[arg(long, default_value_t = 20)]
    items: usize,

    /// Share of the items that fail their own check
    #[arg(long, default_value_t = 0.2)]
    bad_ratio: f64,

    /// Percentage of messages the network loses
    #[arg(long, default_value_t = 0)]
    drop_percent: u32,

    /// Node configuration (TOML); thresholds default to the ones fitting `--nodes`
    #[arg(long, env = "QUORUM_CONFIG")]
    config: Option<PathBuf>,

    /// How long to wait for each item, in seconds
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
}

/// Build the configuration every node starts with
fn node_config(args: &Args) -> Result<NodeConfig> {
    let config = match &args.config {
        Some(path) => NodeConfig::from(
            NodeConfigFile::from_file(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => NodeConfig::with_thresholds(ConsensusThresholds::for_network_size(args.nodes)),
    };
    config
        .validate(args.nodes)
        .with_context(|| "Configuration does not fit the network")?;
    Ok(config)
}

/// Create and start every node, all attached to one emulated network
async fn start_nodes(args: &Args, config: &NodeConfig) -> Result<Vec<Arc<Node<MemoryImpl>>>> {
    let master_map = MasterMap::new();
    let reliability: Option<Arc<dyn NetworkReliability>> = if args.drop_percent > 0 {
        Some(Arc::new(AsynchronousNetwork::new(args.drop_percent, 0, 20)))
    } else {
        None
    };

    let networks: Vec<_> = (0..args.nodes as u64)
        .map(|index| {
            Arc::new(MemoryNetwork::new(
                NodeId(index),
                &master_map,
                reliability.clone(),
            ))
        })
        .collect();

    let mut nodes = Vec::with_capacity(networks.len());
    for (index, network) in (0..args.nodes as u64).zip(networks) {
        let node = Node::<MemoryImpl>::new(
            NodeId(index),
            config.clone(),
            Arc::new(MemoryLedger::empty()),
            network,
        )
        .with_context(|| format!("Failed to create node {index}"))?;
        node.start().await;
        nodes.push(node);
    }
    Ok(nodes)
}

/// Register the items on random nodes and wait for every node to settle them.
///
/// Returns, per item, whether it was meant to pass and the state on each node.
async fn run_items(
    args: &Args,
    nodes: &[Arc<Node<MemoryImpl>>],
) -> Result<Vec<(HashId, bool, Vec<String>)>> {
    let mut rng = rand::thread_rng();
    let mut items = Vec::with_capacity(args.items);
    for _ in 0..args.items {
        let is_ok = !rng.gen_bool(args.bad_ratio);
        let item = TestItem::new(is_ok).shared();
        let node = nodes.choose(&mut rng).context("No nodes to register on")?;
        node.register_item(Arc::clone(&item)).await?;
        items.push((item.id(), is_ok));
    }
    info!(items = items.len(), "items registered");

    let max_wait = Duration::from_secs(args.wait_secs);
    let mut outcomes = Vec::with_capacity(items.len());
    for (id, is_ok) in items {
        let results = join_all(nodes.iter().map(|node| node.wait_item(&id, max_wait))).await;
        let mut states = Vec::with_capacity(results.len());
        for result in results {
            states.push(result?.state.to_string());
        }
        outcomes.push((id, is_ok, states));
    }
    Ok(outcomes)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    setup_logging();

    // Parse the command line arguments
    let args = Args::parse();
    ensure!(args.nodes >= 2, "At least two nodes are needed");
    ensure!(
        (0.0..=1.0).contains(&args.bad_ratio),
        "The bad ratio must be between 0 and 1"
    );

    let config = node_config(&args)?;
    info!(?config.thresholds, nodes = args.nodes, "starting network");
    let nodes = start_nodes(&args, &config).await?;

    let outcomes = tokio::select! {
        outcomes = run_items(&args, &nodes) => outcomes?,
        _ = ctrl_c() => {
            warn!("interrupted");
            Vec::new()
        }
    };

    let mut summary: BTreeMap<String, usize> = BTreeMap::new();
    for (id, is_ok, states) in &outcomes {
        info!(%id, is_ok, states = states.join(","), "item settled");
        for state in states {
            *summary.entry(state.clone()).or_default() += 1;
        }
    }
    for (state, count) in &summary {
        println!("{state:>20}: {count}");
    }

    join_all(nodes.iter().map(|node| node.shut_down())).await;
    Ok(())
}
