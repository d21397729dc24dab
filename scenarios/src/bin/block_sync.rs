//! Blocks mined on every node of a four node chain reach all of them.

use std::process::ExitCode;

use anyhow::{ensure, Result};
use clap::Parser;
use harness::assert::ensure_eq;
use harness::mocktime::DEFAULT_MOCK_TIME;
use harness::{scenario, Cluster};
use scenarios::{mine_and_sync, require_daemon, Cli};
use tracing::info;

const NODES: usize = 4;
const SPREAD_BLOCKS: u32 = 51;

fn main() -> ExitCode {
    let cli = Cli::parse();
    scenario::run(cli.options, run)
}

fn run(cluster: &mut Cluster) -> Result<()> {
    require_daemon(cluster)?;
    cluster.start_nodes(NODES)?;
    cluster.setup_network(false)?;
    cluster.set_absolute(DEFAULT_MOCK_TIME)?;

    // Spread the blocks unevenly over the nodes, varying with the seed.
    let seed = cluster.config().port_seed as usize;
    let mut per_node = [0u32; NODES];
    for block in 0..SPREAD_BLOCKS as usize {
        per_node[(block * 7 + seed) % NODES] += 1;
    }
    info!(?per_node, "mining across the cluster");
    for (index, blocks) in per_node.iter().enumerate() {
        if *blocks > 0 {
            cluster.rpc(index)?.generate(*blocks)?;
            cluster.advance_by(1)?;
        }
    }
    cluster.sync_all()?;

    let best = cluster.rpc(0)?.get_best_block_hash()?;
    for index in 0..NODES {
        let rpc = cluster.rpc(index)?;
        ensure_eq(rpc.get_block_count()?, u64::from(SPREAD_BLOCKS), "block count")?;
        ensure_eq(rpc.get_best_block_hash()?, best.clone(), "best block")?;
    }

    info!("mining a long run on a single node");
    mine_and_sync(cluster, 1, 50)?;
    let best = cluster.rpc(1)?.get_best_block_hash()?;
    for index in 0..NODES {
        ensure_eq(cluster.rpc(index)?.get_best_block_hash()?, best.clone(), "best block")?;
    }
    let height = u64::from(SPREAD_BLOCKS + 50);
    let tip = cluster.rpc(3)?.get_block_hash(height)?;
    ensure!(tip == best, "block {height} on node 3 is {tip}, expected {best}");
    Ok(())
}
