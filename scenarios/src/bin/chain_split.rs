//! Two halves of a split network mine competing chains; after healing
//! every node follows the longer one and pending transactions survive.

use std::process::ExitCode;

use anyhow::{ensure, Result};
use clap::Parser;
use harness::assert::ensure_eq;
use harness::mocktime::DEFAULT_MOCK_TIME;
use harness::{scenario, Cluster};
use scenarios::{mine_and_sync, require_daemon, Cli};
use tracing::info;

fn main() -> ExitCode {
    let cli = Cli::parse();
    scenario::run(cli.options, run)
}

fn run(cluster: &mut Cluster) -> Result<()> {
    require_daemon(cluster)?;
    cluster.start_nodes(4)?;
    cluster.setup_network(false)?;
    cluster.set_absolute(DEFAULT_MOCK_TIME)?;
    mine_and_sync(cluster, 0, 30)?;

    info!("splitting the network");
    cluster.partition(&[0, 1], &[2, 3])?;
    cluster.rpc(0)?.generate(5)?;
    cluster.advance_by(60)?;
    cluster.rpc(2)?.generate(8)?;
    cluster.sync_all()?;

    let short_tip = cluster.rpc(1)?.get_best_block_hash()?;
    let long_tip = cluster.rpc(3)?.get_best_block_hash()?;
    ensure!(short_tip != long_tip, "halves agree on {short_tip} while split");
    ensure_eq(cluster.rpc(1)?.get_block_count()?, 35, "short half height")?;
    ensure_eq(cluster.rpc(3)?.get_block_count()?, 38, "long half height")?;

    info!("healing the network");
    cluster.heal()?;
    cluster.sync_all()?;
    for index in 0..4 {
        ensure_eq(
            cluster.rpc(index)?.get_best_block_hash()?,
            long_tip.clone(),
            "best block after heal",
        )?;
    }

    let address = cluster.rpc(0)?.get_new_address()?;
    let txid = cluster.rpc(3)?.send_to_address(&address, 10.0)?;
    cluster.sync_mempools(&[0, 1, 2, 3])?;
    ensure_eq(cluster.rpc(0)?.get_raw_mempool()?, vec![txid.clone()], "mempool")?;

    let mined = mine_and_sync(cluster, 1, 1)?;
    cluster.sync_mempools(&[0, 1, 2, 3])?;
    ensure!(
        cluster.rpc(2)?.get_raw_mempool()?.is_empty(),
        "mempool not cleared after mining"
    );
    let block = cluster.rpc(0)?.get_block(&mined[0])?;
    ensure!(block.tx.contains(&txid), "transaction {txid} missing from block");
    Ok(())
}
