//! A broadcast presigned on the cold node is stored on the hot node,
//! survives a restart there and later starts the masternode.

use std::process::ExitCode;

use anyhow::{ensure, Result};
use clap::Parser;
use harness::assert::{ensure_eq, expect_rpc_error};
use harness::mocktime::DEFAULT_MOCK_TIME;
use harness::{
    scenario, wait_for_mnsync, ActivationPhase, ActivationPolicy, Cluster, MasternodeActivation,
    MasternodeConfigLine,
};
use scenarios::{mine_and_sync, require_daemon, Cli};
use tracing::info;

const COLD: usize = 0;
const HOT: usize = 1;
const ALIAS: &str = "mn";

fn main() -> ExitCode {
    let cli = Cli::parse();
    scenario::run(cli.options, run)
}

fn start_pair(cluster: &mut Cluster, config_line: Option<&MasternodeConfigLine>) -> Result<()> {
    let lines: Vec<String> = config_line.map(ToString::to_string).into_iter().collect();
    let hot_args = match config_line {
        Some(_) => vec![format!("-masternode={ALIAS}")],
        None => Vec::new(),
    };
    cluster.start_node(COLD, &[], &lines)?;
    cluster.start_node(HOT, &hot_args, &lines)?;
    cluster.connect_bidirectional(COLD, HOT)?;
    Ok(())
}

fn run(cluster: &mut Cluster) -> Result<()> {
    require_daemon(cluster)?;
    start_pair(cluster, None)?;
    cluster.set_absolute(DEFAULT_MOCK_TIME)?;

    info!("funding masternode");
    mine_and_sync(cluster, COLD, 30)?;
    let mut mn = MasternodeActivation::fund(cluster, COLD, HOT, ALIAS, "copper")?;
    mine_and_sync(cluster, COLD, 1)?;
    let line = MasternodeConfigLine {
        alias: ALIAS.to_string(),
        address: cluster.node(HOT)?.p2p_address(),
        privkey: "hot".to_string(),
        txid: mn.collateral().txhash.clone(),
        vout: mn.collateral().vout,
    };

    info!("updating masternode.conf");
    cluster.stop_all()?;
    start_pair(cluster, Some(&line))?;

    info!("preparing the masternode broadcast");
    mn.prepare_stored(cluster, line.clone())?;
    let (code, message) = expect_rpc_error(cluster.rpc(HOT)?.import_mn_broadcast("invalid"))?;
    info!(code, %message, "garbage broadcast rejected");
    mn.import_on(cluster, HOT)?;
    ensure!(
        cluster.rpc(COLD)?.list_mn_broadcasts()?.is_empty(),
        "cold node stored a broadcast"
    );

    info!("restarting nodes");
    cluster.stop_all()?;
    start_pair(cluster, Some(&line))?;
    mn.host_restarted();
    ensure_eq(mn.phase(), ActivationPhase::BroadcastPrepared, "phase after restart")?;
    let stored = cluster.rpc(HOT)?.list_mn_broadcasts()?;
    ensure_eq(stored.len(), 1, "stored broadcasts")?;
    ensure_eq(stored[0].txhash.clone(), line.txid.clone(), "stored collateral")?;

    // Let the ping inside the stored broadcast expire; starting must refresh it.
    for _ in 0..100 {
        cluster.advance_by(100)?;
    }
    for index in [COLD, HOT] {
        ensure!(
            cluster.rpc(index)?.list_masternodes()?.is_empty(),
            "node {index} lists a masternode before start"
        );
    }

    info!("starting masternode with stored broadcast");
    mn.start_stored(cluster)?;
    let policy = ActivationPolicy::default();
    mn.wait_locally_active(cluster, &policy)?;
    wait_for_mnsync(cluster, &[COLD, HOT], &policy)?;
    mn.wait_cluster_visible(cluster, &[COLD, HOT], &policy)?;
    Ok(())
}
