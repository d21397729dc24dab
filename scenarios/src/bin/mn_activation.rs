//! A control node funds a masternode hosted on another node, the host
//! activates it and an independent observer sees it enabled.

use std::process::ExitCode;

use anyhow::{ensure, Result};
use clap::Parser;
use harness::masternode::ENABLED;
use harness::mocktime::DEFAULT_MOCK_TIME;
use harness::{
    scenario, wait_for_mnsync, ActivationPhase, ActivationPolicy, BroadcastOrigin, Cluster,
    MasternodeActivation,
};
use scenarios::{mine_and_sync, require_daemon, Cli};
use tracing::info;

const CONTROL: usize = 0;
const HOST: usize = 1;
const OBSERVER: usize = 2;
const ALIAS: &str = "mn1";

fn main() -> ExitCode {
    let cli = Cli::parse();
    scenario::run(cli.options, run)
}

fn run(cluster: &mut Cluster) -> Result<()> {
    require_daemon(cluster)?;
    cluster.start_node(CONTROL, &[], &[])?;
    cluster.start_node(HOST, &[format!("-masternode={ALIAS}")], &[])?;
    cluster.start_node(OBSERVER, &[], &[])?;
    cluster.connect_bidirectional(CONTROL, HOST)?;
    cluster.connect_bidirectional(HOST, OBSERVER)?;
    cluster.set_absolute(DEFAULT_MOCK_TIME)?;
    mine_and_sync(cluster, CONTROL, 30)?;

    info!("funding masternode");
    let mut mn = MasternodeActivation::fund(cluster, CONTROL, HOST, ALIAS, "copper")?;
    mine_and_sync(cluster, CONTROL, 1)?;
    let line = mn.prepare(cluster)?.clone();
    info!(config = %line, "masternode prepared");

    mn.broadcast(cluster, BroadcastOrigin::Control)?;
    mine_and_sync(cluster, CONTROL, 1)?;

    let policy = ActivationPolicy::default();
    mn.wait_locally_active(cluster, &policy)?;
    let observers = [CONTROL, HOST, OBSERVER];
    wait_for_mnsync(cluster, &observers, &policy)?;
    mn.wait_cluster_visible(cluster, &observers, &policy)?;
    ensure!(
        mn.phase() == ActivationPhase::ClusterVisible,
        "activation ended in {:?}",
        mn.phase()
    );

    for index in observers {
        let listed = cluster.rpc(index)?.list_masternodes()?;
        ensure!(listed.len() == 1, "node {index} lists {} masternodes", listed.len());
        ensure!(
            listed[0].txhash == line.txid && listed[0].status == ENABLED,
            "node {index} lists {:?}",
            listed[0]
        );
    }
    Ok(())
}
