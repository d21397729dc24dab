//! Helpers shared by the scenario binaries.

use std::path::{Path, PathBuf};

use clap::Parser;
use harness::{Cluster, HarnessResult, ScenarioOptions, Skip};

/// Command line every scenario accepts.
#[derive(Debug, Parser)]
pub struct Cli {
    #[command(flatten)]
    pub options: ScenarioOptions,
}

/// Resolves a binary the way `Command` would: paths as given, bare names
/// through `PATH`.
pub fn locate(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(binary))
            .find(|candidate| candidate.is_file())
    })
}

/// Skips the scenario when the configured daemon cannot be found.
pub fn require_daemon(cluster: &Cluster) -> Result<(), Skip> {
    let daemon = &cluster.config().daemon_binary;
    match locate(daemon) {
        Some(_) => Ok(()),
        None => Err(Skip(format!(
            "daemon {} not found; set BITCOIND or pass --srcdir",
            daemon.display()
        ))),
    }
}

/// Mines `blocks` on `miner` and waits until every present node has them.
pub fn mine_and_sync(cluster: &Cluster, miner: usize, blocks: u32) -> HarnessResult<Vec<String>> {
    let hashes = cluster.rpc(miner)?.generate(blocks)?;
    cluster.sync_blocks(&cluster.present_indices())?;
    Ok(hashes)
}
