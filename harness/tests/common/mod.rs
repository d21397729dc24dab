#![allow(dead_code)]

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use harness::{Cluster, HarnessConfig};
use tempfile::TempDir;

pub fn mock_daemon() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock-divid"))
}

/// Config pointing at the mock daemon with short timeouts; each test passes
/// its own port seed so tests can run in parallel.
pub fn mock_config(dir: &TempDir, seed: u32) -> HarnessConfig {
    let mut config = HarnessConfig::with_tmpdir(dir.path())
        .with_daemon(mock_daemon())
        .with_port_seed(seed)
        .with_poll_interval(Duration::from_millis(50));
    config.startup_timeout = Duration::from_secs(20);
    config.shutdown_timeout = Duration::from_secs(10);
    config.sync_timeout = Duration::from_secs(30);
    config.rpc_timeout = Duration::from_secs(10);
    config
}

/// Kills node `index` behind the cluster's back, leaving its slot occupied,
/// and returns once its RPC port stopped answering.
pub fn crash_node(cluster: &Cluster, index: usize) {
    let pid = cluster.node(index).expect("running node").pid();
    let status = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("kill");
    assert!(status.success());
    let started = Instant::now();
    while cluster.rpc(index).expect("slot kept").get_block_count().is_ok() {
        assert!(started.elapsed() < Duration::from_secs(10), "node {index} survived kill");
        thread::sleep(Duration::from_millis(20));
    }
}

/// Cluster that stops its nodes before its temp directory goes away.
pub struct TestCluster {
    pub cluster: Cluster,
    _dir: TempDir,
}

impl TestCluster {
    pub fn new(seed: u32) -> Self {
        Self::with_config(seed, |_| {})
    }

    pub fn with_config(seed: u32, adjust: impl FnOnce(&mut HarnessConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = mock_config(&dir, seed);
        adjust(&mut config);
        Self {
            cluster: Cluster::new(config),
            _dir: dir,
        }
    }
}

impl Deref for TestCluster {
    type Target = Cluster;

    fn deref(&self) -> &Cluster {
        &self.cluster
    }
}

impl DerefMut for TestCluster {
    fn deref_mut(&mut self) -> &mut Cluster {
        &mut self.cluster
    }
}
