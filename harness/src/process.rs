//! Daemon process lifecycle.
//!
//! This module is the only place that spawns, signals or reaps a daemon
//! child process. Everything above it works with [`NodeHandle`]s owned by a
//! [`Cluster`](crate::cluster::Cluster).

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{write_masternode_conf, DaemonConf, HarnessConfig};
use crate::error::{HarnessError, HarnessResult};
use crate::ports::NodePorts;
use crate::rpc::RpcClient;

const STARTUP_POLL: Duration = Duration::from_millis(100);
const DEFAULT_DAEMON_ARGS: [&str; 3] = ["-keypool=1", "-discover=0", "-rest"];

/// Arguments a node was started with, kept so the node can be restarted
/// identically by topology changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeLaunch {
    pub extra_args: Vec<String>,
    pub mn_config_lines: Vec<String>,
}

#[derive(Debug)]
pub struct NodeHandle {
    index: usize,
    datadir: PathBuf,
    ports: NodePorts,
    rpc: RpcClient,
    launch: NodeLaunch,
    child: Child,
}

impl NodeHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn ports(&self) -> NodePorts {
        self.ports
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn launch(&self) -> &NodeLaunch {
        &self.launch
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Address other nodes use to reach this node's p2p listener.
    pub fn p2p_address(&self) -> String {
        p2p_address(self.ports)
    }

    fn exited(&mut self) -> HarnessResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(node = self.index, pid = self.child.id(), "killing daemon still running");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub fn p2p_address(ports: NodePorts) -> String {
    format!("127.0.0.1:{}", ports.p2p)
}

/// Writes the data directory and config files, launches the daemon and blocks
/// until it answers RPC.
pub(crate) fn spawn_node(
    config: &HarnessConfig,
    index: usize,
    ports: NodePorts,
    launch: NodeLaunch,
) -> HarnessResult<NodeHandle> {
    let datadir = config.datadir(index);
    DaemonConf {
        ports,
        credentials: config.credentials.clone(),
    }
    .write(&datadir)?;
    write_masternode_conf(&datadir, &launch.mn_config_lines)?;

    let mut command = Command::new(&config.daemon_binary);
    command
        .arg(format!("-datadir={}", datadir.display()))
        .args(DEFAULT_DAEMON_ARGS)
        .args(&config.base_args)
        .args(&launch.extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    let child = command.spawn().map_err(|source| HarnessError::ProcessSpawn {
        index,
        binary: config.daemon_binary.clone(),
        source,
    })?;
    let rpc = RpcClient::local(ports.rpc, &config.credentials, config.effective_rpc_timeout())?
        .with_trace(config.trace_rpc);
    let mut handle = NodeHandle {
        index,
        datadir,
        ports,
        rpc,
        launch,
        child,
    };
    info!(node = index, pid = handle.pid(), p2p = ports.p2p, rpc = ports.rpc, "daemon launched");

    // Dropping the handle on error kills the half-started daemon.
    match &config.cli_binary {
        Some(cli) => wait_with_cli(&mut handle, cli, config.effective_startup_timeout())?,
        None => wait_with_rpc(&mut handle, config.effective_startup_timeout())?,
    }
    info!(node = index, "daemon answering rpc");
    Ok(handle)
}

fn wait_with_rpc(handle: &mut NodeHandle, timeout: Duration) -> HarnessResult<()> {
    let started = Instant::now();
    loop {
        if let Some(status) = handle.exited()? {
            return Err(HarnessError::EarlyExit {
                index: handle.index,
                status,
            });
        }
        match handle.rpc.get_block_count() {
            Ok(_) => return Ok(()),
            Err(err) if err.is_transient() => {
                debug!(node = handle.index, %err, "daemon not ready");
            }
            Err(err) => return Err(err),
        }
        if started.elapsed() >= timeout {
            return Err(HarnessError::StartupTimeout {
                index: handle.index,
                waited: started.elapsed(),
            });
        }
        thread::sleep(STARTUP_POLL);
    }
}

/// Runs `<cli> -datadir=<dir> -rpcwait getblockcount` while watching the daemon.
fn wait_with_cli(handle: &mut NodeHandle, cli: &Path, timeout: Duration) -> HarnessResult<()> {
    let mut probe = Command::new(cli)
        .arg(format!("-datadir={}", handle.datadir.display()))
        .args(["-rpcwait", "getblockcount"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| HarnessError::ProcessSpawn {
            index: handle.index,
            binary: cli.to_path_buf(),
            source,
        })?;
    let started = Instant::now();
    let outcome = loop {
        if let Some(status) = handle.exited()? {
            break Err(HarnessError::EarlyExit {
                index: handle.index,
                status,
            });
        }
        if let Some(status) = probe.try_wait()? {
            break if status.success() {
                Ok(())
            } else {
                Err(HarnessError::Protocol(format!(
                    "liveness probe for node {} exited with {status}",
                    handle.index
                )))
            };
        }
        if started.elapsed() >= timeout {
            break Err(HarnessError::StartupTimeout {
                index: handle.index,
                waited: started.elapsed(),
            });
        }
        thread::sleep(STARTUP_POLL);
    };
    if let Ok(None) = probe.try_wait() {
        let _ = probe.kill();
        let _ = probe.wait();
    }
    outcome
}

/// Sends `stop` and waits for the process to exit, killing it once
/// `timeout` has passed.
pub(crate) fn shutdown_node(mut handle: NodeHandle, timeout: Duration) -> HarnessResult<()> {
    let index = handle.index;
    match handle.rpc.stop() {
        Ok(_) => {}
        // The daemon may close the connection before replying, or be gone already.
        Err(err @ HarnessError::Unreachable { .. }) => {
            debug!(node = index, %err, "stop not acknowledged");
        }
        Err(err) => warn!(node = index, %err, "stop rejected"),
    }
    let started = Instant::now();
    loop {
        if let Some(status) = handle.exited()? {
            info!(node = index, %status, "daemon stopped");
            return Ok(());
        }
        if started.elapsed() >= timeout {
            let _ = handle.child.kill();
            let _ = handle.child.wait();
            return Err(HarnessError::ShutdownTimeout {
                index,
                waited: started.elapsed(),
            });
        }
        thread::sleep(STARTUP_POLL);
    }
}

/// Kills the daemon without asking it to stop; used for nodes presumed crashed.
pub(crate) fn kill_node(mut handle: NodeHandle) {
    let _ = handle.child.kill();
    let _ = handle.child.wait();
}
