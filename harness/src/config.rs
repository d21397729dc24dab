use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::NodePorts;

pub const DAEMON_ENV: &str = "BITCOIND";
pub const CLI_ENV: &str = "BITCOINCLI";
pub const SLOW_MODE_ENV: &str = "QA_SLOW_MODE";
pub const DEFAULT_DAEMON: &str = "divid";
pub const CONF_FILE: &str = "divi.conf";
pub const NETWORK_DIR: &str = "regtest";
pub const MASTERNODE_CONF_FILE: &str = "masternode.conf";
const SLOW_MODE_FACTOR: u32 = 4;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCredentials {
    pub user: String,
    pub password: String,
}

impl Default for RpcCredentials {
    fn default() -> Self {
        Self {
            user: "rt".to_string(),
            password: "rt".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub daemon_binary: PathBuf,
    /// When set, startup liveness is probed with `<cli> -rpcwait getblockcount`
    /// instead of polling the RPC port directly.
    pub cli_binary: Option<PathBuf>,
    pub tmpdir: PathBuf,
    pub port_seed: u32,
    pub credentials: RpcCredentials,
    pub rpc_timeout: Duration,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub poll_interval: Duration,
    pub sync_timeout: Duration,
    pub base_args: Vec<String>,
    pub trace_rpc: bool,
    pub slow_mode: bool,
}

impl HarnessConfig {
    pub fn with_tmpdir(path: impl AsRef<Path>) -> Self {
        Self {
            tmpdir: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Applies `BITCOIND`, `BITCOINCLI` and `QA_SLOW_MODE` from the environment.
    pub fn from_env(tmpdir: impl AsRef<Path>) -> Self {
        let mut config = Self::with_tmpdir(tmpdir);
        if let Some(daemon) = std::env::var_os(DAEMON_ENV).filter(|v| !v.is_empty()) {
            config.daemon_binary = PathBuf::from(daemon);
        }
        config.cli_binary = std::env::var_os(CLI_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        config.slow_mode = std::env::var(SLOW_MODE_ENV)
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);
        config
    }

    pub fn with_port_seed(mut self, seed: u32) -> Self {
        self.port_seed = seed;
        self
    }

    pub fn with_daemon(mut self, binary: impl Into<PathBuf>) -> Self {
        self.daemon_binary = binary.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Timeouts scaled for instrumented runs where the daemon is much slower.
    pub fn effective_rpc_timeout(&self) -> Duration {
        self.scaled(self.rpc_timeout)
    }

    pub fn effective_startup_timeout(&self) -> Duration {
        self.scaled(self.startup_timeout)
    }

    pub fn effective_sync_timeout(&self) -> Duration {
        self.scaled(self.sync_timeout)
    }

    pub fn datadir(&self, index: usize) -> PathBuf {
        self.tmpdir.join(format!("node{index}"))
    }

    fn scaled(&self, base: Duration) -> Duration {
        if self.slow_mode {
            base * SLOW_MODE_FACTOR
        } else {
            base
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            daemon_binary: PathBuf::from(DEFAULT_DAEMON),
            cli_binary: None,
            tmpdir: std::env::temp_dir(),
            port_seed: std::process::id(),
            credentials: RpcCredentials::default(),
            rpc_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            sync_timeout: Duration::from_secs(60),
            base_args: Vec::new(),
            trace_rpc: false,
            slow_mode: false,
        }
    }
}

/// Contents of the generated `divi.conf`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonConf {
    pub ports: NodePorts,
    pub credentials: RpcCredentials,
}

impl DaemonConf {
    pub fn render(&self) -> String {
        format!(
            "allowunencryptedwallet=1\nregtest=1\nrpcuser={}\nrpcpassword={}\nport={}\nrpcport={}\n",
            self.credentials.user, self.credentials.password, self.ports.p2p, self.ports.rpc
        )
    }

    /// Creates `<datadir>/regtest` and writes `<datadir>/divi.conf`.
    pub fn write(&self, datadir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(datadir.join(NETWORK_DIR))?;
        let path = datadir.join(CONF_FILE);
        fs::write(&path, self.render())?;
        Ok(path)
    }

    /// Parses `key=value` lines; unknown keys are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let mut user = None;
        let mut password = None;
        let mut p2p = None;
        let mut rpc = None;
        for line in text.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            match key {
                "rpcuser" => user = Some(value.to_string()),
                "rpcpassword" => password = Some(value.to_string()),
                "port" => p2p = value.parse().ok(),
                "rpcport" => rpc = value.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            ports: NodePorts { p2p: p2p?, rpc: rpc? },
            credentials: RpcCredentials {
                user: user?,
                password: password?,
            },
        })
    }

    pub fn read(datadir: &Path) -> std::io::Result<Self> {
        let path = datadir.join(CONF_FILE);
        let text = fs::read_to_string(&path)?;
        Self::parse(&text).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} lacks rpc credentials or ports", path.display()),
            )
        })
    }
}

pub fn read_masternode_conf(datadir: &Path) -> std::io::Result<Vec<String>> {
    let path = datadir.join(NETWORK_DIR).join(MASTERNODE_CONF_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

pub fn write_masternode_conf(datadir: &Path, lines: &[String]) -> std::io::Result<PathBuf> {
    let path = datadir.join(NETWORK_DIR).join(MASTERNODE_CONF_FILE);
    fs::write(&path, lines.join("\n"))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn conf_matches_daemon_contract() {
        let conf = DaemonConf {
            ports: NodePorts {
                p2p: 11_001,
                rpc: 12_001,
            },
            credentials: RpcCredentials::default(),
        };
        assert_eq!(
            conf.render(),
            "allowunencryptedwallet=1\nregtest=1\nrpcuser=rt\nrpcpassword=rt\nport=11001\nrpcport=12001\n"
        );
    }

    #[test]
    fn write_creates_network_subdir() {
        let dir = tempdir().expect("tempdir");
        let datadir = dir.path().join("node0");
        let conf = DaemonConf {
            ports: NodePorts {
                p2p: 11_000,
                rpc: 12_000,
            },
            credentials: RpcCredentials::default(),
        };
        let path = conf.write(&datadir).expect("write conf");
        assert_eq!(path, datadir.join("divi.conf"));
        assert!(datadir.join("regtest").is_dir());
        let mn = write_masternode_conf(&datadir, &["mn1 127.0.0.1:11000 key txid 1".into()])
            .expect("write masternode.conf");
        assert_eq!(
            fs::read_to_string(mn).unwrap(),
            "mn1 127.0.0.1:11000 key txid 1"
        );
        assert_eq!(DaemonConf::read(&datadir).expect("read conf"), conf);
        assert_eq!(
            read_masternode_conf(&datadir).expect("read masternode.conf"),
            vec!["mn1 127.0.0.1:11000 key txid 1".to_string()]
        );
    }

    #[test]
    fn parse_requires_credentials_and_ports() {
        assert!(DaemonConf::parse("regtest=1\nrpcuser=rt\nport=1\nrpcport=2\n").is_none());
        let conf = DaemonConf::parse("rpcuser=a\nrpcpassword=b\nport=11003\nrpcport=12003").unwrap();
        assert_eq!(conf.ports.rpc, 12_003);
        assert_eq!(conf.credentials.password, "b");
    }

    #[test]
    fn slow_mode_scales_timeouts() {
        let mut config = HarnessConfig::with_tmpdir("/tmp/x");
        assert_eq!(config.effective_rpc_timeout(), Duration::from_secs(30));
        config.slow_mode = true;
        assert_eq!(config.effective_rpc_timeout(), Duration::from_secs(120));
        assert_eq!(config.datadir(3), PathBuf::from("/tmp/x/node3"));
    }
}
