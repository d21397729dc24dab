//! Entry point shared by scenario binaries.
//!
//! ```no_run
//! use clap::Parser;
//! use harness::scenario::{self, ScenarioOptions};
//!
//! #[derive(Parser)]
//! struct Cli {
//!     #[command(flatten)]
//!     options: ScenarioOptions,
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     let cli = Cli::parse();
//!     scenario::run(cli.options, |cluster| {
//!         cluster.start_nodes(2)?;
//!         cluster.connect(0, 1)?;
//!         Ok(())
//!     })
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cluster::Cluster;
use crate::config::HarnessConfig;

/// Exit status the runner reads as "skipped".
pub const EXIT_SKIPPED: u8 = 77;

/// Returned from a scenario body to report that it cannot run here.
#[derive(Debug, Error)]
#[error("skipped: {0}")]
pub struct Skip(pub String);

#[derive(Args, Clone, Debug, Default)]
pub struct ScenarioOptions {
    /// Root directory for node data directories; a fresh one is created when absent.
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,
    /// Seed for the port allocator, defaults to the process id.
    #[arg(long)]
    pub portseed: Option<u32>,
    /// Keep the data directories after the run.
    #[arg(long)]
    pub nocleanup: bool,
    /// Directory searched first for the daemon and CLI binaries.
    #[arg(long)]
    pub srcdir: Option<PathBuf>,
    /// Log every JSON-RPC request and response.
    #[arg(long)]
    pub tracerpc: bool,
    /// RPC timeout in seconds.
    #[arg(long = "rpc-timeout")]
    pub rpc_timeout: Option<u64>,
}

impl ScenarioOptions {
    /// Harness configuration from the environment with these options applied.
    pub fn config(&self, tmpdir: &Path) -> HarnessConfig {
        let mut config = HarnessConfig::from_env(tmpdir);
        if let Some(seed) = self.portseed {
            config.port_seed = seed;
        }
        if let Some(srcdir) = &self.srcdir {
            config.daemon_binary = prefer_in(srcdir, config.daemon_binary);
            config.cli_binary = config.cli_binary.map(|cli| prefer_in(srcdir, cli));
        }
        if let Some(secs) = self.rpc_timeout {
            config.rpc_timeout = Duration::from_secs(secs);
        }
        config.trace_rpc = self.tracerpc;
        config
    }
}

fn prefer_in(dir: &Path, binary: PathBuf) -> PathBuf {
    if binary.is_absolute() {
        return binary;
    }
    let candidate = dir.join(&binary);
    if candidate.exists() {
        candidate
    } else {
        binary
    }
}

/// Logs go to stdout; the runner treats anything on stderr as a failure.
fn init_logging(trace_rpc: bool) {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if trace_rpc {
        if let Ok(directive) = "harness::rpc=trace".parse() {
            filter = filter.add_directive(directive);
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .try_init();
}

fn prepare_tmpdir(requested: Option<&Path>) -> Result<PathBuf> {
    match requested {
        Some(path) => {
            fs::create_dir_all(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(path.to_path_buf())
        }
        None => Ok(tempfile::Builder::new()
            .prefix("test")
            .tempdir()
            .context("failed to create temporary directory")?
            .into_path()),
    }
}

/// Runs `body` against a fresh cluster and maps the outcome to the exit code
/// the runner expects: 0 passed, 77 skipped, 1 failed.
pub fn run<F>(options: ScenarioOptions, body: F) -> ExitCode
where
    F: FnOnce(&mut Cluster) -> Result<()>,
{
    init_logging(options.tracerpc);
    let tmpdir = match prepare_tmpdir(options.tmpdir.as_deref()) {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    let config = options.config(&tmpdir);
    info!(tmpdir = %tmpdir.display(), seed = config.port_seed, daemon = %config.daemon_binary.display(), "initializing scenario");

    let mut cluster = Cluster::new(config);
    let outcome = body(&mut cluster);
    if let Err(err) = cluster.stop_all() {
        warn!(%err, "nodes did not stop cleanly");
    }
    drop(cluster);

    if options.nocleanup {
        info!(tmpdir = %tmpdir.display(), "not cleaning up");
    } else if let Err(err) = fs::remove_dir_all(&tmpdir) {
        warn!(%err, tmpdir = %tmpdir.display(), "failed to remove temporary directory");
    }

    match outcome {
        Ok(()) => {
            info!("tests successful");
            ExitCode::SUCCESS
        }
        Err(err) => match err.downcast_ref::<Skip>() {
            Some(skip) => {
                info!(reason = %skip.0, "scenario skipped");
                ExitCode::from(EXIT_SKIPPED)
            }
            None => {
                error!("scenario failed");
                eprintln!("{err:?}");
                ExitCode::FAILURE
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        options: ScenarioOptions,
    }

    #[test]
    fn options_parse_and_apply() {
        let cli = Cli::try_parse_from([
            "scenario",
            "--tmpdir",
            "/tmp/run1",
            "--portseed",
            "7",
            "--nocleanup",
            "--rpc-timeout",
            "90",
            "--tracerpc",
        ])
        .unwrap();
        assert!(cli.options.nocleanup);
        let config = cli.options.config(Path::new("/tmp/run1"));
        assert_eq!(config.port_seed, 7);
        assert_eq!(config.rpc_timeout, Duration::from_secs(90));
        assert!(config.trace_rpc);
        assert_eq!(config.datadir(2), PathBuf::from("/tmp/run1/node2"));
    }

    #[test]
    fn srcdir_is_preferred_when_binary_exists_there() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("divid"), b"").unwrap();
        assert_eq!(
            prefer_in(dir.path(), PathBuf::from("divid")),
            dir.path().join("divid")
        );
        assert_eq!(
            prefer_in(dir.path(), PathBuf::from("divi-cli")),
            PathBuf::from("divi-cli")
        );
        assert_eq!(
            prefer_in(dir.path(), PathBuf::from("/usr/bin/divid")),
            PathBuf::from("/usr/bin/divid")
        );
    }

    #[test]
    fn skip_and_failure_map_to_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let options = ScenarioOptions {
            tmpdir: Some(dir.path().join("skip")),
            ..ScenarioOptions::default()
        };
        let code = run(options, |_| Err(Skip("no wallet".into()).into()));
        assert_eq!(code, ExitCode::from(EXIT_SKIPPED));
        assert!(!dir.path().join("skip").exists());

        let options = ScenarioOptions {
            tmpdir: Some(dir.path().join("kept")),
            nocleanup: true,
            ..ScenarioOptions::default()
        };
        let code = run(options, |cluster| {
            cluster.node(0)?;
            Ok(())
        });
        assert_eq!(code, ExitCode::FAILURE);
        assert!(dir.path().join("kept").exists());
    }
}
