use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

/// Daemon-style `-flag[=value]` command line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DaemonArgs {
    pub datadir: PathBuf,
    pub masternode: Option<String>,
    /// Accept the process but never open the RPC port.
    pub stall: bool,
    /// Exit with status 1 right after startup.
    pub fail: bool,
    /// Answer RPC with the warm-up error for this long after startup.
    pub warmup: Duration,
    /// Acknowledge `stop` but keep running.
    pub ignore_stop: bool,
    /// Client mode: wait for the daemon's RPC and run `command`.
    pub rpcwait: bool,
    pub command: Vec<String>,
}

impl DaemonArgs {
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parsed = Self::default();
        let mut datadir = None;
        for arg in args.into_iter().map(Into::into) {
            if !parsed.command.is_empty() || !arg.starts_with('-') {
                parsed.command.push(arg);
                continue;
            }
            let (key, value) = match arg.trim_start_matches('-').split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.to_string())),
                None => (arg.trim_start_matches('-').to_string(), None),
            };
            match key.as_str() {
                "datadir" => datadir = value.map(PathBuf::from),
                "masternode" => {
                    parsed.masternode = Some(value.unwrap_or_else(|| "masternode".to_string()))
                }
                "mockstall" => parsed.stall = true,
                "mockfail" => parsed.fail = true,
                "mockwarmup" => {
                    let millis = value.as_deref().unwrap_or("0").parse()?;
                    parsed.warmup = Duration::from_millis(millis);
                }
                "mockignorestop" => parsed.ignore_stop = true,
                "rpcwait" => parsed.rpcwait = true,
                // Real daemon flags the harness passes; they change nothing here.
                _ => {}
            }
        }
        let Some(datadir) = datadir else {
            bail!("-datadir=<dir> is required");
        };
        parsed.datadir = datadir;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_flags() {
        let args = DaemonArgs::parse([
            "-datadir=/tmp/t/node1",
            "-keypool=1",
            "-discover=0",
            "-rest",
            "-masternode=mn1",
            "-mockwarmup=250",
        ])
        .unwrap();
        assert_eq!(args.datadir, PathBuf::from("/tmp/t/node1"));
        assert_eq!(args.masternode.as_deref(), Some("mn1"));
        assert_eq!(args.warmup, Duration::from_millis(250));
        assert!(!args.rpcwait && args.command.is_empty());
        assert!(!args.ignore_stop);
    }

    #[test]
    fn stop_can_be_ignored() {
        let args = DaemonArgs::parse(["-datadir=/d", "-mockignorestop"]).unwrap();
        assert!(args.ignore_stop);
        assert!(args.command.is_empty());
    }

    #[test]
    fn client_mode_collects_the_command() {
        let args =
            DaemonArgs::parse(["-datadir=/d", "-rpcwait", "getblockhash", "-1"]).unwrap();
        assert!(args.rpcwait);
        assert_eq!(args.command, vec!["getblockhash", "-1"]);
        assert!(DaemonArgs::parse(["-rest"]).is_err());
    }
}
