//! Client mode, standing in for `divi-cli -rpcwait <command>`.

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use harness::config::DaemonConf;
use harness::rpc::RpcClient;

use crate::args::DaemonArgs;

const RETRY: Duration = Duration::from_millis(100);

pub fn run(args: &DaemonArgs) -> Result<ExitCode> {
    let conf = DaemonConf::read(&args.datadir).context("reading divi.conf")?;
    let rpc = RpcClient::local(conf.ports.rpc, &conf.credentials, Duration::from_secs(30))?;
    let command = args
        .command
        .first()
        .map(String::as_str)
        .unwrap_or("getblockcount");
    loop {
        let result = match command {
            "getblockcount" => rpc.get_block_count().map(|height| height.to_string()),
            "getbestblockhash" => rpc.get_best_block_hash(),
            other => bail!("unsupported command {other}"),
        };
        match result {
            Ok(output) => {
                println!("{output}");
                return Ok(ExitCode::SUCCESS);
            }
            Err(err) if args.rpcwait && err.is_transient() => thread::sleep(RETRY),
            Err(err) => return Err(err.into()),
        }
    }
}
