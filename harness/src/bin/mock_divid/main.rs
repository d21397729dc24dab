//! Stand-in for `divid` used by the harness's own integration tests.
//!
//! Speaks the daemon's regtest JSON-RPC dialect on the configured rpc port,
//! relays blocks, transactions and masternode broadcasts with its peers, and
//! keeps its chain and wallet in `<datadir>/regtest/mockchain.json` across
//! restarts. Diagnostics go to `<datadir>/regtest/debug.log`.

mod args;
mod chain;
mod client;
mod p2p;
mod rpc;
mod state;

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use harness::config::{read_masternode_conf, DaemonConf, NETWORK_DIR};
use harness::masternode::MasternodeConfigLine;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::DaemonArgs;
use crate::state::NodeState;

pub type SharedState = Arc<Mutex<NodeState>>;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    let outcome = DaemonArgs::parse(std::env::args().skip(1)).and_then(|args| {
        if args.rpcwait || !args.command.is_empty() {
            client::run(&args)
        } else {
            run_daemon(args)
        }
    });
    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("mock-divid: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(network_dir: &Path) -> Result<()> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(network_dir.join("debug.log"))
        .context("opening debug.log")?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log))
        .init();
    Ok(())
}

fn run_daemon(args: DaemonArgs) -> Result<ExitCode> {
    let network_dir = args.datadir.join(NETWORK_DIR);
    fs::create_dir_all(&network_dir)
        .with_context(|| format!("creating {}", network_dir.display()))?;
    init_logging(&network_dir)?;
    info!(pid = std::process::id(), datadir = %args.datadir.display(), "mock daemon starting");
    if args.fail {
        error!("startup failure requested");
        return Ok(ExitCode::FAILURE);
    }

    let conf = DaemonConf::read(&args.datadir).context("reading divi.conf")?;
    let mut mn_conf = Vec::new();
    for line in read_masternode_conf(&args.datadir)? {
        match line.parse::<MasternodeConfigLine>() {
            Ok(entry) => mn_conf.push(entry),
            Err(err) => warn!(%err, "ignoring masternode.conf line"),
        }
    }
    let node = NodeState::open(&network_dir, conf.ports.p2p, args.masternode.clone(), mn_conf)?;
    let node = Arc::new(Mutex::new(node));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(serve(args, conf, node))?;
    Ok(ExitCode::SUCCESS)
}

async fn serve(args: DaemonArgs, conf: DaemonConf, node: SharedState) -> Result<()> {
    if args.stall {
        warn!("stalling before opening any port");
        std::future::pending::<()>().await;
    }
    let (shutdown, mut stop_requested) = watch::channel(false);
    let shutdown = Arc::new(shutdown);
    let rpc_listener = TcpListener::bind(("127.0.0.1", conf.ports.rpc))
        .await
        .with_context(|| format!("binding rpc port {}", conf.ports.rpc))?;
    let p2p_listener = TcpListener::bind(("127.0.0.1", conf.ports.p2p))
        .await
        .with_context(|| format!("binding p2p port {}", conf.ports.p2p))?;

    let credentials = format!("{}:{}", conf.credentials.user, conf.credentials.password);
    let rpc_state = rpc::RpcState {
        node: node.clone(),
        auth: format!("Basic {}", STANDARD.encode(credentials)),
        ready_at: Instant::now() + args.warmup,
        shutdown: shutdown.clone(),
        ignore_stop: args.ignore_stop,
    };
    let rpc_server = tokio::spawn({
        let stop = stop_requested.clone();
        async move {
            axum::serve(rpc_listener, rpc::router(rpc_state))
                .with_graceful_shutdown(stopped(stop))
                .await
        }
    });
    let p2p_server = tokio::spawn({
        let stop = stop_requested.clone();
        let router = p2p::router(node.clone());
        async move {
            axum::serve(p2p_listener, router)
                .with_graceful_shutdown(stopped(stop))
                .await
        }
    });
    let sync = tokio::spawn(p2p::sync_loop(node.clone(), stop_requested.clone()));
    info!(rpc = conf.ports.rpc, p2p = conf.ports.p2p, masternode = ?args.masternode, "mock daemon ready");

    tokio::select! {
        _ = stop_requested.wait_for(|stop| *stop) => info!("shutting down"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            let _ = shutdown.send(true);
        }
    }
    node.lock().persist()?;
    for server in [rpc_server, p2p_server] {
        match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(%err, "server error during shutdown"),
            Ok(Err(err)) => warn!(%err, "server task failed"),
            Err(_) => warn!("server did not drain in time"),
        }
    }
    sync.abort();
    info!("mock daemon stopped");
    Ok(())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
