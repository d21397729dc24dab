//! Pull-based block, mempool and broadcast relay between peers.
//!
//! Each node serves its state on `GET /p2p/state` and pulls every peer's
//! state on a fixed interval. A peer that cannot be reached is dropped, like
//! a disconnected socket on the real network.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::state::PeerSnapshot;
use crate::SharedState;

const SYNC_INTERVAL: Duration = Duration::from_millis(100);
const PULL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct StateQuery {
    from: Option<u16>,
}

pub fn router(node: SharedState) -> Router {
    Router::new()
        .route("/p2p/state", get(peer_state))
        .with_state(node)
}

async fn peer_state(
    State(node): State<SharedState>,
    Query(query): Query<StateQuery>,
) -> Json<PeerSnapshot> {
    let mut node = node.lock();
    if let Some(port) = query.from {
        node.register_inbound(&format!("127.0.0.1:{port}"));
    }
    Json(node.export())
}

pub async fn sync_loop(node: SharedState, mut shutdown: watch::Receiver<bool>) {
    let client = match reqwest::Client::builder().timeout(PULL_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!(%err, "p2p client unavailable, relay disabled");
            return;
        }
    };
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }
        let (peers, port) = {
            let node = node.lock();
            (node.peer_addresses(), node.p2p_port())
        };
        for addr in peers {
            match pull(&client, &addr, port).await {
                Ok(snapshot) => {
                    let mut node = node.lock();
                    node.mark_handshake(&addr);
                    node.absorb(snapshot);
                }
                Err(err) => {
                    debug!(peer = %addr, %err, "pull failed");
                    warn!(peer = %addr, "peer unreachable, disconnecting");
                    node.lock().remove_peer(&addr);
                }
            }
        }
    }
}

async fn pull(client: &reqwest::Client, addr: &str, port: u16) -> reqwest::Result<PeerSnapshot> {
    client
        .get(format!("http://{addr}/p2p/state?from={port}"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}
