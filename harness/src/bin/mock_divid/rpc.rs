//! JSON-RPC 1.0 endpoint on the rpc port.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use harness::error::RPC_IN_WARMUP;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state::{
    NodeState, RpcFailure, RpcOutcome, RPC_INVALID_PARAMETER, RPC_METHOD_NOT_FOUND,
};
use crate::SharedState;

const RPC_PARSE_ERROR: i64 = -32700;
const RPC_TYPE_ERROR: i64 = -3;

#[derive(Clone)]
pub struct RpcState {
    pub node: SharedState,
    /// Expected `Authorization` header value.
    pub auth: String,
    pub ready_at: Instant,
    pub shutdown: Arc<watch::Sender<bool>>,
    pub ignore_stop: bool,
}

pub fn router(state: RpcState) -> Router {
    Router::new().route("/", post(handle)).with_state(state)
}

async fn handle(State(rpc): State<RpcState>, headers: HeaderMap, body: String) -> Response {
    let presented = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if presented != Some(rpc.auth.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        return reply(Value::Null, Err(RpcFailure::new(RPC_PARSE_ERROR, "Parse error")));
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let params = match request.get("params") {
        Some(Value::Array(params)) => params.as_slice(),
        _ => &[],
    };
    if Instant::now() < rpc.ready_at {
        return reply(
            id,
            Err(RpcFailure::new(RPC_IN_WARMUP, "Loading block index...")),
        );
    }
    debug!(method, ?params, "rpc call");
    let outcome = if method == "stop" {
        if rpc.ignore_stop {
            warn!("ignoring stop request");
        } else {
            info!("stop requested over rpc");
            let _ = rpc.shutdown.send(true);
        }
        Ok(json!("Divi server stopping"))
    } else {
        let mut node = rpc.node.lock();
        dispatch(&mut node, method, params)
    };
    reply(id, outcome)
}

fn reply(id: Value, outcome: RpcOutcome) -> Response {
    match outcome {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({ "result": result, "error": null, "id": id })),
        )
            .into_response(),
        Err(failure) => {
            let status = if failure.code == RPC_METHOD_NOT_FOUND {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let body = json!({
                "result": null,
                "error": { "code": failure.code, "message": failure.message },
                "id": id,
            });
            (status, Json(body)).into_response()
        }
    }
}

fn missing(index: usize) -> RpcFailure {
    RpcFailure::new(RPC_INVALID_PARAMETER, format!("missing parameter {index}"))
}

fn text(params: &[Value], index: usize) -> Result<&str, RpcFailure> {
    match params.get(index) {
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(RpcFailure::new(
            RPC_TYPE_ERROR,
            format!("parameter {index} must be a string"),
        )),
        None => Err(missing(index)),
    }
}

/// Integers may arrive as JSON numbers or as decimal strings.
fn integer(params: &[Value], index: usize) -> Result<i64, RpcFailure> {
    let value = params.get(index).ok_or_else(|| missing(index))?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| {
            RpcFailure::new(
                RPC_TYPE_ERROR,
                format!("parameter {index} must be an integer"),
            )
        })
}

fn amount(params: &[Value], index: usize) -> Result<f64, RpcFailure> {
    params
        .get(index)
        .ok_or_else(|| missing(index))?
        .as_f64()
        .ok_or_else(|| RpcFailure::new(RPC_TYPE_ERROR, "Amount is not a number"))
}

fn flag(params: &[Value], index: usize) -> bool {
    params.get(index).and_then(Value::as_bool).unwrap_or(false)
}

fn non_negative(value: i64, what: &str) -> Result<u64, RpcFailure> {
    u64::try_from(value)
        .map_err(|_| RpcFailure::new(RPC_INVALID_PARAMETER, format!("{what} out of range")))
}

pub fn dispatch(node: &mut NodeState, method: &str, params: &[Value]) -> RpcOutcome {
    match method {
        "getblockcount" => Ok(node.block_count()),
        "getbestblockhash" => Ok(node.best_block_hash()),
        "getblockhash" => {
            let height = non_negative(integer(params, 0)?, "Block height")
                .map_err(|_| RpcFailure::new(RPC_INVALID_PARAMETER, "Block height out of range"))?;
            node.block_hash(height)
        }
        "getblock" => node.block(text(params, 0)?),
        "getrawmempool" => Ok(node.raw_mempool()),
        "setgenerate" => {
            if !flag(params, 0) {
                return Ok(Value::Null);
            }
            let count = match params.get(1) {
                Some(_) => non_negative(integer(params, 1)?, "Block count")?,
                None => 1,
            };
            Ok(node.generate(count))
        }
        "getnewaddress" => Ok(node.new_address()),
        "sendtoaddress" => node.send_to_address(text(params, 0)?, amount(params, 1)?),
        "setmocktime" => {
            node.set_mock_time(integer(params, 0)?);
            Ok(Value::Null)
        }
        "addnode" => {
            let addr = text(params, 0)?;
            match text(params, 1)? {
                "add" | "onetry" => node.add_peer(addr),
                "remove" => node.remove_peer(addr),
                other => {
                    return Err(RpcFailure::new(
                        RPC_INVALID_PARAMETER,
                        format!("unknown addnode command {other}"),
                    ))
                }
            }
            Ok(Value::Null)
        }
        "getpeerinfo" => Ok(node.peer_info()),
        "allocatefunds" => {
            if text(params, 0)? != "masternode" {
                return Err(RpcFailure::new(
                    RPC_INVALID_PARAMETER,
                    "only masternode funds can be allocated",
                ));
            }
            node.allocate_funds(text(params, 1)?, text(params, 2)?)
        }
        "getrawtransaction" => node.raw_transaction(text(params, 0)?),
        "validateaddress" => Ok(node.validate_address(text(params, 0)?)),
        "setupmasternode" => {
            let vout = u32::try_from(integer(params, 2)?)
                .map_err(|_| RpcFailure::new(RPC_INVALID_PARAMETER, "vout out of range"))?;
            Ok(node.setup_masternode(
                text(params, 0)?,
                text(params, 1)?,
                vout,
                text(params, 3)?,
                text(params, 4)?,
            ))
        }
        "signmessage" => node.sign_message(text(params, 0)?, text(params, 1)?),
        "signmnbroadcast" => node.sign_mn_broadcast(text(params, 0)?),
        "broadcaststartmasternode" => {
            node.broadcast_start_masternode(text(params, 0)?, text(params, 1)?)
        }
        "startmasternode" => node.start_masternode(text(params, 0)?, flag(params, 1)),
        "importmnbroadcast" => node.import_mn_broadcast(text(params, 0)?),
        "listmnbroadcasts" => Ok(node.list_mn_broadcasts()),
        "getmasternodestatus" => node.masternode_status(),
        "listmasternodes" => Ok(node.list_masternodes()),
        "mnsync" => match text(params, 0)? {
            "status" => Ok(node.mnsync_status()),
            "reset" => Ok(node.mnsync_reset()),
            other => Err(RpcFailure::new(
                RPC_INVALID_PARAMETER,
                format!("unknown mnsync command {other}"),
            )),
        },
        _ => Err(RpcFailure::new(RPC_METHOD_NOT_FOUND, "Method not found")),
    }
}
