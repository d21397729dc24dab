//! Typed JSON-RPC client for one daemon.
//!
//! Only the calls the harness and its scenarios need are exposed. Transport
//! failures become [`HarnessError::Unreachable`]; an error object returned by
//! the daemon becomes [`HarnessError::RemoteCall`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;
use url::Url;

use crate::config::RpcCredentials;
use crate::error::{HarnessError, HarnessResult};

/// `getmasternodestatus` code for a masternode that started successfully.
pub const MASTERNODE_STARTED: i64 = 4;
/// `mnsync status` value once the masternode sync finished.
pub const MNSYNC_FINISHED: i64 = 999;

#[derive(Clone, Debug)]
pub struct RpcClient {
    client: Client,
    endpoint: Url,
    auth: HeaderValue,
    next_id: Arc<AtomicU64>,
    trace: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddNodeCommand {
    Add,
    Remove,
    OneTry,
}

impl AddNodeCommand {
    fn as_str(&self) -> &'static str {
        match self {
            AddNodeCommand::Add => "add",
            AddNodeCommand::Remove => "remove",
            AddNodeCommand::OneTry => "onetry",
        }
    }
}

impl RpcClient {
    pub fn new(
        endpoint: Url,
        credentials: &RpcCredentials,
        timeout: Duration,
    ) -> HarnessResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| HarnessError::Protocol(err.to_string()))?;
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", credentials.user, credentials.password));
        let auth = HeaderValue::from_str(&format!("Basic {token}"))
            .map_err(|err| HarnessError::Protocol(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            auth,
            next_id: Arc::new(AtomicU64::new(1)),
            trace: false,
        })
    }

    pub fn local(port: u16, credentials: &RpcCredentials, timeout: Duration) -> HarnessResult<Self> {
        let endpoint = Url::parse(&format!("http://127.0.0.1:{port}/"))
            .map_err(|err| HarnessError::Protocol(err.to_string()))?;
        Self::new(endpoint, credentials, timeout)
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn get_block_count(&self) -> HarnessResult<u64> {
        self.call("getblockcount", json!([]))
    }

    pub fn get_best_block_hash(&self) -> HarnessResult<String> {
        self.call("getbestblockhash", json!([]))
    }

    pub fn get_block_hash(&self, height: u64) -> HarnessResult<String> {
        self.call("getblockhash", json!([height]))
    }

    pub fn get_block(&self, hash: &str) -> HarnessResult<BlockInfo> {
        self.call("getblock", json!([hash]))
    }

    pub fn get_raw_mempool(&self) -> HarnessResult<Vec<String>> {
        self.call("getrawmempool", json!([]))
    }

    /// Mines `blocks` blocks on this node and returns their hashes.
    pub fn generate(&self, blocks: u32) -> HarnessResult<Vec<String>> {
        self.call("setgenerate", json!([true, blocks]))
    }

    pub fn get_new_address(&self) -> HarnessResult<String> {
        self.call("getnewaddress", json!([]))
    }

    pub fn send_to_address(&self, address: &str, amount: f64) -> HarnessResult<String> {
        self.call("sendtoaddress", json!([address, amount]))
    }

    pub fn set_mock_time(&self, timestamp: i64) -> HarnessResult<()> {
        self.call("setmocktime", json!([timestamp]))
    }

    pub fn add_node(&self, address: &str, command: AddNodeCommand) -> HarnessResult<()> {
        self.call("addnode", json!([address, command.as_str()]))
    }

    pub fn get_peer_info(&self) -> HarnessResult<Vec<PeerInfo>> {
        self.call("getpeerinfo", json!([]))
    }

    pub fn stop(&self) -> HarnessResult<String> {
        self.call("stop", json!([]))
    }

    pub fn allocate_funds(&self, alias: &str, tier: &str) -> HarnessResult<FundsAllocation> {
        self.call("allocatefunds", json!(["masternode", alias, tier]))
    }

    pub fn get_raw_transaction(&self, txid: &str) -> HarnessResult<RawTransaction> {
        self.call("getrawtransaction", json!([txid, 1]))
    }

    pub fn validate_address(&self, address: &str) -> HarnessResult<AddressValidation> {
        self.call("validateaddress", json!([address]))
    }

    pub fn setup_masternode(
        &self,
        alias: &str,
        txhash: &str,
        vout: u32,
        pubkey: &str,
        host: &str,
    ) -> HarnessResult<MasternodeSetup> {
        self.call(
            "setupmasternode",
            json!([alias, txhash, vout.to_string(), pubkey, host]),
        )
    }

    pub fn sign_message(&self, address: &str, message: &str) -> HarnessResult<String> {
        self.call("signmessage", json!([address, message, "hex", "hex"]))
    }

    pub fn sign_mn_broadcast(&self, broadcast: &str) -> HarnessResult<SignedBroadcast> {
        self.call("signmnbroadcast", json!([broadcast]))
    }

    /// Relays a broadcast; `signature == None` sends the `update_ping` marker
    /// used for broadcasts that already carry their signature.
    pub fn broadcast_start_masternode(
        &self,
        broadcast: &str,
        signature: Option<&str>,
    ) -> HarnessResult<BroadcastOutcome> {
        let signature = signature.unwrap_or("update_ping");
        self.call("broadcaststartmasternode", json!([broadcast, signature]))
    }

    pub fn start_masternode(&self, alias: &str, defer_relay: bool) -> HarnessResult<BroadcastOutcome> {
        if defer_relay {
            self.call("startmasternode", json!([alias, true]))
        } else {
            self.call("startmasternode", json!([alias]))
        }
    }

    pub fn import_mn_broadcast(&self, broadcast: &str) -> HarnessResult<bool> {
        self.call("importmnbroadcast", json!([broadcast]))
    }

    pub fn list_mn_broadcasts(&self) -> HarnessResult<Vec<StoredBroadcast>> {
        self.call("listmnbroadcasts", json!([]))
    }

    pub fn get_masternode_status(&self) -> HarnessResult<MasternodeStatus> {
        self.call("getmasternodestatus", json!([]))
    }

    pub fn list_masternodes(&self) -> HarnessResult<Vec<MasternodeEntry>> {
        self.call("listmasternodes", json!([]))
    }

    pub fn mnsync_status(&self) -> HarnessResult<MnSyncStatus> {
        self.call("mnsync", json!(["status"]))
    }

    pub fn mnsync_reset(&self) -> HarnessResult<Value> {
        self.call("mnsync", json!(["reset"]))
    }

    fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> HarnessResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestEnvelope {
            jsonrpc: "1.0",
            id,
            method,
            params,
        };
        if self.trace {
            trace!(target: "harness::rpc", endpoint = %self.endpoint, id, method, params = %request.params, "->");
        }
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers())
            .json(&request)
            .send()
            .map_err(|err| self.unreachable(err))?;
        let status = response.status();
        let body = response.text().map_err(|err| self.unreachable(err))?;
        if self.trace {
            trace!(target: "harness::rpc", endpoint = %self.endpoint, id, %status, body = %body, "<-");
        }
        // Daemon errors arrive with HTTP 500 and a JSON body, so the status
        // code alone does not decide success.
        let envelope: ResponseEnvelope = serde_json::from_str(&body).map_err(|_| {
            HarnessError::Protocol(format!("{method}: HTTP {status}: {}", body.trim()))
        })?;
        if let Some(error) = envelope.error {
            return Err(HarnessError::RemoteCall {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        serde_json::from_value(envelope.result)
            .map_err(|err| HarnessError::Protocol(format!("{method}: {err}")))
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.auth.clone());
        headers
    }

    fn unreachable(&self, err: reqwest::Error) -> HarnessError {
        HarnessError::Unreachable {
            endpoint: self.endpoint.to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PeerInfo {
    pub addr: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub inbound: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BlockInfo {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    #[serde(default)]
    pub tx: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsAllocation {
    pub txhash: String,
    pub vout: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    pub vout: Vec<TxOutput>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxOutput {
    pub n: u32,
    #[serde(default)]
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AddressValidation {
    pub isvalid: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub pubkey: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MasternodeSetup {
    pub protocol_version: i64,
    pub message_to_sign: String,
    pub config_line: String,
    pub broadcast_data: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SignedBroadcast {
    pub broadcast_data: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BroadcastOutcome {
    pub status: String,
    #[serde(default, rename = "broadcastData")]
    pub broadcast_data: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct StoredBroadcast {
    pub txhash: String,
    pub outidx: u32,
    pub broadcast: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MasternodeStatus {
    pub status: i64,
    pub txhash: String,
    pub outputidx: u32,
    pub message: String,
    #[serde(default)]
    pub addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct MasternodeEntry {
    pub txhash: String,
    pub outidx: u32,
    pub status: String,
    pub addr: String,
    #[serde(default)]
    pub tier: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MnSyncStatus {
    #[serde(rename = "currentMasternodeSyncStatus")]
    pub current: i64,
}

impl MnSyncStatus {
    pub fn is_finished(&self) -> bool {
        self.current == MNSYNC_FINISHED
    }
}
