//! Node state shared by the RPC server, the p2p server and the sync task.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use harness::masternode::{MasternodeConfigLine, ENABLED, STARTED_MESSAGE};
use harness::rpc::{MASTERNODE_STARTED, MNSYNC_FINISHED};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::chain::{
    address_for, is_valid_address, pubkey_for, sha_hex, sign, tier_amount, tier_for_amount, Block,
    BroadcastPayload, Transaction, TxOut, PROTOCOL_VERSION,
};

pub const RPC_MISC_ERROR: i64 = -1;
pub const RPC_WALLET_ERROR: i64 = -4;
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
pub const RPC_INVALID_PARAMETER: i64 = -8;
pub const RPC_DESERIALIZATION_ERROR: i64 = -22;
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;

/// Seconds between a broadcast's signature time and `ENABLED`.
pub const ENABLE_DELAY: i64 = 20;
/// Seconds after the sync anchor until `mnsync status` reports finished.
pub const MNSYNC_DELAY: i64 = 5;
pub const MNSYNC_INITIAL: i64 = 1;

const SNAPSHOT_FILE: &str = "mockchain.json";
const BLOCK_REWARD: f64 = 1250.0;

#[derive(Debug, Error, PartialEq)]
#[error("{message} ({code})")]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type RpcOutcome = Result<Value, RpcFailure>;

/// Collateral allocated by this node's wallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Collateral {
    pub alias: String,
    pub txhash: String,
    pub vout: u32,
    pub address: String,
}

/// A masternode broadcast as relayed on the network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relayed {
    pub payload: BroadcastPayload,
    pub sig_time: i64,
}

/// Everything a peer hands out on `GET /p2p/state`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub blocks: Vec<Block>,
    pub mempool: Vec<Transaction>,
    pub broadcasts: Vec<Relayed>,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    blocks: Vec<Block>,
    #[serde(default)]
    addresses: BTreeSet<String>,
    #[serde(default)]
    collateral: Vec<Collateral>,
    #[serde(default)]
    stored: BTreeMap<String, String>,
    #[serde(default)]
    counter: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Peer {
    pub version: u64,
    pub inbound: bool,
}

pub struct NodeState {
    network_dir: PathBuf,
    p2p_port: u16,
    masternode: Option<String>,
    mn_conf: Vec<MasternodeConfigLine>,
    chain: Vec<Block>,
    mempool: BTreeMap<String, Transaction>,
    addresses: BTreeSet<String>,
    collateral: Vec<Collateral>,
    stored: BTreeMap<String, String>,
    relayed: BTreeMap<String, Relayed>,
    peers: BTreeMap<String, Peer>,
    mocktime: Option<i64>,
    sync_anchor: i64,
    counter: u64,
}

fn system_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl NodeState {
    /// Loads `mockchain.json` from `network_dir` if a previous run left one.
    pub fn open(
        network_dir: &Path,
        p2p_port: u16,
        masternode: Option<String>,
        mn_conf: Vec<MasternodeConfigLine>,
    ) -> Result<Self> {
        let path = network_dir.join(SNAPSHOT_FILE);
        let snapshot = if path.exists() {
            let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Snapshot::default()
        };
        let mut chain = snapshot.blocks;
        if chain.is_empty() {
            chain.push(Block::genesis());
        }
        info!(height = chain.len() - 1, "chain loaded");
        Ok(Self {
            network_dir: network_dir.to_path_buf(),
            p2p_port,
            masternode,
            mn_conf,
            chain,
            mempool: BTreeMap::new(),
            addresses: snapshot.addresses,
            collateral: snapshot.collateral,
            stored: snapshot.stored,
            relayed: BTreeMap::new(),
            peers: BTreeMap::new(),
            mocktime: None,
            sync_anchor: system_time(),
            counter: snapshot.counter,
        })
    }

    pub fn persist(&self) -> Result<()> {
        let snapshot = Snapshot {
            blocks: self.chain.clone(),
            addresses: self.addresses.clone(),
            collateral: self.collateral.clone(),
            stored: self.stored.clone(),
            counter: self.counter,
        };
        let path = self.network_dir.join(SNAPSHOT_FILE);
        fs::write(&path, serde_json::to_vec_pretty(&snapshot)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(height = self.height(), path = %path.display(), "chain persisted");
        Ok(())
    }

    pub fn p2p_port(&self) -> u16 {
        self.p2p_port
    }

    pub fn now(&self) -> i64 {
        self.mocktime.unwrap_or_else(system_time)
    }

    pub fn height(&self) -> u64 {
        (self.chain.len() - 1) as u64
    }

    fn next_nonce(&mut self) -> String {
        self.counter += 1;
        format!("{}:{}", self.p2p_port, self.counter)
    }

    fn confirmed_txids(&self) -> HashSet<&str> {
        self.chain
            .iter()
            .flat_map(|block| block.txs.iter().map(|tx| tx.txid.as_str()))
            .collect()
    }

    fn find_tx(&self, txid: &str) -> Option<(&Transaction, u64)> {
        if let Some(tx) = self.mempool.get(txid) {
            return Some((tx, 0));
        }
        self.chain.iter().find_map(|block| {
            block
                .txs
                .iter()
                .find(|tx| tx.txid == txid)
                .map(|tx| (tx, self.height() - block.height + 1))
        })
    }

    fn confirmed_output(&self, txhash: &str, vout: u32) -> Option<&TxOut> {
        match self.find_tx(txhash) {
            Some((tx, confirmations)) if confirmations > 0 => tx.outputs.get(vout as usize),
            _ => None,
        }
    }

    pub fn set_mock_time(&mut self, timestamp: i64) {
        if timestamp <= 0 {
            self.mocktime = None;
            return;
        }
        self.mocktime = Some(timestamp);
        self.sync_anchor = self.sync_anchor.min(timestamp);
    }

    pub fn block_count(&self) -> Value {
        json!(self.height())
    }

    pub fn best_block_hash(&self) -> Value {
        json!(self.chain[self.chain.len() - 1].hash)
    }

    pub fn block_hash(&self, height: u64) -> RpcOutcome {
        self.chain
            .get(height as usize)
            .map(|block| json!(block.hash))
            .ok_or_else(|| RpcFailure::new(RPC_INVALID_PARAMETER, "Block height out of range"))
    }

    pub fn block(&self, hash: &str) -> RpcOutcome {
        let block = self
            .chain
            .iter()
            .find(|block| block.hash == hash)
            .ok_or_else(|| RpcFailure::new(RPC_INVALID_ADDRESS_OR_KEY, "Block not found"))?;
        Ok(json!({
            "hash": block.hash,
            "height": block.height,
            "time": block.time,
            "previousblockhash": block.prev,
            "confirmations": self.height() - block.height + 1,
            "tx": block.txids(),
        }))
    }

    pub fn raw_mempool(&self) -> Value {
        json!(self.mempool.keys().collect::<Vec<_>>())
    }

    /// Mines `count` blocks on top of the tip, each including the whole mempool.
    pub fn generate(&mut self, count: u64) -> Value {
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let nonce = self.next_nonce();
            let tip = &self.chain[self.chain.len() - 1];
            let height = tip.height + 1;
            let time = self.now();
            let prev = tip.hash.clone();
            let hash = sha_hex(&[&prev, &height.to_string(), &time.to_string(), &nonce]);
            let reward = address_for(&hash);
            let mut txs = vec![Transaction {
                txid: sha_hex(&["coinbase", &hash]),
                outputs: vec![TxOut {
                    value: BLOCK_REWARD,
                    address: reward.clone(),
                }],
                coinbase: true,
            }];
            txs.extend(std::mem::take(&mut self.mempool).into_values());
            self.addresses.insert(reward);
            self.chain.push(Block {
                hash: hash.clone(),
                height,
                time,
                prev,
                txs,
            });
            hashes.push(hash);
        }
        info!(count, height = self.height(), "blocks generated");
        json!(hashes)
    }

    pub fn new_address(&mut self) -> Value {
        let address = address_for(&self.next_nonce());
        self.addresses.insert(address.clone());
        json!(address)
    }

    pub fn send_to_address(&mut self, address: &str, amount: f64) -> RpcOutcome {
        if !is_valid_address(address) {
            return Err(RpcFailure::new(
                RPC_INVALID_ADDRESS_OR_KEY,
                "Invalid Divi address",
            ));
        }
        if amount <= 0.0 {
            return Err(RpcFailure::new(RPC_INVALID_PARAMETER, "Invalid amount"));
        }
        let nonce = self.next_nonce();
        let txid = sha_hex(&["send", &nonce, address, &amount.to_string()]);
        let change = address_for(&txid);
        self.addresses.insert(change.clone());
        self.mempool.insert(
            txid.clone(),
            Transaction {
                txid: txid.clone(),
                outputs: vec![
                    TxOut {
                        value: 0.0,
                        address: change,
                    },
                    TxOut {
                        value: amount,
                        address: address.to_string(),
                    },
                ],
                coinbase: false,
            },
        );
        Ok(json!(txid))
    }

    pub fn raw_transaction(&self, txid: &str) -> RpcOutcome {
        self.find_tx(txid)
            .map(|(tx, confirmations)| tx.describe(confirmations))
            .ok_or_else(|| {
                RpcFailure::new(
                    RPC_INVALID_ADDRESS_OR_KEY,
                    "No information available about transaction",
                )
            })
    }

    pub fn validate_address(&self, address: &str) -> Value {
        if !is_valid_address(address) {
            return json!({ "isvalid": false });
        }
        json!({
            "isvalid": true,
            "address": address,
            "ismine": self.addresses.contains(address),
            "pubkey": pubkey_for(address),
        })
    }

    pub fn sign_message(&self, address: &str, message: &str) -> RpcOutcome {
        if !self.addresses.contains(address) {
            return Err(RpcFailure::new(RPC_WALLET_ERROR, "Private key not available"));
        }
        Ok(json!(sign(&pubkey_for(address), message)))
    }

    /// Sends a masternode collateral to a fresh wallet address at output 1.
    pub fn allocate_funds(&mut self, alias: &str, tier: &str) -> RpcOutcome {
        let amount = tier_amount(tier)
            .ok_or_else(|| RpcFailure::new(RPC_INVALID_PARAMETER, format!("Invalid tier {tier}")))?;
        if self.collateral.iter().any(|record| record.alias == alias) {
            return Err(RpcFailure::new(
                RPC_WALLET_ERROR,
                format!("Collateral for {alias} already allocated"),
            ));
        }
        let nonce = self.next_nonce();
        let txid = sha_hex(&["collateral", &nonce, alias, tier]);
        let address = address_for(&txid);
        self.addresses.insert(address.clone());
        self.mempool.insert(
            txid.clone(),
            Transaction {
                txid: txid.clone(),
                outputs: vec![
                    TxOut {
                        value: 0.0,
                        address: address_for(&nonce),
                    },
                    TxOut {
                        value: amount,
                        address: address.clone(),
                    },
                ],
                coinbase: false,
            },
        );
        self.collateral.push(Collateral {
            alias: alias.to_string(),
            txhash: txid.clone(),
            vout: 1,
            address,
        });
        info!(alias, tier, txhash = %txid, "collateral allocated");
        Ok(json!({ "txhash": txid, "vout": 1 }))
    }

    pub fn setup_masternode(
        &self,
        alias: &str,
        txhash: &str,
        vout: u32,
        collateral_pubkey: &str,
        host: &str,
    ) -> Value {
        let payload = BroadcastPayload {
            alias: alias.to_string(),
            txhash: txhash.to_string(),
            outidx: vout,
            addr: host.to_string(),
            collateral_pubkey: collateral_pubkey.to_string(),
            protocol_version: PROTOCOL_VERSION,
            sig: None,
        };
        let privkey = sha_hex(&["mnkey", alias, txhash]);
        json!({
            "protocol_version": PROTOCOL_VERSION,
            "message_to_sign": payload.message(),
            "config_line": format!("{alias} {host} {privkey} {txhash} {vout}"),
            "broadcast_data": payload.encode(),
        })
    }

    fn wallet_collateral(&self, txhash: &str, vout: u32) -> Option<&Collateral> {
        self.collateral
            .iter()
            .find(|record| record.txhash == txhash && record.vout == vout)
    }

    fn sign_payload(&self, mut payload: BroadcastPayload) -> Result<BroadcastPayload, RpcFailure> {
        let record = self
            .wallet_collateral(&payload.txhash, payload.outidx)
            .ok_or_else(|| RpcFailure::new(RPC_WALLET_ERROR, "Collateral is not in this wallet"))?;
        payload.collateral_pubkey = pubkey_for(&record.address);
        payload.sig = Some(sign(&payload.collateral_pubkey, &payload.message()));
        Ok(payload)
    }

    pub fn sign_mn_broadcast(&self, data: &str) -> RpcOutcome {
        let payload = decode(data)?;
        let signed = self.sign_payload(payload)?;
        Ok(json!({ "broadcast_data": signed.encode() }))
    }

    fn relay(&mut self, payload: BroadcastPayload) {
        let sig_time = self.now();
        info!(alias = %payload.alias, outpoint = %payload.outpoint(), sig_time, "masternode broadcast relayed");
        self.relayed
            .insert(payload.outpoint(), Relayed { payload, sig_time });
    }

    /// `signature` is either a signature over `message_to_sign` or
    /// `update_ping` for a payload that already carries one.
    pub fn broadcast_start_masternode(&mut self, data: &str, signature: &str) -> RpcOutcome {
        let mut payload = decode(data)?;
        let valid = if signature == "update_ping" {
            payload
                .sig
                .as_deref()
                .is_some_and(|sig| payload.signature_valid(sig))
        } else {
            let valid = payload.signature_valid(signature);
            payload.sig = Some(signature.to_string());
            valid
        };
        if !valid {
            return Err(RpcFailure::new(
                RPC_MISC_ERROR,
                "Masternode broadcast signature is invalid",
            ));
        }
        self.relay(payload);
        Ok(json!({ "status": "success" }))
    }

    /// Builds and signs the broadcast for a `masternode.conf` alias whose
    /// collateral this wallet holds.
    fn broadcast_for_alias(&self, alias: &str) -> Result<BroadcastPayload, RpcFailure> {
        let line = self
            .mn_conf
            .iter()
            .find(|line| line.alias == alias)
            .ok_or_else(|| {
                RpcFailure::new(
                    RPC_INVALID_PARAMETER,
                    format!("Could not find alias {alias} in masternode.conf"),
                )
            })?;
        self.sign_payload(BroadcastPayload {
            alias: alias.to_string(),
            txhash: line.txid.clone(),
            outidx: line.vout,
            addr: line.address.clone(),
            collateral_pubkey: String::new(),
            protocol_version: PROTOCOL_VERSION,
            sig: None,
        })
    }

    pub fn start_masternode(&mut self, alias: &str, defer_relay: bool) -> RpcOutcome {
        if defer_relay {
            let payload = self.broadcast_for_alias(alias)?;
            return Ok(json!({ "status": "success", "broadcastData": payload.encode() }));
        }
        let stored = self
            .stored
            .values()
            .filter_map(|data| BroadcastPayload::decode(data))
            .find(|payload| payload.alias == alias);
        let payload = match stored {
            Some(payload) => payload,
            None => self.broadcast_for_alias(alias)?,
        };
        self.relay(payload);
        Ok(json!({ "status": "success" }))
    }

    pub fn import_mn_broadcast(&mut self, data: &str) -> RpcOutcome {
        let payload = decode(data)?;
        if !payload
            .sig
            .as_deref()
            .is_some_and(|sig| payload.signature_valid(sig))
        {
            return Err(RpcFailure::new(
                RPC_INVALID_PARAMETER,
                "Broadcast is not signed",
            ));
        }
        self.stored.insert(payload.outpoint(), payload.encode());
        Ok(json!(true))
    }

    pub fn list_mn_broadcasts(&self) -> Value {
        let entries: Vec<Value> = self
            .stored
            .values()
            .filter_map(|data| BroadcastPayload::decode(data).map(|payload| (payload, data)))
            .map(|(payload, data)| {
                json!({
                    "txhash": payload.txhash,
                    "outidx": payload.outidx,
                    "broadcast": data,
                })
            })
            .collect();
        json!(entries)
    }

    pub fn masternode_status(&self) -> RpcOutcome {
        let alias = self
            .masternode
            .as_deref()
            .ok_or_else(|| RpcFailure::new(RPC_MISC_ERROR, "This is not a masternode"))?;
        let relayed = self
            .relayed
            .values()
            .find(|relayed| relayed.payload.alias == alias)
            .ok_or_else(|| {
                RpcFailure::new(
                    RPC_MISC_ERROR,
                    "Masternode not found in the list of available masternodes",
                )
            })?;
        let payload = &relayed.payload;
        if self
            .confirmed_output(&payload.txhash, payload.outidx)
            .is_none()
        {
            return Err(RpcFailure::new(
                RPC_MISC_ERROR,
                "Masternode collateral is not confirmed",
            ));
        }
        Ok(json!({
            "status": MASTERNODE_STARTED,
            "txhash": payload.txhash,
            "outputidx": payload.outidx,
            "message": STARTED_MESSAGE,
            "addr": payload.addr,
        }))
    }

    fn mnsync_finished(&self) -> bool {
        self.now() - self.sync_anchor >= MNSYNC_DELAY
    }

    pub fn mnsync_status(&self) -> Value {
        let status = if self.mnsync_finished() {
            MNSYNC_FINISHED
        } else {
            MNSYNC_INITIAL
        };
        json!({ "currentMasternodeSyncStatus": status })
    }

    pub fn mnsync_reset(&mut self) -> Value {
        self.sync_anchor = self.now();
        json!("success")
    }

    /// Known masternodes with confirmed collateral; empty while still syncing.
    pub fn list_masternodes(&self) -> Value {
        if !self.mnsync_finished() {
            return json!([]);
        }
        let now = self.now();
        let entries: Vec<Value> = self
            .relayed
            .values()
            .filter_map(|relayed| {
                let payload = &relayed.payload;
                let output = self.confirmed_output(&payload.txhash, payload.outidx)?;
                let status = if now - relayed.sig_time >= ENABLE_DELAY {
                    ENABLED
                } else {
                    "PRE_ENABLED"
                };
                Some(json!({
                    "txhash": payload.txhash,
                    "outidx": payload.outidx,
                    "status": status,
                    "addr": payload.addr,
                    "tier": tier_for_amount(output.value),
                }))
            })
            .collect();
        json!(entries)
    }

    pub fn add_peer(&mut self, addr: &str) {
        self.peers
            .entry(addr.to_string())
            .and_modify(|peer| peer.inbound = false)
            .or_insert(Peer {
                version: 0,
                inbound: false,
            });
    }

    pub fn remove_peer(&mut self, addr: &str) {
        self.peers.remove(addr);
    }

    pub fn register_inbound(&mut self, addr: &str) {
        self.peers.entry(addr.to_string()).or_insert(Peer {
            version: PROTOCOL_VERSION,
            inbound: true,
        });
    }

    pub fn mark_handshake(&mut self, addr: &str) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.version = PROTOCOL_VERSION;
        }
    }

    pub fn peer_addresses(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn peer_info(&self) -> Value {
        let peers: Vec<Value> = self
            .peers
            .iter()
            .map(|(addr, peer)| {
                json!({ "addr": addr, "version": peer.version, "inbound": peer.inbound })
            })
            .collect();
        json!(peers)
    }

    pub fn export(&self) -> PeerSnapshot {
        PeerSnapshot {
            blocks: self.chain.clone(),
            mempool: self.mempool.values().cloned().collect(),
            broadcasts: self.relayed.values().cloned().collect(),
        }
    }

    /// Merges a peer's state: a strictly longer chain with our genesis
    /// replaces ours, mempools and broadcasts are unioned.
    pub fn absorb(&mut self, remote: PeerSnapshot) {
        let same_genesis = remote.blocks.first().map(|block| &block.hash)
            == self.chain.first().map(|block| &block.hash);
        if same_genesis && remote.blocks.len() > self.chain.len() {
            let replaced = std::mem::replace(&mut self.chain, remote.blocks);
            let confirmed: HashSet<String> =
                self.confirmed_txids().into_iter().map(String::from).collect();
            for tx in replaced.into_iter().flat_map(|block| block.txs) {
                if !tx.coinbase && !confirmed.contains(&tx.txid) {
                    self.mempool.insert(tx.txid.clone(), tx);
                }
            }
            info!(height = self.height(), "switched to longer chain");
        }
        for tx in remote.mempool {
            self.mempool.entry(tx.txid.clone()).or_insert(tx);
        }
        let confirmed: HashSet<String> =
            self.confirmed_txids().into_iter().map(String::from).collect();
        self.mempool.retain(|txid, _| !confirmed.contains(txid));
        for incoming in remote.broadcasts {
            let key = incoming.payload.outpoint();
            match self.relayed.get(&key) {
                Some(known) if known.sig_time >= incoming.sig_time => {}
                _ => {
                    self.relayed.insert(key, incoming);
                }
            }
        }
    }
}

fn decode(data: &str) -> Result<BroadcastPayload, RpcFailure> {
    BroadcastPayload::decode(data)
        .ok_or_else(|| RpcFailure::new(RPC_DESERIALIZATION_ERROR, "Broadcast decode failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(dir: &Path, port: u16, masternode: Option<&str>) -> NodeState {
        NodeState::open(dir, port, masternode.map(String::from), Vec::new()).unwrap()
    }

    #[test]
    fn longer_chain_wins_and_orphans_return_to_mempool() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = node(dir.path(), 11000, None);
        let mut b = node(dir.path(), 11001, None);
        a.set_mock_time(1_580_000_000);
        b.set_mock_time(1_580_000_000);
        let address = a.new_address();
        let txid = a
            .send_to_address(address.as_str().unwrap(), 1.0)
            .unwrap();
        a.generate(2);
        b.generate(5);
        a.absorb(b.export());
        assert_eq!(a.height(), 5);
        assert_eq!(a.best_block_hash(), b.best_block_hash());
        assert_eq!(a.raw_mempool(), json!([txid]));

        b.absorb(a.export());
        assert_eq!(b.raw_mempool(), json!([txid]));
        let before = a.best_block_hash();
        let mut c = node(dir.path(), 11002, None);
        c.generate(5);
        a.absorb(c.export());
        assert_eq!(a.best_block_hash(), before);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = node(dir.path(), 11000, None);
        a.generate(3);
        let collateral = a.allocate_funds("mn1", "copper").unwrap();
        a.persist().unwrap();
        let reopened = node(dir.path(), 11000, None);
        assert_eq!(reopened.height(), 3);
        assert_eq!(reopened.collateral[0].txhash, collateral["txhash"]);
        assert_eq!(reopened.raw_mempool(), json!([]));
    }

    #[test]
    fn masternode_goes_from_pre_enabled_to_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = node(dir.path(), 11000, None);
        let mut host = node(dir.path(), 11001, Some("mn1"));
        for state in [&mut control, &mut host] {
            state.set_mock_time(1_580_000_000);
        }
        let funds = control.allocate_funds("mn1", "silver").unwrap();
        let txhash = funds["txhash"].as_str().unwrap().to_string();
        let tx = control.raw_transaction(&txhash).unwrap();
        let address = tx["vout"][1]["scriptPubKey"]["addresses"][0]
            .as_str()
            .unwrap()
            .to_string();
        let pubkey = control.validate_address(&address)["pubkey"]
            .as_str()
            .unwrap()
            .to_string();
        let setup = host.setup_masternode("mn1", &txhash, 1, &pubkey, "127.0.0.1:11001");
        let message = setup["message_to_sign"].as_str().unwrap();
        let signature = control.sign_message(&address, message).unwrap();
        let data = setup["broadcast_data"].as_str().unwrap();
        assert!(control.broadcast_start_masternode(data, "00").is_err());
        control
            .broadcast_start_masternode(data, signature.as_str().unwrap())
            .unwrap();

        host.absorb(control.export());
        assert!(host.masternode_status().is_err());
        control.generate(1);
        host.absorb(control.export());
        assert_eq!(host.masternode_status().unwrap()["status"], json!(4));

        assert_eq!(host.list_masternodes(), json!([]));
        host.set_mock_time(1_580_000_010);
        assert_eq!(host.list_masternodes()[0]["status"], json!("PRE_ENABLED"));
        host.set_mock_time(1_580_000_020);
        let listed = host.list_masternodes();
        assert_eq!(listed[0]["status"], json!(ENABLED));
        assert_eq!(listed[0]["tier"], json!("silver"));
    }

    #[test]
    fn mnsync_reset_restarts_the_sync_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = node(dir.path(), 11000, None);
        state.set_mock_time(1_580_000_000);
        assert_eq!(state.mnsync_status()["currentMasternodeSyncStatus"], json!(1));
        state.set_mock_time(1_580_000_005);
        assert_eq!(state.mnsync_status()["currentMasternodeSyncStatus"], json!(999));
        state.mnsync_reset();
        assert_eq!(state.mnsync_status()["currentMasternodeSyncStatus"], json!(1));
    }

    #[test]
    fn out_of_range_height_is_a_parameter_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = node(dir.path(), 11000, None);
        assert_eq!(
            state.block_hash(1).unwrap_err().code,
            RPC_INVALID_PARAMETER
        );
        assert!(state.block_hash(0).is_ok());
    }
}
