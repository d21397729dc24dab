//! Blocks, transactions and the hash-derived keys of the fake chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const GENESIS_TIME: i64 = 1_573_000_000;
pub const PROTOCOL_VERSION: u64 = 70915;

pub fn sha_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Regtest-looking address derived from a transaction id.
pub fn address_for(seed: &str) -> String {
    let digest = sha_hex(&["addr", seed]);
    format!("y{}", &digest[..33])
}

pub fn pubkey_for(address: &str) -> String {
    sha_hex(&["pub", address])
}

pub fn sign(pubkey: &str, message: &str) -> String {
    sha_hex(&[pubkey, message])
}

pub fn is_valid_address(address: &str) -> bool {
    address.len() == 34
        && address.starts_with('y')
        && address[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: f64,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub outputs: Vec<TxOut>,
    #[serde(default)]
    pub coinbase: bool,
}

impl Transaction {
    pub fn describe(&self, confirmations: u64) -> serde_json::Value {
        let vout: Vec<_> = self
            .outputs
            .iter()
            .enumerate()
            .map(|(n, out)| {
                serde_json::json!({
                    "n": n,
                    "value": out.value,
                    "scriptPubKey": { "addresses": [out.address] },
                })
            })
            .collect();
        serde_json::json!({
            "txid": self.txid,
            "vout": vout,
            "confirmations": confirmations,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    pub prev: String,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn genesis() -> Self {
        Self {
            hash: sha_hex(&["genesis", "regtest"]),
            height: 0,
            time: GENESIS_TIME,
            prev: String::new(),
            txs: Vec::new(),
        }
    }

    pub fn txids(&self) -> Vec<String> {
        self.txs.iter().map(|tx| tx.txid.clone()).collect()
    }
}

/// Collateral amount required per tier.
pub fn tier_amount(tier: &str) -> Option<f64> {
    match tier.to_ascii_lowercase().as_str() {
        "copper" => Some(100_000.0),
        "silver" => Some(300_000.0),
        "gold" => Some(1_000_000.0),
        "platinum" => Some(3_000_000.0),
        "diamond" => Some(10_000_000.0),
        _ => None,
    }
}

pub fn tier_for_amount(amount: f64) -> &'static str {
    ["diamond", "platinum", "gold", "silver", "copper"]
        .into_iter()
        .find(|tier| tier_amount(tier).is_some_and(|needed| amount >= needed))
        .unwrap_or("invalid")
}

/// Masternode announcement carried hex-encoded through the RPC layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub alias: String,
    pub txhash: String,
    pub outidx: u32,
    pub addr: String,
    pub collateral_pubkey: String,
    pub protocol_version: u64,
    #[serde(default)]
    pub sig: Option<String>,
}

impl BroadcastPayload {
    pub fn message(&self) -> String {
        sha_hex(&[
            "mnb",
            &self.txhash,
            &self.outidx.to_string(),
            &self.addr,
            &self.collateral_pubkey,
        ])
    }

    pub fn signature_valid(&self, sig: &str) -> bool {
        sign(&self.collateral_pubkey, &self.message()) == sig
    }

    pub fn encode(&self) -> String {
        hex::encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(data: &str) -> Option<Self> {
        let bytes = hex::decode(data.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.txhash, self.outidx)
    }
}
