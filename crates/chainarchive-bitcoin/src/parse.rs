//! RPC response shapes and their conversion into archive records.

use chainarchive_core::error::ProducerError;
use chainarchive_core::record::{AddressDelta, BlockHeader, TransactionId};
use serde::Deserialize;

/// `getblockheader` (verbose).
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInfo {
    pub hash: String,
    pub height: u64,
    pub time: i64,
}

/// `getblock` at verbosity 1.
#[derive(Debug, Clone, Deserialize)]
pub struct TxidBlock {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    #[serde(default)]
    pub tx: Vec<String>,
}

/// `getblock` at verbosity 3.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseBlock {
    pub hash: String,
    pub height: u64,
    #[serde(default)]
    pub tx: Vec<VerboseTx>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerboseTx {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub prevout: Option<TxOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxOutput {
    #[serde(default)]
    pub value: f64,
    #[serde(default, rename = "scriptPubKey")]
    pub script_pub_key: Option<ScriptPubKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub address: Option<String>,
    /// Pre-22.0 nodes report a list instead.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl ScriptPubKey {
    pub fn address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .filter(|a| !a.is_empty())
            .or_else(|| self.addresses.first().map(String::as_str).filter(|a| !a.is_empty()))
    }
}

impl TxOutput {
    fn address(&self) -> Option<&str> {
        self.script_pub_key.as_ref().and_then(ScriptPubKey::address)
    }
}

/// BTC amount to satoshis, rounded to the nearest unit.
pub fn btc_to_sat(value: f64) -> i64 {
    (value * 100_000_000.0).round() as i64
}

fn check_height(what: &str, expected: u64, got: u64) -> Result<(), ProducerError> {
    if expected == got {
        Ok(())
    } else {
        // The node answered for a different block; the hash lookup raced a reorg.
        Err(ProducerError::Transient(format!(
            "{what} for height {expected} reports height {got}"
        )))
    }
}

pub fn header_record(height: u64, header: HeaderInfo) -> Result<BlockHeader, ProducerError> {
    check_height("getblockheader", height, header.height)?;
    Ok(BlockHeader {
        height,
        hash: header.hash,
        time: header.time,
    })
}

pub fn txid_records(height: u64, block: TxidBlock) -> Result<Vec<TransactionId>, ProducerError> {
    check_height("getblock", height, block.height)?;
    let TxidBlock { hash, time, tx, .. } = block;
    Ok(tx
        .into_iter()
        .map(|txid| TransactionId {
            height,
            block_hash: hash.clone(),
            block_time: time,
            txid,
        })
        .collect())
}

/// Balance changes in block order: for each transaction its outputs
/// (credits) then its spent prevouts (debits).
pub fn address_deltas(height: u64, block: &VerboseBlock) -> Result<Vec<AddressDelta>, ProducerError> {
    check_height("getblock", height, block.height)?;
    let mut deltas = Vec::new();

    for tx in &block.tx {
        for output in &tx.vout {
            push_delta(&mut deltas, height, &tx.txid, output, 1);
        }
        for input in &tx.vin {
            if input.coinbase.is_some() {
                continue;
            }
            let Some(prevout) = &input.prevout else {
                return Err(ProducerError::Fatal(format!(
                    "input of {} has no prevout; getblock verbosity 3 requires bitcoind 23+",
                    tx.txid
                )));
            };
            push_delta(&mut deltas, height, &tx.txid, prevout, -1);
        }
    }
    Ok(deltas)
}

fn push_delta(out: &mut Vec<AddressDelta>, height: u64, txid: &str, output: &TxOutput, sign: i64) {
    let Some(address) = output.address() else {
        return;
    };
    let sat = btc_to_sat(output.value);
    if sat == 0 {
        return;
    }
    out.push(AddressDelta {
        address: address.to_string(),
        txid: txid.to_string(),
        height,
        delta_sat: sign * sat,
    });
}
