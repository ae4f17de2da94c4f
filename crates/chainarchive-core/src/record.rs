//! Record variants written to segment files.
//!
//! Every segment line is one compact JSON object. The schema is fixed per
//! entity and the field order is part of the on-disk contract, so the structs
//! below must not be reordered.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

// ─── Entity ──────────────────────────────────────────────────────────────────

/// The stream a record belongs to. Also the segment file name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Blocks,
    Txids,
    Addresses,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Txids => "txids",
            Self::Addresses => "addresses",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocks" | "block" => Ok(Self::Blocks),
            "txids" | "txid" => Ok(Self::Txids),
            "addresses" | "address" => Ok(Self::Addresses),
            other => Err(ArchiveError::Config(format!("unknown entity '{other}'"))),
        }
    }
}

// ─── Variants ────────────────────────────────────────────────────────────────

/// A block header summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
    /// Block timestamp (unix seconds).
    pub time: i64,
}

/// One transaction id, tagged with the block that confirmed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionId {
    pub height: u64,
    pub block_hash: String,
    pub block_time: i64,
    pub txid: String,
}

/// Net balance change of one address inside one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressDelta {
    pub address: String,
    pub txid: String,
    pub height: u64,
    pub delta_sat: i64,
}

/// A single segment line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Record {
    BlockHeader(BlockHeader),
    TransactionId(TransactionId),
    AddressDelta(AddressDelta),
}

impl Record {
    pub fn entity(&self) -> Entity {
        match self {
            Self::BlockHeader(_) => Entity::Blocks,
            Self::TransactionId(_) => Entity::Txids,
            Self::AddressDelta(_) => Entity::Addresses,
        }
    }

    /// Position in the producer's total order (the block height).
    pub fn position(&self) -> u64 {
        match self {
            Self::BlockHeader(r) => r.height,
            Self::TransactionId(r) => r.height,
            Self::AddressDelta(r) => r.height,
        }
    }

    /// Key a downstream index publishes for this record.
    pub fn key(&self) -> String {
        match self {
            Self::BlockHeader(r) => r.height.to_string(),
            Self::TransactionId(r) => r.txid.clone(),
            Self::AddressDelta(r) => r.address.clone(),
        }
    }

    /// Checks the fixed schema of the variant.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        match self {
            Self::BlockHeader(r) => check_hex64("hash", &r.hash),
            Self::TransactionId(r) => {
                check_hex64("block_hash", &r.block_hash)?;
                check_hex64("txid", &r.txid)
            }
            Self::AddressDelta(r) => {
                if r.address.is_empty() || r.address.chars().any(char::is_whitespace) {
                    return Err(ArchiveError::MalformedRecord(format!(
                        "invalid address '{}'",
                        r.address
                    )));
                }
                if r.delta_sat == 0 {
                    return Err(ArchiveError::MalformedRecord(
                        "delta_sat must be non-zero".into(),
                    ));
                }
                check_hex64("txid", &r.txid)
            }
        }
    }

    /// Compact JSON encoding, without the trailing newline.
    pub fn to_line(&self) -> Result<String, ArchiveError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates one segment line of the given entity.
    pub fn parse_line(entity: Entity, line: &[u8]) -> Result<Self, ArchiveError> {
        let line = trim_line(line);
        let record = match entity {
            Entity::Blocks => Self::BlockHeader(serde_json::from_slice(line)?),
            Entity::Txids => Self::TransactionId(serde_json::from_slice(line)?),
            Entity::Addresses => Self::AddressDelta(serde_json::from_slice(line)?),
        };
        record.validate()?;
        Ok(record)
    }
}

impl From<BlockHeader> for Record {
    fn from(r: BlockHeader) -> Self {
        Self::BlockHeader(r)
    }
}

impl From<TransactionId> for Record {
    fn from(r: TransactionId) -> Self {
        Self::TransactionId(r)
    }
}

impl From<AddressDelta> for Record {
    fn from(r: AddressDelta) -> Self {
        Self::AddressDelta(r)
    }
}

fn check_hex64(field: &str, value: &str) -> Result<(), ArchiveError> {
    if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ArchiveError::MalformedRecord(format!(
            "{field} must be 64 hex characters, got '{value}'"
        )))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}
