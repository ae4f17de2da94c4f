//! chainarchive-bitcoin: Bitcoin Core as a ChainArchive record source.
//!
//! ```text
//! BitcoinRpcClient (JSON-RPC 1.0, basic auth / cookie)
//!   ├── BlockHeaderProducer    getblockhash + getblockheader
//!   ├── TransactionIdProducer  getblockhash + getblock(1)
//!   └── AddressDeltaProducer   getblockhash + getblock(3)
//! ```

pub mod client;
pub mod parse;
pub mod producer;

pub use client::{BitcoinRpcClient, BitcoinRpcConfig, RpcError};
pub use producer::{producer_for, AddressDeltaProducer, BlockHeaderProducer, TransactionIdProducer};
