//! [`Producer`] implementations over a Bitcoin Core node.
//!
//! Position is block height. The frontier is `getblockcount`; every fetch
//! resolves the height to a hash first, so a record always names the block
//! the node considered canonical at that moment.

use std::sync::Arc;

use async_trait::async_trait;
use chainarchive_core::error::ProducerError;
use chainarchive_core::producer::Producer;
use chainarchive_core::record::{Entity, Record};

use crate::client::BitcoinRpcClient;
use crate::parse::{address_deltas, header_record, txid_records};

/// One block header per height.
pub struct BlockHeaderProducer {
    rpc: Arc<BitcoinRpcClient>,
}

impl BlockHeaderProducer {
    pub fn new(rpc: Arc<BitcoinRpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl Producer for BlockHeaderProducer {
    fn entity(&self) -> Entity {
        Entity::Blocks
    }

    async fn current_frontier(&self) -> Result<u64, ProducerError> {
        Ok(self.rpc.get_block_count().await?)
    }

    async fn fetch(&self, height: u64) -> Result<Vec<Record>, ProducerError> {
        let hash = self.rpc.get_block_hash(height).await?;
        let header = self.rpc.get_block_header(&hash).await?;
        Ok(vec![header_record(height, header)?.into()])
    }
}

/// Every transaction id of a block, in block order.
pub struct TransactionIdProducer {
    rpc: Arc<BitcoinRpcClient>,
}

impl TransactionIdProducer {
    pub fn new(rpc: Arc<BitcoinRpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl Producer for TransactionIdProducer {
    fn entity(&self) -> Entity {
        Entity::Txids
    }

    async fn current_frontier(&self) -> Result<u64, ProducerError> {
        Ok(self.rpc.get_block_count().await?)
    }

    async fn fetch(&self, height: u64) -> Result<Vec<Record>, ProducerError> {
        let hash = self.rpc.get_block_hash(height).await?;
        let block = self.rpc.get_block_txids(&hash).await?;
        Ok(txid_records(height, block)?
            .into_iter()
            .map(Record::from)
            .collect())
    }
}

/// Address balance deltas of a block. Needs `getblock` verbosity 3.
pub struct AddressDeltaProducer {
    rpc: Arc<BitcoinRpcClient>,
}

impl AddressDeltaProducer {
    pub fn new(rpc: Arc<BitcoinRpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl Producer for AddressDeltaProducer {
    fn entity(&self) -> Entity {
        Entity::Addresses
    }

    async fn current_frontier(&self) -> Result<u64, ProducerError> {
        Ok(self.rpc.get_block_count().await?)
    }

    async fn fetch(&self, height: u64) -> Result<Vec<Record>, ProducerError> {
        let hash = self.rpc.get_block_hash(height).await?;
        let block = self.rpc.get_block_with_prevouts(&hash).await?;
        let deltas = address_deltas(height, &block)?;
        tracing::trace!(height, transactions = block.tx.len(), deltas = deltas.len(), "block parsed");
        Ok(deltas.into_iter().map(Record::from).collect())
    }
}

/// The producer for `entity`, sharing one client.
pub fn producer_for(entity: Entity, rpc: Arc<BitcoinRpcClient>) -> Box<dyn Producer> {
    match entity {
        Entity::Blocks => Box::new(BlockHeaderProducer::new(rpc)),
        Entity::Txids => Box::new(TransactionIdProducer::new(rpc)),
        Entity::Addresses => Box::new(AddressDeltaProducer::new(rpc)),
    }
}
