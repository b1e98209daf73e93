// Storage layer: the chain store contract and its backends

mod memory;
mod sled_db;

pub use memory::MemoryStore;
pub use sled_db::SledStore;

use crate::core::{Block, Hash256, InvKind, Inventory, Transaction};
use crate::error::StoreError;

/// Outcome of submitting a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResult {
    /// Stored and connected at this height
    New(u32),
    /// Already present; accepting again is a no-op
    Existing,
    /// Predecessor unknown; retained in the orphan pool
    Orphan,
    /// Rejected (merkle root does not match the transactions)
    Invalid,
}

/// Outcome of submitting a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    New,
    Existing,
}

/// Persistent view of the blockchain used by the node.
///
/// Implementations provide their own serialization; all operations may be
/// called from any thread. Submitting the same hash twice is idempotent.
pub trait ChainStore: Send + Sync {
    /// Store a block, connecting it to its predecessor if known. Orphans
    /// are kept in a side pool and connected when their predecessor
    /// arrives.
    fn store_block(&self, block: Block) -> Result<BlockResult, StoreError>;

    /// Store a loose (unconfirmed) transaction.
    fn store_tx(&self, tx: Transaction) -> Result<TxResult, StoreError>;

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError>;

    /// Look up a transaction, loose or confirmed.
    fn get_tx(&self, hash: &Hash256) -> Result<Option<Transaction>, StoreError>;

    /// Block on the best chain at the given height.
    fn block_at_height(&self, height: u32) -> Result<Option<Block>, StoreError>;

    /// Tip of the best chain.
    fn head(&self) -> Result<Option<Block>, StoreError>;

    /// Height of the best chain tip; zero for an empty store.
    fn height(&self) -> Result<u32, StoreError>;

    fn has(&self, inv: &Inventory) -> Result<bool, StoreError> {
        Ok(match inv.kind {
            InvKind::Block => self.get_block(&inv.hash)?.is_some(),
            InvKind::Tx => self.get_tx(&inv.hash)?.is_some(),
        })
    }

    /// Height of a connected block.
    fn block_height(&self, hash: &Hash256) -> Result<Option<u32>, StoreError>;

    /// Successor of `block` on the best chain, for linear traversal from
    /// genesis.
    fn next_block(&self, block: &Block) -> Result<Option<Block>, StoreError> {
        match self.block_height(&block.hash())? {
            Some(height) => self.block_at_height(height + 1),
            None => Ok(None),
        }
    }

    /// Hashes of up to `limit` best-chain blocks after the locator,
    /// starting from genesis when no locator hash is known.
    fn blocks_after(&self, locator: &[Hash256], limit: usize) -> Result<Vec<Hash256>, StoreError> {
        let mut start_height = 0;
        for hash in locator {
            if let Some(height) = self.block_height(hash)? {
                // only main-chain anchors count
                let on_main = self
                    .block_at_height(height)?
                    .map(|b| b.hash() == *hash)
                    .unwrap_or(false);
                if on_main {
                    start_height = height + 1;
                    break;
                }
            }
        }

        let mut hashes = Vec::new();
        let mut height = start_height;
        while hashes.len() < limit {
            match self.block_at_height(height)? {
                Some(block) => hashes.push(block.hash()),
                None => break,
            }
            height += 1;
        }
        Ok(hashes)
    }
}
