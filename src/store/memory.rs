// In-memory reference store

use crate::core::{Block, Hash256, Transaction};
use crate::error::StoreError;
use crate::store::{BlockResult, ChainStore, TxResult};
use std::collections::HashMap;
use std::sync::Mutex;

/// Reference store keeping everything in maps behind a single mutex.
/// Primarily for tests; it satisfies the same contract as the file-backed
/// store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Connected blocks with their heights
    blocks: HashMap<Hash256, (Block, u32)>,
    /// Best-chain index: height -> hash
    by_height: HashMap<u32, Hash256>,
    /// Loose and confirmed transactions
    txs: HashMap<Hash256, Transaction>,
    /// Blocks waiting for their predecessor, keyed by that predecessor
    orphans: HashMap<Hash256, Vec<Block>>,
    head: Option<Hash256>,
}

impl Inner {
    fn head_height(&self) -> Option<u32> {
        self.head.and_then(|h| self.blocks.get(&h).map(|(_, height)| *height))
    }

    /// Attach a block whose predecessor is connected (or which is
    /// genesis), then drain any orphans that were waiting for it.
    fn connect(&mut self, block: Block) -> u32 {
        let hash = block.hash();
        let height = if block.is_genesis() {
            0
        } else {
            // caller guarantees the predecessor is present
            self.blocks[&block.header.prev_block_hash].1 + 1
        };

        for tx in &block.transactions {
            self.txs.insert(tx.hash(), tx.clone());
        }
        self.blocks.insert(hash, (block, height));

        let extends_best = match self.head_height() {
            None => true,
            Some(best) => height > best,
        };
        if extends_best {
            self.by_height.insert(height, hash);
            self.head = Some(hash);
        }

        // connect waiting orphans, transitively
        let mut pending = vec![hash];
        while let Some(parent) = pending.pop() {
            if let Some(children) = self.orphans.remove(&parent) {
                for child in children {
                    let child_hash = self.connect_child(child, parent);
                    pending.push(child_hash);
                }
            }
        }

        height
    }

    fn connect_child(&mut self, block: Block, parent: Hash256) -> Hash256 {
        let hash = block.hash();
        let height = self.blocks[&parent].1 + 1;

        for tx in &block.transactions {
            self.txs.insert(tx.hash(), tx.clone());
        }
        self.blocks.insert(hash, (block, height));

        let extends_best = match self.head_height() {
            None => true,
            Some(best) => height > best,
        };
        if extends_best {
            self.by_height.insert(height, hash);
            self.head = Some(hash);
        }
        hash
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryStore {
    fn store_block(&self, block: Block) -> Result<BlockResult, StoreError> {
        let mut inner = self.lock()?;
        let hash = block.hash();

        if inner.blocks.contains_key(&hash) {
            return Ok(BlockResult::Existing);
        }
        if !block.verify_merkle_root() {
            return Ok(BlockResult::Invalid);
        }

        if !block.is_genesis() && !inner.blocks.contains_key(&block.header.prev_block_hash) {
            let waiting = inner
                .orphans
                .entry(block.header.prev_block_hash)
                .or_default();
            if !waiting.iter().any(|b| b.hash() == hash) {
                waiting.push(block);
            }
            return Ok(BlockResult::Orphan);
        }

        let height = inner.connect(block);
        Ok(BlockResult::New(height))
    }

    fn store_tx(&self, tx: Transaction) -> Result<TxResult, StoreError> {
        let mut inner = self.lock()?;
        let hash = tx.hash();
        if inner.txs.contains_key(&hash) {
            return Ok(TxResult::Existing);
        }
        inner.txs.insert(hash, tx);
        Ok(TxResult::New)
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        Ok(self.lock()?.blocks.get(hash).map(|(b, _)| b.clone()))
    }

    fn get_tx(&self, hash: &Hash256) -> Result<Option<Transaction>, StoreError> {
        Ok(self.lock()?.txs.get(hash).cloned())
    }

    fn block_at_height(&self, height: u32) -> Result<Option<Block>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .by_height
            .get(&height)
            .and_then(|h| inner.blocks.get(h))
            .map(|(b, _)| b.clone()))
    }

    fn head(&self) -> Result<Option<Block>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .head
            .and_then(|h| inner.blocks.get(&h))
            .map(|(b, _)| b.clone()))
    }

    fn height(&self) -> Result<u32, StoreError> {
        Ok(self.lock()?.head_height().unwrap_or(0))
    }

    fn block_height(&self, hash: &Hash256) -> Result<Option<u32>, StoreError> {
        Ok(self.lock()?.blocks.get(hash).map(|(_, h)| *h))
    }
}
