// File-backed store using sled

use crate::core::{Block, Hash256, Serializable, Transaction};
use crate::error::StoreError;
use crate::store::{BlockResult, ChainStore, TxResult};
use sled::Db;
use std::path::Path;
use std::sync::Mutex;

// Key prefixes within the single sled tree.
const BLOCK: u8 = b'b'; // b + hash -> block bytes
const HEIGHT_OF: u8 = b'd'; // d + hash -> height (connected blocks only)
const AT_HEIGHT: u8 = b'h'; // h + height BE -> hash (best chain)
const TX: u8 = b't'; // t + hash -> tx bytes
const ORPHAN: u8 = b'o'; // o + prev hash + hash -> block bytes
const TIP: &[u8] = b"tip";

fn key(prefix: u8, hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(prefix);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn height_key(height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(AT_HEIGHT);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn orphan_key(prev: &Hash256, hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(65);
    key.push(ORPHAN);
    key.extend_from_slice(prev.as_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

/// Blockchain store on a sled database.
pub struct SledStore {
    db: Db,
    /// Serializes mutations; reads go straight to sled.
    write_lock: Mutex<()>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Temporary on-disk database, removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn read_hash(&self, key: &[u8]) -> Result<Option<Hash256>, StoreError> {
        match self.db.get(key)? {
            Some(data) => Ok(Some(
                Hash256::from_slice(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn read_height(&self, hash: &Hash256) -> Result<Option<u32>, StoreError> {
        match self.db.get(key(HEIGHT_OF, hash))? {
            Some(data) => {
                let bytes: [u8; 4] = data
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("height record".into()))?;
                Ok(Some(u32::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn head_height(&self) -> Result<Option<u32>, StoreError> {
        match self.read_hash(TIP)? {
            Some(tip) => self.read_height(&tip),
            None => Ok(None),
        }
    }

    /// Write one block whose predecessor is connected and index it.
    /// Caller holds the write lock.
    fn connect_one(&self, block: &Block) -> Result<u32, StoreError> {
        let hash = block.hash();
        let height = if block.is_genesis() {
            0
        } else {
            self.read_height(&block.header.prev_block_hash)?
                .ok_or_else(|| StoreError::Invariant("predecessor not connected".into()))?
                + 1
        };

        for tx in &block.transactions {
            self.db.insert(key(TX, &tx.hash()), tx.serialize())?;
        }
        self.db.insert(key(BLOCK, &hash), block.serialize())?;
        self.db
            .insert(key(HEIGHT_OF, &hash), height.to_le_bytes().to_vec())?;

        let extends_best = match self.head_height()? {
            None => true,
            Some(best) => height > best,
        };
        if extends_best {
            self.db.insert(height_key(height), hash.as_bytes().as_slice())?;
            self.db.insert(TIP, hash.as_bytes().as_slice())?;
        }

        Ok(height)
    }

    /// Connect a block, then drain any orphans that were waiting for it,
    /// transitively. Caller holds the write lock.
    fn connect(&self, block: Block) -> Result<u32, StoreError> {
        let height = self.connect_one(&block)?;

        let mut pending = vec![block.hash()];
        while let Some(parent) = pending.pop() {
            let mut prefix = Vec::with_capacity(33);
            prefix.push(ORPHAN);
            prefix.extend_from_slice(parent.as_bytes());

            for entry in self.db.scan_prefix(&prefix) {
                let (orphan_key, data) = entry?;
                let child = Block::from_bytes(&data)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                self.db.remove(orphan_key)?;
                self.connect_one(&child)?;
                pending.push(child.hash());
            }
        }

        Ok(height)
    }
}

impl ChainStore for SledStore {
    fn store_block(&self, block: Block) -> Result<BlockResult, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("write lock poisoned".into()))?;

        let hash = block.hash();
        if self.db.contains_key(key(BLOCK, &hash))? {
            return Ok(BlockResult::Existing);
        }
        if !block.verify_merkle_root() {
            return Ok(BlockResult::Invalid);
        }

        if !block.is_genesis()
            && !self
                .db
                .contains_key(key(BLOCK, &block.header.prev_block_hash))?
        {
            self.db.insert(
                orphan_key(&block.header.prev_block_hash, &hash),
                block.serialize(),
            )?;
            return Ok(BlockResult::Orphan);
        }

        let height = self.connect(block)?;
        Ok(BlockResult::New(height))
    }

    fn store_tx(&self, tx: Transaction) -> Result<TxResult, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("write lock poisoned".into()))?;

        let tx_key = key(TX, &tx.hash());
        if self.db.contains_key(&tx_key)? {
            return Ok(TxResult::Existing);
        }
        self.db.insert(tx_key, tx.serialize())?;
        Ok(TxResult::New)
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        match self.db.get(key(BLOCK, hash))? {
            Some(data) => Ok(Some(
                Block::from_bytes(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn get_tx(&self, hash: &Hash256) -> Result<Option<Transaction>, StoreError> {
        match self.db.get(key(TX, hash))? {
            Some(data) => Ok(Some(
                Transaction::from_bytes(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn block_at_height(&self, height: u32) -> Result<Option<Block>, StoreError> {
        match self.read_hash(&height_key(height))? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    fn head(&self) -> Result<Option<Block>, StoreError> {
        match self.read_hash(TIP)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    fn height(&self) -> Result<u32, StoreError> {
        Ok(self.head_height()?.unwrap_or(0))
    }

    fn block_height(&self, hash: &Hash256) -> Result<Option<u32>, StoreError> {
        self.read_height(hash)
    }
}
