// Block data structures

use crate::core::hash::merkle_root;
use crate::core::serialize::{write_varint, Reader, Serializable, MAX_BLOCK_TXS};
use crate::core::{hash256, Hash256, Network, Transaction, TxOutput};
use crate::error::DecodeError;

/// Version bit signalling that a merged-mining proof follows the header.
pub const BLOCK_VERSION_AUXPOW: u32 = 1 << 8;

/// Block header - 80 bytes on the wire, all integers little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block, wire byte order
    pub prev_block_hash: Hash256,
    /// Merkle root of the block's transaction hashes
    pub merkle_root: Hash256,
    /// Unix timestamp
    pub time: u32,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(
        version: u32,
        prev_block_hash: Hash256,
        merkle_root: Hash256,
        time: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_block_hash,
            merkle_root,
            time,
            bits,
            nonce,
        }
    }

    /// Block identifier: double SHA256 of the 80 serialized header bytes.
    pub fn hash(&self) -> Hash256 {
        hash256(&self.serialize())
    }

    pub fn has_auxpow(&self) -> bool {
        self.version & BLOCK_VERSION_AUXPOW != 0
    }
}

impl Serializable for BlockHeader {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(self.prev_block_hash.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.extend_from_slice(&self.time.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
    }

    fn deserialize(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            version: r.u32_le()?,
            prev_block_hash: r.hash()?,
            merkle_root: r.hash()?,
            time: r.u32_le()?,
            bits: r.u32_le()?,
            nonce: r.u32_le()?,
        })
    }
}

/// Merged-mining proof of work. Decoded and re-encoded byte-exactly; the
/// proof itself is not validated here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxPow {
    /// Coinbase transaction of the parent chain block
    pub coinbase_tx: Transaction,
    /// Hash of the parent block
    pub parent_hash: Hash256,
    /// Merkle branch linking the coinbase into the parent block
    pub coinbase_branch: Vec<Hash256>,
    pub coinbase_index: u32,
    /// Merkle branch linking this chain into the aux chain tree
    pub chain_branch: Vec<Hash256>,
    pub chain_index: u32,
    /// Header of the parent block
    pub parent_header: BlockHeader,
}

fn read_branch(r: &mut Reader) -> Result<Vec<Hash256>, DecodeError> {
    let count = r.varint()? as usize;
    let mut branch = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        branch.push(r.hash()?);
    }
    Ok(branch)
}

fn write_branch(buf: &mut Vec<u8>, branch: &[Hash256]) {
    write_varint(buf, branch.len() as u64);
    for hash in branch {
        buf.extend_from_slice(hash.as_bytes());
    }
}

impl Serializable for AuxPow {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        self.coinbase_tx.serialize_into(buf);
        buf.extend_from_slice(self.parent_hash.as_bytes());
        write_branch(buf, &self.coinbase_branch);
        buf.extend_from_slice(&self.coinbase_index.to_le_bytes());
        write_branch(buf, &self.chain_branch);
        buf.extend_from_slice(&self.chain_index.to_le_bytes());
        self.parent_header.serialize_into(buf);
    }

    fn deserialize(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            coinbase_tx: Transaction::deserialize(r)?,
            parent_hash: r.hash()?,
            coinbase_branch: read_branch(r)?,
            coinbase_index: r.u32_le()?,
            chain_branch: read_branch(r)?,
            chain_index: r.u32_le()?,
            parent_header: BlockHeader::deserialize(r)?,
        })
    }
}

/// Block - header, optional auxpow, transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Present iff the header carries the auxpow version bit
    pub aux_pow: Option<AuxPow>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            aux_pow: None,
            transactions,
        }
    }

    /// Build a block on top of `prev`, computing the merkle root from the
    /// given transactions.
    pub fn build(prev: &Block, time: u32, bits: u32, transactions: Vec<Transaction>) -> Self {
        let hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.hash()).collect();
        let header = BlockHeader::new(1, prev.hash(), merkle_root(&hashes), time, bits, 0);
        Self::new(header, transactions)
    }

    /// The genesis block of the given network, byte-exact.
    pub fn genesis(network: Network) -> Self {
        let script_sig = hex::decode(
            "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c\
             6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73",
        )
        .expect("genesis coinbase script is valid hex");
        let pk_script = hex::decode(
            "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f\
             4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac",
        )
        .expect("genesis output script is valid hex");

        let coinbase = Transaction::coinbase(script_sig, vec![TxOutput::new(5_000_000_000, pk_script)]);
        let root = merkle_root(&[coinbase.hash()]);

        let (time, bits, nonce) = match network {
            Network::Mainnet => (1_231_006_505, 0x1d00ffff, 2_083_236_893),
            Network::Testnet => (1_296_688_602, 0x1d00ffff, 414_098_458),
            Network::Regtest => (1_296_688_602, 0x207fffff, 2),
        };

        Self::new(
            BlockHeader::new(1, Hash256::zero(), root, time, bits, nonce),
            vec![coinbase],
        )
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_block_hash.is_zero()
    }

    /// A header-only block carries no transactions (headers sync).
    pub fn is_header_only(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Merkle root of the transaction hashes in block order.
    pub fn compute_merkle_root(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&hashes)
    }

    /// True iff the header's merkle root matches the transactions. Always
    /// true for header-only blocks, which carry nothing to check.
    pub fn verify_merkle_root(&self) -> bool {
        self.is_header_only() || self.compute_merkle_root() == self.header.merkle_root
    }
}

impl Serializable for Block {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        self.header.serialize_into(buf);
        if let Some(aux_pow) = &self.aux_pow {
            aux_pow.serialize_into(buf);
        }
        write_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.serialize_into(buf);
        }
    }

    fn deserialize(r: &mut Reader) -> Result<Self, DecodeError> {
        let header = BlockHeader::deserialize(r)?;

        let aux_pow = if header.has_auxpow() {
            Some(AuxPow::deserialize(r)?)
        } else {
            None
        };

        let tx_count = r.varint()?;
        if tx_count > MAX_BLOCK_TXS {
            return Err(DecodeError::TooManyTxs(tx_count));
        }

        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::deserialize(r)?);
        }

        Ok(Self {
            header,
            aux_pow,
            transactions,
        })
    }
}
