// Core data structures and wire codec

pub mod address;
mod block;
mod hash;
pub mod serialize;
mod transaction;
mod types;

pub use block::{AuxPow, Block, BlockHeader, BLOCK_VERSION_AUXPOW};
pub use hash::{hash160, hash256, merkle_root, sha256};
pub use serialize::{Reader, Serializable};
pub use transaction::{Transaction, TxInput, TxOutput, SIGHASH_ALL};
pub use types::{Hash256, InvKind, Inventory, Network};
