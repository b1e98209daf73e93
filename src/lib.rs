// Bitcoin protocol library: wire codec, script interpreter, P2P node

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod script;
pub mod store;

// Re-exports for convenience
pub use crate::config::NodeConfig;
pub use crate::core::{Block, BlockHeader, Hash256, Network, Transaction, TxInput, TxOutput};
pub use crate::error::{DecodeError, Error, NetworkError, Result, StoreError};
pub use crate::network::{Node, NodeEvent};
pub use crate::script::{Interpreter, InterpreterFlags, Script, ScriptError};
pub use crate::store::{BlockResult, ChainStore, MemoryStore, SledStore, TxResult};
