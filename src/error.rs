// Error types

use thiserror::Error;

/// Errors produced while decoding wire bytes.
///
/// A decode error terminates processing of the offending message; it never
/// takes down the node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input truncated")]
    Truncated,

    #[error("malformed varint")]
    MalformedVarInt,

    #[error("script too large: {0} bytes")]
    ScriptTooLarge(usize),

    #[error("too many transactions: {0}")]
    TooManyTxs(u64),

    #[error("invalid hex string")]
    BadHex,

    #[error("invalid base58 string")]
    BadBase58,

    #[error("base58 checksum mismatch")]
    BadBase58Checksum,

    #[error("invalid {0} payload")]
    BadPayload(&'static str),
}

/// Errors from the storage layer. Duplicates and orphans are not errors,
/// they are ordinary [`BlockResult`](crate::store::BlockResult) outcomes.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("chain invariant violated: {0}")]
    Invariant(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<DecodeError> for StoreError {
    fn from(e: DecodeError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Errors local to a single peer connection.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("bad magic bytes")]
    BadMagic,

    #[error("checksum mismatch for '{0}'")]
    BadChecksum(String),

    #[error("oversized message: {0} bytes")]
    Oversized(usize),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
