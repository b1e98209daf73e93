// Basic types: hashes, networks, inventories

use crate::error::DecodeError;
use std::fmt;

/// 256-bit hash (32 bytes), stored in the byte order it appears on the
/// wire. Display reverses the bytes, per Bitcoin convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, DecodeError> {
        if slice.len() != 32 {
            return Err(DecodeError::Truncated);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Zero hash, used as the previous-block hash of a genesis block and
    /// as the previous outpoint of a coinbase input.
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex string in display order (reversed wire bytes).
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    /// Parse from a display-order hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, DecodeError> {
        let bytes = hex::decode(hex_str).map_err(|_| DecodeError::BadHex)?;
        if bytes.len() != 32 {
            return Err(DecodeError::BadHex);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        hash.reverse();
        Ok(Self(hash))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Kind of an inventory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    Tx,
    Block,
}

impl InvKind {
    /// Wire value used in inv/getdata vectors.
    pub fn to_wire(self) -> u32 {
        match self {
            InvKind::Tx => 1,
            InvKind::Block => 2,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(InvKind::Tx),
            2 => Some(InvKind::Block),
            _ => None,
        }
    }
}

/// A (kind, hash) announcement, the currency of inv/getdata negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inventory {
    pub fn tx(hash: Hash256) -> Self {
        Self { kind: InvKind::Tx, hash }
    }

    pub fn block(hash: Hash256) -> Self {
        Self { kind: InvKind::Block, hash }
    }
}

/// Network parameters: protocol magic, default port, address version byte
/// and DNS seed hostnames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// The four magic bytes prefixed to every wire message.
    pub fn magic(self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }

    /// Version byte prepended to hash160 payloads in Base58Check addresses.
    pub fn address_version(self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Regtest => 0x6f,
        }
    }

    pub fn dns_seeds(self) -> &'static [&'static str] {
        match self {
            Network::Mainnet => &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
            ],
            Network::Testnet => &[
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
            ],
            Network::Regtest => &[],
        }
    }
}
