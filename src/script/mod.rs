// Script: chunk representation, codec, text form, templates

pub mod interpreter;
pub mod opcodes;

pub use interpreter::{Interpreter, InterpreterFlags, ScriptError};

use crate::core::address::hash160_to_address;
use crate::core::serialize::{Reader, MAX_SCRIPT_SIZE};
use crate::core::{hash160, Network};
use crate::error::DecodeError;
use opcodes::*;
use std::fmt;
use std::str::FromStr;

/// One element of a parsed script: an opcode byte or the payload of a
/// push opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Op(u8),
    Push(Vec<u8>),
}

impl Chunk {
    /// Wire encoding of this chunk, using the shortest push form.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Chunk::Op(op) => buf.push(*op),
            Chunk::Push(data) => match data.len() {
                0 => buf.push(OP_0),
                1..=75 => {
                    buf.push(data.len() as u8);
                    buf.extend_from_slice(data);
                }
                76..=0xff => {
                    buf.push(OP_PUSHDATA1);
                    buf.push(data.len() as u8);
                    buf.extend_from_slice(data);
                }
                0x100..=0xffff => {
                    buf.push(OP_PUSHDATA2);
                    buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
                    buf.extend_from_slice(data);
                }
                _ => {
                    buf.push(OP_PUSHDATA4);
                    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    buf.extend_from_slice(data);
                }
            },
        }
    }
}

/// A script as an ordered list of chunks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Script {
    pub chunks: Vec<Chunk>,
}

impl Script {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    /// Decode script bytes left to right. Opcode bytes 1..=75 and the
    /// OP_PUSHDATA forms consume their payload; everything else becomes an
    /// opcode chunk, unknown bytes included, so round-tripping is
    /// lossless.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_SCRIPT_SIZE {
            return Err(DecodeError::ScriptTooLarge(bytes.len()));
        }

        let mut r = Reader::new(bytes);
        let mut chunks = Vec::new();
        while !r.is_empty() {
            let op = r.u8()?;
            match op {
                1..=75 => chunks.push(Chunk::Push(r.take(op as usize)?.to_vec())),
                OP_PUSHDATA1 => {
                    let len = r.u8()? as usize;
                    chunks.push(Chunk::Push(r.take(len)?.to_vec()));
                }
                OP_PUSHDATA2 => {
                    let len = r.u16_le()? as usize;
                    chunks.push(Chunk::Push(r.take(len)?.to_vec()));
                }
                OP_PUSHDATA4 => {
                    let len = r.u32_le()? as usize;
                    chunks.push(Chunk::Push(r.take(len)?.to_vec()));
                }
                _ => chunks.push(Chunk::Op(op)),
            }
        }

        Ok(Self { chunks })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for chunk in &self.chunks {
            chunk.encode_into(&mut buf);
        }
        buf
    }

    pub fn byte_size(&self) -> usize {
        self.encode().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    // --- templates ---------------------------------------------------

    /// OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
    pub fn is_p2pkh(&self) -> bool {
        matches!(
            self.chunks.as_slice(),
            [Chunk::Op(OP_DUP), Chunk::Op(OP_HASH160), Chunk::Push(h), Chunk::Op(OP_EQUALVERIFY), Chunk::Op(OP_CHECKSIG)]
                if h.len() == 20
        )
    }

    /// <pubkey> OP_CHECKSIG
    pub fn is_p2pk(&self) -> bool {
        matches!(
            self.chunks.as_slice(),
            [Chunk::Push(pk), Chunk::Op(OP_CHECKSIG)] if pk.len() == 33 || pk.len() == 65
        )
    }

    /// <M> <pubkey>.. <N> OP_CHECKMULTISIG
    pub fn is_multisig(&self) -> bool {
        self.multisig_parts().is_some()
    }

    fn multisig_parts(&self) -> Option<(usize, Vec<&[u8]>)> {
        let chunks = &self.chunks;
        if chunks.len() < 4 {
            return None;
        }
        let m = match &chunks[0] {
            Chunk::Op(op) => small_int(*op)? as usize,
            _ => return None,
        };
        let n = match &chunks[chunks.len() - 2] {
            Chunk::Op(op) => small_int(*op)? as usize,
            _ => return None,
        };
        if chunks[chunks.len() - 1] != Chunk::Op(OP_CHECKMULTISIG) {
            return None;
        }
        if m > n || chunks.len() != n + 3 {
            return None;
        }

        let mut pubkeys = Vec::with_capacity(n);
        for chunk in &chunks[1..chunks.len() - 2] {
            match chunk {
                Chunk::Push(pk) => pubkeys.push(pk.as_slice()),
                _ => return None,
            }
        }
        Some((m, pubkeys))
    }

    /// The 20-byte hash committed by a P2PKH script.
    pub fn p2pkh_hash160(&self) -> Option<[u8; 20]> {
        if !self.is_p2pkh() {
            return None;
        }
        match &self.chunks[2] {
            Chunk::Push(h) => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(h);
                Some(hash)
            }
            _ => None,
        }
    }

    /// The pubkey of a pay-to-pubkey script.
    pub fn p2pk_pubkey(&self) -> Option<&[u8]> {
        if !self.is_p2pk() {
            return None;
        }
        match &self.chunks[0] {
            Chunk::Push(pk) => Some(pk),
            _ => None,
        }
    }

    /// (M, pubkeys) of a bare multisig script.
    pub fn multisig_pubkeys(&self) -> Option<(usize, Vec<&[u8]>)> {
        self.multisig_parts()
    }

    /// Base58Check addresses this output script pays to, derived with the
    /// network's version byte. Empty for non-template scripts.
    pub fn addresses(&self, network: Network) -> Vec<String> {
        if let Some(hash) = self.p2pkh_hash160() {
            return vec![hash160_to_address(network, &hash)];
        }
        if let Some(pk) = self.p2pk_pubkey() {
            return vec![hash160_to_address(network, &hash160(pk))];
        }
        if let Some((_, pubkeys)) = self.multisig_pubkeys() {
            return pubkeys
                .iter()
                .map(|pk| hash160_to_address(network, &hash160(pk)))
                .collect();
        }
        Vec::new()
    }

    // --- builders -----------------------------------------------------

    /// Standard P2PKH output script for a pubkey hash.
    pub fn p2pkh(hash: &[u8; 20]) -> Self {
        Self::new(vec![
            Chunk::Op(OP_DUP),
            Chunk::Op(OP_HASH160),
            Chunk::Push(hash.to_vec()),
            Chunk::Op(OP_EQUALVERIFY),
            Chunk::Op(OP_CHECKSIG),
        ])
    }

    /// P2PKH input script: <sig+hashtype> <pubkey>
    pub fn p2pkh_sig(signature: &[u8], pubkey: &[u8]) -> Self {
        Self::new(vec![
            Chunk::Push(signature.to_vec()),
            Chunk::Push(pubkey.to_vec()),
        ])
    }

    /// Pay-to-pubkey output script.
    pub fn p2pk(pubkey: &[u8]) -> Self {
        Self::new(vec![Chunk::Push(pubkey.to_vec()), Chunk::Op(OP_CHECKSIG)])
    }

    /// Bare M-of-N multisig output script.
    pub fn multisig(m: u8, pubkeys: &[&[u8]]) -> Self {
        let mut chunks = Vec::with_capacity(pubkeys.len() + 3);
        chunks.push(Chunk::Op(OP_1 + m - 1));
        for pk in pubkeys {
            chunks.push(Chunk::Push(pk.to_vec()));
        }
        chunks.push(Chunk::Op(OP_1 + pubkeys.len() as u8 - 1));
        chunks.push(Chunk::Op(OP_CHECKMULTISIG));
        Self { chunks }
    }
}

impl fmt::Display for Script {
    /// Canonical one-line form: opcodes by name (OP_0 and OP_1..OP_16 as
    /// bare digits, unknown bytes as "(opcode-N)"), data pushes as
    /// lowercase hex.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match chunk {
                Chunk::Op(OP_0) => write!(f, "0")?,
                Chunk::Op(op) => {
                    if let Some(n) = small_int(*op) {
                        write!(f, "{}", n)?;
                    } else if let Some(name) = opcodes::name(*op) {
                        write!(f, "{}", name)?;
                    } else {
                        write!(f, "(opcode-{})", op)?;
                    }
                }
                Chunk::Push(data) => write!(f, "{}", hex::encode(data))?,
            }
        }
        Ok(())
    }
}

/// Bare decimal 1..16 is the small-integer opcode. Zero-padded or longer
/// digit runs are left for the hex-push case.
fn small_int_token(token: &str) -> Option<u8> {
    if token.starts_with('0') || token.len() > 2 {
        return None;
    }
    match token.parse::<u8>() {
        Ok(n) if (1..=16).contains(&n) => Some(OP_1 + n - 1),
        _ => None,
    }
}

impl FromStr for Script {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chunks = Vec::new();
        for token in s.split_whitespace() {
            if token == "0" {
                chunks.push(Chunk::Op(OP_0));
            } else if let Some(op) = small_int_token(token) {
                chunks.push(Chunk::Op(op));
            } else if let Some(rest) = token
                .strip_prefix("(opcode-")
                .and_then(|t| t.strip_suffix(')'))
            {
                let op = rest
                    .parse::<u8>()
                    .map_err(|_| DecodeError::BadPayload("script"))?;
                chunks.push(Chunk::Op(op));
            } else if token.starts_with("OP_") {
                let op = opcodes::from_name(token).ok_or(DecodeError::BadPayload("script"))?;
                chunks.push(Chunk::Op(op));
            } else {
                let data = hex::decode(token).map_err(|_| DecodeError::BadHex)?;
                chunks.push(Chunk::Push(data));
            }
        }
        Ok(Self { chunks })
    }
}
