// Transaction data structures

use crate::core::serialize::{write_var_bytes, Reader, Serializable, MAX_SCRIPT_SIZE};
use crate::core::{hash256, Hash256};
use crate::error::DecodeError;

/// Signature hash type covering all inputs and outputs.
pub const SIGHASH_ALL: u8 = 0x01;

/// Transaction input - references a previous transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Hash of the referenced transaction
    pub prev_tx_hash: Hash256,
    /// Index of the output in the referenced transaction
    pub prev_index: u32,
    /// Signature script (scriptSig)
    pub script_sig: Vec<u8>,
    /// Sequence number, usually 0xffffffff
    pub sequence: u32,
}

impl TxInput {
    pub fn new(prev_tx_hash: Hash256, prev_index: u32, script_sig: Vec<u8>) -> Self {
        Self {
            prev_tx_hash,
            prev_index,
            script_sig,
            sequence: 0xffff_ffff,
        }
    }

    /// Coinbase input: all-zero previous hash with index 0xffffffff.
    pub fn coinbase(script_sig: Vec<u8>) -> Self {
        Self {
            prev_tx_hash: Hash256::zero(),
            prev_index: 0xffff_ffff,
            script_sig,
            sequence: 0xffff_ffff,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.prev_tx_hash.is_zero() && self.prev_index == 0xffff_ffff
    }
}

impl Serializable for TxInput {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.prev_tx_hash.as_bytes());
        buf.extend_from_slice(&self.prev_index.to_le_bytes());
        write_var_bytes(buf, &self.script_sig);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
    }

    fn deserialize(r: &mut Reader) -> Result<Self, DecodeError> {
        let prev_tx_hash = r.hash()?;
        let prev_index = r.u32_le()?;
        let script_sig = r.var_bytes_limited(MAX_SCRIPT_SIZE)?;
        let sequence = r.u32_le()?;

        Ok(Self {
            prev_tx_hash,
            prev_index,
            script_sig,
            sequence,
        })
    }
}

/// Transaction output - an amount and the script that locks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount in the smallest unit (satoshis)
    pub value: i64,
    /// Public key script (scriptPubKey)
    pub pk_script: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: i64, pk_script: Vec<u8>) -> Self {
        Self { value, pk_script }
    }
}

impl Serializable for TxOutput {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(buf, &self.pk_script);
    }

    fn deserialize(r: &mut Reader) -> Result<Self, DecodeError> {
        let value = r.i64_le()?;
        let pk_script = r.var_bytes_limited(MAX_SCRIPT_SIZE)?;
        Ok(Self { value, pk_script })
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which the tx is not final
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Coinbase transaction: single synthetic input, arbitrary outputs.
    pub fn coinbase(script_sig: Vec<u8>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs: vec![TxInput::coinbase(script_sig)],
            outputs,
            lock_time: 0,
        }
    }

    /// A transaction is coinbase iff its only input has the synthetic
    /// outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Transaction ID: double SHA256 of the canonical serialization.
    pub fn hash(&self) -> Hash256 {
        hash256(&self.serialize())
    }

    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    pub fn total_output_value(&self) -> i64 {
        self.outputs.iter().map(|out| out.value).sum()
    }

    /// Digest signed by an input's signature under SIGHASH_ALL: every
    /// scriptSig is blanked, the subscript replaces the signed input's
    /// script, and the hash type is appended as a 32-bit little-endian
    /// integer before double hashing.
    pub fn signature_hash(&self, input_index: usize, subscript: &[u8], hash_type: u8) -> Hash256 {
        let mut tx = self.clone();
        for input in &mut tx.inputs {
            input.script_sig.clear();
        }
        if let Some(input) = tx.inputs.get_mut(input_index) {
            input.script_sig = subscript.to_vec();
        }

        let mut data = tx.serialize();
        data.extend_from_slice(&(hash_type as u32).to_le_bytes());
        hash256(&data)
    }
}

impl Serializable for Transaction {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());

        crate::core::serialize::write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.serialize_into(buf);
        }

        crate::core::serialize::write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.serialize_into(buf);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
    }

    fn deserialize(r: &mut Reader) -> Result<Self, DecodeError> {
        let version = r.u32_le()?;

        let input_count = r.varint()? as usize;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxInput::deserialize(r)?);
        }

        let output_count = r.varint()? as usize;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOutput::deserialize(r)?);
        }

        let lock_time = r.u32_le()?;

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}
