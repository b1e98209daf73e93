// Script execution engine

use crate::core::hash160;
use crate::script::opcodes;
use crate::script::opcodes::*;
use crate::script::{Chunk, Script};
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Combined main + alt stack depth limit.
pub const MAX_STACK_SIZE: usize = 1_000;
/// Largest element a push may place on the stack.
pub const MAX_ELEMENT_SIZE: usize = 520;
/// Executed opcodes above OP_16 per script pair.
pub const MAX_OP_COUNT: usize = 201;
/// Scripts above this size fail outright.
pub const MAX_SCRIPT_SIZE: usize = crate::core::serialize::MAX_SCRIPT_SIZE;

/// Why a script failed. Diagnostic only: the engine's public result is the
/// boolean verdict, this is never raised to the caller as an error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("disabled opcode 0x{0:02x}")]
    DisabledOpcode(u8),
    #[error("reserved opcode 0x{0:02x}")]
    ReservedOpcode(u8),
    #[error("invalid opcode 0x{0:02x}")]
    BadOpcode(u8),
    #[error("pushed element exceeds 520 bytes")]
    PushSize,
    #[error("stack depth exceeds 1000")]
    StackSize,
    #[error("operation count exceeds 201")]
    OpCount,
    #[error("script exceeds 10000 bytes")]
    ScriptSize,
    #[error("verify failed")]
    Verify,
    #[error("OP_RETURN encountered")]
    Return,
    #[error("numeric operand exceeds 4 bytes")]
    NumberOverflow,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("invalid key count")]
    KeyCount,
    #[error("invalid signature count")]
    SigCount,
    #[error("hash commitment mismatch")]
    CheckHashVerify,
    #[error("empty final stack")]
    EvalFalse,
}

/// Consensus-rule switches.
#[derive(Debug, Clone, Copy)]
pub struct InterpreterFlags {
    /// Treat OP_NOP2 as the BIP-17 OP_CHECKHASHVERIFY commitment opcode.
    /// Off by default, where the byte is an ordinary no-op.
    pub bip17_checkhashverify: bool,
}

impl Default for InterpreterFlags {
    fn default() -> Self {
        Self {
            bip17_checkhashverify: false,
        }
    }
}

/// Signature verification callback: (pubkey, signature without the
/// trailing hash-type byte, hash type) -> valid.
pub type SigChecker<'a> = dyn Fn(&[u8], &[u8], u8) -> bool + 'a;

/// Stack machine executing a signature script followed by an output
/// script, with the main stack carried over.
pub struct Interpreter<'a> {
    stack: Vec<Vec<u8>>,
    alt_stack: Vec<Vec<u8>>,
    /// One entry per open OP_IF/OP_NOTIF; execution is live when all are
    /// true.
    exec_stack: Vec<bool>,
    op_count: usize,
    error: Option<ScriptError>,
    /// Serialized chunks since the last executed OP_CODESEPARATOR of the
    /// currently running script.
    span: Vec<u8>,
    /// Span frozen at the end of the signature script; this is what
    /// OP_CHECKHASHVERIFY commits to.
    frozen_span: Option<Vec<u8>>,
    check_sig: &'a SigChecker<'a>,
    flags: InterpreterFlags,
}

impl<'a> Interpreter<'a> {
    pub fn new(check_sig: &'a SigChecker<'a>, flags: InterpreterFlags) -> Self {
        Self {
            stack: Vec::new(),
            alt_stack: Vec::new(),
            exec_stack: Vec::new(),
            op_count: 0,
            error: None,
            span: Vec::new(),
            frozen_span: None,
            check_sig,
            flags,
        }
    }

    /// Execute `script_sig` then `pk_script` and return the verdict: true
    /// iff no failure was flagged and the top of the main stack is true.
    pub fn verify(
        script_sig: &Script,
        pk_script: &Script,
        check_sig: &'a SigChecker<'a>,
        flags: InterpreterFlags,
    ) -> bool {
        let mut vm = Self::new(check_sig, flags);
        vm.run(script_sig);
        vm.freeze_span();
        vm.run(pk_script);
        vm.verdict()
    }

    /// The diagnostic reason for a false verdict, if any.
    pub fn error(&self) -> Option<ScriptError> {
        self.error
    }

    /// Record the signature script's code span for OP_CHECKHASHVERIFY.
    fn freeze_span(&mut self) {
        self.frozen_span = Some(std::mem::take(&mut self.span));
    }

    fn fail(&mut self, err: ScriptError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn executing(&self) -> bool {
        self.exec_stack.iter().all(|b| *b)
    }

    /// Run a single script against the current state.
    pub fn run(&mut self, script: &Script) {
        if self.error.is_some() {
            return;
        }
        if script.byte_size() > MAX_SCRIPT_SIZE {
            self.fail(ScriptError::ScriptSize);
            return;
        }

        for chunk in &script.chunks {
            if self.error.is_some() {
                return;
            }

            let executing = self.executing();
            match chunk {
                Chunk::Push(data) => {
                    if executing {
                        if data.len() > MAX_ELEMENT_SIZE {
                            self.fail(ScriptError::PushSize);
                            return;
                        }
                        self.stack.push(data.clone());
                    }
                }
                Chunk::Op(op) => {
                    let op = *op;
                    if opcodes::is_disabled(op) {
                        self.fail(ScriptError::DisabledOpcode(op));
                        return;
                    }
                    if op > OP_16 {
                        self.op_count += 1;
                        if self.op_count > MAX_OP_COUNT {
                            self.fail(ScriptError::OpCount);
                            return;
                        }
                    }

                    let is_conditional =
                        matches!(op, OP_IF | OP_NOTIF | OP_ELSE | OP_ENDIF);
                    if executing || is_conditional {
                        if let Err(e) = self.execute(op) {
                            self.fail(e);
                            return;
                        }
                    }
                }
            }

            // Track the code span for hash commitments.
            match chunk {
                Chunk::Op(OP_CODESEPARATOR) => self.span.clear(),
                other => other.encode_into(&mut self.span),
            }

            if self.stack.len() + self.alt_stack.len() > MAX_STACK_SIZE {
                self.fail(ScriptError::StackSize);
                return;
            }
        }

        if !self.exec_stack.is_empty() {
            self.fail(ScriptError::UnbalancedConditional);
        }
    }

    /// Final verdict over the combined execution.
    pub fn verdict(&mut self) -> bool {
        if self.error.is_some() {
            return false;
        }
        match self.stack.last() {
            Some(top) => cast_to_bool(top),
            None => {
                self.fail(ScriptError::EvalFalse);
                false
            }
        }
    }

    fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::StackUnderflow)
    }

    fn pop_num(&mut self) -> Result<i64, ScriptError> {
        decode_num(&self.pop()?)
    }

    fn push_bool(&mut self, b: bool) {
        self.stack.push(if b { vec![1] } else { vec![] });
    }

    fn push_num(&mut self, n: i64) {
        self.stack.push(encode_num(n));
    }

    fn require(&self, depth: usize) -> Result<(), ScriptError> {
        if self.stack.len() < depth {
            Err(ScriptError::StackUnderflow)
        } else {
            Ok(())
        }
    }

    fn execute(&mut self, op: u8) -> Result<(), ScriptError> {
        match op {
            OP_0 => self.stack.push(vec![]),
            OP_1NEGATE => self.push_num(-1),
            OP_1..=OP_16 => {
                // small_int is total on this range
                self.push_num(opcodes::small_int(op).unwrap_or(0));
            }

            OP_NOP => {}
            OP_NOP1 | 0xb2..=OP_NOP10 => {}
            OP_NOP2 => {
                if self.flags.bip17_checkhashverify {
                    self.check_hash_verify()?;
                }
            }

            OP_VER | OP_RESERVED | OP_RESERVED1 | OP_RESERVED2 => {
                return Err(ScriptError::ReservedOpcode(op));
            }

            OP_IF | OP_NOTIF => {
                if self.executing() {
                    let cond = cast_to_bool(&self.pop()?);
                    self.exec_stack.push(if op == OP_IF { cond } else { !cond });
                } else {
                    self.exec_stack.push(false);
                }
            }
            OP_ELSE => {
                let last = self
                    .exec_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
            }
            OP_ENDIF => {
                self.exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }

            OP_VERIFY => {
                let top = self.pop()?;
                if !cast_to_bool(&top) {
                    return Err(ScriptError::Verify);
                }
            }
            OP_RETURN => return Err(ScriptError::Return),

            OP_TOALTSTACK => {
                let top = self.pop()?;
                self.alt_stack.push(top);
            }
            OP_FROMALTSTACK => {
                let top = self.alt_stack.pop().ok_or(ScriptError::StackUnderflow)?;
                self.stack.push(top);
            }

            OP_IFDUP => {
                let top = self.stack.last().ok_or(ScriptError::StackUnderflow)?;
                if cast_to_bool(top) {
                    let copy = top.clone();
                    self.stack.push(copy);
                }
            }
            OP_DEPTH => {
                let depth = self.stack.len() as i64;
                self.push_num(depth);
            }
            OP_DROP => {
                self.pop()?;
            }
            OP_DUP => {
                let top = self.stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                self.stack.push(top);
            }
            OP_NIP => {
                self.require(2)?;
                let top = self.pop()?;
                self.pop()?;
                self.stack.push(top);
            }
            OP_OVER => {
                self.require(2)?;
                let second = self.stack[self.stack.len() - 2].clone();
                self.stack.push(second);
            }
            OP_PICK | OP_ROLL => {
                let n = self.pop_num()?;
                if n < 0 || n as usize >= self.stack.len() {
                    return Err(ScriptError::StackUnderflow);
                }
                let idx = self.stack.len() - 1 - n as usize;
                let item = if op == OP_PICK {
                    self.stack[idx].clone()
                } else {
                    self.stack.remove(idx)
                };
                self.stack.push(item);
            }
            OP_ROT => {
                self.require(3)?;
                let len = self.stack.len();
                self.stack[len - 3..].rotate_left(1);
            }
            OP_SWAP => {
                self.require(2)?;
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            OP_TUCK => {
                self.require(2)?;
                let top = self.pop()?;
                let second = self.pop()?;
                self.stack.push(top.clone());
                self.stack.push(second);
                self.stack.push(top);
            }
            OP_2DROP => {
                self.require(2)?;
                self.pop()?;
                self.pop()?;
            }
            OP_2DUP => {
                self.require(2)?;
                let len = self.stack.len();
                let a = self.stack[len - 2].clone();
                let b = self.stack[len - 1].clone();
                self.stack.push(a);
                self.stack.push(b);
            }
            OP_3DUP => {
                self.require(3)?;
                let len = self.stack.len();
                for i in 0..3 {
                    let item = self.stack[len - 3 + i].clone();
                    self.stack.push(item);
                }
            }
            OP_2OVER => {
                self.require(4)?;
                let len = self.stack.len();
                let a = self.stack[len - 4].clone();
                let b = self.stack[len - 3].clone();
                self.stack.push(a);
                self.stack.push(b);
            }
            OP_2ROT => {
                self.require(6)?;
                let len = self.stack.len();
                self.stack[len - 6..].rotate_left(2);
            }
            OP_2SWAP => {
                self.require(4)?;
                let len = self.stack.len();
                self.stack[len - 4..].rotate_left(2);
            }
            OP_SIZE => {
                let size = self.stack.last().ok_or(ScriptError::StackUnderflow)?.len();
                self.push_num(size as i64);
            }

            OP_EQUAL | OP_EQUALVERIFY => {
                self.require(2)?;
                let a = self.pop()?;
                let b = self.pop()?;
                if op == OP_EQUAL {
                    self.push_bool(a == b);
                } else if a != b {
                    return Err(ScriptError::Verify);
                }
            }

            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let n = self.pop_num()?;
                match op {
                    OP_1ADD => self.push_num(n + 1),
                    OP_1SUB => self.push_num(n - 1),
                    OP_NEGATE => self.push_num(-n),
                    OP_ABS => self.push_num(n.abs()),
                    OP_NOT => self.push_bool(n == 0),
                    _ => self.push_bool(n != 0),
                }
            }

            OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
            | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
            | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                self.require(2)?;
                let b = self.pop_num()?;
                let a = self.pop_num()?;
                match op {
                    OP_ADD => self.push_num(a + b),
                    OP_SUB => self.push_num(a - b),
                    OP_BOOLAND => self.push_bool(a != 0 && b != 0),
                    OP_BOOLOR => self.push_bool(a != 0 || b != 0),
                    OP_NUMEQUAL => self.push_bool(a == b),
                    OP_NUMEQUALVERIFY => {
                        if a != b {
                            return Err(ScriptError::Verify);
                        }
                    }
                    OP_NUMNOTEQUAL => self.push_bool(a != b),
                    OP_LESSTHAN => self.push_bool(a < b),
                    OP_GREATERTHAN => self.push_bool(a > b),
                    OP_LESSTHANOREQUAL => self.push_bool(a <= b),
                    OP_GREATERTHANOREQUAL => self.push_bool(a >= b),
                    OP_MIN => self.push_num(a.min(b)),
                    _ => self.push_num(a.max(b)),
                }
            }

            OP_WITHIN => {
                self.require(3)?;
                let max = self.pop_num()?;
                let min = self.pop_num()?;
                let x = self.pop_num()?;
                self.push_bool(min <= x && x < max);
            }

            OP_RIPEMD160 => {
                let top = self.pop()?;
                self.stack.push(Ripemd160::digest(&top).to_vec());
            }
            OP_SHA1 => {
                let top = self.pop()?;
                self.stack.push(Sha1::digest(&top).to_vec());
            }
            OP_SHA256 => {
                let top = self.pop()?;
                self.stack.push(Sha256::digest(&top).to_vec());
            }
            OP_HASH160 => {
                let top = self.pop()?;
                self.stack.push(hash160(&top).to_vec());
            }
            OP_HASH256 => {
                let top = self.pop()?;
                self.stack
                    .push(crate::core::hash256(&top).as_bytes().to_vec());
            }

            OP_CODESEPARATOR => {
                // The span reset happens in the run loop, which sees the
                // chunk stream.
            }

            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                self.require(2)?;
                let pubkey = self.pop()?;
                let sig = self.pop()?;
                let ok = self.check_one_sig(&pubkey, &sig);
                if op == OP_CHECKSIG {
                    self.push_bool(ok);
                } else if !ok {
                    return Err(ScriptError::Verify);
                }
            }

            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let ok = self.check_multisig()?;
                if op == OP_CHECKMULTISIG {
                    self.push_bool(ok);
                } else if !ok {
                    return Err(ScriptError::Verify);
                }
            }

            other => return Err(ScriptError::BadOpcode(other)),
        }
        Ok(())
    }

    fn check_one_sig(&self, pubkey: &[u8], sig: &[u8]) -> bool {
        if sig.is_empty() {
            return false;
        }
        let hash_type = sig[sig.len() - 1];
        (self.check_sig)(pubkey, &sig[..sig.len() - 1], hash_type)
    }

    /// CHECKMULTISIG stack layout, top first: N, N pubkeys, M, M
    /// signatures, one extra dummy element. Each signature must match a
    /// pubkey; the pubkey cursor only moves forward, so signatures must
    /// appear in the same relative order as their keys.
    fn check_multisig(&mut self) -> Result<bool, ScriptError> {
        let n = self.pop_num()?;
        if !(0..=20).contains(&n) {
            return Err(ScriptError::KeyCount);
        }
        self.require(n as usize)?;
        let mut pubkeys: Vec<Vec<u8>> = Vec::with_capacity(n as usize);
        for _ in 0..n {
            pubkeys.push(self.pop()?);
        }
        pubkeys.reverse();

        let m = self.pop_num()?;
        if m < 0 || m > n {
            return Err(ScriptError::SigCount);
        }
        self.require(m as usize)?;
        let mut sigs: Vec<Vec<u8>> = Vec::with_capacity(m as usize);
        for _ in 0..m {
            sigs.push(self.pop()?);
        }
        sigs.reverse();

        // The historical off-by-one: one extra element is consumed
        // unconditionally.
        self.pop()?;

        let mut pk_idx = 0;
        for sig in &sigs {
            let mut matched = false;
            while pk_idx < pubkeys.len() {
                let pk = &pubkeys[pk_idx];
                pk_idx += 1;
                if self.check_one_sig(pk, sig) {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// BIP-17 hash commitment: the popped 20 bytes must equal the hash160
    /// of the signature script's code span since its last
    /// OP_CODESEPARATOR.
    fn check_hash_verify(&mut self) -> Result<(), ScriptError> {
        let expected = self.pop()?;
        let code = self.frozen_span.as_ref().unwrap_or(&self.span);
        let actual = hash160(code);
        if expected.len() != 20 || expected != actual {
            return Err(ScriptError::CheckHashVerify);
        }
        Ok(())
    }
}

/// Empty strings and (possibly negative) zero are false; everything else
/// is true.
pub fn cast_to_bool(data: &[u8]) -> bool {
    for (i, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // negative zero: sign bit alone in the last byte
            return !(i == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Minimal little-endian sign-magnitude encoding.
pub fn encode_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return vec![];
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut bytes = Vec::new();
    while abs > 0 {
        bytes.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    // The most significant byte carries the sign bit. If it is occupied,
    // an extra byte is appended.
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        bytes.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = bytes.len() - 1;
        bytes[last] |= 0x80;
    }
    bytes
}

/// Decode an integer operand; at most 4 bytes are consumed.
pub fn decode_num(data: &[u8]) -> Result<i64, ScriptError> {
    if data.len() > 4 {
        return Err(ScriptError::NumberOverflow);
    }
    if data.is_empty() {
        return Ok(0);
    }

    let mut value: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        let byte = if i == data.len() - 1 {
            (byte & 0x7f) as i64
        } else {
            *byte as i64
        };
        value |= byte << (8 * i);
    }
    if data[data.len() - 1] & 0x80 != 0 {
        value = -value;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{hash256, Hash256};
    use secp256k1::ecdsa::Signature;
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    fn reject_all(_pk: &[u8], _sig: &[u8], _ht: u8) -> bool {
        false
    }

    fn run_script(text: &str) -> (bool, Option<ScriptError>) {
        let script: Script = text.parse().unwrap();
        let checker = reject_all;
        let mut vm = Interpreter::new(&checker, InterpreterFlags::default());
        vm.run(&script);
        let verdict = vm.verdict();
        (verdict, vm.error())
    }

    fn expect_true(text: &str) {
        let (verdict, error) = run_script(text);
        assert!(verdict, "expected true: {} ({:?})", text, error);
    }

    fn expect_false(text: &str) {
        let (verdict, _) = run_script(text);
        assert!(!verdict, "expected false: {}", text);
    }

    #[test]
    fn test_number_encoding() {
        assert_eq!(encode_num(0), Vec::<u8>::new());
        assert_eq!(encode_num(1), vec![1]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(encode_num(127), vec![0x7f]);
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_num(-128), vec![0x80, 0x80]);
        assert_eq!(encode_num(256), vec![0x00, 0x01]);
        assert_eq!(encode_num(-256), vec![0x00, 0x81]);

        for n in [-70000i64, -256, -128, -1, 0, 1, 127, 128, 255, 70000] {
            assert_eq!(decode_num(&encode_num(n)).unwrap(), n, "n={}", n);
        }
    }

    #[test]
    fn test_number_overflow() {
        assert_eq!(decode_num(&[1, 2, 3, 4, 5]), Err(ScriptError::NumberOverflow));
        assert!(decode_num(&[1, 2, 3, 4]).is_ok());
    }

    #[test]
    fn test_cast_to_bool() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0]));
        assert!(!cast_to_bool(&[0, 0]));
        assert!(!cast_to_bool(&[0x80])); // negative zero
        assert!(!cast_to_bool(&[0, 0x80]));
        assert!(cast_to_bool(&[1]));
        assert!(cast_to_bool(&[0x80, 0])); // 0x80 not in last position
        assert!(cast_to_bool(&[0, 1]));
    }

    #[test]
    fn test_push_constants() {
        expect_true("1");
        expect_true("16");
        expect_false("0");
        expect_true("OP_1NEGATE"); // -1 is truthy
        expect_true("deadbeef");
    }

    #[test]
    fn test_stack_ops() {
        expect_true("1 2 OP_DROP");
        expect_true("1 OP_DUP OP_EQUAL");
        expect_true("1 2 OP_SWAP OP_DROP 2 OP_NUMEQUAL");
        expect_true("1 2 OP_NIP"); // leaves [2]
        expect_true("1 2 OP_OVER"); // leaves [1 2 1]
        expect_true("5 OP_TOALTSTACK OP_FROMALTSTACK 5 OP_NUMEQUAL");
        expect_true("1 2 OP_TUCK OP_2DROP"); // [2 1 2] -> [2]
        expect_true("0 OP_IFDUP OP_NOT"); // no dup for false
    }

    #[test]
    fn test_pick_and_roll() {
        expect_true("1 2 3 1 OP_PICK 2 OP_NUMEQUAL"); // copies index 1
        expect_true("1 2 3 1 OP_ROLL 2 OP_NUMEQUAL"); // moves index 1
        expect_false("1 2 OP_PICK"); // index out of range fails
    }

    #[test]
    fn test_empty_stack_pops_fail() {
        let (verdict, error) = run_script("OP_DUP");
        assert!(!verdict);
        assert_eq!(error, Some(ScriptError::StackUnderflow));

        expect_false("OP_DROP");
        expect_false("OP_FROMALTSTACK");
        expect_false("1 OP_EQUAL");
    }

    #[test]
    fn test_arithmetic() {
        expect_true("2 3 OP_ADD 5 OP_NUMEQUAL");
        expect_true("5 3 OP_SUB 2 OP_NUMEQUAL");
        expect_true("1 1 OP_BOOLAND");
        expect_false("1 0 OP_BOOLAND");
        expect_true("0 1 OP_BOOLOR");
        expect_true("3 OP_1ADD 4 OP_NUMEQUAL");
        expect_true("3 OP_1SUB 2 OP_NUMEQUAL");
        expect_true("3 OP_NEGATE OP_ABS 3 OP_NUMEQUAL");
        expect_true("0 OP_NOT");
        expect_true("5 OP_0NOTEQUAL");
        expect_true("2 3 OP_LESSTHAN");
        expect_true("3 2 OP_GREATERTHAN");
        expect_true("3 3 OP_GREATERTHANOREQUAL");
        expect_true("2 3 OP_MIN 2 OP_NUMEQUAL");
        expect_true("2 3 OP_MAX 3 OP_NUMEQUAL");
        expect_true("2 1 4 OP_WITHIN"); // 1 <= 2 < 4
        expect_false("4 1 4 OP_WITHIN"); // max is exclusive
    }

    #[test]
    fn test_equal_and_verify() {
        expect_true("deadbeef deadbeef OP_EQUAL");
        expect_false("deadbeef beefdead OP_EQUAL");
        expect_true("1 1 OP_EQUALVERIFY 1");
        expect_false("1 2 OP_EQUALVERIFY 1");
        expect_false("0 OP_VERIFY 1");
        expect_true("1 OP_VERIFY 1");
        // OP_VERIFY consumes its operand; nothing left means failure
        expect_false("1 OP_VERIFY");
    }

    #[test]
    fn test_conditionals() {
        expect_true("1 OP_IF 2 OP_ELSE 3 OP_ENDIF 2 OP_NUMEQUAL");
        expect_true("0 OP_IF 2 OP_ELSE 3 OP_ENDIF 3 OP_NUMEQUAL");
        expect_true("0 OP_NOTIF 2 OP_ELSE 3 OP_ENDIF 2 OP_NUMEQUAL");
        // nesting
        expect_true("1 1 OP_IF OP_IF 2 OP_ELSE 3 OP_ENDIF OP_ENDIF 2 OP_NUMEQUAL");
        // unbalanced
        let (verdict, error) = run_script("1 OP_IF 1");
        assert!(!verdict);
        assert_eq!(error, Some(ScriptError::UnbalancedConditional));
        expect_false("OP_ELSE 1");
        expect_false("OP_ENDIF 1");
    }

    #[test]
    fn test_return_fails() {
        let (verdict, error) = run_script("1 OP_RETURN");
        assert!(!verdict);
        assert_eq!(error, Some(ScriptError::Return));
    }

    #[test]
    fn test_disabled_opcodes_fail() {
        for name in ["OP_CAT", "OP_MUL", "OP_DIV", "OP_XOR", "OP_LSHIFT"] {
            let (verdict, error) = run_script(&format!("1 1 {}", name));
            assert!(!verdict, "{} must fail", name);
            assert!(matches!(error, Some(ScriptError::DisabledOpcode(_))));
        }
        // disabled even inside a dead branch
        let (verdict, error) = run_script("0 OP_IF OP_CAT OP_ENDIF 1");
        assert!(!verdict);
        assert!(matches!(error, Some(ScriptError::DisabledOpcode(_))));
    }

    #[test]
    fn test_hash_opcodes() {
        // OP_HASH160 of pubkey data compared against precomputed value
        let data = b"some data".to_vec();
        let expected = hex::encode(hash160(&data));
        expect_true(&format!("{} OP_HASH160 {} OP_EQUAL", hex::encode(&data), expected));

        let expected256 = hex::encode(hash256(&data).as_bytes());
        expect_true(&format!("{} OP_HASH256 {} OP_EQUAL", hex::encode(&data), expected256));

        let sha = hex::encode(Sha256::digest(&data));
        expect_true(&format!("{} OP_SHA256 {} OP_EQUAL", hex::encode(&data), sha));

        let sha1 = hex::encode(Sha1::digest(&data));
        expect_true(&format!("{} OP_SHA1 {} OP_EQUAL", hex::encode(&data), sha1));

        let ripemd = hex::encode(Ripemd160::digest(&data));
        expect_true(&format!("{} OP_RIPEMD160 {} OP_EQUAL", hex::encode(&data), ripemd));
    }

    #[test]
    fn test_size_opcode() {
        expect_true("deadbeef OP_SIZE 4 OP_NUMEQUAL OP_VERIFY OP_SIZE OP_DROP 1");
    }

    #[test]
    fn test_stack_limit() {
        // 1001 pushes overflows the combined stack
        let script_text = vec!["1"; MAX_STACK_SIZE + 1].join(" ");
        let (verdict, error) = run_script(&script_text);
        assert!(!verdict);
        assert_eq!(error, Some(ScriptError::StackSize));

        // exactly 1000 is fine
        let script_text = vec!["1"; MAX_STACK_SIZE].join(" ");
        let script: Script = script_text.parse().unwrap();
        let checker = reject_all;
        let mut vm = Interpreter::new(&checker, InterpreterFlags::default());
        vm.run(&script);
        assert!(vm.verdict());
    }

    #[test]
    fn test_op_count_limit() {
        let script_text = vec!["OP_NOP"; MAX_OP_COUNT + 1].join(" ");
        let (verdict, error) = run_script(&format!("1 {}", script_text));
        assert!(!verdict);
        assert_eq!(error, Some(ScriptError::OpCount));
    }

    #[test]
    fn test_script_size_limit() {
        let script = Script::new(vec![Chunk::Op(OP_NOP); MAX_SCRIPT_SIZE + 1]);
        let checker = reject_all;
        let mut vm = Interpreter::new(&checker, InterpreterFlags::default());
        vm.run(&script);
        assert!(!vm.verdict());
        assert_eq!(vm.error(), Some(ScriptError::ScriptSize));
    }

    #[test]
    fn test_push_size_limit() {
        let script = Script::new(vec![Chunk::Push(vec![0u8; MAX_ELEMENT_SIZE + 1])]);
        let checker = reject_all;
        let mut vm = Interpreter::new(&checker, InterpreterFlags::default());
        vm.run(&script);
        assert_eq!(vm.error(), Some(ScriptError::PushSize));

        let script = Script::new(vec![Chunk::Push(vec![1u8; MAX_ELEMENT_SIZE])]);
        let mut vm = Interpreter::new(&checker, InterpreterFlags::default());
        vm.run(&script);
        assert!(vm.verdict());
    }

    #[test]
    fn test_unknown_opcode_fails() {
        let script = Script::new(vec![Chunk::Op(0x51), Chunk::Op(0xbd)]);
        let checker = reject_all;
        let mut vm = Interpreter::new(&checker, InterpreterFlags::default());
        vm.run(&script);
        assert_eq!(vm.error(), Some(ScriptError::BadOpcode(0xbd)));
    }

    #[test]
    fn test_nop2_is_noop_by_default() {
        expect_true("1 OP_NOP2");
        expect_true("1 OP_NOP1 OP_NOP10");
    }

    // --- signature opcodes with a real secp256k1 checker ---------------

    struct Keys {
        secp: Secp256k1<secp256k1::All>,
        secret: SecretKey,
        pubkey: Vec<u8>,
    }

    fn make_keys() -> Keys {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        Keys {
            secp,
            secret,
            pubkey: public.serialize().to_vec(),
        }
    }

    fn sign(keys: &Keys, digest: &Hash256) -> Vec<u8> {
        let msg = Message::from_digest_slice(digest.as_bytes()).unwrap();
        let mut sig = keys.secp.sign_ecdsa(&msg, &keys.secret).serialize_der().to_vec();
        sig.push(0x01); // hash type byte
        sig
    }

    /// Checker verifying DER signatures over a fixed digest.
    fn digest_checker(digest: Hash256) -> impl Fn(&[u8], &[u8], u8) -> bool {
        move |pubkey, sig, _hash_type| {
            let secp = Secp256k1::verification_only();
            let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
                return false;
            };
            let Ok(sig) = Signature::from_der(sig) else {
                return false;
            };
            let Ok(msg) = Message::from_digest_slice(digest.as_bytes()) else {
                return false;
            };
            secp.verify_ecdsa(&msg, &sig, &pubkey).is_ok()
        }
    }

    #[test]
    fn test_checksig_valid_and_tampered() {
        let keys = make_keys();
        let digest = hash256(b"spend authorization");
        let sig = sign(&keys, &digest);

        let script_sig = Script::new(vec![Chunk::Push(sig.clone())]);
        let pk_script = Script::new(vec![
            Chunk::Push(keys.pubkey.clone()),
            Chunk::Op(OP_CHECKSIG),
        ]);

        let checker = digest_checker(digest);
        assert!(Interpreter::verify(
            &script_sig,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));

        // tampered signature byte
        let mut bad_sig = sig.clone();
        bad_sig[10] ^= 0x01;
        let bad_script_sig = Script::new(vec![Chunk::Push(bad_sig)]);
        assert!(!Interpreter::verify(
            &bad_script_sig,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));

        // tampered pubkey byte
        let mut bad_pubkey = keys.pubkey.clone();
        bad_pubkey[5] ^= 0x01;
        let bad_pk_script = Script::new(vec![Chunk::Push(bad_pubkey), Chunk::Op(OP_CHECKSIG)]);
        assert!(!Interpreter::verify(
            &script_sig,
            &bad_pk_script,
            &checker,
            InterpreterFlags::default()
        ));

        // different signed digest
        let other_checker = digest_checker(hash256(b"other message"));
        assert!(!Interpreter::verify(
            &script_sig,
            &pk_script,
            &other_checker,
            InterpreterFlags::default()
        ));
    }

    #[test]
    fn test_p2pkh_end_to_end() {
        let keys = make_keys();
        let digest = hash256(b"p2pkh spend");
        let sig = sign(&keys, &digest);

        let pk_script = Script::p2pkh(&hash160(&keys.pubkey));
        let script_sig = Script::p2pkh_sig(&sig, &keys.pubkey);

        let checker = digest_checker(digest);
        assert!(Interpreter::verify(
            &script_sig,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));

        // wrong key for the committed hash
        let other = make_keys();
        let other_sig = sign(&other, &digest);
        let wrong_sig = Script::p2pkh_sig(&other_sig, &other.pubkey);
        assert!(!Interpreter::verify(
            &wrong_sig,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));
    }

    #[test]
    fn test_checksigverify() {
        let keys = make_keys();
        let digest = hash256(b"csv");
        let sig = sign(&keys, &digest);
        let checker = digest_checker(digest);

        let script_sig = Script::new(vec![Chunk::Push(sig)]);
        let pk_script = Script::new(vec![
            Chunk::Push(keys.pubkey.clone()),
            Chunk::Op(OP_CHECKSIGVERIFY),
            Chunk::Op(OP_1),
        ]);
        assert!(Interpreter::verify(
            &script_sig,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));
    }

    #[test]
    fn test_checkmultisig_two_of_three() {
        let k1 = make_keys();
        let k2 = make_keys();
        let k3 = make_keys();
        let digest = hash256(b"foobar");
        let s1 = sign(&k1, &digest);
        let s2 = sign(&k2, &digest);
        let checker = digest_checker(digest);

        // 0 <s1> <s2> | 2 <k1> <k2> <k3> 3 OP_CHECKMULTISIG
        let script_sig = Script::new(vec![
            Chunk::Op(OP_0),
            Chunk::Push(s1.clone()),
            Chunk::Push(s2.clone()),
        ]);
        let pk_script = Script::multisig(2, &[&k1.pubkey, &k2.pubkey, &k3.pubkey]);
        assert!(Interpreter::verify(
            &script_sig,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));

        // signatures out of key order fail the monotonic matching
        let reversed = Script::new(vec![
            Chunk::Op(OP_0),
            Chunk::Push(s2.clone()),
            Chunk::Push(s1.clone()),
        ]);
        assert!(!Interpreter::verify(
            &reversed,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));

        // skipped key is fine: s1, s3 against k1 k2 k3
        let s3 = sign(&k3, &digest);
        let skipping = Script::new(vec![
            Chunk::Op(OP_0),
            Chunk::Push(s1.clone()),
            Chunk::Push(s3),
        ]);
        assert!(Interpreter::verify(
            &skipping,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));

        // missing dummy element underflows
        let no_dummy = Script::new(vec![Chunk::Push(s1), Chunk::Push(s2)]);
        assert!(!Interpreter::verify(
            &no_dummy,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));
    }

    #[test]
    fn test_checkhashverify() {
        // scriptSig: OP_CODESEPARATOR <inner>; the commitment covers the
        // chunks after the separator.
        let inner = Chunk::Push(b"redeem me".to_vec());
        let mut span = Vec::new();
        inner.encode_into(&mut span);
        let commitment = hash160(&span);

        let script_sig = Script::new(vec![Chunk::Op(OP_CODESEPARATOR), inner]);
        let pk_script = Script::new(vec![
            Chunk::Push(commitment.to_vec()),
            Chunk::Op(OP_NOP2),
            Chunk::Op(OP_1),
        ]);

        let checker = reject_all;
        let flags = InterpreterFlags {
            bip17_checkhashverify: true,
        };
        assert!(Interpreter::verify(&script_sig, &pk_script, &checker, flags));

        // wrong commitment
        let bad_pk = Script::new(vec![
            Chunk::Push(vec![0u8; 20]),
            Chunk::Op(OP_NOP2),
            Chunk::Op(OP_1),
        ]);
        assert!(!Interpreter::verify(&script_sig, &bad_pk, &checker, flags));

        // with the flag off the bytes are plain no-ops; the unconsumed
        // commitment stays on the stack and the script still succeeds
        assert!(Interpreter::verify(
            &script_sig,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));
    }

    #[test]
    fn test_codeseparator_moves_commitment() {
        // A separator inside the sig script resets the span: only chunks
        // after the last one count.
        let first = Chunk::Push(b"ignored".to_vec());
        let second = Chunk::Push(b"counted".to_vec());
        let mut span = Vec::new();
        second.encode_into(&mut span);
        let commitment = hash160(&span);

        let script_sig = Script::new(vec![
            first,
            Chunk::Op(OP_CODESEPARATOR),
            second,
        ]);
        let pk_script = Script::new(vec![
            Chunk::Push(commitment.to_vec()),
            Chunk::Op(OP_NOP2),
            Chunk::Op(OP_1),
        ]);

        let checker = reject_all;
        let flags = InterpreterFlags {
            bip17_checkhashverify: true,
        };
        assert!(Interpreter::verify(&script_sig, &pk_script, &checker, flags));
    }

    #[test]
    fn test_verdict_requires_nonempty_stack() {
        let checker = reject_all;
        let mut vm = Interpreter::new(&checker, InterpreterFlags::default());
        vm.run(&Script::default());
        assert!(!vm.verdict());
        assert_eq!(vm.error(), Some(ScriptError::EvalFalse));
    }

    #[test]
    fn test_sig_and_pubkey_scripts_share_the_stack() {
        let script_sig: Script = "2 3".parse().unwrap();
        let pk_script: Script = "OP_ADD 5 OP_NUMEQUAL".parse().unwrap();
        let checker = reject_all;
        assert!(Interpreter::verify(
            &script_sig,
            &pk_script,
            &checker,
            InterpreterFlags::default()
        ));
    }
}
