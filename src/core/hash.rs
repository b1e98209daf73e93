// Hashing utilities

use crate::core::Hash256;
use sha2::{Digest, Sha256};

/// Single SHA256 hash.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(data);
    let mut result = [0u8; 32];
    result.copy_from_slice(&hash);
    result
}

/// SHA256 double hash (Bitcoin convention).
/// hash256 = SHA256(SHA256(data))
pub fn hash256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut result = [0u8; 32];
    result.copy_from_slice(&second);
    Hash256::new(result)
}

/// RIPEMD160(SHA256(data)) - used for addresses and script hashing.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::{Digest as RipemdDigest, Ripemd160};
    let sha = Sha256::digest(data);
    let ripemd = Ripemd160::digest(sha);
    let mut result = [0u8; 20];
    result.copy_from_slice(&ripemd);
    result
}

/// Merkle root of a list of hashes in block order.
///
/// At each level adjacent nodes are paired; an odd level duplicates its
/// last node. Parent = hash256(left || right). An empty list yields the
/// zero hash.
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::zero();
    }

    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };

            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(left.as_bytes());
            combined.extend_from_slice(right.as_bytes());
            next.push(hash256(&combined));
        }
        level = next;
    }

    level[0]
}
