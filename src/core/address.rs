// Base58Check addresses

use crate::core::{hash160, hash256, Network};
use crate::error::DecodeError;

/// Base58Check: version byte || payload || first 4 checksum bytes of
/// hash256(version || payload), base58-encoded.
pub fn base58_check_encode(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 5);
    data.push(version);
    data.extend_from_slice(payload);

    let checksum = hash256(&data);
    data.extend_from_slice(&checksum.as_bytes()[..4]);

    bs58::encode(data).into_string()
}

/// Decode a Base58Check string into (version, payload), verifying the
/// checksum.
pub fn base58_check_decode(s: &str) -> Result<(u8, Vec<u8>), DecodeError> {
    let data = bs58::decode(s)
        .into_vec()
        .map_err(|_| DecodeError::BadBase58)?;
    if data.len() < 5 {
        return Err(DecodeError::BadBase58);
    }

    let (body, checksum) = data.split_at(data.len() - 4);
    let expected = hash256(body);
    if checksum != &expected.as_bytes()[..4] {
        return Err(DecodeError::BadBase58Checksum);
    }

    Ok((body[0], body[1..].to_vec()))
}

/// Address for a 20-byte pubkey hash on the given network.
pub fn hash160_to_address(network: Network, hash: &[u8; 20]) -> String {
    base58_check_encode(network.address_version(), hash)
}

/// Address for a serialized public key.
pub fn pubkey_to_address(network: Network, pubkey: &[u8]) -> String {
    hash160_to_address(network, &hash160(pubkey))
}

/// Recover the hash160 from an address, checking the network's version
/// byte.
pub fn address_to_hash160(network: Network, address: &str) -> Result<[u8; 20], DecodeError> {
    let (version, payload) = base58_check_decode(address)?;
    if version != network.address_version() || payload.len() != 20 {
        return Err(DecodeError::BadBase58);
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload);
    Ok(hash)
}

pub fn is_valid_address(network: Network, address: &str) -> bool {
    address_to_hash160(network, address).is_ok()
}
