//! Key material for tunnel devices
//!
//! Uses X25519 for device and client keypairs. Keys are kept as lower-case
//! hex because that is what the device configuration protocol speaks;
//! exported client configuration converts them to base64.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Length of every key in bytes
pub const KEY_LEN: usize = 32;

/// A raw 32-byte key
pub type Key = [u8; KEY_LEN];

/// X25519 keypair, both halves hex encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Result<Self> {
        let private_key = generate_private_key();
        let public_key = derive_public_key(&private_key)?;
        Ok(Self {
            private_key,
            public_key,
        })
    }
}

/// Generate a clamped Curve25519 private key
pub fn generate_private_key() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    hex::encode(key)
}

/// Derive the public key for a hex private key
pub fn derive_public_key(private_hex: &str) -> Result<String> {
    let secret = StaticSecret::from(parse_key(private_hex)?);
    let public = PublicKey::from(&secret);
    Ok(hex::encode(public.as_bytes()))
}

/// Generate a random preshared key
pub fn generate_preshared_key() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    hex::encode(key)
}

/// Parse a hex key into raw bytes
pub fn parse_key(hex_key: &str) -> Result<Key> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| Error::KeyParse(format!("invalid hex: {}", e)))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::KeyParse(format!(
            "invalid key length: {} (expected {})",
            bytes.len(),
            KEY_LEN
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Accept a key in hex or base64 and return it as hex
pub fn normalize_key(key: &str) -> Result<String> {
    let key = key.trim();
    if key.len() == KEY_LEN * 2 {
        return parse_key(key).map(hex::encode);
    }
    base64_to_hex(key)
}

/// Convert a hex key to base64 (wg-quick notation)
pub fn hex_to_base64(hex_key: &str) -> Result<String> {
    Ok(BASE64.encode(parse_key(hex_key)?))
}

/// Convert a base64 key to hex
pub fn base64_to_hex(b64: &str) -> Result<String> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::KeyParse(format!("invalid base64: {}", e)))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::KeyParse(format!(
            "invalid key length: {} (expected {})",
            bytes.len(),
            KEY_LEN
        )));
    }
    Ok(hex::encode(bytes))
}

/// Check whether a hex key is all zeroes (the protocol's "unset" value)
pub fn is_zero(hex_key: &str) -> bool {
    parse_key(hex_key).map(|k| k.iter().all(|b| *b == 0)).unwrap_or(true)
}
