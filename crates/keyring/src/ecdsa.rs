//! ECDSA signing over secp256k1 with SHA-256 message hashing.
//!
//! Callers pass the `Secp256k1` context explicitly so a single context
//! (with its precomputed tables) is shared across operations.

use std::fmt;

use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing, Verification};

/// Errors returned by signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaError {
    /// The signature does not verify against the given key and message.
    VerificationFailed,
    /// The provided bytes are not a valid compact (64-byte) signature.
    InvalidCompact,
}

impl fmt::Display for EcdsaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationFailed => write!(f, "ECDSA signature verification failed"),
            Self::InvalidCompact => write!(f, "invalid compact ECDSA signature"),
        }
    }
}

impl std::error::Error for EcdsaError {}

/// SHA-256-hash a message and ECDSA-sign the resulting digest.
pub fn sign_message(
    secp: &Secp256k1<impl Signing>,
    secret_key: &SecretKey,
    message: &[u8],
) -> Signature {
    let digest = sha256::Hash::hash(message).to_byte_array();
    secp.sign_ecdsa(&Message::from_digest(digest), secret_key)
}

/// SHA-256-hash a message and verify the signature against it.
///
/// # Errors
///
/// [`EcdsaError::VerificationFailed`] if the signature does not match.
pub fn verify_message(
    secp: &Secp256k1<impl Verification>,
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), EcdsaError> {
    let digest = sha256::Hash::hash(message).to_byte_array();
    secp.verify_ecdsa(&Message::from_digest(digest), signature, public_key)
        .map_err(|_| EcdsaError::VerificationFailed)
}

/// Parses a hex-encoded 64-byte compact signature.
pub fn parse_compact_hex(s: &str) -> Result<Signature, EcdsaError> {
    let mut bytes = [0u8; 64];
    if s.len() != 128 {
        return Err(EcdsaError::InvalidCompact);
    }
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
        let hi = hex_val(chunk[0]).ok_or(EcdsaError::InvalidCompact)?;
        let lo = hex_val(chunk[1]).ok_or(EcdsaError::InvalidCompact)?;
        bytes[i] = (hi << 4) | lo;
    }
    Signature::from_compact(&bytes).map_err(|_| EcdsaError::InvalidCompact)
}

/// Encodes a signature as hex of its 64-byte compact form.
pub fn encode_compact_hex(signature: &Signature) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let compact = signature.serialize_compact();
    let mut s = String::with_capacity(compact.len() * 2);
    for &b in &compact {
        s.push(HEX[(b >> 4) as usize] as char);
        s.push(HEX[(b & 0x0f) as usize] as char);
    }
    s
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
