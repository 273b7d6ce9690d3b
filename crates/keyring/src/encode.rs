//! Bech32m encodings for addresses and key material.
//!
//! All three encodings share the same shape: a fixed HRP naming the
//! payload kind, the raw bytes, a Bech32m checksum. Addresses are the
//! HASH-160 of the compressed public key; keys are encoded verbatim.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Bech32m, Hrp};
use bitcoin::hashes::{Hash, hash160};
use bitcoin::secp256k1::{PublicKey, SecretKey};

/// Human-readable part of an account address.
pub const HRP_ADDRESS: &str = "acct";

/// Human-readable part of an encoded public key.
pub const HRP_PUBLIC: &str = "pub";

/// Human-readable part of an encoded secret key.
pub const HRP_SECRET: &str = "sec";

/// Length of an address payload (HASH-160 digest).
const ADDRESS_LEN: usize = 20;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors from parsing Bech32m-encoded values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Bech32m decoding failed (checksum, charset, separator).
    Bech32(String),
    /// The HRP does not match the expected payload kind.
    UnexpectedHrp {
        expected: &'static str,
        found: String,
    },
    /// The payload has the wrong length for its kind.
    BadLength,
    /// The payload bytes are not a valid secp256k1 key.
    InvalidKey,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bech32(e) => write!(f, "bech32 error: {e}"),
            Self::UnexpectedHrp { expected, found } => {
                write!(f, "expected HRP {expected:?}, found {found:?}")
            }
            Self::BadLength => write!(f, "payload has wrong length"),
            Self::InvalidKey => write!(f, "payload is not a valid key"),
        }
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// An account address: HASH-160 of the compressed secp256k1 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Computes the address of a public key.
    pub fn from_public_key(public: &PublicKey) -> Self {
        let digest = hash160::Hash::hash(&public.serialize());
        Self(digest.to_byte_array())
    }

    /// Returns the raw 20-byte digest.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Parses an `acct1…` string.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let payload = decode_payload::<ADDRESS_LEN>(s, HRP_ADDRESS)?;
        Ok(Self(payload))
    }
}

/// Writes the Bech32m encoding directly to the formatter.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hrp = Hrp::parse(HRP_ADDRESS).expect("HRP constant is valid");
        bech32::encode_lower_to_fmt::<Bech32m, _>(f, hrp, &self.0).map_err(|_| fmt::Error)
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Key encodings
// ---------------------------------------------------------------------------

/// Encodes a secret key as `sec1…`.
pub fn encode_secret_key(secret: &SecretKey) -> String {
    encode_payload(HRP_SECRET, &secret.secret_bytes())
}

/// Parses a `sec1…` string into a secret key.
pub fn parse_secret_key(s: &str) -> Result<SecretKey, ParseError> {
    let payload = decode_payload::<32>(s, HRP_SECRET)?;
    SecretKey::from_slice(&payload).map_err(|_| ParseError::InvalidKey)
}

/// Encodes a public key (compressed) as `pub1…`.
pub fn encode_public_key(public: &PublicKey) -> String {
    encode_payload(HRP_PUBLIC, &public.serialize())
}

/// Parses a `pub1…` string into a public key.
pub fn parse_public_key(s: &str) -> Result<PublicKey, ParseError> {
    let payload = decode_payload::<33>(s, HRP_PUBLIC)?;
    PublicKey::from_slice(&payload).map_err(|_| ParseError::InvalidKey)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn encode_payload(hrp: &'static str, data: &[u8]) -> String {
    let hrp = Hrp::parse(hrp).expect("HRP constant is valid");
    bech32::encode::<Bech32m>(hrp, data).expect("payload fits bech32 length limits")
}

/// Decodes a Bech32m string into a fixed-size payload, checking the HRP.
fn decode_payload<const N: usize>(
    s: &str,
    expected_hrp: &'static str,
) -> Result<[u8; N], ParseError> {
    // Bech32m is case-insensitive; normalize only when needed.
    let normalized: Cow<'_, str> = if s.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(s.to_lowercase())
    } else {
        Cow::Borrowed(s)
    };

    let checked = CheckedHrpstring::new::<Bech32m>(&normalized)
        .map_err(|e| ParseError::Bech32(e.to_string()))?;

    if checked.hrp().as_str() != expected_hrp {
        return Err(ParseError::UnexpectedHrp {
            expected: expected_hrp,
            found: checked.hrp().as_str().to_owned(),
        });
    }

    let mut buf = [0u8; N];
    let mut len = 0;
    for byte in checked.byte_iter() {
        if len >= N {
            return Err(ParseError::BadLength);
        }
        buf[len] = byte;
        len += 1;
    }
    if len != N {
        return Err(ParseError::BadLength);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::Secp256k1;

    use super::*;
    use crate::Seed;

    fn keypair() -> crate::Keypair {
        let secp = Secp256k1::new();
        Seed::new(b"an example seed for encoding".to_vec())
            .derive(&secp, 7)
            .expect("derive")
    }

    #[test]
    fn address_roundtrip() {
        let addr = keypair().address();
        let s = addr.to_string();
        assert!(s.starts_with("acct1"), "{s}");
        assert_eq!(Address::parse(&s).expect("parse"), addr);
    }

    #[test]
    fn address_parse_is_case_insensitive() {
        let addr = keypair().address();
        let upper = addr.to_string().to_uppercase();
        assert_eq!(Address::parse(&upper).expect("parse"), addr);
    }

    #[test]
    fn secret_key_roundtrip() {
        let kp = keypair();
        let s = encode_secret_key(kp.secret_key());
        assert!(s.starts_with("sec1"), "{s}");
        assert_eq!(&parse_secret_key(&s).expect("parse"), kp.secret_key());
    }

    #[test]
    fn public_key_roundtrip() {
        let kp = keypair();
        let s = encode_public_key(kp.public_key());
        assert!(s.starts_with("pub1"), "{s}");
        assert_eq!(&parse_public_key(&s).expect("parse"), kp.public_key());
    }

    #[test]
    fn hrp_mismatch_is_rejected() {
        let kp = keypair();
        let s = encode_secret_key(kp.secret_key());
        let err = parse_public_key(&s).expect_err("wrong hrp");
        assert!(matches!(err, ParseError::UnexpectedHrp { .. }));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let hrp = Hrp::parse(HRP_ADDRESS).expect("valid hrp");
        let s = bech32::encode::<Bech32m>(hrp, &[0u8; 4]).expect("encode");
        assert_eq!(Address::parse(&s).expect_err("short"), ParseError::BadLength);
    }
}
