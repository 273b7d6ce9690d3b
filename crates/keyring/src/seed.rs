//! Seed container and per-index key derivation.

use std::fmt;

use bitcoin::NetworkKind;
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};

use crate::encode::Address;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationError {
    /// The seed is invalid for BIP32 master key derivation.
    InvalidSeed,
    /// A 32-bit half of the index exceeds the non-hardened BIP32 range
    /// (must be < 2^31).
    IndexOutOfRange(u64),
    /// BIP32 child key derivation failed along the path.
    DerivationFailed,
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSeed => write!(f, "invalid seed"),
            Self::IndexOutOfRange(i) => write!(f, "key index {i} out of derivable range"),
            Self::DerivationFailed => write!(f, "key derivation failed"),
        }
    }
}

impl std::error::Error for DerivationError {}

// ---------------------------------------------------------------------------
// Seed
// ---------------------------------------------------------------------------

/// Root secret of a network.
///
/// Opaque bytes (hex-decoded by the configuration layer). A `u64` key
/// index maps to the BIP32 path `index >> 32 / index & 0xffff_ffff`,
/// both segments non-hardened.
#[derive(Clone)]
pub struct Seed(Vec<u8>);

impl Seed {
    /// Wraps raw seed bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw seed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Derives the key pair at `index`.
    ///
    /// Deterministic: the same `(seed, index)` always yields the same
    /// pair. The caller supplies the secp256k1 context so one context
    /// can be shared across derivations.
    ///
    /// # Errors
    ///
    /// [`DerivationError::IndexOutOfRange`] if either 32-bit half of the
    /// index is ≥ 2^31; [`DerivationError::InvalidSeed`] if the seed
    /// cannot seed a BIP32 master key.
    pub fn derive(
        &self,
        secp: &Secp256k1<impl Signing>,
        index: u64,
    ) -> Result<Keypair, DerivationError> {
        let path = [
            ChildNumber::from_normal_idx((index >> 32) as u32)
                .map_err(|_| DerivationError::IndexOutOfRange(index))?,
            ChildNumber::from_normal_idx((index & 0xffff_ffff) as u32)
                .map_err(|_| DerivationError::IndexOutOfRange(index))?,
        ];

        let master = Xpriv::new_master(NetworkKind::Main, &self.0)
            .map_err(|_| DerivationError::InvalidSeed)?;
        let child = master
            .derive_priv(secp, &path)
            .map_err(|_| DerivationError::DerivationFailed)?;

        let secret = child.private_key;
        let public = PublicKey::from_secret_key(secp, &secret);
        Ok(Keypair { secret, public })
    }
}

// Seeds never appear in logs or errors.
impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed({} bytes)", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// A derived account key pair.
#[derive(Debug, Clone, Copy)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// The secret half.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// The public half (compressed on serialization).
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The account address: HASH-160 of the compressed public key.
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Seed {
        Seed::new(hex::decode("000102030405060708090a0b0c0d0e0f").expect("valid hex"))
    }

    #[test]
    fn derivation_is_deterministic() {
        let secp = Secp256k1::new();
        let a = seed().derive(&secp, 42).expect("derive");
        let b = seed().derive(&secp, 42).expect("derive");
        assert_eq!(a.secret_key(), b.secret_key());
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn distinct_indices_yield_distinct_keys() {
        let secp = Secp256k1::new();
        let s = seed();
        let a = s.derive(&secp, 1).expect("derive");
        let b = s.derive(&secp, 2).expect("derive");
        assert_ne!(a.secret_key(), b.secret_key());
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn high_and_low_halves_both_contribute() {
        let secp = Secp256k1::new();
        let s = seed();
        let low = s.derive(&secp, 5).expect("derive");
        let high = s.derive(&secp, 5 << 32).expect("derive");
        assert_ne!(low.address(), high.address());
    }

    #[test]
    fn hardened_range_index_is_rejected() {
        let secp = Secp256k1::new();
        let err = seed().derive(&secp, 1 << 31).expect_err("out of range");
        assert_eq!(err, DerivationError::IndexOutOfRange(1 << 31));
    }
}
