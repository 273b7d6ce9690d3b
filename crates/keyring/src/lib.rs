//! Deterministic account keys for the key dispenser.
//!
//! A network is provisioned with an opaque [`Seed`]; every account the
//! dispenser hands out is the key pair derived from that seed at a `u64`
//! index. Derivation is BIP32: the index is split into two non-hardened
//! 32-bit path segments, so the same `(seed, index)` always yields the
//! same secp256k1 key pair.
//!
//! The crate also owns the human-readable encodings used on the wire and
//! in configuration files:
//!
//! | Value | Encoding | Example |
//! |-------|----------|---------|
//! | Address (HASH-160 of the compressed public key) | Bech32m, HRP `acct` | `acct1...` |
//! | Public key (33 bytes, compressed) | Bech32m, HRP `pub` | `pub1...` |
//! | Secret key (32 bytes) | Bech32m, HRP `sec` | `sec1...` |
//!
//! Signing is ECDSA over the SHA-256 of the message; see [`ecdsa`].

pub mod ecdsa;
mod encode;
mod seed;

pub use encode::{
    Address, HRP_ADDRESS, HRP_PUBLIC, HRP_SECRET, ParseError, encode_public_key,
    encode_secret_key, parse_public_key, parse_secret_key,
};
pub use seed::{DerivationError, Keypair, Seed};
