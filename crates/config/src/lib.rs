//! Networks file parsing and secret resolution.
//!
//! The daemon is configured by a YAML mapping from network name to its
//! parameters:
//!
//! ```yaml
//! testnet:
//!   url: https://node.testnet.example
//!   chain-id: testchain-1
//!   seed-file: /run/secrets/testnet.seed       # or inline: seed: <hex>
//!   private-key-file: /run/secrets/testnet.key # or inline: private-key: sec1…
//!   min-balance: 1000
//!   amount: 2000000
//!   ops-per-group: 100
//!   lease-time: 10m
//!   buffer-length: 10
//!   buffer-threshold: 2
//!   rpc-timeout: 30s
//! ```
//!
//! Secrets resolve in precedence order: `<UPPERNAME>_SEED` /
//! `<UPPERNAME>_PRIVATE_KEY` environment variables, then the inline
//! field, then the `*-file` indirection. The seed is hex; the private
//! key is a `sec1…` string.

mod duration;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bitcoin::secp256k1::SecretKey;
use keyring::Seed;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// The YAML document failed to parse.
    Yaml(serde_yaml::Error),
    /// Neither the inline field, its file variant, nor the environment
    /// variable provided a value.
    MissingSecret {
        network: String,
        field: &'static str,
    },
    /// A `*-file` indirection could not be read.
    ReadFile {
        network: String,
        path: String,
        error: std::io::Error,
    },
    /// The seed is not valid hex.
    InvalidSeed {
        network: String,
        error: hex::FromHexError,
    },
    /// The private key is not a valid `sec1…` string.
    InvalidPrivateKey {
        network: String,
        error: keyring::ParseError,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yaml(e) => write!(f, "networks file: {e}"),
            Self::MissingSecret { network, field } => {
                write!(f, "network {network:?}: no {field} configured")
            }
            Self::ReadFile {
                network,
                path,
                error,
            } => write!(f, "network {network:?}: reading {path:?}: {error}"),
            Self::InvalidSeed { network, error } => {
                write!(f, "network {network:?}: seed is not valid hex: {error}")
            }
            Self::InvalidPrivateKey { network, error } => {
                write!(f, "network {network:?}: invalid private key: {error}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml(e)
    }
}

// ---------------------------------------------------------------------------
// Raw (file) form
// ---------------------------------------------------------------------------

fn zero_duration() -> Duration {
    Duration::ZERO
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    url: String,
    #[serde(rename = "chain-id")]
    chain_id: String,
    #[serde(default)]
    seed: Option<String>,
    #[serde(rename = "seed-file", default)]
    seed_file: Option<String>,
    #[serde(rename = "private-key", default)]
    private_key: Option<String>,
    #[serde(rename = "private-key-file", default)]
    private_key_file: Option<String>,
    #[serde(rename = "min-balance", default)]
    min_balance: u64,
    #[serde(default)]
    amount: u64,
    #[serde(rename = "ops-per-group", default)]
    ops_per_group: usize,
    #[serde(
        rename = "lease-time",
        default = "zero_duration",
        deserialize_with = "duration::deserialize"
    )]
    lease_time: Duration,
    #[serde(rename = "buffer-length", default)]
    buffer_length: u64,
    #[serde(rename = "buffer-threshold", default)]
    buffer_threshold: u64,
    #[serde(
        rename = "rpc-timeout",
        default = "zero_duration",
        deserialize_with = "duration::deserialize"
    )]
    rpc_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Resolved form
// ---------------------------------------------------------------------------

/// One network's fully resolved configuration: secrets loaded and
/// decoded, durations parsed.
#[derive(Debug)]
pub struct NetworkConfig {
    /// Network name; also the persistence bucket name.
    pub name: String,
    /// Node base URL.
    pub url: String,
    /// Chain identifier used in node paths and operation groups.
    pub chain_id: String,
    /// Derivation seed (hex-decoded).
    pub seed: Seed,
    /// Master account secret key.
    pub private_key: SecretKey,
    /// Balance below which a leased account counts as drained.
    pub min_balance: u64,
    /// Amount put on each fresh account.
    pub amount: u64,
    /// Maximum transfers per funding operation group.
    pub ops_per_group: usize,
    /// How long an ephemeral lease lasts.
    pub lease_time: Duration,
    /// Free-queue length a refill tops up to.
    pub buffer_length: u64,
    /// Refill triggers at or below this free-queue length.
    pub buffer_threshold: u64,
    /// Per-call node RPC timeout; `None` disables it.
    pub rpc_timeout: Option<Duration>,
}

/// Parses the networks YAML document and resolves every network's
/// secrets.
pub fn parse(yaml: &str) -> Result<HashMap<String, NetworkConfig>, ConfigError> {
    let raw: HashMap<String, RawNetwork> = serde_yaml::from_str(yaml)?;
    let mut out = HashMap::with_capacity(raw.len());
    for (name, data) in raw {
        let network = resolve(&name, data)?;
        out.insert(name, network);
    }
    Ok(out)
}

fn resolve(name: &str, raw: RawNetwork) -> Result<NetworkConfig, ConfigError> {
    let env_prefix = name.to_uppercase();

    let seed_data = secret_value(
        name,
        "seed",
        &format!("{env_prefix}_SEED"),
        &raw.seed,
        &raw.seed_file,
    )?;
    let seed_bytes = hex::decode(seed_data.trim()).map_err(|error| ConfigError::InvalidSeed {
        network: name.to_owned(),
        error,
    })?;

    let key_data = secret_value(
        name,
        "private-key",
        &format!("{env_prefix}_PRIVATE_KEY"),
        &raw.private_key,
        &raw.private_key_file,
    )?;
    let private_key = keyring::parse_secret_key(key_data.trim()).map_err(|error| {
        ConfigError::InvalidPrivateKey {
            network: name.to_owned(),
            error,
        }
    })?;

    Ok(NetworkConfig {
        name: name.to_owned(),
        url: raw.url,
        chain_id: raw.chain_id,
        seed: Seed::new(seed_bytes),
        private_key,
        min_balance: raw.min_balance,
        amount: raw.amount,
        ops_per_group: raw.ops_per_group,
        lease_time: raw.lease_time,
        buffer_length: raw.buffer_length,
        buffer_threshold: raw.buffer_threshold,
        rpc_timeout: (raw.rpc_timeout > Duration::ZERO).then_some(raw.rpc_timeout),
    })
}

/// Environment variable, then inline value, then file indirection.
fn secret_value(
    network: &str,
    field: &'static str,
    env_var: &str,
    inline: &Option<String>,
    file: &Option<String>,
) -> Result<String, ConfigError> {
    if let Ok(v) = std::env::var(env_var) {
        if !v.is_empty() {
            return Ok(v);
        }
    }
    if let Some(v) = inline {
        if !v.is_empty() {
            return Ok(v.clone());
        }
    }
    if let Some(path) = file {
        return std::fs::read_to_string(path).map_err(|error| ConfigError::ReadFile {
            network: network.to_owned(),
            path: path.clone(),
            error,
        });
    }
    Err(ConfigError::MissingSecret {
        network: network.to_owned(),
        field,
    })
}
