//! Service façade: binds each network's pool, charger and config into
//! the operations the HTTP layer exposes.
//!
//! `pub_key` and `sign` are pure derivation given the seed and id; they
//! do not consult the pool and work for any id the caller supplies,
//! leased or not (the remote-signer protocol expects that).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bitcoin::secp256k1::{All, Secp256k1};
use charger::{Charger, ChargerError};
use config::NetworkConfig;
use keypool::{Pool, PoolError};
use keyring::{DerivationError, ecdsa, encode_public_key, encode_secret_key};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced to the HTTP layer.
#[derive(Debug)]
pub enum ServiceError {
    /// The request named a network that is not configured.
    UnknownNetwork,
    /// The pool failed or is stopped.
    Pool(PoolError),
    /// A balance query or funding call failed.
    Charger(ChargerError),
    /// Key derivation failed for the requested id.
    Derivation(DerivationError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNetwork => write!(f, "unknown network"),
            Self::Pool(e) => write!(f, "{e}"),
            Self::Charger(e) => write!(f, "{e}"),
            Self::Derivation(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<DerivationError> for ServiceError {
    fn from(e: DerivationError) -> Self {
        Self::Derivation(e)
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// GET `/{net}` response.
#[derive(Debug, Serialize)]
pub struct NetworkStatus {
    /// Master account balance, in base units.
    pub balance: u64,
    /// Current free-queue length.
    pub count: u64,
}

/// POST `/{net}/ephemeral` response.
#[derive(Debug, Serialize)]
pub struct Lease {
    /// Leased key index; used in the `/keys/` paths.
    pub id: u64,
    /// The leased account's address.
    pub pkh: String,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// One configured network: its pool, its charger and its parameters.
pub struct Network {
    pub pool: Pool,
    pub charger: Arc<Charger>,
    pub config: Arc<NetworkConfig>,
}

/// The dispenser service surface.
pub struct Service {
    networks: HashMap<String, Network>,
    secp: Secp256k1<All>,
}

impl Service {
    pub fn new(networks: HashMap<String, Network>) -> Self {
        Self {
            networks,
            secp: Secp256k1::new(),
        }
    }

    fn network(&self, name: &str) -> Result<&Network, ServiceError> {
        self.networks.get(name).ok_or(ServiceError::UnknownNetwork)
    }

    /// Permanently consumes the next free index and returns its
    /// encoded secret key.
    pub async fn pop(&self, cancel: &CancellationToken, name: &str) -> Result<String, ServiceError> {
        let net = self.network(name)?;
        let index = net.pool.get(cancel).await.map_err(|e| {
            error!(network = name, error = %e, "pop failed");
            ServiceError::Pool(e)
        })?;
        let keypair = net.config.seed.derive(&self.secp, index)?;
        Ok(encode_secret_key(keypair.secret_key()))
    }

    /// Master balance and free-queue length.
    pub async fn status(&self, name: &str) -> Result<NetworkStatus, ServiceError> {
        let net = self.network(name)?;
        let balance = net.charger.get_funds().await.map_err(|e| {
            error!(network = name, error = %e, "balance query failed");
            ServiceError::Charger(e)
        })?;
        let count = net.pool.count().map_err(ServiceError::Pool)?;
        Ok(NetworkStatus { balance, count })
    }

    /// Reserves the next free index for the configured lease time.
    pub async fn lease(&self, cancel: &CancellationToken, name: &str) -> Result<Lease, ServiceError> {
        let net = self.network(name)?;
        let deadline = SystemTime::now() + net.config.lease_time;
        let id = net.pool.lease(cancel, deadline).await.map_err(|e| {
            error!(network = name, error = %e, "lease failed");
            ServiceError::Pool(e)
        })?;
        let keypair = net.config.seed.derive(&self.secp, id)?;
        Ok(Lease {
            id,
            pkh: keypair.address().to_string(),
        })
    }

    /// Encoded public key at `id`.
    pub fn pub_key(&self, name: &str, id: u64) -> Result<String, ServiceError> {
        let net = self.network(name)?;
        let keypair = net.config.seed.derive(&self.secp, id)?;
        Ok(encode_public_key(keypair.public_key()))
    }

    /// Signs `data` with the key at `id`; returns the hex compact
    /// signature.
    pub fn sign(&self, name: &str, id: u64, data: &[u8]) -> Result<String, ServiceError> {
        let net = self.network(name)?;
        let keypair = net.config.seed.derive(&self.secp, id)?;
        let signature = ecdsa::sign_message(&self.secp, keypair.secret_key(), data);
        Ok(ecdsa::encode_compact_hex(&signature))
    }

    /// Stops every pool, failing their queued requests.
    pub async fn stop(&self) {
        for net in self.networks.values() {
            net.pool.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use charger::ChargerConfig;
    use keyring::Seed;

    use super::*;

    fn test_service() -> (tempfile::TempDir, Service) {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = unsafe {
            heed::EnvOpenOptions::new()
                .map_size(16 * 1024 * 1024)
                .max_dbs(3)
                .open(dir.path())
                .expect("open env")
        };

        let secp = Secp256k1::new();
        let seed = Seed::new(b"service test seed".to_vec());
        let master_key = *Seed::new(b"service test master".to_vec())
            .derive(&secp, 0)
            .expect("derive")
            .secret_key();

        let config = Arc::new(NetworkConfig {
            name: "testnet".to_owned(),
            url: "http://localhost:18730".to_owned(),
            chain_id: "testchain-1".to_owned(),
            seed: seed.clone(),
            private_key: master_key,
            min_balance: 1_000,
            amount: 2_000_000,
            ops_per_group: 10,
            lease_time: std::time::Duration::from_secs(600),
            buffer_length: 10,
            buffer_threshold: 0,
            rpc_timeout: None,
        });

        let http = chain_client::make_http_client().expect("http client");
        let client =
            chain_client::ChainClient::new(http, &config.url, &config.chain_id);
        let charger = Arc::new(Charger::new(
            ChargerConfig {
                seed: config.seed.clone(),
                master_key: config.private_key,
                min_balance: config.min_balance,
                amount: config.amount,
                ops_per_group: config.ops_per_group,
            },
            client,
        ));
        let pool = Pool::new(
            &env,
            keypool::PoolConfig {
                bucket: config.name.clone(),
                buffer_length: config.buffer_length,
                buffer_threshold: config.buffer_threshold,
                timeout: config.rpc_timeout,
            },
            Arc::clone(&charger),
        )
        .expect("pool");

        let mut networks = HashMap::new();
        networks.insert(
            "testnet".to_owned(),
            Network {
                pool,
                charger,
                config,
            },
        );
        (dir, Service::new(networks))
    }

    #[tokio::test]
    async fn unknown_network_is_distinguished() {
        let (_dir, service) = test_service();
        let err = service.status("nowhere").await.expect_err("unknown");
        assert!(matches!(err, ServiceError::UnknownNetwork), "{err}");
        service.stop().await;
    }

    #[tokio::test]
    async fn sign_verifies_against_published_key() {
        let (_dir, service) = test_service();

        let pub_s = service.pub_key("testnet", 42).expect("pub");
        let sig_s = service.sign("testnet", 42, b"forge me").expect("sign");

        let public = keyring::parse_public_key(&pub_s).expect("parse pub");
        let signature = ecdsa::parse_compact_hex(&sig_s).expect("parse sig");
        let secp = Secp256k1::new();
        ecdsa::verify_message(&secp, &public, b"forge me", &signature).expect("verifies");

        service.stop().await;
    }
}
