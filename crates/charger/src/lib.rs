//! Funding engine: puts coins on the accounts the pool hands out.
//!
//! A [`Charger`] binds one network's seed, master key and funding
//! parameters to a [`ChainClient`]. It keeps no state of its own -- every
//! operation is a pure function of the chain and the seed, which is what
//! lets the pool decide freely when to call it.

use std::fmt;
use std::future::Future;

use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use chain_client::{ChainClient, ChainError, OperationGroup, SignedOperationGroup, Transfer};
use keypool::BoxError;
use keyring::{Address, DerivationError, Seed, ecdsa, encode_public_key};
use tracing::{error, info};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from funding operations.
#[derive(Debug)]
pub enum ChargerError {
    /// Key derivation failed for one of the requested indices.
    Derivation(DerivationError),
    /// The node rejected or failed a request.
    Chain(ChainError),
}

impl fmt::Display for ChargerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Derivation(e) => write!(f, "derivation error: {e}"),
            Self::Chain(e) => write!(f, "chain error: {e}"),
        }
    }
}

impl std::error::Error for ChargerError {}

impl From<DerivationError> for ChargerError {
    fn from(e: DerivationError) -> Self {
        Self::Derivation(e)
    }
}

impl From<ChainError> for ChargerError {
    fn from(e: ChainError) -> Self {
        Self::Chain(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Funding parameters of one network.
pub struct ChargerConfig {
    /// Derivation seed shared with the dispenser surface.
    pub seed: Seed,
    /// Master account secret key; pays for every funding group.
    pub master_key: SecretKey,
    /// Balance below which a leased account counts as drained.
    pub min_balance: u64,
    /// Amount put on each fresh account, in base units.
    pub amount: u64,
    /// Maximum number of transfers per injected operation group.
    pub ops_per_group: usize,
}

// ---------------------------------------------------------------------------
// Charger
// ---------------------------------------------------------------------------

/// Funds derived accounts from the master account and answers balance
/// probes.
pub struct Charger {
    client: ChainClient,
    config: ChargerConfig,
    secp: Secp256k1<All>,
    master_public: PublicKey,
    master_address: Address,
}

impl Charger {
    /// Creates a charger for one network.
    pub fn new(config: ChargerConfig, client: ChainClient) -> Self {
        let secp = Secp256k1::new();
        let master_public = PublicKey::from_secret_key(&secp, &config.master_key);
        let master_address = Address::from_public_key(&master_public);
        Self {
            client,
            config,
            secp,
            master_public,
            master_address,
        }
    }

    /// Funds every index in `keys` with `amount`, in operation groups
    /// of at most `ops_per_group` transfers.
    ///
    /// Each group is simulated (to fill fee and limits), signed with
    /// the master key and injected. Returns after the last group is
    /// injected, not after confirmation. On error, groups injected
    /// earlier stay on chain.
    pub async fn charge_keys(&self, keys: &[u64]) -> Result<(), ChargerError> {
        let source = self.master_address.to_string();
        for chunk in keys.chunks(self.config.ops_per_group.max(1)) {
            let mut transfers = Vec::with_capacity(chunk.len());
            for &index in chunk {
                let destination = self.derive_address(index)?;
                info!(pkh = %destination, amount = self.config.amount, "funding account");
                transfers.push(Transfer {
                    destination: destination.to_string(),
                    amount: self.config.amount,
                });
            }

            let counter = self.client.counter(&source).await?;
            let mut group = OperationGroup {
                chain_id: self.client.chain_id().to_owned(),
                source: source.clone(),
                counter: counter + 1,
                fee: 0,
                gas_limit: 0,
                storage_limit: 0,
                transfers,
            };
            let limits = self.client.simulate(&group).await?;
            group.fee = limits.fee;
            group.gas_limit = limits.gas_limit;
            group.storage_limit = limits.storage_limit;

            let signed = self.sign_group(group)?;
            let hash = self.client.inject(&signed).await?;
            info!(%hash, "injected funding group");
        }
        Ok(())
    }

    /// Whether the account at `key` has fallen below the configured
    /// minimum balance.
    pub async fn is_drained(&self, key: u64) -> Result<bool, ChargerError> {
        let address = self.derive_address(key)?;
        let balance = self.client.balance(&address.to_string()).await?;
        Ok(balance < self.config.min_balance)
    }

    /// Current balance of the master account.
    pub async fn get_funds(&self) -> Result<u64, ChargerError> {
        let balance = self
            .client
            .balance(&self.master_address.to_string())
            .await?;
        Ok(balance)
    }

    /// The account address at `key`, for logging. Returns an empty
    /// string when derivation fails.
    pub fn hash(&self, key: u64) -> String {
        match self.derive_address(key) {
            Ok(address) => address.to_string(),
            Err(err) => {
                error!(error = %err, key, "key derivation failed");
                String::new()
            }
        }
    }

    fn derive_address(&self, index: u64) -> Result<Address, ChargerError> {
        Ok(self.config.seed.derive(&self.secp, index)?.address())
    }

    /// Signs an operation group with the master key.
    fn sign_group(&self, group: OperationGroup) -> Result<SignedOperationGroup, ChargerError> {
        let bytes = group.signing_bytes()?;
        let signature = ecdsa::sign_message(&self.secp, &self.config.master_key, &bytes);
        Ok(SignedOperationGroup {
            group,
            public_key: encode_public_key(&self.master_public),
            signature: ecdsa::encode_compact_hex(&signature),
        })
    }
}

impl keypool::Charger for Charger {
    fn charge_keys(&self, keys: &[u64]) -> impl Future<Output = Result<(), BoxError>> + Send {
        async move {
            Self::charge_keys(self, keys)
                .await
                .map_err(|e| Box::new(e) as BoxError)
        }
    }

    fn is_drained(&self, key: u64) -> impl Future<Output = Result<bool, BoxError>> + Send {
        async move {
            Self::is_drained(self, key)
                .await
                .map_err(|e| Box::new(e) as BoxError)
        }
    }

    fn hash(&self, key: u64) -> String {
        Self::hash(self, key)
    }
}

#[cfg(test)]
mod tests {
    use chain_client::make_http_client;

    use super::*;

    fn charger() -> Charger {
        let secp = Secp256k1::new();
        let master_key = Seed::new(b"charger test master seed".to_vec())
            .derive(&secp, 0)
            .expect("derive master")
            .secret_key()
            .to_owned();
        let config = ChargerConfig {
            seed: Seed::new(b"charger test seed".to_vec()),
            master_key,
            min_balance: 1_000,
            amount: 2_000_000,
            ops_per_group: 4,
        };
        let http = make_http_client().expect("http client");
        let client = ChainClient::new(http, "http://localhost:18730", "testchain-1");
        Charger::new(config, client)
    }

    #[test]
    fn signed_groups_verify_against_the_master_key() {
        let charger = charger();
        let group = OperationGroup {
            chain_id: "testchain-1".to_owned(),
            source: charger.master_address.to_string(),
            counter: 5,
            fee: 420,
            gas_limit: 1_040,
            storage_limit: 0,
            transfers: vec![Transfer {
                destination: charger.hash(9),
                amount: 2_000_000,
            }],
        };

        let signed = charger.sign_group(group.clone()).expect("sign");
        let signature = ecdsa::parse_compact_hex(&signed.signature).expect("parse sig");
        let preimage = group.signing_bytes().expect("bytes");
        ecdsa::verify_message(
            &charger.secp,
            &charger.master_public,
            &preimage,
            &signature,
        )
        .expect("signature verifies");
    }

    #[test]
    fn hash_is_stable_and_nonempty() {
        let charger = charger();
        let a = charger.hash(12);
        let b = charger.hash(12);
        assert!(a.starts_with("acct1"), "{a}");
        assert_eq!(a, b);
        assert_ne!(charger.hash(13), a);
    }

    #[test]
    fn derivation_failure_yields_empty_hash() {
        let charger = charger();
        assert_eq!(charger.hash(1 << 31), String::new());
    }
}
