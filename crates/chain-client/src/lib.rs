//! Chain node REST API client.
//!
//! Provides [`ChainClient`] for the node endpoints the dispenser needs:
//! account balances, the funding account's counter, operation-group
//! simulation (fee/gas/storage estimation), and signed-group injection.
//!
//! This crate is **transport only** -- it speaks HTTP/JSON to a node but
//! has no knowledge of seeds, derivation, or the pool. Addresses and
//! keys cross this boundary as plain strings; the caller owns their
//! encoding.
//!
//! The HTTP stack is hyper + rustls, shared with the rest of the
//! workspace (no reqwest dependency). One [`HttpClient`] can be shared
//! by any number of [`ChainClient`]s (it is a cheap handle over a
//! pooled connector).

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Operation group types
// ---------------------------------------------------------------------------

/// A single funding transfer inside an operation group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Destination account address (`acct1…`).
    pub destination: String,
    /// Amount sent, in base units.
    pub amount: u64,
}

/// An unsigned operation group: one signed unit of up to
/// `ops-per-group` transfers from a single source.
///
/// `counter` provides per-source replay protection; `fee`,
/// `gas_limit` and `storage_limit` are zero until filled from a
/// [`ChainClient::simulate`] result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationGroup {
    /// Chain identifier (replay-protection namespace).
    pub chain_id: String,
    /// Source account address.
    pub source: String,
    /// Source account counter this group consumes.
    pub counter: u64,
    /// Fee paid by the source, in base units.
    pub fee: u64,
    /// Gas limit for the whole group.
    pub gas_limit: u64,
    /// Storage limit for the whole group.
    pub storage_limit: u64,
    /// The transfers, applied in order.
    pub transfers: Vec<Transfer>,
}

impl OperationGroup {
    /// Canonical signing preimage: the JSON serialization of the
    /// unsigned group. Signatures are made over the SHA-256 of these
    /// bytes.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ChainError> {
        serde_json::to_vec(self).map_err(|e| ChainError::Parse {
            status: 0,
            detail: e.to_string(),
        })
    }
}

/// A signed operation group, ready for injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOperationGroup {
    /// The unsigned group.
    #[serde(flatten)]
    pub group: OperationGroup,
    /// Source public key (`pub1…`).
    pub public_key: String,
    /// Hex-encoded compact ECDSA signature over the group's
    /// [`signing bytes`](OperationGroup::signing_bytes).
    pub signature: String,
}

/// Limits filled in by simulation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limits {
    /// Estimated fee, in base units.
    pub fee: u64,
    /// Estimated gas limit.
    pub gas_limit: u64,
    /// Estimated storage limit.
    pub storage_limit: u64,
}

// ---------------------------------------------------------------------------
// Response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: u64,
}

#[derive(Debug, Deserialize)]
struct CounterResponse {
    counter: u64,
}

#[derive(Debug, Deserialize)]
struct InjectResponse {
    hash: String,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from node API communication.
#[derive(Debug)]
pub enum ChainError {
    /// The HTTP request failed (TLS, network, timeout).
    RequestFailed,
    /// The node returned a non-2xx status code.
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body (best-effort).
        body: String,
    },
    /// A body could not be serialized or parsed as expected JSON.
    Parse {
        /// HTTP status code (0 when the failure is local).
        status: u16,
        /// Description of the failure.
        detail: String,
    },
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestFailed => write!(f, "node request failed"),
            Self::Api { status, body } => {
                write!(f, "node API error: status={status} body={body}")
            }
            Self::Parse { status, detail } => {
                write!(f, "node response parse error: status={status} detail={detail}")
            }
        }
    }
}

impl std::error::Error for ChainError {}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Hyper client type alias. Cloning shares the underlying connection
/// pool; build one with [`make_http_client`] and hand clones to every
/// [`ChainClient`] in the process.
pub type HttpClient = hyper_util::client::legacy::Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    http_body_util::Full<hyper::body::Bytes>,
>;

/// Build a TLS-enabled hyper client.
pub fn make_http_client() -> Result<HttpClient, ChainError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| {
            error!(?e, "node client TLS setup failed");
            ChainError::RequestFailed
        })?
        .https_or_http()
        .enable_http2()
        .build();

    Ok(
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(https),
    )
}

/// Node API client bound to one base URL and chain id.
pub struct ChainClient {
    base_url: String,
    chain_id: String,
    http: HttpClient,
}

impl ChainClient {
    /// Creates a client for `base_url` (no trailing slash) speaking to
    /// chain `chain_id`.
    pub fn new(http: HttpClient, base_url: &str, chain_id: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            chain_id: chain_id.to_owned(),
            http,
        }
    }

    /// The chain id this client is bound to.
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Current balance of `address`, in base units.
    pub async fn balance(&self, address: &str) -> Result<u64, ChainError> {
        let url = format!(
            "{}/chains/{}/accounts/{}/balance",
            self.base_url, self.chain_id, address
        );
        debug!(%url, "node balance query");
        let body = http_get(&self.http, &url).await?;
        let resp: BalanceResponse = parse_json(&body)?;
        Ok(resp.balance)
    }

    /// Current counter of `address`.
    pub async fn counter(&self, address: &str) -> Result<u64, ChainError> {
        let url = format!(
            "{}/chains/{}/accounts/{}/counter",
            self.base_url, self.chain_id, address
        );
        debug!(%url, "node counter query");
        let body = http_get(&self.http, &url).await?;
        let resp: CounterResponse = parse_json(&body)?;
        Ok(resp.counter)
    }

    /// Simulates an unsigned group, returning filled limits.
    pub async fn simulate(&self, group: &OperationGroup) -> Result<Limits, ChainError> {
        let url = format!(
            "{}/chains/{}/operations/simulate",
            self.base_url, self.chain_id
        );
        let payload = serde_json::to_string(group).map_err(|e| ChainError::Parse {
            status: 0,
            detail: e.to_string(),
        })?;
        debug!(%url, transfers = group.transfers.len(), "node simulate");
        let body = http_post(&self.http, &url, payload).await?;
        parse_json(&body)
    }

    /// Injects a signed group, returning the operation-group hash.
    pub async fn inject(&self, group: &SignedOperationGroup) -> Result<String, ChainError> {
        let url = format!("{}/chains/{}/operations", self.base_url, self.chain_id);
        let payload = serde_json::to_string(group).map_err(|e| ChainError::Parse {
            status: 0,
            detail: e.to_string(),
        })?;
        debug!(%url, transfers = group.group.transfers.len(), "node inject");
        let body = http_post(&self.http, &url, payload).await?;
        let resp: InjectResponse = parse_json(&body)?;
        Ok(resp.hash)
    }
}

// ---------------------------------------------------------------------------
// HTTP transport helpers
// ---------------------------------------------------------------------------

fn parse_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ChainError> {
    serde_json::from_str(body).map_err(|e| ChainError::Parse {
        status: 200,
        detail: e.to_string(),
    })
}

/// Send an HTTP GET and return the response body as a string.
async fn http_get(client: &HttpClient, url: &str) -> Result<String, ChainError> {
    let req = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(url)
        .body(http_body_util::Full::default())
        .map_err(|e| {
            error!(?e, "node client failed to build request");
            ChainError::RequestFailed
        })?;
    send(client, req).await
}

/// Send an HTTP POST with a JSON body and return the response body.
async fn http_post(client: &HttpClient, url: &str, body: String) -> Result<String, ChainError> {
    let req = hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri(url)
        .header("content-type", "application/json")
        .body(http_body_util::Full::new(hyper::body::Bytes::from(body)))
        .map_err(|e| {
            error!(?e, "node client failed to build request");
            ChainError::RequestFailed
        })?;
    send(client, req).await
}

async fn send(
    client: &HttpClient,
    req: hyper::Request<http_body_util::Full<hyper::body::Bytes>>,
) -> Result<String, ChainError> {
    let resp = client.request(req).await.map_err(|e| {
        error!(?e, "node HTTP request failed");
        ChainError::RequestFailed
    })?;

    let status = resp.status();

    use http_body_util::BodyExt;
    let body_bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|_| ChainError::RequestFailed)?
        .to_bytes();

    let body_str = std::str::from_utf8(&body_bytes).map_err(|_| ChainError::Parse {
        status: status.as_u16(),
        detail: "response body is not valid UTF-8".to_owned(),
    })?;

    if !status.is_success() {
        error!(%status, body = body_str, "node API error response");
        return Err(ChainError::Api {
            status: status.as_u16(),
            body: body_str.to_owned(),
        });
    }

    Ok(body_str.to_owned())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
