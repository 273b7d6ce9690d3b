//! HTTP surface.
//!
//! ```text
//! POST /{net}                          pop: consume a funded key for good
//! GET  /{net}                          master balance + free-queue length
//! POST /{net}/ephemeral                lease: timed reservation
//! GET  /{net}/ephemeral/{id}/keys/{key}   public key at id
//! POST /{net}/ephemeral/{id}/keys/{key}   sign raw body with key at id
//! ```
//!
//! The `{key}` path segment exists for URL compatibility with the
//! remote-signer protocol; derivation always uses `{id}` and the
//! segment is ignored. Unknown networks map to 404, everything else to
//! 500, always with a JSON `{error}` body.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::service::{Lease, NetworkStatus, Service, ServiceError};

/// Builds the router over the shared service.
pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/{net}", post(pop).get(status))
        .route("/{net}/ephemeral", post(lease))
        .route("/{net}/ephemeral/{id}/keys/{key}", get(pub_key).post(sign))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct PubKeyBody {
    public_key: String,
}

#[derive(Serialize)]
struct SignatureBody {
    signature: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::UnknownNetwork => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

async fn pop(
    State(service): State<Arc<Service>>,
    Path(net): Path<String>,
) -> Result<Json<String>, ServiceError> {
    let key = service.pop(&CancellationToken::new(), &net).await?;
    Ok(Json(key))
}

async fn status(
    State(service): State<Arc<Service>>,
    Path(net): Path<String>,
) -> Result<Json<NetworkStatus>, ServiceError> {
    Ok(Json(service.status(&net).await?))
}

async fn lease(
    State(service): State<Arc<Service>>,
    Path(net): Path<String>,
) -> Result<Json<Lease>, ServiceError> {
    Ok(Json(service.lease(&CancellationToken::new(), &net).await?))
}

async fn pub_key(
    State(service): State<Arc<Service>>,
    Path((net, id, _key)): Path<(String, u64, String)>,
) -> Result<Json<PubKeyBody>, ServiceError> {
    let public_key = service.pub_key(&net, id)?;
    Ok(Json(PubKeyBody { public_key }))
}

async fn sign(
    State(service): State<Arc<Service>>,
    Path((net, id, _key)): Path<(String, u64, String)>,
    body: Bytes,
) -> Result<Json<SignatureBody>, ServiceError> {
    let signature = service.sign(&net, id, &body)?;
    Ok(Json(SignatureBody { signature }))
}
