use axum::extract::{Path, State};
use axum::Extension;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

use crate::encoder::{EncodeRequest, EncodedResponse, ResponseEncoder};
use crate::error::ApiError;
use crate::middleware::{AdmissionPolicy, ClientId};
use crate::registry::ClientRegistry;
use crate::response::{
    HealthResponse, HelloResponse, LimiterStatsResponse, ReadyResponse, ResetResponse,
};

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub encoder: ResponseEncoder,
    pub policy: AdmissionPolicy,
    /// max-age applied to cacheable GET responses
    pub cache_ttl: Option<u64>,
    pub started_at: Instant,
}

/// Liveness probe
pub async fn health_check(
    State(state): State<SharedState>,
    req: EncodeRequest,
) -> EncodedResponse {
    state.encoder.encode(&HealthResponse::ok(), &req)
}

pub async fn hello(State(state): State<SharedState>, req: EncodeRequest) -> EncodedResponse {
    let payload = HelloResponse {
        message: "Hello from the API!".to_string(),
        timestamp: Utc::now(),
    };
    state
        .encoder
        .encode(&payload, &req.with_cache_ttl(state.cache_ttl))
}

/// Readiness probe
pub async fn readiness_check(
    State(state): State<SharedState>,
    req: EncodeRequest,
) -> EncodedResponse {
    let payload = ReadyResponse {
        status: "ready",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        tracked_clients: state.registry.len(),
    };
    state.encoder.encode(&payload, &req)
}

/// Registry and compression pool counters
pub async fn limiter_stats(
    State(state): State<SharedState>,
    req: EncodeRequest,
) -> EncodedResponse {
    let payload = LimiterStatsResponse {
        settings: state.registry.config().into(),
        registry: state.registry.stats(),
        compression: state.encoder.pool().stats(),
    };
    state.encoder.encode(&payload, &req)
}

/// Client endpoints are reserved for whitelisted callers, so a limited
/// client cannot inspect or refill its own bucket.
fn require_admin(state: &AppState, caller: Option<&ClientId>) -> Result<(), ApiError> {
    match caller {
        Some(ClientId(id)) if state.policy.whitelist.contains(id) => Ok(()),
        _ => Err(ApiError::Forbidden(
            "client administration requires a whitelisted caller".to_string(),
        )),
    }
}

/// Current bucket of a tracked client, without consuming a token
pub async fn get_client_status(
    State(state): State<SharedState>,
    caller: Option<Extension<ClientId>>,
    Path(client): Path<String>,
    req: EncodeRequest,
) -> Result<EncodedResponse, ApiError> {
    require_admin(&state, caller.as_ref().map(|Extension(id)| id))?;

    let status = state
        .registry
        .status(&client)
        .ok_or_else(|| ApiError::NotFound(format!("client '{}' is not tracked", client)))?;

    Ok(state.encoder.encode(&status, &req))
}

/// Forget a client so its next request starts with a full bucket
pub async fn reset_client(
    State(state): State<SharedState>,
    caller: Option<Extension<ClientId>>,
    Path(client): Path<String>,
    req: EncodeRequest,
) -> Result<EncodedResponse, ApiError> {
    if let Err(err) = require_admin(&state, caller.as_ref().map(|Extension(id)| id)) {
        tracing::warn!(client = %client, "Rejected rate limit reset from non-whitelisted caller");
        return Err(err);
    }

    let removed = state.registry.reset(&client);
    tracing::info!(client = %client, removed, "Client rate limit reset");

    Ok(state.encoder.encode(&ResetResponse { client, removed }, &req))
}
