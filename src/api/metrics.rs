//! Prometheus metrics endpoint

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::REGISTRY;

/// GET /metrics
///
/// Refreshes the follower gauge, then renders the registry in text format.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    if let Err(e) = state.followers.list_all().await {
        tracing::warn!(error = %e, "Could not refresh follower gauge");
    }

    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&REGISTRY.gather()) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// `/metrics`, kept outside the tracing and compression layers
pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
