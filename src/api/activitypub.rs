//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (personal and shared)
//! - Followers collection

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{ACTIVITY_JSON, ACTIVITYSTREAMS_CONTEXT, InboxOutcome, InboxRequest};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:identifier - Actor profile
/// - POST /users/:identifier/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:identifier/followers - Followers collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:identifier", get(actor))
        .route("/users/:identifier/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:identifier/followers", get(followers))
}

fn activity_json(body: serde_json::Value) -> Response {
    (
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        body.to_string(),
    )
        .into_response()
}

/// GET /users/:identifier
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Response, AppError> {
    let actor = state
        .actors
        .resolve_actor(&identifier)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(activity_json(actor.to_json()))
}

/// POST /users/:identifier/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, Some(&identifier), method, uri, headers, body).await
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, None, method, uri, headers, body).await
}

/// 202 once the signature verified, whatever processing decided.
async fn receive(
    state: &AppState,
    recipient: Option<&str>,
    method: Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let request = InboxRequest {
        method: method.as_str().to_string(),
        path_and_query: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers,
        body: body.to_vec(),
    };

    match state.inbox.receive(recipient, request).await {
        Ok(outcome) => {
            let status = match outcome {
                InboxOutcome::Ignored(_) => "ignored",
                _ => "accepted",
            };
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", status])
                .inc();
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", e.kind()])
                .inc();
            Err(e)
        }
    }
}

/// GET /users/:identifier/followers
///
/// Deduplicated follower URIs as an `OrderedCollection`.
async fn followers(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Response, AppError> {
    if !state.actors.is_local(&identifier) {
        return Err(AppError::NotFound);
    }

    let followers = state.followers.list_all().await?;

    Ok(activity_json(json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": state.dispatcher.followers_uri(&identifier).as_str(),
        "type": "OrderedCollection",
        "totalItems": followers.len(),
        "orderedItems": followers,
    })))
}
