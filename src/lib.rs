//! Solofed - a single-actor ActivityPub federation core
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Actor, inbox and followers endpoints                     │
//! │  - WebFinger / NodeInfo / host-meta                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - URI dispatch, actor resolution, key management           │
//! │  - Signature verification and inbox processing              │
//! │  - Signed delivery to peers                                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Key-value store (memory or SQLite)                       │
//! │  - Follower relationships                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub protocol engine
//! - `data`: Key-value store and follower state
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use data::{FollowerStore, KvStore, MemoryKvStore, SqliteKvStore};
use federation::{
    ActivityDelivery, ActorFetcher, ActorResolver, InboxProcessor, KeyManager, PublicKeyCache,
    UriDispatcher,
};

/// Largest accepted inbox payload
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Cloned for each request; every member is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub dispatcher: Arc<UriDispatcher>,
    pub keys: Arc<KeyManager>,
    pub actors: Arc<ActorResolver>,
    pub followers: FollowerStore,
    pub key_cache: Arc<PublicKeyCache>,
    pub inbox: Arc<InboxProcessor>,
}

impl AppState {
    /// Initialize application state
    ///
    /// Opens the configured key-value store and wires the federation
    /// components on top of it.
    ///
    /// # Errors
    /// Returns error if the store cannot be opened or the base URL is invalid
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let kv: Arc<dyn KvStore> = match config.store.backend {
            config::StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; keys and followers are lost on restart");
                Arc::new(MemoryKvStore::new())
            }
            config::StoreBackend::Sqlite => {
                let path = config.store.path.as_deref().ok_or_else(|| {
                    error::AppError::Config(
                        "store.path is required when store.backend=sqlite".to_string(),
                    )
                })?;
                Arc::new(SqliteKvStore::connect(path).await?)
            }
        };

        Self::with_store(config, kv)
    }

    /// Wire the application around an existing store.
    pub fn with_store(
        config: config::AppConfig,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self, error::AppError> {
        let federation_config = &config.federation;

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Solofed/", env!("CARGO_PKG_VERSION")))
            .timeout(federation_config.request_timeout())
            .build()?;

        let dispatcher = Arc::new(UriDispatcher::new(&config.server.base_url())?);
        let identifier = config.actor.identifier.clone();

        let keys = Arc::new(KeyManager::new(
            kv.clone(),
            identifier.clone(),
            federation_config.key_bits,
        ));
        let actors = Arc::new(ActorResolver::new(
            dispatcher.clone(),
            keys.clone(),
            config.actor.clone(),
        ));
        let followers = FollowerStore::new(kv);

        let fetcher = Arc::new(ActorFetcher::new(
            http_client.clone(),
            federation_config.request_timeout(),
            federation_config.allow_private_addresses,
        ));
        let key_cache = Arc::new(PublicKeyCache::new(
            fetcher.clone(),
            federation_config.key_cache_ttl(),
        ));

        let delivery = ActivityDelivery::new(
            http_client,
            keys.clone(),
            dispatcher.clone(),
            federation_config.request_timeout(),
            federation_config.allow_private_addresses,
            federation_config.max_concurrent_deliveries,
        );

        let inbox = Arc::new(
            InboxProcessor::new(
                dispatcher.clone(),
                identifier,
                followers.clone(),
                fetcher,
                key_cache.clone(),
                federation_config.request_timeout(),
            )
            .with_delivery(delivery),
        );

        tracing::info!(
            base_url = %dispatcher.base_url(),
            actor = %config.actor.identifier,
            "Application state initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            keys,
            actors,
            followers,
            key_cache,
            inbox,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);
    let metrics = api::metrics_router(state.clone());

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(metrics)
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost:8080".to_string(),
                protocol: "http".to_string(),
            },
            actor: config::ActorConfig {
                identifier: "me".to_string(),
                display_name: "Me".to_string(),
                summary: String::new(),
            },
            store: config::StoreConfig {
                backend: config::StoreBackend::Memory,
                path: None,
            },
            federation: config::FederationConfig {
                key_bits: 1024,
                ..Default::default()
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        AppState::with_store(config, Arc::new(MemoryKvStore::new())).unwrap()
    }

    #[tokio::test]
    async fn health_route_responds() {
        let response = build_router(test_state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_inbox_body_is_rejected() {
        let body = vec![b'a'; MAX_BODY_BYTES + 1];
        let response = build_router(test_state())
            .oneshot(
                Request::post("/inbox")
                    .header("content-type", "application/activity+json")
                    .header("content-length", body.len())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unknown_actor_routes_to_not_found() {
        let response = build_router(test_state())
            .oneshot(Request::get("/users/nobody").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
