//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use solofed::AppState;
use solofed::config::{
    ActorConfig, AppConfig, FederationConfig, LoggingConfig, ServerConfig, StoreBackend,
    StoreConfig,
};
use solofed::data::MemoryKvStore;
use solofed::federation::{KeyPair, sign_request};
use tokio::sync::Mutex;
use url::Url;

/// Smaller than production keys so tests stay fast.
pub const TEST_KEY_BITS: usize = 1024;

/// Test server wrapper
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server serving the actor `me`
    pub async fn new() -> Self {
        Self::with_request_timeout(5).await
    }

    /// Test server whose outbound requests give up after `seconds`
    pub async fn with_request_timeout(seconds: u64) -> Self {
        solofed::metrics::init_metrics();

        // Bind first so the public domain carries the real port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = test_config(&addr.to_string());
        config.federation.request_timeout_seconds = seconds;
        let state = AppState::with_store(config, Arc::new(MemoryKvStore::new())).unwrap();
        let app = solofed::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            addr: format!("http://{}", addr),
            state,
            client: reqwest::Client::new(),
        }
    }

    /// Get full URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Public URI of the local actor
    pub fn actor_uri(&self) -> String {
        self.url("/users/me")
    }

    /// Follower URIs currently recorded in the store
    pub async fn followers(&self) -> Vec<String> {
        self.state.followers.list_all().await.unwrap()
    }
}

fn test_config(domain: &str) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: domain.to_string(),
            protocol: "http".to_string(),
        },
        actor: ActorConfig {
            identifier: "me".to_string(),
            display_name: "Me".to_string(),
            summary: "This is me!".to_string(),
        },
        store: StoreConfig {
            backend: StoreBackend::Memory,
            path: None,
        },
        federation: FederationConfig {
            request_timeout_seconds: 5,
            key_bits: TEST_KEY_BITS,
            allow_private_addresses: true,
            ..Default::default()
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// A delivery captured by a [`RemotePeer`]
#[derive(Debug, Clone)]
pub struct ReceivedDelivery {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ReceivedDelivery {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Where the peer publishes its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStyle {
    /// `{actor}#main-key`, embedded in the actor document
    Fragment,
    /// `{actor}/main-key`, served as its own document
    Path,
}

/// How a [`RemotePeer`] behaves
#[derive(Debug, Clone, Copy)]
pub struct PeerOptions {
    pub key_style: KeyStyle,
    /// Pause before serving the actor or key document
    pub document_delay: Duration,
    /// Status returned for inbox POSTs
    pub inbox_status: StatusCode,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            key_style: KeyStyle::Fragment,
            document_delay: Duration::ZERO,
            inbox_status: StatusCode::ACCEPTED,
        }
    }
}

#[derive(Clone)]
struct PeerState {
    actor: Arc<Value>,
    received: Arc<Mutex<Vec<ReceivedDelivery>>>,
    options: PeerOptions,
}

/// A remote actor `alice` on its own loopback server.
///
/// Serves a signed-fetchable actor document and records every POST to
/// its inbox.
pub struct RemotePeer {
    pub base: String,
    pub key_pair: KeyPair,
    key_id: String,
    received: Arc<Mutex<Vec<ReceivedDelivery>>>,
}

impl RemotePeer {
    pub async fn start() -> Self {
        Self::start_with(PeerOptions::default()).await
    }

    pub async fn start_with(options: PeerOptions) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let key_pair = tokio::task::spawn_blocking(|| KeyPair::generate(TEST_KEY_BITS))
            .await
            .unwrap()
            .unwrap();
        let actor_uri = format!("{}/users/alice", base);
        let key_id = match options.key_style {
            KeyStyle::Fragment => format!("{}#main-key", actor_uri),
            KeyStyle::Path => format!("{}/main-key", actor_uri),
        };
        let actor = json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "id": actor_uri,
            "type": "Person",
            "preferredUsername": "alice",
            "name": "Alice",
            "inbox": format!("{}/inbox", actor_uri),
            "publicKey": {
                "id": key_id,
                "owner": actor_uri,
                "publicKeyPem": key_pair.public_key_pem().unwrap(),
            }
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let state = PeerState {
            actor: Arc::new(actor),
            received: received.clone(),
            options,
        };
        // The key endpoint serves the actor document with its key embedded.
        let app = Router::new()
            .route("/users/alice", get(peer_actor))
            .route("/users/alice/main-key", get(peer_actor))
            .route("/users/alice/inbox", post(peer_inbox))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            base,
            key_pair,
            key_id,
            received,
        }
    }

    pub fn actor_uri(&self) -> String {
        format!("{}/users/alice", self.base)
    }

    pub fn key_id(&self) -> String {
        self.key_id.clone()
    }

    /// `Follow` of `target` with a fresh id
    pub fn follow(&self, target: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/{}", self.actor_uri(), ulid::Ulid::new()),
            "type": "Follow",
            "actor": self.actor_uri(),
            "object": target,
        })
    }

    /// `Undo` wrapping `follow`
    pub fn undo(&self, follow: &Value) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/undos/{}", self.actor_uri(), ulid::Ulid::new()),
            "type": "Undo",
            "actor": self.actor_uri(),
            "object": follow,
        })
    }

    /// POST `activity` to `url`, signed with this peer's key.
    pub async fn post_signed(
        &self,
        client: &reqwest::Client,
        url: &str,
        activity: &Value,
    ) -> reqwest::Response {
        self.post_signed_with(client, url, activity, self.key_pair.private_key())
            .await
    }

    /// POST signed with an arbitrary key while still claiming this peer's key id.
    pub async fn post_signed_with(
        &self,
        client: &reqwest::Client,
        url: &str,
        activity: &Value,
        private_key: &rsa::RsaPrivateKey,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let target = Url::parse(url).unwrap();
        let signed =
            sign_request("POST", &target, Some(&body), private_key, &self.key_id()).unwrap();

        let mut request = client
            .post(url)
            .header(header::CONTENT_TYPE, "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }
        request.body(body).send().await.unwrap()
    }

    /// Deliveries received so far
    pub async fn received(&self) -> Vec<ReceivedDelivery> {
        self.received.lock().await.clone()
    }

    /// Poll until at least `count` deliveries arrived or `timeout` elapsed.
    pub async fn wait_for_deliveries(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<ReceivedDelivery> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.received().await;
            if received.len() >= count || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn peer_actor(State(state): State<PeerState>) -> impl IntoResponse {
    tokio::time::sleep(state.options.document_delay).await;
    (
        [(header::CONTENT_TYPE, "application/activity+json")],
        state.actor.to_string(),
    )
}

async fn peer_inbox(
    State(state): State<PeerState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().await.push(ReceivedDelivery {
        path: "/users/alice/inbox".to_string(),
        headers,
        body: body.to_vec(),
    });
    state.options.inbox_status
}
