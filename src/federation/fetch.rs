//! Outbound fetches of peer documents
//!
//! Every GET against an untrusted peer goes through [`ActorFetcher`], which
//! rejects non-HTTP(S) schemes and loopback/private destinations before
//! connecting and bounds each request with the configured timeout.
//! Deliveries reuse the same destination guard.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use serde_json::Value;
use url::Url;

use crate::error::AppError;

pub const ACTIVITY_JSON: &str = "application/activity+json";

const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
                || v6.to_ipv4_mapped().is_some_and(|v4| is_disallowed_ip(IpAddr::V4(v4)))
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Reject URLs that must never be dereferenced on behalf of a peer.
pub fn check_remote_url(url: &Url, allow_private: bool) -> Result<(), AppError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    if !allow_private && is_disallowed_host(host) {
        return Err(AppError::Forbidden);
    }

    Ok(())
}

/// Resolve DNS before connecting and reject hosts that map to private space.
pub(super) async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Delivery(format!("Failed to resolve {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Delivery(format!("No DNS records for {}", host)));
    }

    Ok(())
}

/// Resolved-address half of [`check_remote_destination`].
pub(super) async fn check_resolved_destination(url: &Url) -> Result<(), AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
    validate_resolved_host_ips(host, port).await
}

/// Full guard for a URL about to be contacted on behalf of a peer.
///
/// The literal host is checked first; unless private destinations are
/// allowed, the name is also resolved so a public-looking hostname that
/// points into private space is refused too.
pub(super) async fn check_remote_destination(
    url: &Url,
    allow_private: bool,
) -> Result<(), AppError> {
    check_remote_url(url, allow_private)?;
    if allow_private {
        return Ok(());
    }
    check_resolved_destination(url).await
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| {
            use rsa::pkcs1::DecodeRsaPublicKey;
            RsaPublicKey::from_pkcs1_pem(pem)
        })
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))
}

/// A peer key and the actor that publishes it
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedKey {
    pub id: String,
    pub owner: Url,
    pub key: RsaPublicKey,
}

impl PublishedKey {
    /// Find `key_id` in a dereferenced document.
    ///
    /// Accepts an actor document (`publicKey` as an object or a list, as
    /// served for `#main-key` ids and by path-style key endpoints) or a
    /// standalone key document with `publicKeyPem` and `owner` at the top.
    pub fn from_document(document: &Value, key_id: &str) -> Result<Self, AppError> {
        let document_id = document.get("id").and_then(Value::as_str);
        let embedded = document.get("publicKey");
        let candidates: Vec<&Value> = match embedded {
            Some(Value::Array(keys)) => keys.iter().collect(),
            Some(key @ Value::Object(_)) => vec![key],
            _ => vec![document],
        };

        let by_id = candidates
            .iter()
            .copied()
            .find(|key| key.get("id").and_then(Value::as_str) == Some(key_id));
        // A keyId naming the actor itself selects its only key.
        let entry = by_id
            .or_else(|| {
                (embedded.is_some() && document_id == Some(key_id) && candidates.len() == 1)
                    .then(|| candidates[0])
            })
            .ok_or_else(|| {
                AppError::Validation(format!("Document does not publish key {}", key_id))
            })?;

        let pem = entry
            .get("publicKeyPem")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Key has no publicKeyPem".to_string()))?;
        let owner = entry
            .get("owner")
            .and_then(Value::as_str)
            .or(if embedded.is_some() { document_id } else { None })
            .ok_or_else(|| AppError::Validation("Key has no owner".to_string()))?;
        let owner = Url::parse(owner)
            .map_err(|e| AppError::Validation(format!("Invalid key owner {}: {}", owner, e)))?;

        Ok(Self {
            id: key_id.to_string(),
            owner,
            key: parse_public_key_pem(pem)?,
        })
    }
}

/// The parts of a peer's actor document this server uses
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteActor {
    pub id: Url,
    pub inbox: Url,
    pub shared_inbox: Option<Url>,
    pub name: Option<String>,
    pub preferred_username: Option<String>,
}

impl RemoteActor {
    /// Decode an actor document. `id` and `inbox` are mandatory.
    pub fn from_json(value: &Value) -> Result<Self, AppError> {
        let url_field = |field: &str| -> Option<Url> {
            value
                .get(field)
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok())
        };

        let id = url_field("id")
            .ok_or_else(|| AppError::Validation("Actor document has no valid id".to_string()))?;
        let inbox = url_field("inbox").ok_or_else(|| {
            AppError::Validation("Actor document has no valid inbox".to_string())
        })?;
        let shared_inbox = value
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(Value::as_str)
            .and_then(|s| Url::parse(s).ok());

        Ok(Self {
            id,
            inbox,
            shared_inbox,
            name: value.get("name").and_then(Value::as_str).map(str::to_string),
            preferred_username: value
                .get("preferredUsername")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Fetches actor documents and keys from peers
pub struct ActorFetcher {
    http_client: reqwest::Client,
    timeout: Duration,
    allow_private: bool,
}

impl ActorFetcher {
    pub fn new(http_client: reqwest::Client, timeout: Duration, allow_private: bool) -> Self {
        Self {
            http_client,
            timeout,
            allow_private,
        }
    }

    /// GET `url` as an ActivityStreams document.
    pub async fn fetch_json(&self, url: &Url) -> Result<Value, AppError> {
        check_remote_destination(url, self.allow_private).await?;

        let start = Instant::now();
        let result = self
            .http_client
            .get(url.clone())
            .header("Accept", ACCEPT_ACTIVITY)
            .timeout(self.timeout)
            .send()
            .await;

        crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["fetch"])
            .observe(start.elapsed().as_secs_f64());

        let response = result.map_err(|e| {
            crate::metrics::FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["fetch", "error"])
                .inc();
            AppError::Delivery(format!("Failed to fetch {}: {}", url, e))
        })?;

        let status = response.status();
        crate::metrics::FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["fetch", status.as_str()])
            .inc();

        if !status.is_success() {
            return Err(AppError::Delivery(format!(
                "Failed to fetch {}: HTTP {}",
                url, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Delivery(format!("Failed to parse {}: {}", url, e)))
    }

    /// Dereference an actor URI.
    ///
    /// The returned document's `id` must name the same actor that was asked
    /// for, so a peer cannot answer for someone else's URI.
    pub async fn fetch_actor(&self, uri: &Url) -> Result<RemoteActor, AppError> {
        let mut target = uri.clone();
        target.set_fragment(None);

        let document = self.fetch_json(&target).await?;
        let actor = RemoteActor::from_json(&document)?;

        if !same_origin(&actor.id, &target) {
            return Err(AppError::Validation(format!(
                "Actor document {} claims foreign id {}",
                target, actor.id
            )));
        }

        Ok(actor)
    }

    /// Dereference a signature `keyId` and return the key with its owner.
    ///
    /// The owner is trusted as stated only when the served document is the
    /// owner itself on the key's own origin. Otherwise the owner's document
    /// is fetched and must publish the same key under the same id.
    pub async fn fetch_public_key(&self, key_id: &str) -> Result<PublishedKey, AppError> {
        let mut key_url = Url::parse(key_id)
            .map_err(|e| AppError::Validation(format!("Invalid keyId {}: {}", key_id, e)))?;
        key_url.set_fragment(None);

        let document = self.fetch_json(&key_url).await?;
        let published = PublishedKey::from_document(&document, key_id)?;

        let served_by_owner = document.get("id").and_then(Value::as_str)
            == Some(published.owner.as_str())
            && same_origin(&published.owner, &key_url);
        if !served_by_owner {
            let owner_document = self.fetch_json(&published.owner).await?;
            let confirmed = PublishedKey::from_document(&owner_document, key_id)?;
            if confirmed != published {
                return Err(AppError::Validation(format!(
                    "{} does not publish key {}",
                    published.owner, key_id
                )));
            }
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::get};
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use serde_json::json;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn test_pem() -> (RsaPublicKey, String) {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public_key = RsaPublicKey::from(&key);
        let pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();
        (public_key, pem)
    }

    /// Bind first so documents can carry the real port in their ids.
    async fn bind() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    fn serve_documents(listener: tokio::net::TcpListener, routes: Vec<(&'static str, Value)>) {
        let mut app = Router::new();
        for (path, document) in routes {
            app = app.route(
                path,
                get(move || {
                    let document = document.clone();
                    async move { Json(document) }
                }),
            );
        }
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }

    fn loopback_fetcher() -> ActorFetcher {
        ActorFetcher::new(reqwest::Client::new(), Duration::from_secs(5), true)
    }

    #[test]
    fn rejects_localhost_and_private_addresses() {
        for target in [
            "https://localhost/users/alice",
            "http://192.168.1.10/users/alice",
            "http://127.0.0.1:8080/users/alice",
            "http://[::1]/users/alice",
            "http://[::ffff:10.0.0.1]/users/alice",
            "https://app.localhost/users/alice",
        ] {
            match check_remote_url(&url(target), false) {
                Err(AppError::Forbidden) => {}
                other => panic!("expected forbidden for {target}, got: {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            check_remote_url(&url("file:///etc/passwd"), true),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn accepts_public_hosts_and_allowed_private() {
        assert!(check_remote_url(&url("https://example.com/users/alice"), false).is_ok());
        assert!(check_remote_url(&url("http://127.0.0.1:3000/users/alice"), true).is_ok());
    }

    #[tokio::test]
    async fn resolved_loopback_is_rejected() {
        match validate_resolved_host_ips("localhost", 80).await {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for localhost resolution, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolution_check_does_not_rely_on_the_host_literal() {
        // Judged only by where the name resolves to.
        match check_resolved_destination(&url("http://localhost:9/users/alice/inbox")).await {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden after resolution, got: {other:?}"),
        }
        assert!(
            check_remote_destination(&url("http://localhost:9/inbox"), true)
                .await
                .is_ok()
        );
    }

    #[test]
    fn remote_actor_decodes_mastodon_document() {
        let document = json!({
            "id": "https://remote.example/users/alice",
            "type": "Person",
            "preferredUsername": "alice",
            "name": "Alice",
            "inbox": "https://remote.example/users/alice/inbox",
            "endpoints": {"sharedInbox": "https://remote.example/inbox"},
        });

        let actor = RemoteActor::from_json(&document).unwrap();
        assert_eq!(actor.inbox, url("https://remote.example/users/alice/inbox"));
        assert_eq!(actor.shared_inbox, Some(url("https://remote.example/inbox")));
        assert_eq!(actor.preferred_username.as_deref(), Some("alice"));
    }

    #[test]
    fn remote_actor_requires_inbox() {
        let document = json!({"id": "https://remote.example/users/alice", "type": "Person"});
        assert!(RemoteActor::from_json(&document).is_err());
    }

    #[test]
    fn published_key_from_actor_document() {
        let (key, pem) = test_pem();
        let document = json!({
            "id": "https://remote.example/users/alice",
            "type": "Person",
            "inbox": "https://remote.example/users/alice/inbox",
            "publicKey": {
                "id": "https://remote.example/users/alice#main-key",
                "owner": "https://remote.example/users/alice",
                "publicKeyPem": pem
            }
        });

        let published =
            PublishedKey::from_document(&document, "https://remote.example/users/alice#main-key")
                .unwrap();
        assert_eq!(published.owner, url("https://remote.example/users/alice"));
        assert_eq!(published.key, key);

        assert!(
            PublishedKey::from_document(&document, "https://remote.example/users/alice#other-key")
                .is_err()
        );
    }

    #[test]
    fn published_key_from_path_style_key_stub() {
        let (key, pem) = test_pem();
        // Key endpoint answering with a minimal actor stub and no inbox
        let document = json!({
            "id": "https://gts.example/users/alice",
            "type": "Person",
            "publicKey": {
                "id": "https://gts.example/users/alice/main-key",
                "owner": "https://gts.example/users/alice",
                "publicKeyPem": pem
            }
        });

        let published =
            PublishedKey::from_document(&document, "https://gts.example/users/alice/main-key")
                .unwrap();
        assert_eq!(published.owner, url("https://gts.example/users/alice"));
        assert_eq!(published.key, key);
    }

    #[test]
    fn published_key_from_standalone_key_document() {
        let (_, pem) = test_pem();
        let document = json!({
            "id": "https://remote.example/keys/1",
            "owner": "https://remote.example/users/alice",
            "publicKeyPem": pem
        });

        let published =
            PublishedKey::from_document(&document, "https://remote.example/keys/1").unwrap();
        assert_eq!(published.owner, url("https://remote.example/users/alice"));

        let ownerless = json!({"id": "https://remote.example/keys/1", "publicKeyPem": "x"});
        assert!(PublishedKey::from_document(&ownerless, "https://remote.example/keys/1").is_err());
    }

    #[tokio::test]
    async fn fetches_path_style_key_id() {
        let (key, pem) = test_pem();
        let (listener, base) = bind().await;
        let key_id = format!("{base}/users/alice/main-key");
        let owner = format!("{base}/users/alice");
        serve_documents(
            listener,
            vec![(
                "/users/alice/main-key",
                json!({
                    "id": owner,
                    "type": "Person",
                    "publicKey": {"id": key_id, "owner": owner, "publicKeyPem": pem}
                }),
            )],
        );

        let published = loopback_fetcher().fetch_public_key(&key_id).await.unwrap();
        assert_eq!(published.owner, url(&owner));
        assert_eq!(published.key, key);
    }

    #[tokio::test]
    async fn key_claiming_a_foreign_owner_is_rejected() {
        let (_, pem) = test_pem();
        let (listener, base) = bind().await;
        let key_id = format!("{base}/users/mallory/main-key");
        // Claims to be an actor on another origin, which never confirms it.
        let victim = "http://127.0.0.1:9/users/victim";
        serve_documents(
            listener,
            vec![(
                "/users/mallory/main-key",
                json!({
                    "id": victim,
                    "type": "Person",
                    "publicKey": {"id": key_id, "owner": victim, "publicKeyPem": pem}
                }),
            )],
        );

        let result = loopback_fetcher().fetch_public_key(&key_id).await;
        assert!(result.is_err(), "unconfirmed owner must not be trusted");
    }

    #[tokio::test]
    async fn standalone_key_confirmed_by_owner() {
        let (key, pem) = test_pem();
        let (listener, base) = bind().await;
        let key_id = format!("{base}/keys/1");
        let owner = format!("{base}/users/alice");
        serve_documents(
            listener,
            vec![
                (
                    "/keys/1",
                    json!({"id": key_id, "owner": owner, "publicKeyPem": pem}),
                ),
                (
                    "/users/alice",
                    json!({
                        "id": owner,
                        "type": "Person",
                        "inbox": format!("{owner}/inbox"),
                        "publicKey": [{"id": key_id, "owner": owner, "publicKeyPem": pem}]
                    }),
                ),
            ],
        );

        let published = loopback_fetcher().fetch_public_key(&key_id).await.unwrap();
        assert_eq!(published.owner, url(&owner));
        assert_eq!(published.key, key);
    }
}
