//! Actor documents
//!
//! The instance serves exactly one actor. Its document is rebuilt on every
//! request from configuration, the dispatch table and the stored keys.

use std::sync::Arc;

use serde_json::{Value, json};
use url::Url;

use super::activity::{ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT};
use super::dispatch::UriDispatcher;
use super::keys::KeyManager;
use crate::config::ActorConfig;
use crate::error::AppError;

/// A published public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyDescriptor {
    pub id: Url,
    pub owner: Url,
    pub public_key_pem: String,
}

impl PublicKeyDescriptor {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id.as_str(),
            "owner": self.owner.as_str(),
            "publicKeyPem": self.public_key_pem,
        })
    }
}

/// Local actor value, built per request
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub identifier: String,
    pub name: String,
    pub summary: String,
    pub id: Url,
    /// Human-facing profile page
    pub url: Url,
    pub inbox: Url,
    pub shared_inbox: Option<Url>,
    pub followers: Url,
    /// Ordered; the first key is the one used for signing
    pub public_keys: Vec<PublicKeyDescriptor>,
}

impl Actor {
    /// `Person` document as served at the actor URI
    pub fn to_json(&self) -> Value {
        let mut document = json!({
            "@context": [ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT],
            "type": "Person",
            "id": self.id.as_str(),
            "preferredUsername": self.identifier,
            "name": self.name,
            "summary": self.summary,
            "url": self.url.as_str(),
            "inbox": self.inbox.as_str(),
            "followers": self.followers.as_str(),
            "manuallyApprovesFollowers": false,
        });

        if let Some(shared_inbox) = &self.shared_inbox {
            document["endpoints"] = json!({ "sharedInbox": shared_inbox.as_str() });
        }
        if let Some(primary) = self.public_keys.first() {
            document["publicKey"] = primary.to_json();
        }

        document
    }
}

/// Builds [`Actor`] values for the configured identifier
pub struct ActorResolver {
    dispatcher: Arc<UriDispatcher>,
    keys: Arc<KeyManager>,
    config: ActorConfig,
}

impl ActorResolver {
    pub fn new(dispatcher: Arc<UriDispatcher>, keys: Arc<KeyManager>, config: ActorConfig) -> Self {
        Self {
            dispatcher,
            keys,
            config,
        }
    }

    /// The only identifier that resolves
    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn is_local(&self, identifier: &str) -> bool {
        identifier == self.config.identifier
    }

    /// `Ok(None)` for any identifier other than the configured one.
    ///
    /// The first resolution generates the actor's key pair.
    pub async fn resolve_actor(&self, identifier: &str) -> Result<Option<Actor>, AppError> {
        if !self.is_local(identifier) {
            tracing::debug!(identifier = %identifier, "Actor not found");
            return Ok(None);
        }

        let id = self.dispatcher.actor_uri(identifier);
        let key_pairs = self.keys.get_or_create_key_pairs(identifier).await?;
        let public_keys = key_pairs
            .iter()
            .enumerate()
            .map(|(index, pair)| {
                Ok(PublicKeyDescriptor {
                    id: self.dispatcher.key_id(identifier, index),
                    owner: id.clone(),
                    public_key_pem: pair.public_key_pem()?,
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        let mut url = self.dispatcher.base_url().clone();
        url.set_path("/");

        Ok(Some(Actor {
            identifier: identifier.to_string(),
            name: self.config.display_name.clone(),
            summary: self.config.summary.clone(),
            inbox: self.dispatcher.inbox_uri(Some(identifier)),
            shared_inbox: Some(self.dispatcher.inbox_uri(None)),
            followers: self.dispatcher.followers_uri(identifier),
            url,
            id,
            public_keys,
        }))
    }
}
