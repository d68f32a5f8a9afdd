//! Inbox processing
//!
//! Verifies the HTTP signature of each delivered activity, then applies it:
//! Follow records a follower and replies with Accept, Undo of a Follow
//! removes it, everything else is acknowledged and dropped. Problems with
//! the content of a verified activity never fail the request.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use url::Url;

use super::activity::{Activity, ActivityFields, ActivityKind, ObjectRef};
use super::delivery::ActivityDelivery;
use super::dispatch::{ParsedUri, UriDispatcher};
use super::fetch::ActorFetcher;
use super::key_cache::{KeyLookup, PublicKeyCache};
use super::signature::{extract_signature_key_id, verify_signature};
use crate::data::FollowerStore;
use crate::error::AppError;

/// Raw inbound POST, as seen by the HTTP layer
#[derive(Debug, Clone)]
pub struct InboxRequest {
    pub method: String,
    /// Request target including the query string
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// What processing a verified activity did
#[derive(Debug, Clone, PartialEq)]
pub enum InboxOutcome {
    FollowAccepted {
        follow_id: Url,
        follower: Url,
        /// The reply handed to delivery
        accept: Activity,
    },
    FollowRemoved {
        follow_id: Url,
    },
    /// Acknowledged without effect; the reason is for logs
    Ignored(String),
}

fn ignored(reason: impl Into<String>) -> Result<InboxOutcome, AppError> {
    let reason = reason.into();
    tracing::info!(reason = %reason, "Ignoring activity");
    Ok(InboxOutcome::Ignored(reason))
}

pub struct InboxProcessor {
    dispatcher: Arc<UriDispatcher>,
    /// The local actor; the only valid Follow target
    identifier: String,
    followers: FollowerStore,
    fetcher: Arc<ActorFetcher>,
    key_cache: Arc<PublicKeyCache>,
    delivery: Option<ActivityDelivery>,
    timeout: Duration,
}

impl InboxProcessor {
    pub fn new(
        dispatcher: Arc<UriDispatcher>,
        identifier: impl Into<String>,
        followers: FollowerStore,
        fetcher: Arc<ActorFetcher>,
        key_cache: Arc<PublicKeyCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            identifier: identifier.into(),
            followers,
            fetcher,
            key_cache,
            delivery: None,
            timeout,
        }
    }

    /// Send Accept replies through `delivery`.
    pub fn with_delivery(mut self, delivery: ActivityDelivery) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Handle a POST to the personal inbox of `recipient`, or to the shared
    /// inbox when `recipient` is `None`.
    ///
    /// # Errors
    /// - `NotFound` for a personal inbox of an unknown identifier
    /// - `Unauthorized` without a Signature header
    /// - `InvalidSignature` when the signature does not verify or the key's
    ///   published owner is not the activity's actor
    /// - store failures while applying a verified activity
    pub async fn receive(
        &self,
        recipient: Option<&str>,
        request: InboxRequest,
    ) -> Result<InboxOutcome, AppError> {
        if let Some(recipient) = recipient {
            if recipient != self.identifier {
                return Err(AppError::NotFound);
            }
        }

        if !request.headers.contains_key("signature") {
            tracing::info!(path = %request.path_and_query, "Rejecting unsigned inbox request");
            return Err(AppError::Unauthorized);
        }

        let key_id = extract_signature_key_id(&request.headers).map_err(|e| {
            tracing::info!(error = %e, "Malformed Signature header");
            AppError::InvalidSignature
        })?;

        let signer = self.verify(&key_id, &request).await?;

        let activity = match Activity::from_slice(&request.body) {
            Ok(activity) => activity,
            Err(e) => return ignored(format!("Undecodable payload: {}", e)),
        };

        if let Some(actor) = activity.actor() {
            if *actor != signer {
                tracing::warn!(
                    key_id = %key_id,
                    key_owner = %signer,
                    actor = %actor,
                    "Signature key does not belong to activity actor"
                );
                return Err(AppError::InvalidSignature);
            }
        }

        crate::metrics::ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind().as_str()])
            .inc();

        self.process(&activity).await
    }

    async fn lookup_key(&self, key_id: &str) -> Result<KeyLookup, AppError> {
        match tokio::time::timeout(self.timeout, self.key_cache.get(key_id)).await {
            Ok(Ok(lookup)) => Ok(lookup),
            Ok(Err(e)) => {
                tracing::warn!(key_id = %key_id, error = %e, "Could not resolve signing key");
                Err(AppError::InvalidSignature)
            }
            Err(_) => {
                tracing::warn!(key_id = %key_id, "Timed out resolving signing key");
                Err(AppError::InvalidSignature)
            }
        }
    }

    /// Returns the owner of the key that verified the request.
    ///
    /// A cached key that fails is dropped and the check repeated once
    /// against a fresh copy, which covers peers that rotated their key.
    async fn verify(&self, key_id: &str, request: &InboxRequest) -> Result<Url, AppError> {
        let check = |key: &rsa::RsaPublicKey| {
            verify_signature(
                &request.method,
                &request.path_and_query,
                &request.headers,
                Some(request.body.as_slice()),
                key,
            )
        };

        let lookup = self.lookup_key(key_id).await?;
        let result = match check(&lookup.key.key) {
            Ok(()) => Ok(lookup.key.owner),
            Err(e) if lookup.cached => {
                tracing::debug!(key_id = %key_id, error = %e, "Cached key failed, refetching");
                self.key_cache.invalidate(key_id).await;
                let fresh = self.lookup_key(key_id).await?;
                check(&fresh.key.key).map(|()| fresh.key.owner)
            }
            Err(e) => Err(e),
        };

        result.map_err(|e| {
            tracing::warn!(key_id = %key_id, error = %e, "Signature verification failed");
            AppError::InvalidSignature
        })
    }

    /// Apply an already verified activity.
    pub async fn process(&self, activity: &Activity) -> Result<InboxOutcome, AppError> {
        tracing::debug!(
            activity_type = activity.type_name(),
            id = ?activity.id().map(Url::as_str),
            "Processing activity"
        );

        match activity {
            Activity::Follow(fields) => self.on_follow(fields, activity).await,
            Activity::Undo(fields) => self.on_undo(fields).await,
            Activity::Accept(_) => ignored("Accept needs no handling"),
            Activity::Unknown { kind, .. } => ignored(format!("Unhandled activity type {}", kind)),
        }
    }

    async fn on_follow(
        &self,
        fields: &ActivityFields,
        activity: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        let (Some(follow_id), Some(follower_uri), Some(object_id)) =
            (fields.id.clone(), fields.actor.clone(), fields.object.id())
        else {
            return ignored("Follow is missing id, actor or object");
        };

        match self.dispatcher.parse_uri(&object_id) {
            ParsedUri::Actor { identifier } if identifier == self.identifier => {}
            _ => return ignored(format!("Follow target {} is not the local actor", object_id)),
        }

        let follower = match tokio::time::timeout(
            self.timeout,
            self.fetcher.fetch_actor(&follower_uri),
        )
        .await
        {
            Ok(Ok(follower)) => follower,
            Ok(Err(e)) => {
                return ignored(format!("Follower {} could not be resolved: {}", follower_uri, e));
            }
            Err(_) => return ignored(format!("Timed out resolving follower {}", follower_uri)),
        };

        self.followers
            .put(follow_id.as_str(), follower_uri.as_str())
            .await?;
        tracing::info!(
            follow_id = %follow_id,
            follower = %follower_uri,
            name = follower.name.as_deref().unwrap_or_default(),
            "New follower"
        );

        let accept = Activity::accept(
            self.dispatcher
                .new_activity_uri(&self.identifier, "accepts"),
            self.dispatcher.actor_uri(&self.identifier),
            activity.clone(),
        );

        if let Some(delivery) = &self.delivery {
            let delivery = delivery.clone();
            let sender = self.identifier.clone();
            let reply = accept.clone();
            tokio::spawn(async move {
                match delivery.send_activity(&sender, &follower, &reply).await {
                    Ok(result) if result.success => {}
                    Ok(result) => tracing::warn!(
                        inbox = %result.inbox_uri,
                        error = ?result.error,
                        "Accept delivery failed"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Accept could not be prepared"),
                }
            });
        }

        Ok(InboxOutcome::FollowAccepted {
            follow_id,
            follower: follower_uri,
            accept,
        })
    }

    async fn on_undo(&self, fields: &ActivityFields) -> Result<InboxOutcome, AppError> {
        let Some(undo_actor) = fields.actor.as_ref() else {
            return ignored("Undo has no actor");
        };

        match &fields.object {
            ObjectRef::Activity(inner) if inner.kind() == ActivityKind::Follow => {
                let Some(follow_id) = inner.id() else {
                    return ignored("Undone Follow has no id");
                };
                if inner.actor().is_some_and(|actor| actor != undo_actor) {
                    return ignored("Undo actor differs from the Follow actor");
                }
                self.remove_follow(follow_id, undo_actor, true).await
            }
            ObjectRef::Activity(inner) => {
                ignored(format!("Undo of {} is not handled", inner.type_name()))
            }
            // Only a Follow we recorded can be undone by reference.
            ObjectRef::Uri(object_id) => self.remove_follow(object_id, undo_actor, false).await,
            ObjectRef::Other(_) | ObjectRef::Absent => ignored("Undo object is not a Follow"),
        }
    }

    async fn remove_follow(
        &self,
        follow_id: &Url,
        undo_actor: &Url,
        known_follow: bool,
    ) -> Result<InboxOutcome, AppError> {
        match self.followers.get(follow_id.as_str()).await? {
            Some(follower) if follower != undo_actor.as_str() => {
                return ignored(format!(
                    "{} cannot undo a Follow made by {}",
                    undo_actor, follower
                ));
            }
            None if !known_follow => {
                return ignored(format!("No Follow recorded under {}", follow_id));
            }
            _ => {}
        }

        self.followers.delete(follow_id.as_str()).await?;
        tracing::info!(follow_id = %follow_id, follower = %undo_actor, "Follower removed");
        Ok(InboxOutcome::FollowRemoved {
            follow_id: follow_id.clone(),
        })
    }
}
