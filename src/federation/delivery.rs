//! Activity delivery
//!
//! Signs and POSTs activities to peer inboxes. Delivery is best-effort: a
//! network failure or non-2xx answer is reported in the [`DeliveryResult`]
//! and never retried here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use url::Url;

use super::activity::Activity;
use super::dispatch::UriDispatcher;
use super::fetch::{ACTIVITY_JSON, RemoteActor, check_remote_destination};
use super::keys::KeyManager;
use super::signature::sign_request;
use crate::error::AppError;

/// Outcome of one POST to one inbox
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub inbox_uri: Url,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl DeliveryResult {
    fn failed(inbox_uri: &Url, status_code: Option<u16>, error: String) -> Self {
        Self {
            inbox_uri: inbox_uri.clone(),
            success: false,
            status_code,
            error: Some(error),
        }
    }
}

/// Signing material resolved once per send
struct Signer {
    key_id: String,
    private_key: rsa::RsaPrivateKey,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
fn unique_inbox_targets(inbox_uris: Vec<Url>) -> Vec<Url> {
    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|uri| seen.insert(uri.clone()))
        .collect()
}

/// Inbox to use when one activity goes to several recipients
fn fan_out_inbox(recipient: &RemoteActor) -> Url {
    recipient
        .shared_inbox
        .clone()
        .unwrap_or_else(|| recipient.inbox.clone())
}

/// Activity delivery service
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: reqwest::Client,
    keys: Arc<KeyManager>,
    dispatcher: Arc<UriDispatcher>,
    timeout: Duration,
    allow_private: bool,
    max_concurrent: usize,
}

impl ActivityDelivery {
    pub fn new(
        http_client: reqwest::Client,
        keys: Arc<KeyManager>,
        dispatcher: Arc<UriDispatcher>,
        timeout: Duration,
        allow_private: bool,
        max_concurrent: usize,
    ) -> Self {
        Self {
            http_client,
            keys,
            dispatcher,
            timeout,
            allow_private,
            max_concurrent: max_concurrent.max(1),
        }
    }

    async fn signer(&self, sender: &str) -> Result<Signer, AppError> {
        let key_pair = self.keys.primary_key_pair(sender).await?.ok_or_else(|| {
            AppError::Crypto(format!("No signing key for sender {}", sender))
        })?;
        Ok(Signer {
            key_id: self.dispatcher.key_id(sender, 0).to_string(),
            private_key: key_pair.private_key().clone(),
        })
    }

    /// Sign and deliver `activity` to `recipient`'s personal inbox.
    ///
    /// `Err` means the activity could not be prepared (no key, key store
    /// down); transport problems come back as an unsuccessful result.
    pub async fn send_activity(
        &self,
        sender: &str,
        recipient: &RemoteActor,
        activity: &Activity,
    ) -> Result<DeliveryResult, AppError> {
        let signer = self.signer(sender).await?;
        let body = serde_json::to_vec(&activity.to_json())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {}", e)))?;

        let result = self.deliver_to_inbox(&signer, &recipient.inbox, &body).await;
        record_outcome(activity, &result);
        Ok(result)
    }

    /// Deliver one activity to several recipients.
    ///
    /// Shared inboxes are preferred and identical inbox URIs are contacted
    /// once. At most `max_concurrent` POSTs are in flight.
    pub async fn send_to_many(
        &self,
        sender: &str,
        recipients: &[RemoteActor],
        activity: &Activity,
    ) -> Result<Vec<DeliveryResult>, AppError> {
        let signer = Arc::new(self.signer(sender).await?);
        let body: Arc<[u8]> = serde_json::to_vec(&activity.to_json())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {}", e)))?
            .into();

        let targets = unique_inbox_targets(recipients.iter().map(fan_out_inbox).collect());
        tracing::info!(
            activity_type = activity.type_name(),
            inboxes = targets.len(),
            recipients = recipients.len(),
            "Delivering to unique inboxes"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = Vec::with_capacity(targets.len());

        for inbox_uri in targets {
            let semaphore = semaphore.clone();
            let signer = signer.clone();
            let body = body.clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return DeliveryResult::failed(&inbox_uri, None, e.to_string());
                    }
                };
                this.deliver_to_inbox(&signer, &inbox_uri, &body).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => {
                    record_outcome(activity, &result);
                    results.push(result);
                }
                Err(e) => tracing::error!(error = %e, "Delivery task panicked"),
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(
            succeeded,
            failed = results.len() - succeeded,
            "Batch delivery complete"
        );

        Ok(results)
    }

    async fn deliver_to_inbox(&self, signer: &Signer, inbox_uri: &Url, body: &[u8]) -> DeliveryResult {
        if let Err(e) = check_remote_destination(inbox_uri, self.allow_private).await {
            tracing::warn!(inbox = %inbox_uri, error = %e, "Refusing to deliver");
            return DeliveryResult::failed(inbox_uri, None, e.to_string());
        }

        let sig_headers = match sign_request(
            "POST",
            inbox_uri,
            Some(body),
            &signer.private_key,
            &signer.key_id,
        ) {
            Ok(headers) => headers,
            Err(e) => return DeliveryResult::failed(inbox_uri, None, e.to_string()),
        };

        let mut request = self
            .http_client
            .post(inbox_uri.clone())
            .timeout(self.timeout)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);
        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let start = Instant::now();
        let response = request.body(body.to_vec()).send().await;
        crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["deliver"])
            .observe(start.elapsed().as_secs_f64());

        match response {
            Ok(response) => {
                let status = response.status();
                crate::metrics::FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["deliver", status.as_str()])
                    .inc();

                if status.is_success() {
                    tracing::info!(inbox = %inbox_uri, status = status.as_u16(), "Delivered activity");
                    DeliveryResult {
                        inbox_uri: inbox_uri.clone(),
                        success: true,
                        status_code: Some(status.as_u16()),
                        error: None,
                    }
                } else {
                    tracing::warn!(inbox = %inbox_uri, status = status.as_u16(), "Inbox rejected activity");
                    DeliveryResult::failed(
                        inbox_uri,
                        Some(status.as_u16()),
                        format!("Inbox {} rejected activity: HTTP {}", inbox_uri, status),
                    )
                }
            }
            Err(e) => {
                crate::metrics::FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["deliver", "error"])
                    .inc();
                tracing::warn!(inbox = %inbox_uri, error = %e, "Delivery failed");
                DeliveryResult::failed(
                    inbox_uri,
                    None,
                    format!("Failed to deliver to {}: {}", inbox_uri, e),
                )
            }
        }
    }
}

fn record_outcome(activity: &Activity, result: &DeliveryResult) {
    let outcome = if result.success { "success" } else { "failure" };
    crate::metrics::ACTIVITIES_SENT
        .with_label_values(&[activity.kind().as_str(), outcome])
        .inc();
}
