//! WebFinger protocol implementation
//!
//! Maps `acct:identifier@host` handles to the local actor URI.

use serde::{Deserialize, Serialize};

use super::dispatch::UriDispatcher;
use super::fetch::ACTIVITY_JSON;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Generate WebFinger response for a local account.
///
/// The caller has already checked that `identifier` resolves.
pub fn generate_webfinger_response(
    dispatcher: &UriDispatcher,
    identifier: &str,
) -> WebFingerResponse {
    let actor_url = dispatcher.actor_uri(identifier).to_string();
    let mut profile_url = dispatcher.base_url().clone();
    profile_url.set_path("/");

    WebFingerResponse {
        subject: dispatcher.webfinger_subject(identifier),
        aliases: Some(vec![actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(profile_url.to_string()),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_link_points_at_actor() {
        let dispatcher = UriDispatcher::new("https://social.example").unwrap();
        let response = generate_webfinger_response(&dispatcher, "me");

        assert_eq!(response.subject, "acct:me@social.example");
        let self_link = response
            .links
            .iter()
            .find(|link| link.rel == "self")
            .expect("self link");
        assert_eq!(self_link.link_type.as_deref(), Some("application/activity+json"));
        assert_eq!(
            self_link.href.as_deref(),
            Some("https://social.example/users/me")
        );
    }
}
