//! URI dispatch table
//!
//! Builds the URIs of local resources and maps URIs back to the resource
//! they name. Identifiers are stored as single percent-encoded path
//! segments, so `parse_uri(actor_uri(id))` always yields `id` back.
//!
//! Layout under the instance base URL:
//! - `/users/{identifier}`            actor
//! - `/users/{identifier}/inbox`      personal inbox
//! - `/users/{identifier}/followers`  followers collection
//! - `/inbox`                         shared inbox

use url::Url;

use crate::error::AppError;

/// Resource named by a URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedUri {
    Actor { identifier: String },
    /// `identifier` is `None` for the shared inbox
    Inbox { identifier: Option<String> },
    Followers { identifier: String },
    Unknown,
}

impl ParsedUri {
    pub fn actor_identifier(&self) -> Option<&str> {
        match self {
            ParsedUri::Actor { identifier } => Some(identifier),
            _ => None,
        }
    }
}

/// URI builders and parser for one instance base URL
#[derive(Debug, Clone)]
pub struct UriDispatcher {
    base: Url,
}

impl UriDispatcher {
    /// Create a dispatcher rooted at `base_url` (e.g. `https://social.example`).
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let base = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("Invalid base URL {}: {}", base_url, e)))?;

        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(AppError::Config(format!(
                "Base URL must be an http(s) URL with a host: {}",
                base_url
            )));
        }

        Ok(Self { base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `host[:port]` as used in `acct:` handles
    pub fn authority(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    fn base_segments(&self) -> Vec<&str> {
        self.base
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    fn build(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn actor_uri(&self, identifier: &str) -> Url {
        self.build(&["users", identifier])
    }

    /// Personal inbox for `Some(identifier)`, shared inbox for `None`
    pub fn inbox_uri(&self, identifier: Option<&str>) -> Url {
        match identifier {
            Some(identifier) => self.build(&["users", identifier, "inbox"]),
            None => self.build(&["inbox"]),
        }
    }

    pub fn followers_uri(&self, identifier: &str) -> Url {
        self.build(&["users", identifier, "followers"])
    }

    /// Fresh id for an activity the actor emits, e.g. `/users/me/accepts/{ulid}`
    pub fn new_activity_uri(&self, identifier: &str, collection: &str) -> Url {
        let ulid = ulid::Ulid::new().to_string();
        self.build(&["users", identifier, collection, &ulid])
    }

    /// Key id for the `index`-th key pair of an actor.
    ///
    /// The primary key keeps the conventional `#main-key` fragment.
    pub fn key_id(&self, identifier: &str, index: usize) -> Url {
        let mut url = self.actor_uri(identifier);
        if index == 0 {
            url.set_fragment(Some("main-key"));
        } else {
            url.set_fragment(Some(&format!("key-{}", index + 1)));
        }
        url
    }

    /// `acct:identifier@authority`
    pub fn webfinger_subject(&self, identifier: &str) -> String {
        format!("acct:{}@{}", identifier, self.authority())
    }

    /// Classify `uri`.
    ///
    /// Anything not produced by this dispatcher is `Unknown`: other hosts,
    /// ports or schemes, queries, fragments and unrecognised paths.
    pub fn parse_uri(&self, uri: &Url) -> ParsedUri {
        if uri.scheme() != self.base.scheme()
            || uri.host_str() != self.base.host_str()
            || uri.port_or_known_default() != self.base.port_or_known_default()
            || uri.query().is_some()
            || uri.fragment().is_some()
        {
            return ParsedUri::Unknown;
        }

        let Some(segments) = uri.path_segments() else {
            return ParsedUri::Unknown;
        };
        let mut segments: Vec<&str> = segments.collect();
        if segments.len() > 1 && segments.last() == Some(&"") {
            segments.pop();
        }

        let base_segments = self.base_segments();
        if !segments.starts_with(&base_segments) {
            return ParsedUri::Unknown;
        }
        let rest = &segments[base_segments.len()..];

        match rest {
            ["inbox"] => ParsedUri::Inbox { identifier: None },
            ["users", identifier] => match decode_identifier(identifier) {
                Some(identifier) => ParsedUri::Actor { identifier },
                None => ParsedUri::Unknown,
            },
            ["users", identifier, "inbox"] => match decode_identifier(identifier) {
                Some(identifier) => ParsedUri::Inbox {
                    identifier: Some(identifier),
                },
                None => ParsedUri::Unknown,
            },
            ["users", identifier, "followers"] => match decode_identifier(identifier) {
                Some(identifier) => ParsedUri::Followers { identifier },
                None => ParsedUri::Unknown,
            },
            _ => ParsedUri::Unknown,
        }
    }

    /// Parse a string URI; unparsable input is `Unknown`.
    pub fn parse_str(&self, uri: &str) -> ParsedUri {
        Url::parse(uri)
            .map(|uri| self.parse_uri(&uri))
            .unwrap_or(ParsedUri::Unknown)
    }

    /// Map a WebFinger `resource` to a local identifier.
    ///
    /// Accepts `acct:identifier@authority` and local actor URIs.
    pub fn parse_webfinger_resource(&self, resource: &str) -> Option<String> {
        if let Some(acct) = resource.strip_prefix("acct:") {
            let (identifier, authority) = acct.rsplit_once('@')?;
            if identifier.is_empty() || !authority.eq_ignore_ascii_case(&self.authority()) {
                return None;
            }
            return Some(identifier.to_string());
        }

        match self.parse_str(resource) {
            ParsedUri::Actor { identifier } => Some(identifier),
            _ => None,
        }
    }
}

fn decode_identifier(segment: &str) -> Option<String> {
    if segment.is_empty() {
        return None;
    }
    urlencoding::decode(segment)
        .ok()
        .map(|decoded| decoded.into_owned())
}
