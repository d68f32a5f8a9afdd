//! ActivityPub federation module
//!
//! Handles:
//! - Actor key pairs and actor documents
//! - URI dispatch for local resources
//! - Activity processing (inbox)
//! - Activity delivery (outbox)
//! - HTTP Signatures
//! - Peer actor fetching and public key caching
//! - WebFinger

mod activity;
mod actor;
mod delivery;
mod dispatch;
mod fetch;
mod inbox;
mod key_cache;
mod keys;
mod signature;
mod webfinger;

pub use activity::{
    ACTIVITYSTREAMS_CONTEXT, Activity, ActivityFields, ActivityKind, ObjectRef, SECURITY_CONTEXT,
};
pub use actor::{Actor, ActorResolver, PublicKeyDescriptor};
pub use delivery::{ActivityDelivery, DeliveryResult};
pub use dispatch::{ParsedUri, UriDispatcher};
pub use fetch::{ACTIVITY_JSON, ActorFetcher, PublishedKey, RemoteActor, check_remote_url};
pub use inbox::{InboxOutcome, InboxProcessor, InboxRequest};
pub use key_cache::{CacheStats, KeyLookup, PublicKeyCache};
pub use keys::{ExportedKeyPair, Jwk, KeyManager, KeyPair};
pub use signature::{
    SignatureHeaders, generate_digest, parse_signature_header, sign_request, verify_signature,
};
pub use webfinger::{WebFingerLink, WebFingerResponse, generate_webfinger_response};
