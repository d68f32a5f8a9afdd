//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor, inboxes, followers)
//! - Discovery (WebFinger, NodeInfo, host-meta)
//! - Metrics (Prometheus)

mod activitypub;
mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
