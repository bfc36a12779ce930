//! Enrichment of metrics with cloud instance metadata.
//!
//! Metrics can be tagged with metadata about the instance that sent them, such as its region.
//! The metadata is looked up by the sender's IP address through a [`CloudProvider`]. Providers
//! are slow and rate limited, so lookups go through a [`CloudHandle`], which:
//!
//!  - answers from a local cache as long as the entry has not expired,
//!  - runs at most one lookup per IP at a time and shares its result with all callers,
//!  - limits the rate of lookups with a token bucket and fails fast once it is exhausted.
//!
//! Enrichment is best effort. Every failure is reported as an [`EnrichmentError`] and callers are
//! expected to continue without instance tags.
#![warn(missing_docs)]

mod config;
mod limiter;
mod provider;
mod service;
mod statsd;

pub use self::config::*;
pub use self::limiter::*;
pub use self::provider::*;
pub use self::service::*;
