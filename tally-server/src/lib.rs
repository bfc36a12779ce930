//! The tally metrics server.
//!
//! This crate wires the metrics pipeline together and exposes the [`Server`] that runs it. See
//! the [`Config`](tally_config::Config) documentation for configuration options.
//!
//! # Path of a Metric through Tally
//!
//! ```text
//! UDP socket ──► reader ──► dispatcher ──► aggregator (shard n) ──┐
//!    (max_readers)   │     (hash of key)     (max_workers)        │ snapshot
//!                    ▼                                            ▼
//!           cloud enrichment                           flush coordinator
//!          (cached instance tags)                           │ batch
//!                                                           ▼
//!                                              backend queue ──► backend
//! ```
//!
//! 1. Readers receive datagrams and parse every line into a metric. Invalid lines are counted
//!    and skipped.
//! 2. If cloud enrichment is enabled, the instance tags of the sender are added. Lookups are
//!    cached, rate limited and never block a reader.
//! 3. The dispatcher adds default tags and routes the metric to the aggregator that owns its
//!    key. If the aggregator's queue is full, the metric is dropped or the dispatcher waits for a
//!    bounded time, depending on the configured policy.
//! 4. On every flush interval, the flush coordinator collects snapshots from all aggregators and
//!    queues the combined batch at every backend. Backends process their queue one batch at a
//!    time. A slow backend loses batches but never delays the others.
//!
//! # Shutdown
//!
//! A graceful shutdown stops the readers, flushes all aggregators one last time and waits for
//! the backends to drain their queues within the shutdown timeout.
#![warn(missing_docs)]

mod service;
mod source;
mod statsd;

pub mod services;

pub use self::service::*;
pub use self::services::backend::{Backend, BackendError, NullBackend, StdoutBackend};
pub use self::services::dispatcher::{DispatchError, MetricDispatcher};
pub use self::source::*;
