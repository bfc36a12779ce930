//! Metric protocol and in-memory aggregation.
//!
//! Clients submit metrics as plain text lines over UDP:
//!
//! ```text
//! <name>:<value>|<type>[|@<sample_rate>][|#<tag1>,<tag2>]
//! ```
//!
//! The [`Metric::parse_all`] iterator turns a datagram into individual [`Metric`]s. Each metric
//! is identified by a [`BucketKey`], which is the unit of aggregation and of sharding. The
//! [`route`] function deterministically assigns every key to one of a fixed number of shards, so
//! each key's state is owned by exactly one [`Aggregator`].
//!
//! # Metric Types
//!
//! | Type    | Code      | Aggregation                                                        |
//! |---------|-----------|--------------------------------------------------------------------|
//! | Counter | `c`       | Sums values scaled by the inverse sample rate. Reset every flush.  |
//! | Gauge   | `g`       | Keeps the last value. A leading sign applies a delta. Not reset.   |
//! | Timer   | `ms`, `h` | Collects samples and computes statistics at flush.                 |
//! | Set     | `s`       | Counts unique members. Reset every flush.                          |
//!
//! # Flushing
//!
//! [`Aggregator::flush`] produces a [`MetricBatch`] for the elapsed window, resets the window
//! state and removes keys that have not been updated within the expiry interval. Batches of
//! multiple aggregators are combined with [`MetricBatch::merge`].
#![warn(missing_docs)]

mod aggregator;
mod batch;
mod bucket;
mod protocol;
mod router;
mod statsd;
mod time;

pub use self::aggregator::*;
pub use self::batch::*;
pub use self::bucket::*;
pub use self::protocol::*;
pub use self::router::*;
pub use self::time::*;
