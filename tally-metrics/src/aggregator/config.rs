use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Behavior of the dispatcher when an aggregator's queue is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Drops the metric immediately and counts it as dropped.
    #[default]
    Drop,

    /// Waits up to [`AggregatorConfig::block_timeout_ms`] for space in the queue.
    ///
    /// The metric is dropped and counted if the queue is still full after the timeout. This
    /// slows down readers, which causes the kernel to drop datagrams once the socket receive
    /// buffer overflows.
    Block,
}

/// Parameters for aggregation and flushing.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// The number of aggregators.
    ///
    /// Every metric key is owned by exactly one aggregator. Defaults to the number of CPUs.
    pub max_workers: usize,

    /// The maximum number of metrics waiting in the queue of a single aggregator.
    ///
    /// Defaults to `10000`.
    pub max_queue_size: usize,

    /// What to do with metrics when the queue of their aggregator is full.
    pub queue_policy: QueuePolicy,

    /// The maximum time in milliseconds to wait for space with [`QueuePolicy::Block`].
    ///
    /// Defaults to `100` milliseconds.
    pub block_timeout_ms: u64,

    /// The length of a flush window in milliseconds.
    ///
    /// Defaults to `1000` milliseconds.
    pub flush_interval_ms: u64,

    /// The time in seconds after which a key without updates is removed.
    ///
    /// Keys are only removed during a flush. A key that has been idle for longer than this
    /// interval is still emitted in the flush that removes it. Set to `0` to keep keys forever.
    ///
    /// Defaults to `300` seconds.
    pub expiry_interval: u64,

    /// Thresholds for timer percentiles.
    ///
    /// Negative values compute lower percentiles. Defaults to `[90]`.
    pub percent_thresholds: Vec<f64>,

    /// Tags added to every metric that does not already carry them.
    pub default_tags: Vec<String>,

    /// The maximum time in milliseconds to wait for all aggregators during a flush.
    ///
    /// Aggregators that do not respond in time are left out of the flushed batch. Defaults to
    /// `5000` milliseconds.
    pub flush_timeout_ms: u64,

    /// Whether to flush all aggregators one final time on shutdown.
    ///
    /// Defaults to `true`.
    pub flush_on_shutdown: bool,

    /// The maximum number of batches waiting to be delivered to a single backend.
    ///
    /// If a backend falls behind, further batches for this backend are dropped. Defaults to `16`.
    pub max_pending_batches: usize,
}

impl AggregatorConfig {
    /// Returns the length of a flush window.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns the expiry interval or `None` if keys never expire.
    pub fn expiry_interval(&self) -> Option<Duration> {
        match self.expiry_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Returns the maximum time to wait for queue space with [`QueuePolicy::Block`].
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Returns the maximum time to wait for aggregators during a flush.
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
            max_queue_size: 10_000,
            queue_policy: QueuePolicy::default(),
            block_timeout_ms: 100,
            flush_interval_ms: 1000,
            expiry_interval: 300, // 5 minutes
            percent_thresholds: vec![90.0],
            default_tags: Vec::new(),
            flush_timeout_ms: 5000,
            flush_on_shutdown: true,
            max_pending_batches: 16,
        }
    }
}
