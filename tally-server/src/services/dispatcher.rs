//! Routing of parsed metrics to their aggregators.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tally_metrics::{AggregatorConfig, Metric, MetricEvent, QueuePolicy, route};
use tally_statsd::metric;
use tally_system::{Addr, TrySendError};

use crate::services::aggregator::{Aggregator, InsertMetric};
use crate::statsd::ServerCounters;

/// An error returned when a metric could not be handed to its aggregator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// The queue of the aggregator is full.
    #[error("aggregator queue is full")]
    QueueFull,
    /// The aggregator has shut down.
    #[error("aggregator is not running")]
    Closed,
}

impl DispatchError {
    fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Hands metrics to the aggregator that owns their key.
///
/// The dispatcher can be cloned freely. All clones share the counter of dropped metrics.
#[derive(Clone, Debug)]
pub struct MetricDispatcher {
    workers: Arc<[Addr<Aggregator>]>,
    default_tags: Arc<[String]>,
    policy: QueuePolicy,
    block_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl MetricDispatcher {
    /// Creates a dispatcher over a fixed set of aggregators.
    ///
    /// The position of an aggregator in `workers` is its shard index. `workers` must not be
    /// empty.
    pub fn new(workers: Vec<Addr<Aggregator>>, config: &AggregatorConfig) -> Self {
        Self {
            workers: workers.into(),
            default_tags: config.default_tags.clone().into(),
            policy: config.queue_policy,
            block_timeout: config.block_timeout(),
            dropped: Arc::default(),
        }
    }

    /// Returns the number of metrics that could not be queued since the dispatcher was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Applies default tags to the metric and queues it at its aggregator.
    ///
    /// With [`QueuePolicy::Drop`], this never waits. With [`QueuePolicy::Block`], this waits up
    /// to the block timeout for space in the queue. Either way, a metric that cannot be queued
    /// is counted and dropped.
    pub async fn dispatch(&self, mut metric: Metric) -> Result<(), DispatchError> {
        metric.tags.extend(self.default_tags.iter().cloned());
        let event = MetricEvent::from(metric);
        let addr = &self.workers[route(&event.key, self.workers.len())];

        let result = match self.policy {
            QueuePolicy::Drop => addr.try_send(InsertMetric(event)),
            QueuePolicy::Block => addr.send_timeout(InsertMetric(event), self.block_timeout).await,
        };

        let error = match result {
            Ok(()) => {
                metric!(counter(ServerCounters::MetricsAccepted) += 1);
                return Ok(());
            }
            Err(TrySendError::Full(_)) => DispatchError::QueueFull,
            Err(TrySendError::Closed(_)) => DispatchError::Closed,
        };

        self.dropped.fetch_add(1, Ordering::Relaxed);
        metric!(
            counter(ServerCounters::MetricsDropped) += 1,
            reason = error.as_str(),
        );

        Err(error)
    }
}
