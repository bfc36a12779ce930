//! The aggregation worker service.

use tally_metrics::{AggregatorConfig, MetricBatch, MetricEvent, UnixTimestamp};
use tally_system::{
    AsyncResponse, FromMessage, Interface, NoResponse, Receiver, Sender, Service,
};
use tokio::time::Instant;

/// Merges a metric into the aggregator.
///
/// Sent by the [`MetricDispatcher`](super::dispatcher::MetricDispatcher) with a capacity check.
#[derive(Debug)]
pub struct InsertMetric(pub MetricEvent);

/// Closes the current flush window and returns its snapshot.
///
/// The snapshot contains all metrics inserted before this message. Flush requests are never
/// rejected, so they must be sent without a capacity check.
#[derive(Clone, Copy, Debug)]
pub struct FlushWindow {
    /// The timestamp of the flush, shared by the snapshots of all aggregators.
    pub timestamp: UnixTimestamp,
}

/// Returns the number of keys held by the aggregator.
#[derive(Debug)]
pub struct BucketCountInquiry;

/// The interface of the [`AggregatorService`].
#[derive(Debug)]
pub enum Aggregator {
    /// See [`InsertMetric`].
    InsertMetric(MetricEvent),
    /// See [`FlushWindow`].
    FlushWindow(FlushWindow, Sender<MetricBatch>),
    /// See [`BucketCountInquiry`].
    BucketCountInquiry(Sender<usize>),
}

impl Interface for Aggregator {}

impl FromMessage<InsertMetric> for Aggregator {
    type Response = NoResponse;

    fn from_message(message: InsertMetric, _: ()) -> Self {
        Self::InsertMetric(message.0)
    }
}

impl FromMessage<FlushWindow> for Aggregator {
    type Response = AsyncResponse<MetricBatch>;

    fn from_message(message: FlushWindow, sender: Sender<MetricBatch>) -> Self {
        Self::FlushWindow(message, sender)
    }
}

impl FromMessage<BucketCountInquiry> for Aggregator {
    type Response = AsyncResponse<usize>;

    fn from_message(_: BucketCountInquiry, sender: Sender<usize>) -> Self {
        Self::BucketCountInquiry(sender)
    }
}

/// Owns the state of all metric keys routed to one shard.
///
/// The service handles one message at a time, so inserts and flushes never overlap. It stops
/// once all addresses have been dropped.
pub struct AggregatorService {
    aggregator: tally_metrics::Aggregator,
}

impl AggregatorService {
    /// Creates the aggregator for shard `index`.
    pub fn new(index: usize, config: &AggregatorConfig) -> Self {
        Self {
            aggregator: tally_metrics::Aggregator::named(format!("shard{index}"), config),
        }
    }

    fn handle_insert(&mut self, event: MetricEvent) {
        if let Err(error) = self.aggregator.merge(event, Instant::now()) {
            tally_log::debug!(
                error = &error as &dyn std::error::Error,
                aggregator = self.aggregator.name(),
                "failed to merge metric"
            );
        }
    }

    fn handle_flush(&mut self, window: FlushWindow, sender: Sender<MetricBatch>) {
        // The coordinator gave up on this window. Keep the data for the next one.
        if sender.is_closed() {
            tally_log::debug!(
                aggregator = self.aggregator.name(),
                "skipping abandoned flush window"
            );
            return;
        }

        sender.send(self.aggregator.flush(Instant::now(), window.timestamp));
    }

    fn handle_message(&mut self, message: Aggregator) {
        match message {
            Aggregator::InsertMetric(event) => self.handle_insert(event),
            Aggregator::FlushWindow(window, sender) => self.handle_flush(window, sender),
            Aggregator::BucketCountInquiry(sender) => sender.send(self.aggregator.bucket_count()),
        }
    }
}

impl Service for AggregatorService {
    type Interface = Aggregator;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        tally_log::debug!(aggregator = self.aggregator.name(), "aggregator started");

        while let Some(message) = rx.recv().await {
            self.handle_message(message);
        }

        tally_log::debug!(aggregator = self.aggregator.name(), "aggregator stopped");
    }
}
