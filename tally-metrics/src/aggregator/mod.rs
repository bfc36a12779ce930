//! Core functionality of metrics aggregation.

use std::time::Duration;

use hashbrown::HashMap;
use tally_statsd::metric;
use tokio::time::Instant;

use crate::batch::per_second;
use crate::statsd::{MetricCounters, MetricGauges, MetricHistograms, MetricTimers};
use crate::{
    BucketKey, BucketValue, CounterBucket, GaugeBucket, MetricBatch, MetricEvent, SetBucket,
    TimerBucket, TimerStats, UnixTimestamp,
};

mod config;

pub use self::config::*;

/// Any error that may occur during aggregation.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AggregateMetricsError {
    /// The value of a metric does not match the type of its key.
    #[error("found incompatible metric types")]
    InvalidTypes,
}

#[derive(Debug)]
struct Entry {
    value: BucketValue,
    last_seen: Instant,
}

/// An aggregator for [`MetricEvent`]s.
///
/// The aggregator holds the state of all keys routed to it. It is not synchronized and must be
/// owned by a single task.
#[derive(Debug)]
pub struct Aggregator {
    name: String,
    buckets: HashMap<BucketKey, Entry>,
    interval: Duration,
    last_flush: Instant,
    expiry: Option<Duration>,
    thresholds: Vec<f64>,
}

impl Aggregator {
    /// Creates a new named [`Self`].
    pub fn named(name: String, config: &AggregatorConfig) -> Self {
        Self {
            name,
            buckets: HashMap::new(),
            interval: config.flush_interval(),
            last_flush: Instant::now(),
            expiry: config.expiry_interval(),
            thresholds: config.percent_thresholds.clone(),
        }
    }

    /// Returns the name of the aggregator.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of keys currently held by the aggregator.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns `true` if the aggregator holds no keys.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Merges a single event into the aggregator.
    ///
    /// `now` is recorded as the last update of the event's key and is used for expiry.
    pub fn merge(&mut self, event: MetricEvent, now: Instant) -> Result<(), AggregateMetricsError> {
        let MetricEvent {
            key,
            value,
            sample_rate,
        } = event;

        let ty = key.ty;
        let entry = self.buckets.entry(key).or_insert_with(|| Entry {
            value: BucketValue::empty(ty),
            last_seen: now,
        });

        if !entry.value.merge(value, sample_rate) {
            metric!(
                counter(MetricCounters::MergeInvalid) += 1,
                aggregator = &self.name,
            );
            return Err(AggregateMetricsError::InvalidTypes);
        }

        entry.last_seen = now;
        metric!(
            counter(MetricCounters::MergeHit) += 1,
            aggregator = &self.name,
            ty = ty.as_str(),
        );

        Ok(())
    }

    /// Flushes the current window.
    ///
    /// Returns a batch with the state of the window that just ended, then resets the window
    /// state of all keys and removes keys that have not been updated within the expiry interval.
    ///
    /// The batch contains:
    ///  - every counter, with a zero value if it was not updated in this window,
    ///  - every gauge with its last value,
    ///  - timers and sets that were updated in this window.
    ///
    /// If earlier windows were skipped without a flush, their state is part of this batch and
    /// rates are computed over all of them.
    pub fn flush(&mut self, now: Instant, timestamp: UnixTimestamp) -> MetricBatch {
        let window = self.window_since_flush(now);
        self.last_flush = now;

        let batch = metric!(
            timer(MetricTimers::AggregatorFlush),
            aggregator = &self.name,
            { self.snapshot(timestamp, window) }
        );

        let before = self.buckets.len();
        let expiry = self.expiry;
        self.buckets.retain(|_, entry| match expiry {
            Some(expiry) => now.saturating_duration_since(entry.last_seen) <= expiry,
            None => true,
        });
        let expired = before - self.buckets.len();

        if expired > 0 {
            tally_log::trace!(
                aggregator = %self.name,
                "expired {expired} buckets after {:?}",
                expiry
            );
        }

        metric!(
            counter(MetricCounters::BucketsExpired) += expired as i64,
            aggregator = &self.name,
        );
        metric!(
            histogram(MetricHistograms::BucketsFlushed) = batch.len() as u64,
            aggregator = &self.name,
        );
        metric!(
            gauge(MetricGauges::Buckets) = self.buckets.len() as u64,
            aggregator = &self.name,
        );

        batch
    }

    /// Returns the length of all flush windows since the last flush.
    fn window_since_flush(&self, now: Instant) -> Duration {
        let interval = self.interval.as_secs_f64();
        if interval <= 0.0 {
            return self.interval;
        }

        let elapsed = now.saturating_duration_since(self.last_flush).as_secs_f64();
        let windows = (elapsed / interval).round().max(1.0);
        self.interval.mul_f64(windows)
    }

    fn snapshot(&mut self, timestamp: UnixTimestamp, window: Duration) -> MetricBatch {
        let mut batch = MetricBatch::new(timestamp, window);

        for (key, entry) in self.buckets.iter_mut() {
            match &mut entry.value {
                BucketValue::Counter(counter) => batch.counters.push(CounterBucket {
                    key: key.clone(),
                    value: counter.value,
                    count: counter.count,
                    per_second: per_second(counter.value, window),
                }),
                BucketValue::Gauge(value) => batch.gauges.push(GaugeBucket {
                    key: key.clone(),
                    value: *value,
                }),
                BucketValue::Timer(timer) => {
                    let stats = TimerStats::compute(
                        &mut timer.values,
                        timer.sampled_count,
                        &self.thresholds,
                        window,
                    );

                    if let Some(stats) = stats {
                        metric!(histogram(MetricHistograms::TimerSamples) = stats.count as u64);
                        batch.timers.push(TimerBucket {
                            key: key.clone(),
                            stats,
                        });
                    }
                }
                BucketValue::Set(set) if !set.is_empty() => batch.sets.push(SetBucket {
                    key: key.clone(),
                    cardinality: set.len(),
                }),
                BucketValue::Set(_) => {}
            }

            entry.value.reset();
        }

        batch
    }
}
