use tally_statsd::{CounterMetric, GaugeMetric, HistogramMetric, TimerMetric};

/// Counter metrics for metric aggregation.
pub enum MetricCounters {
    /// Incremented for every metric merged into an aggregator.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    ///  - `ty`: The metric type.
    MergeHit,

    /// Incremented for every metric that is rejected because its value does not match the type
    /// of its key.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    MergeInvalid,

    /// Incremented for every key removed after exceeding the expiry interval.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    BucketsExpired,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::MergeHit => "metrics.merge.hit",
            Self::MergeInvalid => "metrics.merge.invalid",
            Self::BucketsExpired => "metrics.buckets.expired",
        }
    }
}

/// Gauge metrics for metric aggregation.
pub enum MetricGauges {
    /// The number of keys retained by an aggregator after a flush.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    Buckets,
}

impl GaugeMetric for MetricGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::Buckets => "metrics.buckets",
        }
    }
}

/// Histogram metrics for metric aggregation.
pub enum MetricHistograms {
    /// The number of entries emitted by a single aggregator flush.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    BucketsFlushed,

    /// The number of samples of a flushed timer.
    TimerSamples,
}

impl HistogramMetric for MetricHistograms {
    fn name(&self) -> &'static str {
        match *self {
            Self::BucketsFlushed => "metrics.buckets.flushed",
            Self::TimerSamples => "metrics.timer.samples",
        }
    }
}

/// Timer metrics for metric aggregation.
pub enum MetricTimers {
    /// Time spent computing the batch of a single aggregator flush.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    AggregatorFlush,
}

impl TimerMetric for MetricTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::AggregatorFlush => "metrics.aggregator.flush",
        }
    }
}
