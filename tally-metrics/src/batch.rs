use std::time::Duration;

use serde::Serialize;

use crate::{BucketKey, CounterType, GaugeType, TimerType, UnixTimestamp};

/// The flushed state of a counter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CounterBucket {
    /// The identity of the series.
    #[serde(flatten)]
    pub key: BucketKey,
    /// Sum of all values in the window, scaled by sample rates.
    pub value: CounterType,
    /// Number of raw submissions in the window.
    pub count: u64,
    /// The value divided by the length of the flushed windows in seconds.
    pub per_second: f64,
}

/// The flushed state of a gauge.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GaugeBucket {
    /// The identity of the series.
    #[serde(flatten)]
    pub key: BucketKey,
    /// The last value of the gauge.
    pub value: GaugeType,
}

/// Statistics over the samples within a percentile threshold.
///
/// For a positive threshold `p`, these describe the lowest `p` percent of the samples and
/// `bound` is the largest of them (`upper_p`). For a negative threshold, they describe the
/// highest `|p|` percent and `bound` is the smallest of them (`lower_p`).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Percentile {
    /// The configured threshold in percent.
    pub threshold: f64,
    /// The boundary sample of the threshold.
    pub bound: TimerType,
    /// Number of samples within the threshold.
    pub count: usize,
    /// Sum of the samples within the threshold.
    pub sum: TimerType,
    /// Mean of the samples within the threshold.
    pub mean: TimerType,
}

/// Statistics computed from the samples of a timer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimerStats {
    /// Number of raw samples.
    pub count: usize,
    /// Number of samples scaled by sample rates.
    pub sampled_count: f64,
    /// The number of sampled submissions per second of the flush interval.
    pub per_second: f64,
    /// The smallest sample.
    pub min: TimerType,
    /// The largest sample.
    pub max: TimerType,
    /// The arithmetic mean.
    pub mean: TimerType,
    /// The median.
    pub median: TimerType,
    /// Sum of all samples.
    pub sum: TimerType,
    /// Sum of the squares of all samples.
    pub sum_squares: TimerType,
    /// Population standard deviation.
    pub stddev: TimerType,
    /// One entry per configured threshold that covers at least one sample.
    pub percentiles: Vec<Percentile>,
}

impl TimerStats {
    /// Computes statistics from a list of samples.
    ///
    /// Returns `None` if there are no samples. The samples are sorted in place.
    pub fn compute(
        values: &mut [TimerType],
        sampled_count: f64,
        thresholds: &[f64],
        interval: Duration,
    ) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        values.sort_unstable_by(|a, b| a.total_cmp(b));

        let count = values.len();
        let sum: TimerType = values.iter().sum();
        let sum_squares: TimerType = values.iter().map(|v| v * v).sum();
        let mean = sum / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        let mid = count / 2;
        let median = if count % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };

        let percentiles = thresholds
            .iter()
            .filter_map(|&threshold| percentile(values, threshold))
            .collect();

        Some(Self {
            count,
            sampled_count,
            per_second: per_second(sampled_count, interval),
            min: values[0],
            max: values[count - 1],
            mean,
            median,
            sum,
            sum_squares,
            stddev: variance.sqrt(),
            percentiles,
        })
    }
}

/// Computes a percentile over sorted samples.
fn percentile(sorted: &[TimerType], threshold: f64) -> Option<Percentile> {
    if threshold == 0.0 || !threshold.is_finite() {
        return None;
    }

    let count = sorted.len();
    let within = ((threshold.abs() / 100.0) * count as f64).round() as usize;
    let within = within.min(count);
    if within == 0 {
        return None;
    }

    let (slice, bound) = if threshold > 0.0 {
        (&sorted[..within], sorted[within - 1])
    } else {
        (&sorted[count - within..], sorted[count - within])
    };

    let sum: TimerType = slice.iter().sum();
    Some(Percentile {
        threshold,
        bound,
        count: within,
        sum,
        mean: sum / within as f64,
    })
}

pub(crate) fn per_second(value: f64, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    if secs > 0.0 { value / secs } else { value }
}

/// The flushed state of a timer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimerBucket {
    /// The identity of the series.
    #[serde(flatten)]
    pub key: BucketKey,
    /// Statistics over all samples in the window.
    #[serde(flatten)]
    pub stats: TimerStats,
}

/// The flushed state of a set.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SetBucket {
    /// The identity of the series.
    #[serde(flatten)]
    pub key: BucketKey,
    /// Number of unique members seen in the window.
    pub cardinality: usize,
}

/// The consolidated output of one flush window.
///
/// A batch is produced by every [`Aggregator`](crate::Aggregator) on flush. Batches of all
/// aggregators are concatenated into one batch, which is then handed to backends. Since every
/// key is owned by exactly one aggregator, concatenation never produces duplicate keys.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricBatch {
    /// The time of the flush.
    pub timestamp: UnixTimestamp,
    /// The length of the flush window.
    #[serde(skip)]
    pub interval: Duration,
    /// All counters, including counters that saw no submissions in this window.
    pub counters: Vec<CounterBucket>,
    /// All gauges that have not expired.
    pub gauges: Vec<GaugeBucket>,
    /// Timers that received samples in this window.
    pub timers: Vec<TimerBucket>,
    /// Sets that received members in this window.
    pub sets: Vec<SetBucket>,
}

impl MetricBatch {
    /// Creates an empty batch.
    pub fn new(timestamp: UnixTimestamp, interval: Duration) -> Self {
        Self {
            timestamp,
            interval,
            ..Default::default()
        }
    }

    /// Appends all entries of `other` to this batch.
    pub fn merge(&mut self, other: MetricBatch) {
        self.counters.extend(other.counters);
        self.gauges.extend(other.gauges);
        self.timers.extend(other.timers);
        self.sets.extend(other.sets);
    }

    /// Returns the total number of entries.
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.timers.len() + self.sets.len()
    }

    /// Returns `true` if the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorts all entries by key.
    ///
    /// Flushed batches are not sorted, since their order has no meaning. This is useful for
    /// stable output in tests and backends that write human readable output.
    pub fn sort(&mut self) {
        self.counters.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        self.gauges.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        self.timers.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        self.sets.sort_unstable_by(|a, b| a.key.cmp(&b.key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(values: &[f64], thresholds: &[f64]) -> TimerStats {
        let mut values = values.to_vec();
        let count = values.len() as f64;
        TimerStats::compute(&mut values, count, thresholds, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_timer_stats_basic() {
        let stats = stats(&[3.0, 1.0, 5.0, 2.0, 4.0], &[90.0]);

        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.sum, 15.0);
        assert_eq!(stats.sum_squares, 55.0);
        assert!((stats.stddev - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(
            stats.percentiles,
            vec![Percentile {
                threshold: 90.0,
                bound: 5.0,
                count: 5,
                sum: 15.0,
                mean: 3.0,
            }]
        );
    }

    #[test]
    fn test_timer_percentile_is_reproducible() {
        let a = stats(&[1.0, 2.0, 3.0, 4.0, 5.0], &[90.0]);
        let b = stats(&[5.0, 4.0, 3.0, 2.0, 1.0], &[90.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_timer_percentiles() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        let stats = stats(&values, &[50.0, -20.0, 5.0]);

        insta::assert_debug_snapshot!(stats.percentiles, @r###"
        [
            Percentile {
                threshold: 50.0,
                bound: 5.0,
                count: 5,
                sum: 15.0,
                mean: 3.0,
            },
            Percentile {
                threshold: -20.0,
                bound: 9.0,
                count: 2,
                sum: 19.0,
                mean: 9.5,
            },
            Percentile {
                threshold: 5.0,
                bound: 1.0,
                count: 1,
                sum: 1.0,
                mean: 1.0,
            },
        ]
        "###);
        assert_eq!(stats.median, 5.5);
    }

    #[test]
    fn test_timer_percentile_too_small() {
        // 10% of 3 samples rounds to zero samples.
        let stats = stats(&[1.0, 2.0, 3.0], &[10.0]);
        assert!(stats.percentiles.is_empty());
    }

    #[test]
    fn test_timer_stats_empty() {
        assert!(TimerStats::compute(&mut [], 0.0, &[90.0], Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_batch_merge() {
        let mut batch = MetricBatch::new(UnixTimestamp::from_secs(10), Duration::from_secs(1));
        let mut other = batch.clone();
        other.sets.push(SetBucket {
            key: BucketKey {
                name: "users".to_owned(),
                ty: crate::MetricType::Set,
                tags: Default::default(),
            },
            cardinality: 3,
        });

        batch.merge(other);
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_new_batch_is_empty() {
        let batch = MetricBatch::new(UnixTimestamp::from_secs(10), Duration::from_secs(1));
        assert!(batch.is_empty());
        assert_eq!(batch.timestamp, UnixTimestamp::from_secs(10));
        assert_eq!(MetricBatch::default().timestamp, UnixTimestamp::from_secs(0));
    }
}
