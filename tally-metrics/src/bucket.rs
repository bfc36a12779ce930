use std::hash::Hash;

use hash32::{FnvHasher, Hasher as _};
use serde::Serialize;
use smallvec::SmallVec;

use crate::{CounterType, GaugeType, Metric, MetricType, MetricValue, Tags, TimerType};

/// The identity of an aggregated series.
///
/// Two metrics are aggregated together if, and only if, their name, type and tags are equal.
/// Keys are also the unit of sharding, see [`route`](crate::route).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BucketKey {
    /// The metric name.
    pub name: String,
    /// The metric type.
    #[serde(skip)]
    pub ty: MetricType,
    /// The normalized tags of the metric.
    #[serde(skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
}

impl BucketKey {
    /// Returns a 32 bit FNV hash of the key.
    ///
    /// The hash only depends on the contents of the key, so it is stable across calls and
    /// instances.
    pub fn hash32(&self) -> u32 {
        let mut hasher = FnvHasher::default();
        self.hash(&mut hasher);
        hasher.finish32()
    }
}

/// A single observation ready to be merged into an aggregator.
///
/// Created from a parsed [`Metric`] after all tags have been applied.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricEvent {
    /// The series this event belongs to.
    pub key: BucketKey,
    /// The observed value.
    pub value: MetricValue,
    /// The sample rate in `(0, 1]`. `1.0` for unsampled submissions.
    pub sample_rate: f64,
}

impl From<Metric> for MetricEvent {
    fn from(metric: Metric) -> Self {
        let Metric {
            name,
            value,
            sample_rate,
            tags,
            ..
        } = metric;

        Self {
            key: BucketKey {
                name,
                ty: value.ty(),
                tags,
            },
            value,
            sample_rate: sample_rate.unwrap_or(1.0),
        }
    }
}

/// Aggregated state of a counter within one flush window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CounterValue {
    /// Sum of all submitted values, each scaled by the inverse of its sample rate.
    pub value: CounterType,
    /// The number of raw submissions.
    pub count: u64,
}

/// Aggregated samples of a timer within one flush window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimerValue {
    /// The raw samples in submission order.
    pub values: SmallVec<[TimerType; 4]>,
    /// The number of samples scaled by the inverse of their sample rate.
    pub sampled_count: f64,
}

/// The aggregated value stored for a [`BucketKey`].
#[derive(Clone, Debug, PartialEq)]
pub enum BucketValue {
    /// See [`MetricType::Counter`].
    Counter(CounterValue),
    /// See [`MetricType::Gauge`].
    Gauge(GaugeType),
    /// See [`MetricType::Timer`].
    Timer(TimerValue),
    /// See [`MetricType::Set`]. Members are stored verbatim.
    Set(Tags),
}

impl BucketValue {
    /// Creates an empty value of the given type.
    pub fn empty(ty: MetricType) -> Self {
        match ty {
            MetricType::Counter => Self::Counter(CounterValue::default()),
            MetricType::Gauge => Self::Gauge(0.0),
            MetricType::Timer => Self::Timer(TimerValue::default()),
            MetricType::Set => Self::Set(Tags::new()),
        }
    }

    /// Returns the type of this value.
    pub fn ty(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Timer(_) => MetricType::Timer,
            Self::Set(_) => MetricType::Set,
        }
    }

    /// Applies a single observation to this value.
    ///
    /// Returns `false` and leaves the value untouched if the observation is of a different type.
    pub fn merge(&mut self, value: MetricValue, sample_rate: f64) -> bool {
        match (self, value) {
            (Self::Counter(counter), MetricValue::Counter(value)) => {
                counter.value += value / sample_rate;
                counter.count += 1;
            }
            (Self::Gauge(gauge), MetricValue::Gauge(value)) => *gauge = value,
            (Self::Gauge(gauge), MetricValue::GaugeDelta(delta)) => *gauge += delta,
            (Self::Timer(timer), MetricValue::Timer(value)) => {
                timer.values.push(value);
                timer.sampled_count += 1.0 / sample_rate;
            }
            (Self::Set(set), MetricValue::Set(member)) => {
                set.insert(member);
            }
            _ => return false,
        }

        true
    }

    /// Clears the window state of this value.
    ///
    /// Counters, timers and sets start over. Gauges keep their value.
    pub fn reset(&mut self) {
        match self {
            Self::Counter(counter) => *counter = CounterValue::default(),
            Self::Gauge(_) => {}
            Self::Timer(timer) => *timer = TimerValue::default(),
            Self::Set(set) => set.clear(),
        }
    }
}
