use tally_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Counter metrics for cloud enrichment.
pub enum CloudCounters {
    /// Incremented for every cache lookup of a [`CloudHandle`](crate::CloudHandle).
    ///
    /// This metric is tagged with:
    ///  - `hit`: `"true"` if an unexpired entry was found.
    CacheLookup,

    /// Incremented for every lookup rejected by the rate limiter.
    RateLimited,
}

impl CounterMetric for CloudCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::CacheLookup => "cloud.cache.lookup",
            Self::RateLimited => "cloud.rate_limited",
        }
    }
}

/// Gauge metrics for cloud enrichment.
pub enum CloudGauges {
    /// The number of cached lookup results after eviction.
    CacheSize,
}

impl GaugeMetric for CloudGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::CacheSize => "cloud.cache.size",
        }
    }
}

/// Timer metrics for cloud enrichment.
pub enum CloudTimers {
    /// The duration of a single provider lookup, including timeouts.
    ///
    /// This metric is tagged with:
    ///  - `provider`: The name of the cloud provider.
    ///  - `success`: `"true"` if the lookup returned instance metadata.
    LookupDuration,
}

impl TimerMetric for CloudTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::LookupDuration => "cloud.lookup.duration",
        }
    }
}
