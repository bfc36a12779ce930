use tally_statsd::{CounterMetric, HistogramMetric, TimerMetric};

/// Counter metrics used by the server.
pub enum ServerCounters {
    /// Number of datagrams received by all readers.
    PacketsReceived,

    /// Number of failed reads from the packet source.
    PacketReadFailed,

    /// Number of metric lines that could not be parsed.
    ///
    /// This metric is tagged with:
    ///  - `reason`: The kind of parse error.
    MetricParseFailed,

    /// Number of metrics accepted into the queue of an aggregator.
    MetricsAccepted,

    /// Number of metrics that were not accepted by an aggregator.
    ///
    /// This metric is tagged with:
    ///  - `reason`: `"queue_full"` or `"closed"`.
    MetricsDropped,

    /// Number of packets forwarded without instance tags because enrichment failed.
    ///
    /// This metric is tagged with:
    ///  - `reason`: The kind of enrichment error.
    EnrichmentFailed,

    /// Number of flush requests an aggregator did not answer within the flush timeout.
    FlushTimeout,

    /// Number of batches not delivered to a backend because its queue was full.
    ///
    /// This metric is tagged with:
    ///  - `backend`: The name of the backend.
    BatchDropped,

    /// Number of batches a backend failed to process.
    ///
    /// This metric is tagged with:
    ///  - `backend`: The name of the backend.
    BackendFailed,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::PacketsReceived => "server.packets.received",
            Self::PacketReadFailed => "server.packets.read_failed",
            Self::MetricParseFailed => "server.metrics.parse_failed",
            Self::MetricsAccepted => "server.metrics.accepted",
            Self::MetricsDropped => "server.metrics.dropped",
            Self::EnrichmentFailed => "server.enrichment.failed",
            Self::FlushTimeout => "server.flush.timeout",
            Self::BatchDropped => "server.batch.dropped",
            Self::BackendFailed => "server.backend.failed",
        }
    }
}

/// Histogram metrics used by the server.
pub enum ServerHistograms {
    /// The size of received datagrams in bytes.
    PacketSize,

    /// The number of entries in a flushed batch.
    BatchSize,
}

impl HistogramMetric for ServerHistograms {
    fn name(&self) -> &'static str {
        match *self {
            Self::PacketSize => "server.packets.size",
            Self::BatchSize => "server.batch.size",
        }
    }
}

/// Timer metrics used by the server.
pub enum ServerTimers {
    /// Time to collect the snapshots of all aggregators during a flush.
    FlushDuration,

    /// Time a backend takes to process a single batch.
    ///
    /// This metric is tagged with:
    ///  - `backend`: The name of the backend.
    BackendFlush,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushDuration => "server.flush.duration",
            Self::BackendFlush => "server.backend.flush",
        }
    }
}
