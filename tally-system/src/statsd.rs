use tally_statsd::GaugeMetric;

/// Gauge metrics for tally-system.
pub enum SystemGauges {
    /// The number of messages waiting in a service's inbox.
    ///
    /// This metric is tagged with:
    ///  - `service`: The fully qualified type name of the service implementation.
    ServiceBackPressure,
}

impl GaugeMetric for SystemGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::ServiceBackPressure => "service.back_pressure",
        }
    }
}
