//! Reading, parsing and enrichment of incoming packets.

use std::net::SocketAddr;
use std::sync::Arc;

use tally_cloud::{CloudHandle, EnrichmentError, InstanceTags};
use tally_log::LogError;
use tally_metrics::{Metric, UnixTimestamp};
use tally_statsd::metric;
use tally_system::ShutdownHandle;
use tokio::sync::Semaphore;

use crate::services::dispatcher::MetricDispatcher;
use crate::source::PacketSource;
use crate::statsd::{ServerCounters, ServerHistograms};

fn enrichment_reason(error: &EnrichmentError) -> &'static str {
    match error {
        EnrichmentError::RateLimited => "rate_limited",
        EnrichmentError::Provider(_) => "provider",
        EnrichmentError::Timeout => "timeout",
        EnrichmentError::Unavailable => "unavailable",
    }
}

/// Bounds the number of packets waiting for an instance lookup.
#[derive(Debug)]
struct PendingLimit {
    permits: Arc<Semaphore>,
    max: usize,
}

/// State shared by all readers.
#[derive(Clone, Debug)]
pub struct PacketHandler {
    dispatcher: MetricDispatcher,
    cloud: Option<CloudHandle>,
    pending: Arc<PendingLimit>,
    log_failed_payloads: bool,
}

impl PacketHandler {
    /// Creates a new packet handler.
    ///
    /// If `cloud` is `None`, metrics are not enriched with instance tags. At most
    /// `max_pending_packets` packets wait for an instance lookup at any time.
    pub fn new(
        dispatcher: MetricDispatcher,
        cloud: Option<CloudHandle>,
        max_pending_packets: usize,
        log_failed_payloads: bool,
    ) -> Self {
        let pending = PendingLimit {
            permits: Arc::new(Semaphore::new(max_pending_packets)),
            max: max_pending_packets,
        };

        Self {
            dispatcher,
            cloud,
            pending: Arc::new(pending),
            log_failed_payloads,
        }
    }

    /// Returns the number of packets currently waiting for an instance lookup.
    pub fn pending_packets(&self) -> usize {
        self.pending.max - self.pending.permits.available_permits()
    }

    /// Parses a datagram and dispatches all valid metrics in it.
    ///
    /// Invalid lines are counted and skipped. If the instance tags of the sender are not cached,
    /// the lookup and dispatch continue in the background so the reader is not held up. Once the
    /// pending limit is reached, packets with uncached senders are dispatched without instance
    /// tags.
    pub async fn handle_packet(&self, payload: &[u8], sender: SocketAddr) {
        metric!(counter(ServerCounters::PacketsReceived) += 1);
        metric!(histogram(ServerHistograms::PacketSize) = payload.len() as u64);

        let timestamp = UnixTimestamp::now();
        let mut metrics = Vec::new();

        for result in Metric::parse_all(payload, timestamp) {
            match result {
                Ok(metric) => metrics.push(metric),
                Err(error) => {
                    metric!(
                        counter(ServerCounters::MetricParseFailed) += 1,
                        reason = error.as_str(),
                    );

                    if self.log_failed_payloads {
                        tally_log::debug!(
                            error = &error as &dyn std::error::Error,
                            payload = %String::from_utf8_lossy(payload),
                            "failed to parse metric"
                        );
                    }
                }
            }
        }

        if metrics.is_empty() {
            return;
        }

        let Some(cloud) = &self.cloud else {
            self.dispatch_all(metrics, None).await;
            return;
        };

        let ip = sender.ip();
        match cloud.cached(ip) {
            Some(result) => {
                let tags = self.instance_tags(result);
                self.dispatch_all(metrics, tags.as_ref()).await;
            }
            None => {
                let Ok(permit) = Arc::clone(&self.pending.permits).try_acquire_owned() else {
                    metric!(
                        counter(ServerCounters::EnrichmentFailed) += 1,
                        reason = "backlog",
                    );
                    self.dispatch_all(metrics, None).await;
                    return;
                };

                let handler = self.clone();
                let cloud = cloud.clone();
                tokio::spawn(async move {
                    let tags = handler.instance_tags(cloud.resolve(ip).await);
                    handler.dispatch_all(metrics, tags.as_ref()).await;
                    drop(permit);
                });
            }
        }
    }

    fn instance_tags(
        &self,
        result: Result<InstanceTags, EnrichmentError>,
    ) -> Option<InstanceTags> {
        match result {
            Ok(tags) => Some(tags),
            Err(error) => {
                metric!(
                    counter(ServerCounters::EnrichmentFailed) += 1,
                    reason = enrichment_reason(&error),
                );
                tally_log::trace!("{}", LogError(&error));
                None
            }
        }
    }

    async fn dispatch_all(&self, metrics: Vec<Metric>, tags: Option<&InstanceTags>) {
        for mut metric in metrics {
            if let Some(tags) = tags {
                metric.tags.extend(tags.iter().cloned());
            }

            // Drops are counted by the dispatcher.
            self.dispatcher.dispatch(metric).await.ok();
        }
    }
}

/// Reads packets from `source` until shutdown.
///
/// Read errors are logged and do not stop the reader.
pub async fn read_packets<S: PacketSource>(
    id: usize,
    source: Arc<S>,
    handler: PacketHandler,
    max_packet_size: usize,
    mut shutdown: ShutdownHandle,
) {
    tally_log::debug!(reader = id, "reader started");
    let mut buf = vec![0; max_packet_size];

    loop {
        let result = tokio::select! {
            biased;

            _ = shutdown.notified() => break,
            result = source.recv_from(&mut buf) => result,
        };

        match result {
            Ok((len, sender)) => handler.handle_packet(&buf[..len], sender).await,
            Err(error) => {
                metric!(counter(ServerCounters::PacketReadFailed) += 1);
                tally_log::error!(
                    error = &error as &dyn std::error::Error,
                    reader = id,
                    "failed to read packet"
                );
            }
        }
    }

    tally_log::debug!(reader = id, "reader stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::IpAddr;
    use std::time::Duration;

    use tally_cloud::{
        CloudConfig, CloudProvider, EnrichmentService, InstanceMetadata, ProviderError,
        StaticProvider,
    };
    use tally_metrics::AggregatorConfig;
    use tally_system::{Controller, ServiceRunner, bounded_channel};
    use tokio::sync::Notify;

    use super::*;
    use crate::services::aggregator::Aggregator;

    fn handler(cloud: Option<CloudHandle>) -> (PacketHandler, tally_system::Receiver<Aggregator>) {
        let (worker, rx) = bounded_channel::<Aggregator>("test", 100);
        let dispatcher = MetricDispatcher::new(vec![worker], &AggregatorConfig::default());
        (PacketHandler::new(dispatcher, cloud, 100, true), rx)
    }

    fn sender() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    async fn recv_names(rx: &mut tally_system::Receiver<Aggregator>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(Some(Aggregator::InsertMetric(event))) =
            tokio::time::timeout(Duration::from_millis(10), rx.recv()).await
        {
            names.push(event.key.name);
        }
        names
    }

    #[tokio::test]
    async fn test_skips_invalid_lines() {
        tally_test::setup();

        let (handler, mut rx) = handler(None);
        handler
            .handle_packet(b"a:1|c\nbroken\nb:1|x\nc:2|g\n", sender())
            .await;

        assert_eq!(recv_names(&mut rx).await, ["a", "c"]);
    }

    #[tokio::test]
    async fn test_enrichment() {
        let controller = Controller::new();
        let mut runner = ServiceRunner::new();

        let instance = InstanceMetadata {
            id: "i-1".to_owned(),
            region: "eu-west-1".to_owned(),
            tags: vec![],
        };
        let provider = StaticProvider::new(BTreeMap::from([(sender().ip(), instance)]));
        let cloud = EnrichmentService::new(
            Arc::new(provider),
            CloudConfig::default(),
            controller.shutdown_handle(),
        )
        .start_in(&mut runner);

        let (handler, mut rx) = handler(Some(cloud));

        // The first packet resolves the tags in the background, the second hits the cache.
        for _ in 0..2 {
            handler.handle_packet(b"hits:1|c", sender()).await;

            let Some(Aggregator::InsertMetric(event)) = rx.recv().await else {
                panic!("expected an insert");
            };
            assert!(event.key.tags.contains("region:eu-west-1"));
        }
    }

    #[tokio::test]
    async fn test_enrichment_failure_keeps_metric() {
        let controller = Controller::new();
        let mut runner = ServiceRunner::new();

        let cloud = EnrichmentService::new(
            Arc::new(StaticProvider::default()),
            CloudConfig::default(),
            controller.shutdown_handle(),
        )
        .start_in(&mut runner);

        let (handler, mut rx) = handler(Some(cloud));
        handler.handle_packet(b"hits:1|c|#a:b", sender()).await;

        let Some(Aggregator::InsertMetric(event)) = rx.recv().await else {
            panic!("expected an insert");
        };
        assert_eq!(event.key.tags.len(), 1);
    }

    /// Answers lookups only once released.
    struct StalledProvider {
        release: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl CloudProvider for StalledProvider {
        fn provider_name(&self) -> &str {
            "stalled"
        }

        fn sample_config(&self) -> &str {
            ""
        }

        async fn instance(&self, _ip: IpAddr) -> Result<InstanceMetadata, ProviderError> {
            self.release.notified().await;
            Ok(InstanceMetadata {
                id: "i-1".to_owned(),
                region: "eu-west-1".to_owned(),
                tags: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_pending_lookups_are_bounded() {
        tally_test::setup();

        let controller = Controller::new();
        let mut runner = ServiceRunner::new();

        let release = Arc::new(Notify::new());
        let provider = StalledProvider {
            release: Arc::clone(&release),
        };
        let cloud = EnrichmentService::new(
            Arc::new(provider),
            CloudConfig::default(),
            controller.shutdown_handle(),
        )
        .start_in(&mut runner);

        let (worker, mut rx) = bounded_channel::<Aggregator>("test", 1000);
        let dispatcher = MetricDispatcher::new(vec![worker], &AggregatorConfig::default());
        let handler = PacketHandler::new(dispatcher, Some(cloud), 10, true);

        for _ in 0..50 {
            handler.handle_packet(b"hits:1|c", sender()).await;
        }
        assert_eq!(handler.pending_packets(), 10);

        // Packets over the limit pass through right away without instance tags.
        assert_eq!(recv_names(&mut rx).await.len(), 40);

        release.notify_one();
        for _ in 0..10 {
            let Some(Aggregator::InsertMetric(event)) = rx.recv().await else {
                panic!("expected an insert");
            };
            assert!(event.key.tags.contains("region:eu-west-1"));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handler.pending_packets(), 0);
    }
}
