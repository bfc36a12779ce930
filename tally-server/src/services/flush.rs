//! Periodic flushing of all aggregators.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tally_metrics::{AggregatorConfig, MetricBatch, UnixTimestamp};
use tally_statsd::metric;
use tally_system::{
    Addr, AsyncResponse, FromMessage, Interface, Receiver, Sender, Service, TrySendError,
};
use tokio::time::{Instant, MissedTickBehavior};

use crate::services::aggregator::{Aggregator, FlushWindow};
use crate::services::backend::{BackendQueue, SubmitBatch};
use crate::statsd::{ServerCounters, ServerHistograms, ServerTimers};

/// Flushes all aggregators one last time and stops the coordinator.
///
/// Resolves once the final batch has been queued at all backends.
#[derive(Debug)]
pub struct FinalFlush;

/// The interface of the [`FlushService`].
#[derive(Debug)]
pub enum FlushControl {
    /// See [`FinalFlush`].
    FinalFlush(Sender<()>),
}

impl Interface for FlushControl {}

impl FromMessage<FinalFlush> for FlushControl {
    type Response = AsyncResponse<()>;

    fn from_message(_: FinalFlush, sender: Sender<()>) -> Self {
        Self::FinalFlush(sender)
    }
}

/// A backend address along with its name.
pub type BackendAddr = (String, Addr<BackendQueue>);

/// Collects snapshots from all aggregators on every flush interval and hands the combined batch
/// to all backends.
///
/// The coordinator never waits for backends. A backend that falls behind loses batches once its
/// queue is full, without affecting other backends or the next flush.
pub struct FlushService {
    workers: Vec<Addr<Aggregator>>,
    backends: Vec<BackendAddr>,
    interval: Duration,
    flush_timeout: Duration,
    flush_on_shutdown: bool,
}

impl FlushService {
    /// Creates a new coordinator.
    pub fn new(
        workers: Vec<Addr<Aggregator>>,
        backends: Vec<BackendAddr>,
        config: &AggregatorConfig,
    ) -> Self {
        Self {
            workers,
            backends,
            interval: config.flush_interval(),
            flush_timeout: config.flush_timeout(),
            flush_on_shutdown: config.flush_on_shutdown,
        }
    }

    async fn collect(&self, timestamp: UnixTimestamp) -> MetricBatch {
        let deadline = Instant::now() + self.flush_timeout;
        let requests = self.workers.iter().map(|worker| {
            let request = worker.send(FlushWindow { timestamp });
            tokio::time::timeout_at(deadline, request)
        });

        let mut batch = MetricBatch::new(timestamp, self.interval);
        let mut missed = 0;

        for result in join_all(requests).await {
            match result {
                Ok(Ok(snapshot)) => batch.merge(snapshot),
                Ok(Err(_)) | Err(_) => missed += 1,
            }
        }

        if missed > 0 {
            metric!(counter(ServerCounters::FlushTimeout) += missed);
            tally_log::warn!(
                "{missed} of {} aggregators missed the flush deadline",
                self.workers.len()
            );
        }

        batch
    }

    fn submit(&self, batch: MetricBatch) {
        metric!(histogram(ServerHistograms::BatchSize) = batch.len() as u64);
        tally_log::trace!(entries = batch.len(), "submitting batch to backends");

        let batch = Arc::new(batch);
        for (name, backend) in &self.backends {
            match backend.try_send(SubmitBatch(Arc::clone(&batch))) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    metric!(counter(ServerCounters::BatchDropped) += 1, backend = name);
                    tally_log::warn!(backend = name, "backend is falling behind, dropping batch");
                }
                Err(TrySendError::Closed(_)) => {
                    tally_log::error!(backend = name, "backend is not running");
                }
            }
        }
    }

    async fn flush(&self) {
        let timestamp = UnixTimestamp::now();
        let batch = metric!(timer(ServerTimers::FlushDuration), {
            self.collect(timestamp).await
        });
        self.submit(batch);
    }
}

impl Service for FlushService {
    type Interface = FlushControl;

    async fn run(self, mut rx: Receiver<Self::Interface>) {
        tally_log::info!(
            "flushing {} aggregators every {:?}",
            self.workers.len(),
            self.interval
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                message = rx.recv() => {
                    if let Some(FlushControl::FinalFlush(sender)) = message {
                        if self.flush_on_shutdown {
                            tally_log::info!("flushing aggregators before shutdown");
                            self.flush().await;
                        }
                        sender.send(());
                    }
                    break;
                }
                _ = ticker.tick() => self.flush().await,
            }
        }

        tally_log::info!("flush coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tally_metrics::{Metric, MetricEvent};
    use tally_system::ServiceRunner;

    use super::*;
    use crate::services::aggregator::{AggregatorService, InsertMetric};

    fn event(line: &str) -> MetricEvent {
        Metric::parse(line.as_bytes(), UnixTimestamp::from_secs(0))
            .unwrap()
            .into()
    }

    type Recorded = Arc<Mutex<Vec<Arc<MetricBatch>>>>;

    fn recorder() -> (BackendAddr, Recorded) {
        let batches = Recorded::default();
        let (addr, _) = tally_test::mock_service(
            "recorder",
            Arc::clone(&batches),
            |batches: &mut Recorded, message: BackendQueue| {
                let BackendQueue::Submit(batch) = message;
                batches.lock().push(batch);
            },
        );
        (("recorder".to_owned(), addr), batches)
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_merges_workers() {
        tally_test::setup();

        let config = AggregatorConfig {
            flush_interval_ms: 1000,
            ..Default::default()
        };

        let mut runner = ServiceRunner::new();
        let workers: Vec<_> = (0..3)
            .map(|i| runner.start(AggregatorService::new(i, &config)))
            .collect();
        let (backend, batches) = recorder();
        let flush = runner.start(FlushService::new(workers.clone(), vec![backend], &config));

        workers[0].send(InsertMetric(event("a:1|c")));
        workers[1].send(InsertMetric(event("b:2|g")));
        workers[2].send(InsertMetric(event("c:3|ms")));

        tokio::time::sleep(Duration::from_millis(1500)).await;

        {
            let batches = batches.lock();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].counters.len(), 1);
            assert_eq!(batches[0].gauges.len(), 1);
            assert_eq!(batches[0].timers.len(), 1);
        }

        tokio::time::sleep(Duration::from_millis(1000)).await;
        {
            let batches = batches.lock();
            assert_eq!(batches.len(), 2);
            // Counters and gauges are retained, timers without samples are not.
            assert_eq!(batches[1].len(), 2);
        }

        drop(flush);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush() {
        let config = AggregatorConfig {
            flush_interval_ms: 3_600_000,
            ..Default::default()
        };

        let mut runner = ServiceRunner::new();
        let worker = runner.start(AggregatorService::new(0, &config));
        let (backend, batches) = recorder();
        let flush = runner.start(FlushService::new(vec![worker.clone()], vec![backend], &config));

        worker.send(InsertMetric(event("users:a|s")));
        flush.send(FinalFlush).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sets[0].cardinality, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_disabled() {
        let config = AggregatorConfig {
            flush_interval_ms: 3_600_000,
            flush_on_shutdown: false,
            ..Default::default()
        };

        let mut runner = ServiceRunner::new();
        let worker = runner.start(AggregatorService::new(0, &config));
        let (backend, batches) = recorder();
        let flush = runner.start(FlushService::new(vec![worker.clone()], vec![backend], &config));

        worker.send(InsertMetric(event("users:a|s")));
        flush.send(FinalFlush).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(batches.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_drops_batches() {
        let config = AggregatorConfig {
            flush_interval_ms: 100,
            max_pending_batches: 2,
            ..Default::default()
        };

        let mut runner = ServiceRunner::new();
        let worker = runner.start(AggregatorService::new(0, &config));

        // A backend queue that is never drained.
        let (stalled, _stalled_rx) =
            tally_system::bounded_channel::<BackendQueue>("stalled", config.max_pending_batches);
        let (recorder, batches) = recorder();

        let backends = vec![("stalled".to_owned(), stalled.clone()), recorder];
        let _flush = runner.start(FlushService::new(vec![worker], backends, &config));

        tokio::time::sleep(Duration::from_millis(550)).await;

        // The healthy backend receives every batch.
        assert_eq!(batches.lock().len(), 5);
        assert_eq!(stalled.len(), 2);
    }
}
