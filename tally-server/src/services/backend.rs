//! Delivery of flushed batches to backends.

use std::error::Error;
use std::io;
use std::sync::Arc;

use tally_metrics::MetricBatch;
use tally_statsd::metric;
use tally_system::{FromMessage, Interface, NoResponse, Receiver, Service};
use tokio::io::AsyncWriteExt;

use crate::statsd::{ServerCounters, ServerTimers};

/// An error returned by a [`Backend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Writing the batch failed.
    #[error("failed to write batch")]
    Io(#[from] io::Error),
    /// Encoding the batch failed.
    #[error("failed to serialize batch")]
    Serialize(#[from] serde_json::Error),
    /// Any other backend specific error.
    #[error("backend error")]
    Other(#[source] Box<dyn Error + Send + Sync>),
}

/// A consumer of flushed metric batches.
///
/// Every backend receives every batch. Batches are delivered to a backend one at a time and in
/// flush order, but independently of all other backends.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Returns the name of the backend, used in configuration and diagnostics.
    fn name(&self) -> &str;

    /// Processes a single batch.
    async fn flush(&self, batch: Arc<MetricBatch>) -> Result<(), BackendError>;
}

/// A backend that discards all batches.
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    /// The name of this backend in configuration.
    pub const NAME: &'static str = "null";
}

#[async_trait::async_trait]
impl Backend for NullBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn flush(&self, _batch: Arc<MetricBatch>) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A backend writing every batch as a line of JSON to stdout.
#[derive(Debug, Default)]
pub struct StdoutBackend;

impl StdoutBackend {
    /// The name of this backend in configuration.
    pub const NAME: &'static str = "stdout";
}

#[async_trait::async_trait]
impl Backend for StdoutBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn flush(&self, batch: Arc<MetricBatch>) -> Result<(), BackendError> {
        let mut line = serde_json::to_vec(&*batch)?;
        line.push(b'\n');

        let mut stdout = tokio::io::stdout();
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Creates one of the built-in backends by its configured name.
pub fn backend_by_name(name: &str) -> Option<Arc<dyn Backend>> {
    match name {
        NullBackend::NAME => Some(Arc::new(NullBackend)),
        StdoutBackend::NAME => Some(Arc::new(StdoutBackend)),
        _ => None,
    }
}

/// Queues a batch for delivery to a backend.
#[derive(Debug)]
pub struct SubmitBatch(pub Arc<MetricBatch>);

/// The interface of the [`BackendService`].
#[derive(Debug)]
pub enum BackendQueue {
    /// See [`SubmitBatch`].
    Submit(Arc<MetricBatch>),
}

impl Interface for BackendQueue {}

impl FromMessage<SubmitBatch> for BackendQueue {
    type Response = NoResponse;

    fn from_message(message: SubmitBatch, _: ()) -> Self {
        Self::Submit(message.0)
    }
}

/// Delivers batches to a single [`Backend`].
///
/// Failures are logged and do not affect later batches.
pub struct BackendService {
    backend: Arc<dyn Backend>,
}

impl BackendService {
    /// Creates a service for the given backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    async fn handle_submit(&self, batch: Arc<MetricBatch>) {
        let name = self.backend.name();
        let start = tokio::time::Instant::now();
        let result = self.backend.flush(batch).await;
        metric!(
            timer(ServerTimers::BackendFlush) = start.elapsed(),
            backend = name,
        );

        if let Err(error) = result {
            metric!(counter(ServerCounters::BackendFailed) += 1, backend = name);
            tally_log::error!(
                error = &error as &dyn Error,
                backend = name,
                "failed to flush batch to backend"
            );
        }
    }
}

impl Service for BackendService {
    type Interface = BackendQueue;

    async fn run(self, mut rx: Receiver<Self::Interface>) {
        tally_log::info!(backend = self.backend.name(), "backend started");

        while let Some(BackendQueue::Submit(batch)) = rx.recv().await {
            self.handle_submit(batch).await;
        }

        tally_log::info!(backend = self.backend.name(), "backend stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tally_metrics::UnixTimestamp;
    use tally_system::ServiceRunner;

    use super::*;

    #[test]
    fn test_builtin_backends() {
        assert_eq!(backend_by_name("null").unwrap().name(), "null");
        assert_eq!(backend_by_name("stdout").unwrap().name(), "stdout");
        assert!(backend_by_name("influxdb").is_none());
    }

    #[tokio::test]
    async fn test_null_backend() {
        let batch = MetricBatch::new(UnixTimestamp::from_secs(1), Duration::from_secs(1));
        NullBackend.flush(Arc::new(batch)).await.unwrap();
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl Backend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn flush(&self, _batch: Arc<MetricBatch>) -> Result<(), BackendError> {
            Err(BackendError::Other("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_service_survives_errors() {
        tally_test::setup();

        let mut runner = ServiceRunner::new();
        let addr = runner.start(BackendService::new(Arc::new(FailingBackend)));

        let batch = Arc::new(MetricBatch::default());
        addr.send(SubmitBatch(Arc::clone(&batch)));
        addr.send(SubmitBatch(batch));
        drop(addr);

        // The service drains both batches and stops once the address is dropped.
        runner.join().await;
    }
}
