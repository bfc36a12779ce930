use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tally_cloud::{CloudProvider, EnrichmentService, StaticProvider};
use tally_config::Config;
use tally_system::{ServiceRunner, ShutdownHandle};
use tokio::time::Instant;

use crate::services::aggregator::AggregatorService;
use crate::services::backend::{Backend, BackendService, backend_by_name};
use crate::services::dispatcher::MetricDispatcher;
use crate::services::flush::{BackendAddr, FinalFlush, FlushService};
use crate::services::reader::{PacketHandler, read_packets};
use crate::source::{PacketSource, UdpPacketSource};

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding the listening socket failed.
    #[error("could not bind to {addr}")]
    Bind {
        /// The configured bind address.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A configured backend does not exist.
    #[error("unknown backend `{0}`")]
    Backend(String),

    /// The configured cloud provider does not exist.
    #[error("unknown cloud provider `{0}`")]
    Provider(String),

    /// The configuration cannot be used to run a server.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The metrics server.
///
/// Owns the configuration along with the resolved backends and cloud provider. Call
/// [`run`](Self::run) to bind the configured address and process metrics until shutdown.
pub struct Server {
    config: Arc<Config>,
    backends: Vec<Arc<dyn Backend>>,
    provider: Option<Arc<dyn CloudProvider>>,
}

impl Server {
    /// Creates a server with the backends and cloud provider named in the config.
    pub fn new(config: Arc<Config>) -> Result<Self, ServerError> {
        let backends = config
            .backends()
            .iter()
            .map(|name| backend_by_name(name).ok_or_else(|| ServerError::Backend(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let cloud_config = config.cloud_config();
        let provider: Option<Arc<dyn CloudProvider>> = match cloud_config.provider.as_deref() {
            None => None,
            Some(StaticProvider::NAME) => Some(Arc::new(StaticProvider::new(
                cloud_config.instances.clone(),
            ))),
            Some(other) => return Err(ServerError::Provider(other.to_owned())),
        };

        Ok(Self {
            config,
            backends,
            provider,
        })
    }

    /// Replaces the configured backends.
    pub fn with_backends(mut self, backends: Vec<Arc<dyn Backend>>) -> Self {
        self.backends = backends;
        self
    }

    /// Enables cloud enrichment with the given provider.
    pub fn with_cloud_provider(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Binds the configured UDP address.
    pub fn bind(&self) -> Result<UdpPacketSource, ServerError> {
        let addr = self.config.bind_addr();
        UdpPacketSource::bind(addr, self.config.receive_buffer_size())
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Binds the configured address and runs until `shutdown` is signaled.
    pub async fn run(self, shutdown: ShutdownHandle) -> Result<(), ServerError> {
        let source = self.bind()?;
        if let Ok(addr) = source.local_addr() {
            tally_log::info!("listening for metrics on udp://{addr}/");
        }

        self.run_with_source(source, shutdown).await
    }

    /// Processes metrics from `source` until `shutdown` is signaled.
    ///
    /// On a graceful shutdown, readers stop first. Then all aggregators are flushed one last time
    /// and the backends drain their queues, all within the shutdown timeout. A forced shutdown
    /// skips the final flush.
    pub async fn run_with_source<S: PacketSource>(
        self,
        source: S,
        mut shutdown: ShutdownHandle,
    ) -> Result<(), ServerError> {
        let Self {
            config,
            backends,
            provider,
        } = self;

        if backends.is_empty() {
            return Err(ServerError::Config("at least one backend is required".to_owned()));
        }

        let aggregator_config = config.aggregator_config();
        let mut services = ServiceRunner::new();

        let backends: Vec<BackendAddr> = backends
            .into_iter()
            .map(|backend| {
                let name = backend.name().to_owned();
                let service = BackendService::new(backend);
                let addr = services.start_bounded(service, aggregator_config.max_pending_batches);
                (name, addr)
            })
            .collect();

        let workers: Vec<_> = (0..aggregator_config.max_workers)
            .map(|index| {
                let service = AggregatorService::new(index, aggregator_config);
                services.start_bounded(service, aggregator_config.max_queue_size)
            })
            .collect();

        let cloud = provider.map(|provider| {
            EnrichmentService::new(provider, config.cloud_config().clone(), shutdown.clone())
                .start_in(&mut services)
        });

        let flush = services.start(FlushService::new(
            workers.clone(),
            backends,
            aggregator_config,
        ));

        let dispatcher = MetricDispatcher::new(workers, aggregator_config);
        let handler = PacketHandler::new(
            dispatcher.clone(),
            cloud,
            config.cloud_config().max_pending_packets,
            config.logging().log_failed_payloads,
        );

        let source = Arc::new(source);
        let mut readers = ServiceRunner::new();
        for id in 0..config.max_readers() {
            readers.spawn(read_packets(
                id,
                Arc::clone(&source),
                handler.clone(),
                config.max_packet_size(),
                shutdown.clone(),
            ));
        }
        drop(handler);

        tally_log::info!(
            readers = config.max_readers(),
            workers = aggregator_config.max_workers,
            "tally server started"
        );

        let signal = shutdown.notified().await;
        readers.join().await;
        tally_log::debug!("readers stopped, dropped {} metrics", dispatcher.dropped());
        drop(dispatcher);

        let Some(timeout) = signal.timeout else {
            tally_log::info!("forced shutdown, skipping final flush");
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, flush.send(FinalFlush)).await {
            Ok(Ok(())) => tally_log::debug!("final flush completed"),
            Ok(Err(_)) => tally_log::error!("flush coordinator stopped before the final flush"),
            Err(_) => tally_log::warn!("final flush did not complete within the shutdown timeout"),
        }
        drop(flush);

        if tokio::time::timeout_at(deadline, services.join()).await.is_err() {
            tally_log::warn!("services did not stop within the shutdown timeout");
        }

        tally_log::info!("tally server stopped");
        Ok(())
    }
}
