use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tally_statsd::metric;
use tally_system::{
    Addr, AsyncResponse, FromMessage, Interface, Receiver, Sender, Service, ServiceRunner,
    ShutdownHandle,
};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;

use crate::statsd::{CloudCounters, CloudGauges, CloudTimers};
use crate::{CloudConfig, CloudProvider, InstanceTags, ProviderError, RateLimiter};

/// An error returned when instance tags cannot be resolved.
///
/// None of these errors are fatal. Metrics are processed without instance tags instead.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EnrichmentError {
    /// The lookup was rejected by the rate limiter.
    #[error("cloud lookups are rate limited")]
    RateLimited,
    /// The provider returned an error.
    #[error("cloud provider failed")]
    Provider(#[source] Arc<ProviderError>),
    /// The provider did not respond in time.
    #[error("cloud lookup timed out")]
    Timeout,
    /// The enrichment service is not running.
    #[error("cloud enrichment is unavailable")]
    Unavailable,
}

type LookupResult = Result<InstanceTags, EnrichmentError>;

/// A lookup in flight and the callers waiting for it.
struct PendingLookup {
    waiters: Vec<Sender<LookupResult>>,
    abort: AbortHandle,
}

type LookupFuture = BoxFuture<'static, (IpAddr, Result<LookupResult, JoinError>)>;

#[derive(Debug)]
struct CacheEntry {
    result: LookupResult,
    expires: Instant,
}

/// The cache of lookup results, shared between the service and all handles.
#[derive(Debug, Default)]
struct Shared {
    entries: RwLock<HashMap<IpAddr, CacheEntry>>,
}

impl Shared {
    fn get(&self, ip: IpAddr, now: Instant) -> Option<LookupResult> {
        let entries = self.entries.read();
        let entry = entries.get(&ip)?;
        (entry.expires > now).then(|| entry.result.clone())
    }

    fn insert(&self, ip: IpAddr, result: LookupResult, expires: Instant) {
        self.entries
            .write()
            .insert(ip, CacheEntry { result, expires });
    }

    fn evict_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires > now);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Resolves the tags of the instance with the given address.
///
/// Sent by [`CloudHandle`] on cache misses.
#[derive(Debug)]
pub struct Resolve(pub IpAddr);

/// The interface of the [`EnrichmentService`].
#[derive(Debug)]
pub enum Enrichment {
    /// See [`Resolve`].
    Resolve(IpAddr, Sender<LookupResult>),
}

impl Interface for Enrichment {}

impl FromMessage<Resolve> for Enrichment {
    type Response = AsyncResponse<LookupResult>;

    fn from_message(message: Resolve, sender: Sender<LookupResult>) -> Self {
        Self::Resolve(message.0, sender)
    }
}

/// Access to instance tags.
///
/// Cheap to clone. Cached results are returned directly without involving the
/// [`EnrichmentService`].
#[derive(Clone)]
pub struct CloudHandle {
    shared: Arc<Shared>,
    service: Addr<Enrichment>,
}

impl CloudHandle {
    /// Returns the tags of the instance at `ip`.
    ///
    /// Returns immediately if the result is cached. Otherwise, waits for the lookup, which is
    /// bounded by the configured lookup timeout.
    pub async fn resolve(&self, ip: IpAddr) -> Result<InstanceTags, EnrichmentError> {
        if let Some(result) = self.cached(ip) {
            return result;
        }

        self.service
            .send(Resolve(ip))
            .await
            .unwrap_or(Err(EnrichmentError::Unavailable))
    }

    /// Returns the cached result for `ip`, if there is an unexpired one.
    pub fn cached(&self, ip: IpAddr) -> Option<Result<InstanceTags, EnrichmentError>> {
        let result = self.shared.get(ip, Instant::now());
        metric!(
            counter(CloudCounters::CacheLookup) += 1,
            hit = if result.is_some() { "true" } else { "false" },
        );
        result
    }
}

impl fmt::Debug for CloudHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudHandle")
            .field("cached", &self.shared.len())
            .finish()
    }
}

/// Runs provider lookups on behalf of [`CloudHandle`]s.
///
/// The service makes sure that there is at most one lookup per address in flight. Callers
/// requesting an address that is already being looked up wait for the same result.
pub struct EnrichmentService {
    provider: Arc<dyn CloudProvider>,
    config: CloudConfig,
    shared: Arc<Shared>,
    limiter: RateLimiter,
    pending: HashMap<IpAddr, PendingLookup>,
    lookups: FuturesUnordered<LookupFuture>,
    shutdown: ShutdownHandle,
}

impl EnrichmentService {
    /// Creates a new enrichment service.
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        config: CloudConfig,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            provider,
            limiter: RateLimiter::new(config.max_requests, config.burst),
            config,
            shared: Arc::default(),
            pending: HashMap::new(),
            lookups: FuturesUnordered::new(),
            shutdown,
        }
    }

    /// Starts the service and returns a handle to it.
    pub fn start_in(self, runner: &mut ServiceRunner) -> CloudHandle {
        let shared = Arc::clone(&self.shared);
        let service = runner.start(self);
        CloudHandle { shared, service }
    }

    fn handle_resolve(&mut self, ip: IpAddr, sender: Sender<LookupResult>) {
        let now = Instant::now();

        // A lookup may have completed after the handle checked the cache.
        if let Some(result) = self.shared.get(ip, now) {
            sender.send(result);
            return;
        }

        if let Some(pending) = self.pending.get_mut(&ip) {
            pending.waiters.push(sender);
            return;
        }

        if !self.limiter.try_acquire(now) {
            metric!(counter(CloudCounters::RateLimited) += 1);
            tally_log::debug!(%ip, "cloud lookup rate limited");
            sender.send(Err(EnrichmentError::RateLimited));
            return;
        }

        let provider = Arc::clone(&self.provider);
        let timeout = self.config.lookup_timeout();
        let lookup = tokio::spawn(async move {
            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, provider.instance(ip)).await {
                Ok(Ok(instance)) => Ok(instance.into_tags()),
                Ok(Err(error)) => Err(EnrichmentError::Provider(Arc::new(error))),
                Err(_) => Err(EnrichmentError::Timeout),
            };

            metric!(
                timer(CloudTimers::LookupDuration) = start.elapsed(),
                provider = provider.provider_name(),
                success = if result.is_ok() { "true" } else { "false" },
            );

            result
        });

        self.pending.insert(
            ip,
            PendingLookup {
                waiters: vec![sender],
                abort: lookup.abort_handle(),
            },
        );
        self.lookups.push(lookup.map(move |result| (ip, result)).boxed());
    }

    fn handle_lookup_done(&mut self, ip: IpAddr, result: Result<LookupResult, JoinError>) {
        let result = match result {
            Ok(result) => result,
            Err(error) => {
                if error.is_panic() {
                    tally_log::error!(%ip, "cloud lookup panicked");
                }
                self.notify(ip, Err(EnrichmentError::Unavailable));
                return;
            }
        };

        let ttl = match &result {
            Ok(_) => self.config.cache_ttl(),
            Err(error) => {
                tally_log::debug!(
                    %ip,
                    error = error as &dyn std::error::Error,
                    "cloud lookup failed"
                );
                self.config.negative_cache_ttl()
            }
        };

        self.shared.insert(ip, result.clone(), Instant::now() + ttl);
        self.notify(ip, result);
    }

    fn notify(&mut self, ip: IpAddr, result: LookupResult) {
        if let Some(pending) = self.pending.remove(&ip) {
            for sender in pending.waiters {
                sender.send(result.clone());
            }
        }
    }

    fn evict_expired(&self) {
        let evicted = self.shared.evict_expired(Instant::now());
        if evicted > 0 {
            tally_log::trace!("evicted {evicted} expired cloud cache entries");
        }
        metric!(gauge(CloudGauges::CacheSize) = self.shared.len() as u64);
    }

    fn abort_lookups(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.abort.abort();
            for sender in pending.waiters {
                sender.send(Err(EnrichmentError::Unavailable));
            }
        }
        self.lookups.clear();
    }
}

impl Service for EnrichmentService {
    type Interface = Enrichment;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        tally_log::info!(
            provider = self.provider.provider_name(),
            "cloud enrichment started"
        );

        let mut eviction = tokio::time::interval(self.config.cache_eviction_interval());
        eviction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    self.abort_lookups();
                    break;
                }
                Some((ip, result)) = self.lookups.next(), if !self.lookups.is_empty() => {
                    self.handle_lookup_done(ip, result)
                }
                message = rx.recv() => match message {
                    Some(Enrichment::Resolve(ip, sender)) => self.handle_resolve(ip, sender),
                    None => break,
                },
                _ = eviction.tick() => self.evict_expired(),
            }
        }

        tally_log::info!("cloud enrichment stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use tally_system::Controller;

    use super::*;
    use crate::InstanceMetadata;

    /// A provider that counts calls and takes a fixed time to respond.
    struct CountingProvider {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingProvider {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CloudProvider for CountingProvider {
        fn provider_name(&self) -> &str {
            "counting"
        }

        fn sample_config(&self) -> &str {
            ""
        }

        async fn instance(&self, ip: IpAddr) -> Result<InstanceMetadata, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            if self.fail {
                return Err(ProviderError::Request("boom".to_owned()));
            }

            Ok(InstanceMetadata {
                id: format!("i-{ip}"),
                region: "us-east-1".to_owned(),
                tags: vec!["role:web".to_owned()],
            })
        }
    }

    fn start(
        provider: Arc<dyn CloudProvider>,
        config: CloudConfig,
    ) -> (Controller, ServiceRunner, CloudHandle) {
        let controller = Controller::new();
        let mut runner = ServiceRunner::new();
        let handle = EnrichmentService::new(provider, config, controller.shutdown_handle())
            .start_in(&mut runner);
        (controller, runner, handle)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_deduplicated() {
        tally_test::setup();

        let provider = CountingProvider::new(Duration::from_millis(100));
        let (_controller, _runner, handle) = start(provider.clone(), CloudConfig::default());

        let (a, b) = tokio::join!(handle.resolve(ip("10.0.0.1")), handle.resolve(ip("10.0.0.1")));

        assert_eq!(provider.calls(), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_and_ttl() {
        let provider = CountingProvider::new(Duration::ZERO);
        let config = CloudConfig {
            cache_ttl: 10,
            ..Default::default()
        };
        let (_controller, _runner, handle) = start(provider.clone(), config);

        let tags = handle.resolve(ip("10.0.0.1")).await.unwrap();
        assert_eq!(
            tags.to_vec(),
            vec!["role:web".to_owned(), "region:us-east-1".to_owned()]
        );

        handle.resolve(ip("10.0.0.1")).await.unwrap();
        assert_eq!(provider.calls(), 1);
        assert!(handle.cached(ip("10.0.0.1")).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(handle.cached(ip("10.0.0.1")).is_none());

        handle.resolve(ip("10.0.0.1")).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_cache() {
        let provider = CountingProvider::failing();
        let config = CloudConfig {
            negative_cache_ttl: 30,
            ..Default::default()
        };
        let (_controller, _runner, handle) = start(provider.clone(), config);

        let result = handle.resolve(ip("10.0.0.1")).await;
        assert!(matches!(result, Err(EnrichmentError::Provider(_))));

        let result = handle.resolve(ip("10.0.0.1")).await;
        assert!(matches!(result, Err(EnrichmentError::Provider(_))));
        assert_eq!(provider.calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        handle.resolve(ip("10.0.0.1")).await.unwrap_err();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited() {
        let provider = CountingProvider::new(Duration::ZERO);
        let config = CloudConfig {
            max_requests: 1,
            burst: 2,
            ..Default::default()
        };
        let (_controller, _runner, handle) = start(provider.clone(), config);

        handle.resolve(ip("10.0.0.1")).await.unwrap();
        handle.resolve(ip("10.0.0.2")).await.unwrap();
        let result = handle.resolve(ip("10.0.0.3")).await;
        assert!(matches!(result, Err(EnrichmentError::RateLimited)));
        assert_eq!(provider.calls(), 2);

        // Rate limited results are not cached.
        tokio::time::advance(Duration::from_secs(1)).await;
        handle.resolve(ip("10.0.0.3")).await.unwrap();
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout() {
        let provider = CountingProvider::new(Duration::from_secs(60));
        let config = CloudConfig {
            lookup_timeout_ms: 1000,
            ..Default::default()
        };
        let (_controller, _runner, handle) = start(provider, config);

        let result = handle.resolve(ip("10.0.0.1")).await;
        assert!(matches!(result, Err(EnrichmentError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_lookups() {
        let provider = CountingProvider::new(Duration::from_secs(60));
        let (controller, mut runner, handle) = start(provider, CloudConfig::default());

        let lookup = tokio::spawn({
            let handle = handle.clone();
            async move { handle.resolve(ip("10.0.0.1")).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.shutdown(None);

        let result = lookup.await.unwrap();
        assert!(matches!(result, Err(EnrichmentError::Unavailable)));

        runner.join().await;
        let result = handle.resolve(ip("10.0.0.2")).await;
        assert!(matches!(result, Err(EnrichmentError::Unavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction() {
        let provider = CountingProvider::new(Duration::ZERO);
        let config = CloudConfig {
            cache_ttl: 5,
            cache_eviction_interval: 10,
            ..Default::default()
        };
        let (_controller, _runner, handle) = start(provider, config);

        handle.resolve(ip("10.0.0.1")).await.unwrap();
        assert_eq!(handle.shared.len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(handle.shared.len(), 0);
    }
}
