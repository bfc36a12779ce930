use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::statsd::SystemGauges;

/// Interval for recording backlog metrics on service channels.
const BACKLOG_INTERVAL: Duration = Duration::from_secs(1);

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of messages, but it can also be implemented on
/// a single message. For each individual message, this type needs to implement the
/// [`FromMessage`] trait.
///
/// # Implementating Interfaces
///
/// There are three main ways to implement interfaces, which depends on the number of messages and
/// their return values. The simplest way is an interface consisting of a **single message** with
/// **no return value**. For this case, use the message directly as interface and choose
/// `NoResponse` as response:
///
/// ```
/// use tally_system::{FromMessage, Interface, NoResponse};
///
/// #[derive(Debug)]
/// pub struct MyMessage;
///
/// impl Interface for MyMessage {}
///
/// impl FromMessage<Self> for MyMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
/// ```
///
/// If a single message has a return value, its interface must hold the response
/// [`Sender`] and be wrapped in an enum or struct:
///
/// ```
/// use tally_system::{AsyncResponse, FromMessage, Interface, Sender};
///
/// #[derive(Debug)]
/// pub struct GetBucketCount;
///
/// #[derive(Debug)]
/// pub enum Aggregator {
///     GetBucketCount(GetBucketCount, Sender<usize>),
/// }
///
/// impl Interface for Aggregator {}
///
/// impl FromMessage<GetBucketCount> for Aggregator {
///     type Response = AsyncResponse<usize>;
///
///     fn from_message(message: GetBucketCount, sender: Sender<usize>) -> Self {
///         Self::GetBucketCount(message, sender)
///     }
/// }
/// ```
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// An error returned by [`Addr::try_send`] and [`Addr::send_timeout`].
///
/// The rejected message is handed back to the caller.
pub enum TrySendError<M> {
    /// The service inbox is at capacity.
    Full(M),
    /// The service has shut down.
    Closed(M),
}

impl<M> TrySendError<M> {
    /// Returns `true` if the message was rejected because the inbox is full.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Returns the rejected message.
    pub fn into_inner(self) -> M {
        match self {
            Self::Full(message) | Self::Closed(message) => message,
        }
    }
}

impl<M> fmt::Debug for TrySendError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<M> fmt::Display for TrySendError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "service inbox is full"),
            Self::Closed(_) => write!(f, "service has shut down"),
        }
    }
}

impl<M> std::error::Error for TrySendError<M> {}

/// Response behavior of an [`Interface`] message.
///
/// It defines how a service handles and responds to interface messages, such as through
/// asynchronous responses or fire-and-forget without responding.
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender;

    /// The type returned from [`Addr::send`].
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The request when sending an asynchronous message to a service.
///
/// This is returned from [`Addr::send`] when the message responds asynchronously through
/// [`AsyncResponse`]. It is a future that should be awaited. The message still runs to
/// completion if this future is dropped.
pub struct Request<T>(oneshot::Receiver<T>);

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx).map(|r| r.map_err(|_| SendError))
    }
}

/// Sends a message response from a service back to the waiting [`Request`].
///
/// The sender is part of an [`AsyncResponse`] and should be moved into the service interface
/// type. If this sender is dropped without calling [`send`](Self::send), the request fails with
/// [`SendError`].
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("open", &!self.0.is_closed())
            .finish()
    }
}

impl<T> Sender<T> {
    /// Sends the response value and closes the [`Request`].
    ///
    /// This silently drops the value if the request has been dropped.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }

    /// Returns `true` if the requester is no longer interested in the response.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Message response resulting in an asynchronous [`Request`].
///
/// The sender must be placed on the interface in [`FromMessage::from_message`].
pub struct AsyncResponse<T>(std::marker::PhantomData<T>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse")
    }
}

impl<T> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), Request(rx))
    }
}

/// Message response for fire-and-forget messages with no output.
///
/// There is no sender associated to this response. When implementing [`FromMessage`], the
/// sender can be ignored.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// Declares a message as part of an [`Interface`].
///
/// Messages have an associated `Response` type that determines the return value of sending the
/// message. Within an interface, the response sender is stored on the interface value so the
/// service can respond once it has handled the message.
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// An item in a service inbox.
///
/// Messages sent with a capacity check carry their permit, which is released as soon as the
/// service dequeues the message.
struct Envelope<I> {
    message: I,
    _permit: Option<OwnedSemaphorePermit>,
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service that implements a corresponding
/// [`Interface`] as long as the service is running.
///
/// Addresses can be freely cloned. When the last clone of an address is dropped, the message
/// channel of the service closes permanently, which signals to the service that it can shut
/// down.
///
/// A service started with a capacity only admits that many messages sent through
/// [`try_send`](Self::try_send) or [`send_timeout`](Self::send_timeout) at a time. Messages sent
/// through [`send`](Self::send) are never rejected and do not count against the capacity, but
/// they are still delivered in order with all other messages.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<Envelope<I>>,
    capacity: Option<Arc<Semaphore>>,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// Depending on the message's response behavior, this either returns a future resolving to
    /// the return value, or does not return anything for fire-and-forget messages. The message
    /// is handled regardless of whether the response is awaited.
    ///
    /// If the service has shut down, the message is dropped and awaiting the response fails with
    /// [`SendError`].
    pub fn send<M>(&self, message: M) -> <I::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        self.enqueue(message, None)
    }

    /// Sends a message only if the service inbox has spare capacity.
    ///
    /// For services without capacity this behaves like [`send`](Self::send), except that it
    /// reports a closed service.
    pub fn try_send<M>(
        &self,
        message: M,
    ) -> Result<<I::Response as MessageResponse>::Output, TrySendError<M>>
    where
        I: FromMessage<M>,
    {
        if self.tx.is_closed() {
            return Err(TrySendError::Closed(message));
        }

        let permit = match &self.capacity {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => return Err(TrySendError::Full(message)),
                Err(TryAcquireError::Closed) => return Err(TrySendError::Closed(message)),
            },
            None => None,
        };

        Ok(self.enqueue(message, permit))
    }

    /// Sends a message, waiting at most `timeout` for the service inbox to have capacity.
    pub async fn send_timeout<M>(
        &self,
        message: M,
        timeout: Duration,
    ) -> Result<<I::Response as MessageResponse>::Output, TrySendError<M>>
    where
        I: FromMessage<M>,
    {
        if self.tx.is_closed() {
            return Err(TrySendError::Closed(message));
        }

        let permit = match &self.capacity {
            Some(semaphore) => {
                let acquire = Arc::clone(semaphore).acquire_owned();
                match tokio::time::timeout(timeout, acquire).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(TrySendError::Closed(message)),
                    Err(_) => return Err(TrySendError::Full(message)),
                }
            }
            None => None,
        };

        Ok(self.enqueue(message, permit))
    }

    fn enqueue<M>(
        &self,
        message: M,
        permit: Option<OwnedSemaphorePermit>,
    ) -> <I::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        let (tx, rx) = I::Response::channel();
        let envelope = Envelope {
            message: I::from_message(message, tx),
            _permit: permit,
        };

        self.queue_size.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(envelope).is_err() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
        }

        rx
    }

    /// Returns the number of messages waiting in the service inbox.
    pub fn len(&self) -> u64 {
        self.queue_size.load(Ordering::Relaxed)
    }

    /// Returns `true` if there are no messages waiting in the service inbox.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the service is no longer receiving messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Custom address used for testing.
    ///
    /// Returns an address whose service has already shut down. Sent messages are dropped.
    pub fn dummy() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            tx,
            capacity: None,
            queue_size: Default::default(),
        }
    }
}

// Manually derive `Clone` since we do not require `I: Clone` and the Clone derive adds this
// constraint.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity.clone(),
            queue_size: self.queue_size.clone(),
        }
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("open", &!self.tx.is_closed())
            .field("queue_size", &self.queue_size.load(Ordering::Relaxed))
            .field(
                "available",
                &self.capacity.as_ref().map(|s| s.available_permits()),
            )
            .finish()
    }
}

/// Inbound channel for messages sent through an [`Addr`].
///
/// This channel is meant to be polled in a [`Service`].
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<Envelope<I>>,
    name: &'static str,
    interval: Option<Interval>,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next value for this receiver.
    ///
    /// This method returns `None` if the channel has been closed and there are no remaining
    /// messages in the channel's buffer. This indicates that no further values can ever be
    /// received from this `Receiver`. The channel is closed when all senders have been dropped.
    pub async fn recv(&mut self) -> Option<I> {
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(BACKLOG_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                biased;

                _ = interval.tick() => {
                    let backlog = self.queue_size.load(Ordering::Relaxed);
                    tally_statsd::metric!(
                        gauge(SystemGauges::ServiceBackPressure) = backlog,
                        service = self.name
                    );
                },
                envelope = self.rx.recv() => {
                    let Envelope { message, .. } = envelope?;
                    self.queue_size.fetch_sub(1, Ordering::SeqCst);
                    return Some(message);
                },
            }
        }
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("queue_size", &self.queue_size.load(Ordering::Relaxed))
            .finish()
    }
}

fn build_channel<I: Interface>(
    name: &'static str,
    capacity: Option<usize>,
) -> (Addr<I>, Receiver<I>) {
    let queue_size = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let addr = Addr {
        tx,
        capacity: capacity.map(|c| Arc::new(Semaphore::new(c))),
        queue_size: queue_size.clone(),
    };

    let receiver = Receiver {
        rx,
        name,
        interval: None,
        queue_size,
    };

    (addr, receiver)
}

/// Creates an unbounded channel for communicating with a [`Service`].
///
/// The `Addr` as the sending part provides public access to the service, while the `Receiver`
/// should remain internal to the service.
pub fn channel<I: Interface>(name: &'static str) -> (Addr<I>, Receiver<I>) {
    build_channel(name, None)
}

/// Creates a channel that admits at most `capacity` messages through [`Addr::try_send`] and
/// [`Addr::send_timeout`].
pub fn bounded_channel<I: Interface>(
    name: &'static str,
    capacity: usize,
) -> (Addr<I>, Receiver<I>) {
    build_channel(name, Some(capacity))
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`] and handle
/// them one by one. Internally, services are free to concurrently process these messages or not,
/// most probably should.
///
/// Individual messages can have a response which will be sent once the message is handled by
/// the service. The sender can asynchronously await the responses of such messages.
///
/// To start a service, create a service runner and call [`ServiceRunner::start`].
///
/// # Implementing Services
///
/// The standard way to implement services is through the `run` function. It receives an inbound
/// channel for all messages sent through the service's address. Note that this function is
/// async, so the service must not perform any blocking work.
///
/// ```
/// use tally_system::{FromMessage, Interface, NoResponse, Receiver, Service, ServiceRunner};
///
/// struct MyMessage;
///
/// impl Interface for MyMessage {}
///
/// impl FromMessage<Self> for MyMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
///
/// struct MyService;
///
/// impl Service for MyService {
///     type Interface = MyMessage;
///
///     async fn run(self, mut rx: Receiver<Self::Interface>) {
///         while let Some(message) = rx.recv().await {
///             // handle the message
///         }
///     }
/// }
///
/// async fn start() {
///     let addr = ServiceRunner::new().start(MyService);
///     addr.send(MyMessage);
/// }
/// ```
pub trait Service: Sized {
    /// The interface of messages this service implements.
    type Interface: Interface;

    /// Defines the main task of this service.
    fn run(self, rx: Receiver<Self::Interface>) -> impl Future<Output = ()> + Send + 'static;

    /// Returns a unique name for this service implementation.
    ///
    /// This is used for internal diagnostics and uses the fully qualified type name of the
    /// service implementor by default.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Keeps track of running services.
///
/// Exposes information about crashed services.
#[derive(Default)]
pub struct ServiceRunner(FuturesUnordered<JoinHandle<()>>);

impl ServiceRunner {
    /// Creates a new service runner.
    pub fn new() -> Self {
        Self(FuturesUnordered::new())
    }

    /// Starts a service and starts tracking its join handle, exposing an [`Addr`] for message
    /// passing.
    pub fn start<S: Service>(&mut self, service: S) -> Addr<S::Interface> {
        let (addr, rx) = channel(S::name());
        self.start_with(service, rx);
        addr
    }

    /// Starts a service whose inbox is bounded by `capacity`.
    ///
    /// See [`bounded_channel`].
    pub fn start_bounded<S: Service>(&mut self, service: S, capacity: usize) -> Addr<S::Interface> {
        let (addr, rx) = bounded_channel(S::name(), capacity);
        self.start_with(service, rx);
        addr
    }

    /// Starts a service with an existing receiver.
    pub fn start_with<S: Service>(&mut self, service: S, rx: Receiver<S::Interface>) {
        self.0.push(tokio::spawn(service.run(rx)));
    }

    /// Spawns a plain task and tracks it along with the services.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.push(tokio::spawn(future));
    }

    /// Returns the number of tracked tasks that have not finished yet.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if all tracked tasks have finished.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Waits until all services have finished.
    ///
    /// Panicking services are logged and do not abort the wait for the others.
    pub async fn join(&mut self) {
        while let Some(result) = self.0.next().await {
            if let Err(error) = result {
                if error.is_panic() {
                    tally_log::error!(
                        error = &error as &dyn std::error::Error,
                        "service panicked"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for ServiceRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRunner")
            .field("running", &self.0.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Push(u32);

    #[derive(Debug)]
    struct Drain;

    #[derive(Debug)]
    enum Collector {
        Push(Push),
        Drain(Drain, Sender<Vec<u32>>),
    }

    impl Interface for Collector {}

    impl FromMessage<Push> for Collector {
        type Response = NoResponse;

        fn from_message(message: Push, _: ()) -> Self {
            Self::Push(message)
        }
    }

    impl FromMessage<Drain> for Collector {
        type Response = AsyncResponse<Vec<u32>>;

        fn from_message(message: Drain, sender: Sender<Vec<u32>>) -> Self {
            Self::Drain(message, sender)
        }
    }

    struct CollectorService {
        items: Vec<u32>,
    }

    impl Service for CollectorService {
        type Interface = Collector;

        async fn run(mut self, mut rx: Receiver<Self::Interface>) {
            while let Some(message) = rx.recv().await {
                match message {
                    Collector::Push(Push(value)) => self.items.push(value),
                    Collector::Drain(_, sender) => sender.send(std::mem::take(&mut self.items)),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_messages_are_handled_in_order() {
        let addr = ServiceRunner::new().start(CollectorService { items: vec![] });

        addr.send(Push(1));
        addr.send(Push(2));
        let drained = addr.send(Drain).await.unwrap();
        addr.send(Push(3));

        assert_eq!(drained, vec![1, 2]);
        assert_eq!(addr.send(Drain).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_bounded_rejects_when_full() {
        let (addr, mut rx) = bounded_channel::<Collector>("test", 2);

        assert!(addr.try_send(Push(1)).is_ok());
        assert!(addr.try_send(Push(2)).is_ok());
        let rejected = addr.try_send(Push(3)).unwrap_err();
        assert!(rejected.is_full());
        assert_eq!(rejected.into_inner().0, 3);

        // Unchecked sends bypass the capacity but keep their place in line.
        let _request = addr.send(Drain);
        assert_eq!(addr.len(), 3);

        assert!(matches!(rx.recv().await, Some(Collector::Push(Push(1)))));
        assert!(addr.try_send(Push(4)).is_ok());
        assert!(matches!(rx.recv().await, Some(Collector::Push(Push(2)))));
        assert!(matches!(rx.recv().await, Some(Collector::Drain(..))));
        assert!(matches!(rx.recv().await, Some(Collector::Push(Push(4)))));
        assert!(addr.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_waits_for_capacity() {
        let (addr, mut rx) = bounded_channel::<Collector>("test", 1);
        assert!(addr.try_send(Push(1)).is_ok());

        let result = addr.send_timeout(Push(2), Duration::from_millis(10)).await;
        assert!(result.unwrap_err().is_full());

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            rx.recv().await.map(|_| ())
        });

        let result = addr.send_timeout(Push(3), Duration::from_millis(10)).await;
        assert!(result.is_ok());
        assert_eq!(consumer.await.unwrap(), Some(()));
    }

    #[tokio::test]
    async fn test_send_to_stopped_service() {
        let addr = Addr::<Collector>::dummy();

        assert_eq!(addr.send(Drain).await, Err(SendError));
        assert!(matches!(
            addr.try_send(Push(1)),
            Err(TrySendError::Closed(_))
        ));
        assert!(addr.is_empty());
    }

    #[tokio::test]
    async fn test_runner_joins_finished_services() {
        let mut runner = ServiceRunner::new();
        let addr = runner.start(CollectorService { items: vec![] });
        assert_eq!(runner.len(), 1);

        drop(addr);
        runner.join().await;
        assert!(runner.is_empty());
    }
}
