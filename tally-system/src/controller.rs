use std::io;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request message sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to resolve the future.
/// Ideally, open work is persisted or finished in an orderly manner but no new requests are
/// accepted anymore.
///
/// After the timeout the system will shut down regardless of what the receivers of this message
/// do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Notifies a service about an upcoming shutdown.
///
/// Obtained from [`Controller::shutdown_handle`]. Handles can be cloned and moved into tasks.
#[derive(Clone, Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Wait for a shutdown.
    ///
    /// This receives all shutdown signals since the [`Controller`] has been started, even before
    /// this shutdown handle has been obtained. Once a shutdown has been signaled, this resolves
    /// immediately on every subsequent call.
    ///
    /// If the controller is dropped without signaling, this resolves with a forced shutdown.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = *self.0.borrow_and_update() {
                return shutdown;
            }

            if self.0.changed().await.is_err() {
                return Shutdown { timeout: None };
            }
        }
    }

    /// Returns the pending shutdown, if one has been signaled.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }
}

/// Service to start and gracefully stop the system.
///
/// Each server instance owns exactly one controller. Services obtain a [`ShutdownHandle`] to
/// learn about the shutdown, the owner of the controller signals it either explicitly through
/// [`shutdown`](Self::shutdown) or by waiting for process signals in
/// [`shutdown_on_signal`](Self::shutdown_on_signal).
///
/// ### Example
///
/// ```
/// use std::time::Duration;
/// use tally_system::Controller;
///
/// # async fn example() {
/// let controller = Controller::new();
/// let mut handle = controller.shutdown_handle();
///
/// tokio::spawn(async move {
///     let shutdown = handle.notified().await;
///     // stop accepting work and flush within `shutdown.timeout`
/// });
///
/// controller.shutdown(Some(Duration::from_secs(10)));
/// # }
/// ```
#[derive(Debug)]
pub struct Controller {
    tx: watch::Sender<Option<Shutdown>>,
}

impl Controller {
    /// Creates a controller that has not been shut down.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.tx.subscribe())
    }

    /// Signals a shutdown to all handles.
    ///
    /// Subsequent calls overwrite the timeout of earlier calls.
    pub fn shutdown(&self, timeout: Option<Duration>) {
        self.tx.send_replace(Some(Shutdown { timeout }));
    }

    /// Returns `true` once a shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits for a process signal and translates it into a shutdown.
    ///
    /// `SIGINT` and `SIGQUIT` shut down immediately, `SIGTERM` shuts down gracefully with the
    /// given timeout.
    pub async fn shutdown_on_signal(&self, timeout: Duration) -> io::Result<()> {
        let graceful = wait_for_signal().await?;
        if graceful {
            tally_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
            self.shutdown(Some(timeout));
        } else {
            tally_log::info!("SIGINT received, exiting");
            self.shutdown(None);
        }
        Ok(())
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves with `true` for a graceful termination request.
#[cfg(unix)]
async fn wait_for_signal() -> io::Result<bool> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_quit = signal(SignalKind::quit())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    Ok(tokio::select! {
        biased;

        _ = sig_int.recv() => false,
        _ = sig_quit.recv() => false,
        _ = sig_term.recv() => true,
    })
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<bool> {
    tokio::signal::ctrl_c().await?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handles_observe_shutdown() {
        let controller = Controller::new();
        let mut early = controller.shutdown_handle();

        let waiter = tokio::spawn(async move { early.notified().await });
        controller.shutdown(Some(Duration::from_secs(3)));

        let expected = Shutdown {
            timeout: Some(Duration::from_secs(3)),
        };
        assert_eq!(waiter.await.unwrap(), expected);

        // Handles obtained after the fact see the shutdown right away.
        let mut late = controller.shutdown_handle();
        assert_eq!(late.get(), Some(expected));
        assert_eq!(late.notified().await, expected);
        assert!(controller.is_shutdown());
    }

    #[tokio::test]
    async fn test_independent_controllers() {
        let first = Controller::new();
        let second = Controller::new();

        first.shutdown(None);

        assert!(first.is_shutdown());
        assert!(!second.is_shutdown());
        assert_eq!(second.shutdown_handle().get(), None);
    }

    #[tokio::test]
    async fn test_dropped_controller_forces_shutdown() {
        let controller = Controller::new();
        let mut handle = controller.shutdown_handle();
        drop(controller);

        assert_eq!(handle.notified().await, Shutdown { timeout: None });
    }
}
