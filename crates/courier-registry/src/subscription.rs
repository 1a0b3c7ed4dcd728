use std::future::Future;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::error;

use courier_common::{Result, ServerMap};

use crate::RegistryEvent;

/// Handle returned by [`Registry::subscribe`](crate::Registry::subscribe).
///
/// Receives one [`ServerMap`] per observed registry version. Dropping the
/// handle (or calling [`unsubscribe`](Self::unsubscribe)) stops delivery.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ServerMap>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Waits for the next server map. `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<ServerMap> {
        self.rx.recv().await
    }

    /// Returns an already delivered server map without waiting.
    pub fn try_recv(&mut self) -> Option<ServerMap> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns the delivery task behind a subscription.
///
/// Every message on `changes` triggers `fetch`, which returns the backend's
/// current `(version, servers)` or `None` when the registry is not running.
/// A version equal to the last delivered one is skipped, so near-simultaneous
/// writes produce a single delivery.
pub(crate) fn spawn_subscription<F, Fut>(
    mut changes: broadcast::Receiver<()>,
    start_version: u64,
    events: broadcast::Sender<RegistryEvent>,
    fetch: F,
) -> Subscription
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<(u64, ServerMap)>>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut seen = start_version;
        loop {
            match changes.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
            match fetch().await {
                Ok(Some((version, servers))) => {
                    if version == seen {
                        continue;
                    }
                    seen = version;
                    if tx.send(servers).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("registry subscription failed to refresh servers: {}", e);
                    let _ = events.send(RegistryEvent::Error(e.to_string()));
                }
            }
        }
    });
    Subscription { rx, task }
}
