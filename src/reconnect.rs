//! Client-initiated connection driver with backoff retry.
//!
//! Reconnect state is keyed by URL in a single server-scoped registry.
//! `connect` is an atomic check-and-create: a second call for the same
//! URL signals the existing task's retry event instead of racing a new
//! task into existence. The retry loop holds its *own* handle to the
//! retry event - never a re-lookup through the registry mid-loop - so a
//! `disconnect`/`connect` pair cannot make an old task clear a new
//! task's event. On exit a task deregisters only if the registry entry
//! still maps to its own handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::{mpsc, Notify};

use crate::endpoint::{CloseReason, Endpoint, Inbound, Phase};

/// First backoff step.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Jitter applied to each backoff wait, as a fraction of the wait.
const BACKOFF_JITTER: f64 = 0.2;

/// Session logic driven for each established connection.
///
/// The future runs until the connection is done; the driver then
/// consults the endpoint's terminal phase to decide whether to retry.
pub trait SessionFactory: Send + Sync + 'static {
    /// Drives one established connection to completion.
    fn run(
        &self,
        endpoint: Arc<Endpoint>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> BoxFuture<'static, ()>;
}

impl<F> SessionFactory for F
where
    F: Fn(Arc<Endpoint>, mpsc::UnboundedReceiver<Inbound>) -> BoxFuture<'static, ()>
        + Send
        + Sync
        + 'static,
{
    fn run(
        &self,
        endpoint: Arc<Endpoint>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> BoxFuture<'static, ()> {
        self(endpoint, inbound)
    }
}

/// Registry entry owned jointly by the driver and its task.
struct Entry {
    /// Distinguishes this task's registration from a successor's.
    id: u64,
    /// Short-circuits the backoff wait.
    retry: Arc<Notify>,
    /// Set by `disconnect`; the task exits at its next yield point.
    cancelled: Arc<AtomicBool>,
    /// The live endpoint, if currently connected.
    endpoint: Mutex<Option<Arc<Endpoint>>>,
}

/// URL-keyed reconnect driver.
pub struct ReconnectDriver {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    next_id: AtomicU64,
    max_backoff: Duration,
    queue_depth: usize,
    drain_deadline: Duration,
    /// Phase for freshly dialed endpoints: `Init` when we speak first
    /// (client side), `HelloWait` when the peer does (a server dialing
    /// an advertised client).
    initial_phase: Phase,
    factory: Arc<dyn SessionFactory>,
}

impl ReconnectDriver {
    /// Creates a driver running `factory` for each established
    /// connection.
    pub fn new(
        max_backoff: Duration,
        queue_depth: usize,
        drain_deadline: Duration,
        initial_phase: Phase,
        factory: Arc<dyn SessionFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_backoff,
            queue_depth,
            drain_deadline,
            initial_phase,
            factory,
        })
    }

    /// Ensures a reconnect task exists for `url`.
    ///
    /// If one already exists its retry event is signalled (waking it
    /// from any backoff wait); otherwise the event and task are created
    /// together under the registry lock. Returns the retry event handle
    /// for the URL - every concurrent caller observes the same one.
    pub fn connect(self: &Arc<Self>, url: &str) -> Arc<Notify> {
        let mut entries = self.entries.lock().expect("reconnect registry lock");
        if let Some(entry) = entries.get(url) {
            entry.retry.notify_one();
            return Arc::clone(&entry.retry);
        }

        let entry = Arc::new(Entry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            retry: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            endpoint: Mutex::new(None),
        });
        entries.insert(url.to_string(), Arc::clone(&entry));
        drop(entries);

        let retry = Arc::clone(&entry.retry);
        let driver = Arc::clone(self);
        let url = url.to_string();
        tokio::spawn(async move {
            driver.retry_loop(&url, &entry).await;
            driver.deregister(&url, entry.id);
        });
        retry
    }

    /// Stops retrying `url` and closes its endpoint if connected.
    pub fn disconnect(&self, url: &str) {
        let entry = {
            let entries = self.entries.lock().expect("reconnect registry lock");
            entries.get(url).map(Arc::clone)
        };
        let Some(entry) = entry else { return };
        entry.cancelled.store(true, Ordering::Release);
        if let Some(endpoint) = entry.endpoint.lock().expect("entry endpoint lock").take() {
            endpoint.close(CloseReason::Normal, false);
        }
        entry.retry.notify_one();
    }

    /// Number of live reconnect tasks.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.entries.lock().expect("reconnect registry lock").len()
    }

    /// Removes the registry entry, but only if it is still ours.
    fn deregister(&self, url: &str, id: u64) {
        let mut entries = self.entries.lock().expect("reconnect registry lock");
        if entries.get(url).is_some_and(|entry| entry.id == id) {
            entries.remove(url);
        }
    }

    async fn retry_loop(&self, url: &str, entry: &Arc<Entry>) {
        // Local handles only from here on; the registry may be mutated
        // underneath us by disconnect/connect pairs.
        let retry = Arc::clone(&entry.retry);
        let cancelled = Arc::clone(&entry.cancelled);
        let mut backoff = BACKOFF_INITIAL;

        loop {
            if cancelled.load(Ordering::Acquire) {
                break;
            }

            match tokio_tungstenite::connect_async(url).await {
                Ok((socket, _response)) => {
                    info!("[{url}] connected");
                    backoff = BACKOFF_INITIAL;

                    let (endpoint, inbound) = Endpoint::spawn(
                        socket,
                        url.to_string(),
                        self.initial_phase,
                        self.queue_depth,
                        self.drain_deadline,
                    );
                    *entry.endpoint.lock().expect("entry endpoint lock") =
                        Some(Arc::clone(&endpoint));

                    self.factory.run(Arc::clone(&endpoint), inbound).await;
                    let reason = endpoint.closed().await;
                    entry.endpoint.lock().expect("entry endpoint lock").take();

                    if endpoint.phase() != Phase::Failed {
                        debug!("[{url}] closed without retry: {reason}");
                        break;
                    }
                    debug!("[{url}] connection lost: {reason}");
                }
                Err(e) => {
                    warn!("[{url}] connect failed: {e}");
                }
            }

            if cancelled.load(Ordering::Acquire) {
                break;
            }

            let wait = jittered(backoff, self.max_backoff);
            debug!("[{url}] retrying in {:.1}s", wait.as_secs_f32());
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = retry.notified() => {
                    debug!("[{url}] retry signalled");
                }
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }
}

/// Applies ±`BACKOFF_JITTER` of spread to prevent thundering herds when
/// many clients lose the same server.
fn jittered(base: Duration, cap: Duration) -> Duration {
    let base = base.min(cap);
    let spread = rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    base.mul_f64(1.0 + spread).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_factory() -> Arc<dyn SessionFactory> {
        Arc::new(
            |_endpoint: Arc<Endpoint>, _inbound: mpsc::UnboundedReceiver<Inbound>| {
                Box::pin(async {}) as BoxFuture<'static, ()>
            },
        )
    }

    fn driver() -> Arc<ReconnectDriver> {
        ReconnectDriver::new(
            Duration::from_secs(30),
            8,
            Duration::from_millis(50),
            Phase::Init,
            idle_factory(),
        )
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_task_and_event() {
        let driver = driver();
        // An unroutable URL: the task parks in its backoff wait.
        let url = "ws://127.0.0.1:9/resonate";

        let d1 = Arc::clone(&driver);
        let d2 = Arc::clone(&driver);
        let (h1, h2) = tokio::join!(
            tokio::spawn(async move { d1.connect(url) }),
            tokio::spawn(async move { d2.connect(url) }),
        );
        let (h1, h2) = (h1.unwrap(), h2.unwrap());

        assert!(Arc::ptr_eq(&h1, &h2), "callers saw different retry events");
        assert_eq!(driver.active_tasks(), 1);

        driver.disconnect(url);
    }

    #[tokio::test]
    async fn disconnect_then_connect_does_not_leak_tasks() {
        let driver = driver();
        let url = "ws://127.0.0.1:9/resonate";

        let first = driver.connect(url);
        driver.disconnect(url);
        // Give the cancelled task a chance to deregister.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = driver.connect(url);
        assert!(
            !Arc::ptr_eq(&first, &second),
            "new task must own a fresh retry event"
        );
        assert_eq!(driver.active_tasks(), 1);

        driver.disconnect(url);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cap = Duration::from_secs(30);
        for _ in 0..100 {
            let wait = jittered(Duration::from_secs(4), cap);
            assert!(wait >= Duration::from_secs(3));
            assert!(wait <= Duration::from_secs(5));
        }
        assert!(jittered(Duration::from_secs(60), cap) <= cap);
    }
}
