//! Connectivity signal and reachability probing.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wcpos_remote::RemoteResourceClient;

/// Writing half of the connectivity signal.
#[derive(Clone)]
pub struct ConnectivitySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivitySignal {
    /// Create a signal with an initial state.
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self { tx: Arc::new(tx) }
    }

    /// Publish the current state. Subscribers only wake on actual changes.
    ///
    /// # Returns
    /// Whether the state changed.
    pub fn set(&self, connected: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        })
    }

    /// Last published state.
    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new reading half.
    pub fn gate(&self) -> ConnectivityGate {
        ConnectivityGate {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ConnectivitySignal {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Reading half of the connectivity signal.
#[derive(Clone)]
pub struct ConnectivityGate {
    rx: watch::Receiver<bool>,
}

impl ConnectivityGate {
    /// Current state.
    pub fn is_connected(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next transition.
    ///
    /// # Returns
    /// The new state, or `None` once every signal is dropped.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Wait until connected.
    ///
    /// # Returns
    /// `false` if the signal was dropped while disconnected.
    pub async fn wait_until_connected(&mut self) -> bool {
        self.rx.wait_for(|connected| *connected).await.is_ok()
    }
}

/// Pings the backend periodically and publishes reachability.
pub struct ReachabilityProbe {
    remote: Arc<dyn RemoteResourceClient>,
    signal: ConnectivitySignal,
    interval: Duration,
}

impl ReachabilityProbe {
    /// Create a probe publishing into `signal` every `interval`.
    pub fn new(
        remote: Arc<dyn RemoteResourceClient>,
        signal: ConnectivitySignal,
        interval: Duration,
    ) -> Self {
        Self {
            remote,
            signal,
            interval,
        }
    }

    /// Ping once and publish the result.
    pub async fn probe(&self) -> bool {
        let reachable = match self.remote.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Reachability probe against {} failed: {}", self.remote.name(), e);
                false
            }
        };

        if self.signal.set(reachable) {
            if reachable {
                info!("Connection restored");
            } else {
                warn!("Connection lost");
            }
        }
        reachable
    }

    /// Probe immediately, then every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = self.probe() => {}
                        }
                    }
                }
            }
            debug!("Reachability probe stopped");
        })
    }
}
