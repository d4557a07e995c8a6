use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::PollError;
use crate::snapshot_store::SnapshotStore;

/// Fraction of the poll interval a single attempt may take.
const TIMEOUT_SHARE_OF_INTERVAL: f64 = 0.8;

/// Drives a backend on a fixed interval and publishes into the store.
pub struct Poller {
    backend: Backend,
    store: SnapshotStore,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl Poller {
    pub fn new(
        backend: Backend,
        store: SnapshotStore,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            poll_interval,
            poll_timeout: poll_timeout(poll_interval, request_timeout),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Spawns the polling loop as its own task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Main execution loop. Returns once `shutdown` flips to true, cancelling
    /// any poll still in flight.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting {} poller: every {:?}, timeout {:?}",
            self.backend.name(),
            self.poll_interval,
            self.poll_timeout
        );

        let mut poll_interval = interval(self.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = poll_interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            tokio::select! {
                _ = self.poll_cycle() => {}
                changed = shutdown.changed() => {
                    debug!("Shutdown requested during poll, abandoning it");
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("{} poller exiting", self.backend.name());
    }

    /// One bounded poll attempt. On success the reading is published; on any
    /// failure the previous snapshot stays in place.
    pub async fn poll_cycle(&self) -> Result<(), PollError> {
        let result = match timeout(self.poll_timeout, self.backend.poll_once()).await {
            Ok(result) => result,
            Err(_) => Err(PollError::Timeout(self.poll_timeout)),
        };
        let published = result.and_then(|snapshot| {
            let snapshot = match self.store.latest() {
                Some(previous) => snapshot.with_energy_floor(&previous),
                None => snapshot,
            };
            self.store.set(snapshot)
        });

        match published {
            Ok(()) => Ok(()),
            Err(e) => {
                let failures = self.store.record_failure();
                if !e.is_transient() {
                    error!("{} poll failed ({failures} in a row): {e}", self.backend.name());
                } else if let PollError::MalformedResponse(_) = e {
                    warn!(
                        "{} returned an unexpected payload ({failures} in a row), \
                         vendor API may have changed: {e}",
                        self.backend.name()
                    );
                } else {
                    warn!("{} poll failed ({failures} in a row): {e}", self.backend.name());
                }
                Err(e)
            }
        }
    }
}

/// Per-attempt budget: the request timeout, capped strictly below the
/// interval so a hung source cannot swallow the next cycle.
pub fn poll_timeout(poll_interval: Duration, request_timeout: Duration) -> Duration {
    request_timeout.min(poll_interval.mul_f64(TIMEOUT_SHARE_OF_INTERVAL))
}
