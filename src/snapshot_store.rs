use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::error::PollError;
use crate::meter_data::{MeterSnapshot, PhaseCount};

/// Latest known-good reading shared between the poller and HTTP handlers.
///
/// Writers swap an `Arc`, readers clone it, so neither side holds the lock
/// for longer than a pointer copy.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Inner>,
}

struct Inner {
    latest: RwLock<Option<Arc<MeterSnapshot>>>,
    consecutive_failures: AtomicU32,
    phases: PhaseCount,
    stale_after: Duration,
}

impl SnapshotStore {
    pub fn new(phases: PhaseCount, stale_after: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                latest: RwLock::new(None),
                consecutive_failures: AtomicU32::new(0),
                phases,
                stale_after,
            }),
        }
    }

    pub fn phases(&self) -> PhaseCount {
        self.inner.phases
    }

    /// Returns the latest snapshot and its age, or `None` before the first
    /// successful poll.
    pub fn get(&self) -> Option<(Arc<MeterSnapshot>, Duration)> {
        let snapshot = self.latest()?;
        let age = (Utc::now() - snapshot.captured_at())
            .to_std()
            .unwrap_or(Duration::ZERO);
        Some((snapshot, age))
    }

    pub fn latest(&self) -> Option<Arc<MeterSnapshot>> {
        self.inner
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publishes a new snapshot and clears the failure counter.
    pub fn set(&self, snapshot: MeterSnapshot) -> Result<(), PollError> {
        let expected = self.inner.phases.count();
        if snapshot.phases().len() != expected {
            return Err(PollError::MalformedResponse(format!(
                "snapshot has {} phases, configured for {}",
                snapshot.phases().len(),
                expected
            )));
        }
        let snapshot = Arc::new(snapshot);
        *self
            .inner
            .latest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Records a failed poll. Returns the new consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    /// True when a snapshot exists and is younger than the staleness limit.
    pub fn is_online(&self) -> bool {
        self.read().1
    }

    /// The latest snapshot together with its freshness, from a single read so
    /// the two always describe the same snapshot.
    pub fn read(&self) -> (Option<Arc<MeterSnapshot>>, bool) {
        match self.get() {
            Some((snapshot, age)) => (Some(snapshot), age <= self.inner.stale_after),
            None => (None, false),
        }
    }
}
