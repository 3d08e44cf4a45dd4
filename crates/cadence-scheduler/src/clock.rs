//! Time sources for the scheduler.
//!
//! Every component that reads the time or waits takes an `Arc<dyn Clock>`.
//! Production uses [`SystemClock`]; tests drive a [`ManualClock`] so timers
//! fire on `advance()` instead of real sleeps.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::oneshot;

#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once `duration` has elapsed on this clock. Non-positive
    /// durations resolve immediately.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time and tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(d) = duration.to_std() {
            tokio::time::sleep(d).await;
        }
    }
}

/// Virtual clock that only moves when told to.
pub struct ManualClock {
    inner: Mutex<ManualInner>,
}

struct ManualInner {
    now: DateTime<Utc>,
    sleepers: Vec<(DateTime<Utc>, oneshot::Sender<()>)>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                now: start,
                sleepers: Vec::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner();
        let target = inner.now + by;
        Self::move_to(&mut inner, target);
    }

    /// Jump to an absolute instant (may go backwards; nobody is woken then).
    pub fn set(&self, to: DateTime<Utc>) {
        let mut inner = self.inner();
        Self::move_to(&mut inner, to);
    }

    /// Number of pending sleeps that can still be woken.
    pub fn sleepers(&self) -> usize {
        let mut inner = self.inner();
        inner.sleepers.retain(|(_, tx)| !tx.is_closed());
        inner.sleepers.len()
    }

    fn move_to(inner: &mut ManualInner, to: DateTime<Utc>) {
        inner.now = to;
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.sleepers)
            .into_iter()
            .partition(|(deadline, _)| *deadline <= to);
        inner.sleepers = pending;
        for (_, tx) in due {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("ManualClock")
            .field("now", &inner.now)
            .field("sleepers", &inner.sleepers.len())
            .finish()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner().now
    }

    async fn sleep(&self, duration: Duration) {
        if duration <= Duration::zero() {
            return;
        }
        let rx = {
            let mut inner = self.inner();
            let (tx, rx) = oneshot::channel();
            let deadline = inner.now + duration;
            inner.sleepers.push((deadline, tx));
            rx
        };
        // A dropped sender only happens if the clock itself is dropped.
        let _ = rx.await;
    }
}
