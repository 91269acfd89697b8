//! Injected wall-clock capability. Production code uses [`SystemClock`];
//! tests drive time explicitly through [`ManualClock`]. There is no
//! process-wide mutable clock singleton.

use crate::types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A now-returning capability.
pub trait Clock: std::fmt::Debug + Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// Shared handle to a clock implementation.
pub type ClockHandle = Arc<dyn Clock>;

/// Wall clock backed by `SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }
}

pub fn system_clock() -> ClockHandle {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to. Intended for tests and simulations;
/// all clones observe the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(crate::types::duration_nanos(by), Ordering::AcqRel);
    }

    pub fn handle(&self) -> ClockHandle {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::Acquire)
    }
}
