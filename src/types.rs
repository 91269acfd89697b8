use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = u64;

/// Value type.
pub type Value = f64;

/// Opaque byte identifier of a series; unique within a namespace.
pub type SeriesId = Vec<u8>;

/// Ordered list of (name, value) tag pairs. The canonical encoding of a
/// series is `(id, tags)`; order is preserved as given by the writer.
pub type Tags = Vec<(String, String)>;

/// Shard index within a namespace.
pub type Shard = u32;

/// Monotonically increasing identifier for successive persisted versions of
/// the same fileset; higher volume supersedes lower. `0` doubles as the
/// writable bucket version in the buffer.
pub type Volume = u32;

/// Bucket version of data that has not yet been persisted.
pub const WRITABLE_BUCKET_VERSION: Volume = 0;

/// Resolution the value of a datapoint was captured at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnit {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

/// A single time-series data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub timestamp: Timestamp,
    pub value: Value,
}

/// Classification of a write relative to the active buffer window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    #[default]
    Warm,
    Cold,
    Bootstrap,
}

/// Optional timestamp transform applied before dispatching a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncateType {
    #[default]
    None,
    /// Round the timestamp down to its block start.
    Block,
}

/// Per-write options and transforms.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub truncate_type: TruncateType,
    /// When set, overrides the written value.
    pub force_value: Option<Value>,
}

/// Durable flush state of one block, as recorded by the owning shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockState {
    /// Whether the warm fileset for the block has been fully persisted.
    pub warm_retrievable: bool,
    /// Highest cold volume that has been fully persisted (0 = none).
    pub cold_version: Volume,
}

/// Snapshot of per-block durable state keyed by block start.
pub type BlockStates = HashMap<Timestamp, BlockState>;

/// Outcome of a warm flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    FlushedToDisk,
    BlockDoesNotExist,
}

/// Size of the inline array inside [`OptimizedTimes`]. Sized for the common
/// cases: buckets removed within one tick after a flush, and buckets holding
/// cold writes within one cold flush cycle.
pub const OPTIMIZED_TIMES_ARRAY_SIZE: usize = 8;

/// A small set of block start times that avoids heap allocation for the
/// common case. Interact with it only through its methods; the spill-over
/// slice stays empty until the inline array fills up.
#[derive(Debug, Clone, Default)]
pub struct OptimizedTimes {
    arr_len: usize,
    arr: [Timestamp; OPTIMIZED_TIMES_ARRAY_SIZE],
    spill: Vec<Timestamp>,
}

impl OptimizedTimes {
    pub fn add(&mut self, t: Timestamp) {
        if self.arr_len < OPTIMIZED_TIMES_ARRAY_SIZE {
            self.arr[self.arr_len] = t;
            self.arr_len += 1;
        } else {
            self.spill.push(t);
        }
    }

    pub fn len(&self) -> usize {
        self.arr_len + self.spill.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, target: Timestamp) -> bool {
        self.arr[..self.arr_len].contains(&target) || self.spill.contains(&target)
    }

    pub fn for_each(&self, mut f: impl FnMut(Timestamp)) {
        for &t in &self.arr[..self.arr_len] {
            f(t);
        }
        for &t in &self.spill {
            f(t);
        }
    }

    pub fn to_vec(&self) -> Vec<Timestamp> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|t| out.push(t));
        out
    }
}

/// Cooperative cancellation token checked by long-running operations at
/// progress boundaries (per block, per shard). Cancellation leaves data
/// structures consistent; work that completed before the check stands.
#[derive(Debug, Clone, Default)]
pub struct Cancellable {
    cancelled: Arc<AtomicBool>,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Rounds a timestamp down to its block boundary.
pub fn block_start(timestamp: Timestamp, block_size: Duration) -> Timestamp {
    let size = duration_nanos(block_size);
    if size == 0 {
        return timestamp;
    }
    timestamp - (timestamp % size)
}

/// Duration as whole nanoseconds, saturating on overflow.
pub fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
