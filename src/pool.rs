//! Free-list object pools. Pools hand ownership of an object out on `get`
//! and expect it back on `put`; objects carry no back-pointers to their pool.

use std::fmt;
use std::sync::Mutex;

/// Default number of pooled objects retained when no size is configured.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// A bounded free-list pool. `get` pops a recycled object or allocates a new
/// one; `put` retains the object up to the configured capacity and drops the
/// rest. Callers are responsible for resetting object state before reuse.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    alloc: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> ObjectPool<T> {
    pub fn new(capacity: usize, alloc: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            alloc: Box::new(alloc),
        }
    }

    pub fn get(&self) -> T {
        let recycled = self.free.lock().ok().and_then(|mut free| free.pop());
        recycled.unwrap_or_else(|| (self.alloc)())
    }

    pub fn put(&self, obj: T) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(obj);
            }
        }
    }

    /// Number of objects currently sitting in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle())
            .finish()
    }
}
