//! Seeker manager: owns the pool of read handles per (shard, block start)
//! fileset, hands out concurrent clones for parallel reads, and hot-swaps to
//! new fileset volumes on lease updates without stalling readers.
//!
//! Locks are always acquired manager first, then per-shard, never the
//! reverse; seeker opens (I/O heavy) happen outside both.

use crate::bloom::BloomFilter;
use crate::clock::ClockHandle;
use crate::encoding::Segment;
use crate::error::{DbError, MultiError};
use crate::lease::{LeaseDescriptor, LeaseManager, LeaseState, Leaser, UpdateOpenLeaseResult};
use crate::pool::ObjectPool;
use crate::telemetry::{db_metrics, DbEvent, EventListener};
use crate::types::{block_start, duration_nanos, Shard, Timestamp, Volume};

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Cadence of the background open/close loop.
pub const SEEK_MANAGER_CLOSE_INTERVAL: Duration = Duration::from_secs(1);
/// Number of reusable seeker resources kept pooled for opens.
pub const REUSABLE_SEEKER_RESOURCES_POOL_SIZE: usize = 10;
/// Default number of seekers (original plus clones) per fileset.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// An open read handle on a persisted fileset for one (shard, block start,
/// volume). Clones share immutable data (bloom filter, index structures)
/// with their original; a handle and its clones must all be closed before
/// the underlying resources are released.
pub trait BlockSeeker: Send + Sync + std::fmt::Debug {
    /// The bloom filter over series IDs in the fileset, shared with clones.
    fn id_bloom_filter(&self) -> Arc<BloomFilter>;

    /// Exact-ID seek. `Ok(None)` when the fileset holds no such series.
    fn seek_by_id(&self, id: &[u8]) -> Result<Option<Segment>, DbError>;

    /// Seeks all series with IDs in `[from, to)`, ascending.
    fn seek_id_range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Segment)>, DbError>;

    fn volume(&self) -> Volume;

    /// A clone sharing immutable data for a parallel reader.
    fn concurrent_clone(&self) -> Result<Arc<dyn BlockSeeker>, DbError>;

    fn close(&self) -> Result<(), DbError>;
}

/// Identifies the fileset a factory should open.
#[derive(Debug, Clone)]
pub struct OpenSeekerRequest {
    pub namespace: String,
    pub shard: Shard,
    pub block_start: Timestamp,
    pub volume: Volume,
}

/// Scratch buffers loaned to a seeker while it opens. The unread buffer is
/// shared across all opens under a dedicated lock so concurrent opens do not
/// each allocate one; it may be grown by the factory.
#[derive(Debug, Default)]
pub struct ReusableSeekerResources {
    pub scratch: Vec<u8>,
    pub unread_buf: Vec<u8>,
}

/// Factory opening a seeker for a request. Injectable so tests can
/// substitute mock filesets. Must return [`DbError::FileSetNotFound`] when
/// no fileset exists for the request.
pub type NewOpenSeekerFn = Arc<
    dyn Fn(&OpenSeekerRequest, &mut ReusableSeekerResources) -> Result<Arc<dyn BlockSeeker>, DbError>
        + Send
        + Sync,
>;

#[derive(Debug, Clone)]
pub struct SeekerManagerOptions {
    /// Seekers (one original plus clones) kept per fileset; a well-behaved
    /// caller borrows at most this many concurrently per (shard, block start).
    pub fetch_concurrency: usize,
    pub close_interval: Duration,
    pub resources_pool_size: usize,
    pub block_size: Duration,
    pub retention_period: Duration,
    pub clock: ClockHandle,
    pub event_listener: Arc<dyn EventListener>,
}

impl Default for SeekerManagerOptions {
    fn default() -> Self {
        Self {
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            close_interval: SEEK_MANAGER_CLOSE_INTERVAL,
            resources_pool_size: REUSABLE_SEEKER_RESOURCES_POOL_SIZE,
            block_size: Duration::from_secs(2 * 3600),
            retention_period: Duration::from_secs(48 * 3600),
            clock: crate::clock::system_clock(),
            event_listener: crate::telemetry::noop_event_listener(),
        }
    }
}

/// Counting barrier in the shape of Go's sync.WaitGroup, used for opener
/// coordination and the inactive seeker drain during hot-swap.
#[derive(Debug)]
struct WaitGroup {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    fn done(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.cond.notify_all();
            }
        }
    }

    fn wait(&self) {
        let Ok(mut count) = self.count.lock() else {
            return;
        };
        while *count > 0 {
            count = match self.cond.wait(count) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }
}

#[derive(Debug)]
struct BorrowableSeeker {
    seeker: Arc<dyn BlockSeeker>,
    is_borrowed: bool,
}

/// The seekers for one volume of a fileset: one original and
/// `fetch_concurrency - 1` clones sharing the original's bloom filter.
#[derive(Debug, Default)]
struct SeekersAndBloom {
    /// Present while the set is being opened (on `active`) or while awaiting
    /// the last return after a rotation (on `inactive`).
    wg: Option<Arc<WaitGroup>>,
    seekers: Vec<BorrowableSeeker>,
    bloom: Option<Arc<BloomFilter>>,
    volume: Volume,
}

impl SeekersAndBloom {
    fn any_borrowed(&self) -> bool {
        self.seekers.iter().any(|s| s.is_borrowed)
    }
}

#[derive(Debug, Default)]
struct RotatableSeekers {
    active: SeekersAndBloom,
    /// Previous volume's seekers during a hot-swap.
    inactive: SeekersAndBloom,
}

#[derive(Debug, Default)]
struct SeekersByTimeState {
    /// Marked by borrows and shard cache warming; the open/close loop only
    /// precaches accessed shards.
    accessed: bool,
    seekers: HashMap<Timestamp, RotatableSeekers>,
}

#[derive(Debug)]
struct SeekersByTime {
    shard: Shard,
    state: RwLock<SeekersByTimeState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekerManagerStatus {
    NotOpen,
    Open,
    Closed,
}

struct ManagerState {
    status: SeekerManagerStatus,
    is_updating_lease: bool,
    namespace: Option<String>,
    /// Sparse array indexed by shard.
    seekers_by_shard: Vec<Arc<SeekersByTime>>,
}

/// One seeker manager per namespace.
pub struct SeekerManager {
    opts: SeekerManagerOptions,
    state: RwLock<ManagerState>,
    lease_manager: Arc<dyn LeaseManager>,
    new_open_seeker_fn: NewOpenSeekerFn,
    /// Shared unread buffer loaned to seekers during open, under its own
    /// lock to avoid double-buffer allocations.
    unread_buf: Mutex<Vec<u8>>,
    resources_pool: ObjectPool<ReusableSeekerResources>,
    loop_shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SeekerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekerManager")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl SeekerManager {
    pub fn new(
        opts: SeekerManagerOptions,
        lease_manager: Arc<dyn LeaseManager>,
        new_open_seeker_fn: NewOpenSeekerFn,
    ) -> Arc<Self> {
        let resources_pool_size = opts.resources_pool_size;
        Arc::new(Self {
            opts,
            state: RwLock::new(ManagerState {
                status: SeekerManagerStatus::NotOpen,
                is_updating_lease: false,
                namespace: None,
                seekers_by_shard: Vec::new(),
            }),
            lease_manager,
            new_open_seeker_fn,
            unread_buf: Mutex::new(Vec::new()),
            resources_pool: ObjectPool::new(
                resources_pool_size,
                ReusableSeekerResources::default,
            ),
            loop_shutdown_tx: Mutex::new(None),
            loop_handle: Mutex::new(None),
        })
    }

    /// Transitions the manager to open, registers it with the lease manager
    /// and spawns the background open/close loop. Double open fails.
    pub fn open(self: &Arc<Self>, namespace: &str) -> Result<(), DbError> {
        {
            let mut state = self.state.write()?;
            if state.status != SeekerManagerStatus::NotOpen {
                return Err(DbError::SeekerManagerAlreadyOpenOrClosed);
            }
            state.namespace = Some(namespace.to_string());
            state.status = SeekerManagerStatus::Open;
        }

        let (tx, rx) = mpsc::channel::<()>();
        let manager = Arc::clone(self);
        let handle = std::thread::spawn(move || manager.open_close_loop(rx));
        *self.loop_shutdown_tx.lock()? = Some(tx);
        *self.loop_handle.lock()? = Some(handle);

        // Register outside the manager lock; the lease manager must never be
        // called while holding it.
        self.lease_manager
            .register_leaser(Arc::clone(self) as Arc<dyn Leaser>)?;

        Ok(())
    }

    /// Marks shards as accessed and eagerly opens all seekable volumes for
    /// them. Missing filesets are expected (sparse shards) and filtered out.
    pub fn cache_shard_indices(&self, shards: &[Shard]) -> Result<(), DbError> {
        let mut multi = MultiError::new();
        for &shard in shards {
            let by_time = self.seekers_by_time(shard)?;
            by_time.state.write()?.accessed = true;
            multi.add_result(self.open_any_unopen_seekers(&by_time));
        }
        multi.final_result()
    }

    /// Fast read-locked bloom filter lookup; opens the seekers on a miss.
    pub fn concurrent_id_bloom_filter(
        &self,
        shard: Shard,
        start: Timestamp,
    ) -> Result<Arc<BloomFilter>, DbError> {
        let by_time = self.seekers_by_time(shard)?;

        {
            let state = by_time.state.read()?;
            if let Some(rot) = state.seekers.get(&start) {
                if rot.active.wg.is_none() {
                    if let Some(bloom) = &rot.active.bloom {
                        return Ok(Arc::clone(bloom));
                    }
                }
            }
        }

        self.ensure_open_seekers(&by_time, start)?;
        let state = by_time.state.read()?;
        let rot = state.seekers.get(&start).ok_or(DbError::SeekersDontExist)?;
        rot.active
            .bloom
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| DbError::Internal("opened seekers carry no bloom filter".to_string()))
    }

    /// Borrows the first free seeker of the active volume, opening the
    /// seekers lazily on first use. Exceeding `fetch_concurrency` concurrent
    /// borrows per fileset is a caller bug and fails with
    /// [`DbError::NoAvailableSeekers`].
    pub fn borrow(&self, shard: Shard, start: Timestamp) -> Result<Arc<dyn BlockSeeker>, DbError> {
        let by_time = self.seekers_by_time(shard)?;
        by_time.state.write()?.accessed = true;

        self.ensure_open_seekers(&by_time, start)?;

        let mut state = by_time.state.write()?;
        let rot = state
            .seekers
            .get_mut(&start)
            .ok_or(DbError::SeekersDontExist)?;
        for borrowable in &mut rot.active.seekers {
            if !borrowable.is_borrowed {
                borrowable.is_borrowed = true;
                db_metrics::record_seeker_borrowed();
                return Ok(Arc::clone(&borrowable.seeker));
            }
        }
        Err(DbError::NoAvailableSeekers)
    }

    /// Returns a borrowed seeker to the exact rotation slot it came from:
    /// active first, then inactive. The return of the last outstanding
    /// inactive seeker closes the whole inactive set and signals the pending
    /// lease update.
    pub fn return_seeker(
        &self,
        shard: Shard,
        start: Timestamp,
        seeker: Arc<dyn BlockSeeker>,
    ) -> Result<(), DbError> {
        let by_time = self.seekers_by_time(shard)?;
        let mut state = by_time.state.write()?;
        let rot = state
            .seekers
            .get_mut(&start)
            .ok_or(DbError::SeekersDontExist)?;

        for borrowable in &mut rot.active.seekers {
            if Arc::ptr_eq(&borrowable.seeker, &seeker) {
                borrowable.is_borrowed = false;
                return Ok(());
            }
        }

        let mut matched = false;
        for borrowable in &mut rot.inactive.seekers {
            if Arc::ptr_eq(&borrowable.seeker, &seeker) {
                borrowable.is_borrowed = false;
                matched = true;
                break;
            }
        }
        if !matched {
            return Err(DbError::ReturnedUnmanagedSeeker);
        }

        if rot.inactive.any_borrowed() {
            return Ok(());
        }

        // Last outstanding inactive seeker: close the set and wake the lease
        // update waiting on the drain.
        let inactive = std::mem::take(&mut rot.inactive);
        let mut multi = MultiError::new();
        for borrowable in inactive.seekers {
            multi.add_result(borrowable.seeker.close());
        }
        if let Some(wg) = inactive.wg {
            wg.done();
        }
        multi.final_result()
    }

    /// Refuses while any seeker is borrowed; unregisters from the lease
    /// manager and waits for the open/close loop to exit (which drains every
    /// remaining seeker).
    pub fn close(&self) -> Result<(), DbError> {
        {
            let mut state = self.state.write()?;
            if state.status == SeekerManagerStatus::Closed {
                return Err(DbError::SeekerManagerAlreadyClosed);
            }

            for by_time in &state.seekers_by_shard {
                let shard_state = by_time.state.read()?;
                for rot in shard_state.seekers.values() {
                    if rot.active.any_borrowed() || rot.inactive.any_borrowed() {
                        return Err(DbError::CantCloseWhileBorrowed);
                    }
                }
            }

            state.status = SeekerManagerStatus::Closed;
        }

        // Unregister outside the manager lock; the lease manager may be
        // concurrently calling update_open_lease on us.
        self.lease_manager.unregister_leaser(self)?;

        if let Some(tx) = self.loop_shutdown_tx.lock()?.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.loop_handle.lock()?.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Earliest block start the retention window still allows seeking.
    pub fn earliest_seekable_block_start(&self) -> Timestamp {
        let now = self.opts.clock.now();
        let flush_start = block_start(
            now.saturating_sub(duration_nanos(self.opts.retention_period)),
            self.opts.block_size,
        );
        flush_start.saturating_sub(duration_nanos(self.opts.block_size))
    }

    /// Latest block start that can have a persisted fileset.
    pub fn latest_seekable_block_start(&self) -> Timestamp {
        block_start(self.opts.clock.now(), self.opts.block_size)
    }

    // --- internals ---

    fn namespace(&self) -> Result<String, DbError> {
        let state = self.state.read()?;
        if state.status != SeekerManagerStatus::Open {
            return Err(DbError::SeekerManagerAlreadyOpenOrClosed);
        }
        state
            .namespace
            .clone()
            .ok_or_else(|| DbError::Internal("open seeker manager has no namespace".to_string()))
    }

    fn seekers_by_time(&self, shard: Shard) -> Result<Arc<SeekersByTime>, DbError> {
        {
            let state = self.state.read()?;
            if let Some(by_time) = state.seekers_by_shard.get(shard as usize) {
                return Ok(Arc::clone(by_time));
            }
        }

        let mut state = self.state.write()?;
        // Raced with another caller growing the array.
        while state.seekers_by_shard.len() <= shard as usize {
            let next_shard = state.seekers_by_shard.len() as Shard;
            state.seekers_by_shard.push(Arc::new(SeekersByTime {
                shard: next_shard,
                state: RwLock::new(SeekersByTimeState::default()),
            }));
        }
        Ok(Arc::clone(&state.seekers_by_shard[shard as usize]))
    }

    /// Makes sure open seekers exist for (shard, start), coordinating racing
    /// openers through a waitgroup published on the placeholder entry so the
    /// I/O-heavy open happens outside the shard lock.
    fn ensure_open_seekers(
        &self,
        by_time: &Arc<SeekersByTime>,
        start: Timestamp,
    ) -> Result<(), DbError> {
        loop {
            enum Action {
                Ready,
                Wait(Arc<WaitGroup>),
                Open(Arc<WaitGroup>),
            }

            let action = {
                let mut state = by_time.state.write()?;
                match state.seekers.get(&start) {
                    Some(rot) => match &rot.active.wg {
                        None => Action::Ready,
                        Some(wg) => Action::Wait(Arc::clone(wg)),
                    },
                    None => {
                        let wg = Arc::new(WaitGroup::new(1));
                        let placeholder = RotatableSeekers {
                            active: SeekersAndBloom {
                                wg: Some(Arc::clone(&wg)),
                                ..SeekersAndBloom::default()
                            },
                            inactive: SeekersAndBloom::default(),
                        };
                        state.seekers.insert(start, placeholder);
                        Action::Open(wg)
                    }
                }
            };

            match action {
                Action::Ready => return Ok(()),
                Action::Wait(wg) => {
                    // Another caller is opening this fileset; wait and
                    // re-check the map for the new state.
                    wg.wait();
                    continue;
                }
                Action::Open(wg) => {
                    let opened = self.open_latest_seekers(by_time.shard, start);
                    let mut state = by_time.state.write()?;
                    // Signal waiters after reacquiring the lock so they
                    // observe the final entry state.
                    wg.done();
                    return match opened {
                        Ok(seekers) => {
                            match state.seekers.get_mut(&start) {
                                Some(rot) => rot.active = seekers,
                                None => {
                                    // The placeholder was dropped while the
                                    // open ran (entry expired); don't leak
                                    // the fresh set.
                                    for borrowable in seekers.seekers {
                                        let _ = borrowable.seeker.close();
                                    }
                                }
                            }
                            Ok(())
                        }
                        Err(err) => {
                            // Remove the placeholder so a later caller can
                            // retry the open.
                            state.seekers.remove(&start);
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Asks the lease manager which volume is current, then opens the seeker
    /// set for it.
    fn open_latest_seekers(
        &self,
        shard: Shard,
        start: Timestamp,
    ) -> Result<SeekersAndBloom, DbError> {
        let namespace = self.namespace()?;
        let state = self.lease_manager.open_latest_lease(
            self,
            &LeaseDescriptor {
                namespace,
                shard,
                block_start: start,
            },
        )?;
        self.new_seekers_and_bloom(shard, start, state.volume)
    }

    fn new_seekers_and_bloom(
        &self,
        shard: Shard,
        start: Timestamp,
        volume: Volume,
    ) -> Result<SeekersAndBloom, DbError> {
        let original = self.new_open_seeker(shard, start, volume)?;

        let mut seekers = Vec::with_capacity(self.opts.fetch_concurrency);
        let bloom = original.id_bloom_filter();
        seekers.push(BorrowableSeeker {
            seeker: Arc::clone(&original),
            is_borrowed: false,
        });

        // Cloning is cheap; shares the immutable fileset data.
        for _ in 0..self.opts.fetch_concurrency.saturating_sub(1) {
            match original.concurrent_clone() {
                Ok(clone) => seekers.push(BorrowableSeeker {
                    seeker: clone,
                    is_borrowed: false,
                }),
                Err(err) => {
                    // Don't leak the seekers opened so far.
                    let mut multi = MultiError::new();
                    multi.add(err);
                    for borrowable in seekers {
                        multi.add_result(borrowable.seeker.close());
                    }
                    return Err(multi
                        .final_result()
                        .expect_err("multi error holds at least the clone error"));
                }
            }
        }

        Ok(SeekersAndBloom {
            wg: None,
            seekers,
            bloom: Some(bloom),
            volume,
        })
    }

    fn new_open_seeker(
        &self,
        shard: Shard,
        start: Timestamp,
        volume: Volume,
    ) -> Result<Arc<dyn BlockSeeker>, DbError> {
        let namespace = self.namespace()?;
        let request = OpenSeekerRequest {
            namespace,
            shard,
            block_start: start,
            volume,
        };

        let mut resources = self.resources_pool.get();
        let opened = {
            let mut unread = self.unread_buf.lock()?;
            resources.unread_buf = std::mem::take(&mut *unread);
            let opened = (self.new_open_seeker_fn)(&request, &mut resources);
            // Reclaim the buffer; the open may have grown it.
            *unread = std::mem::take(&mut resources.unread_buf);
            opened
        };
        resources.scratch.clear();
        self.resources_pool.put(resources);

        let seeker = opened?;
        db_metrics::record_seeker_opened();
        Ok(seeker)
    }

    fn open_any_unopen_seekers(&self, by_time: &Arc<SeekersByTime>) -> Result<(), DbError> {
        let earliest = self.earliest_seekable_block_start();
        let latest = self.latest_seekable_block_start();
        let step = duration_nanos(self.opts.block_size);
        let mut multi = MultiError::new();

        let mut t = earliest;
        while t <= latest {
            match self.ensure_open_seekers(by_time, t) {
                Ok(()) => {}
                // Sparse shards are expected; not every block has a fileset.
                Err(DbError::FileSetNotFound { .. }) => {}
                Err(err) => multi.add(err),
            }
            t = t.saturating_add(step);
        }

        multi.final_result()
    }

    fn open_close_loop(self: Arc<Self>, shutdown_rx: mpsc::Receiver<()>) {
        self.opts
            .event_listener
            .on_event(DbEvent::OpenCloseLoopStarted);

        loop {
            match shutdown_rx.recv_timeout(self.opts.close_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let open = self
                        .state
                        .read()
                        .map(|s| s.status == SeekerManagerStatus::Open)
                        .unwrap_or(false);
                    if !open {
                        break;
                    }
                    self.open_close_loop_pass();
                }
            }
        }

        self.drain_all_seekers();
        self.opts
            .event_listener
            .on_event(DbEvent::OpenCloseLoopStopping);
    }

    fn open_close_loop_pass(&self) {
        let earliest = self.earliest_seekable_block_start();

        let by_times: Vec<Arc<SeekersByTime>> = match self.state.read() {
            Ok(state) => state.seekers_by_shard.to_vec(),
            Err(_) => return,
        };

        // Open pass: precache accessed shards.
        for by_time in &by_times {
            let accessed = by_time
                .state
                .read()
                .map(|s| s.accessed)
                .unwrap_or(false);
            if !accessed {
                continue;
            }
            if let Err(err) = self.open_any_unopen_seekers(by_time) {
                self.opts.event_listener.on_event(DbEvent::SeekerOpenFailed {
                    shard: by_time.shard,
                    block_start: earliest,
                    error: err.to_string(),
                });
            }
        }

        // Close pass: drop fully returned entries that fell behind the
        // earliest seekable block start.
        for by_time in &by_times {
            let mut closing: Vec<(Timestamp, BorrowableSeeker)> = Vec::new();
            if let Ok(mut state) = by_time.state.write() {
                let expired: Vec<Timestamp> = state
                    .seekers
                    .keys()
                    .copied()
                    .filter(|&t| t < earliest)
                    .collect();
                for t in expired {
                    let fully_returned = state
                        .seekers
                        .get(&t)
                        .map(|rot| !rot.active.any_borrowed() && !rot.inactive.any_borrowed())
                        .unwrap_or(false);
                    // Clones share resources with their original; never
                    // close a set while any member is still out.
                    if fully_returned {
                        if let Some(rot) = state.seekers.remove(&t) {
                            closing.extend(rot.active.seekers.into_iter().map(|s| (t, s)));
                            closing.extend(rot.inactive.seekers.into_iter().map(|s| (t, s)));
                        }
                    }
                }
            }

            // Close outside the lock; closing does I/O.
            for (t, borrowable) in closing {
                if let Err(err) = borrowable.seeker.close() {
                    self.opts
                        .event_listener
                        .on_event(DbEvent::SeekerCloseFailed {
                            shard: by_time.shard,
                            block_start: t,
                            error: err.to_string(),
                        });
                }
            }
        }
    }

    /// Releases every held seeker; runs as the open/close loop exits. The
    /// borrow invariant in [`Self::close`] guarantees none are outstanding.
    fn drain_all_seekers(&self) {
        let by_times: Vec<Arc<SeekersByTime>> = match self.state.read() {
            Ok(state) => state.seekers_by_shard.to_vec(),
            Err(_) => return,
        };

        for by_time in by_times {
            let drained: Vec<RotatableSeekers> = match by_time.state.write() {
                Ok(mut state) => state.seekers.drain().map(|(_, rot)| rot).collect(),
                Err(_) => continue,
            };
            for rot in drained {
                for borrowable in rot.active.seekers.into_iter().chain(rot.inactive.seekers) {
                    if let Err(err) = borrowable.seeker.close() {
                        self.opts
                            .event_listener
                            .on_event(DbEvent::SeekerCloseFailed {
                                shard: by_time.shard,
                                block_start: 0,
                                error: err.to_string(),
                            });
                    }
                }
            }
        }
    }

    /// The hot-swap: opens the new volume's seekers outside any lock,
    /// rotates them in under the shard lock, and hands back the waitgroup to
    /// drain still-borrowed seekers of the previous volume.
    fn hot_swap_seekers(
        &self,
        descriptor: &LeaseDescriptor,
        state: LeaseState,
    ) -> Result<(Option<Arc<WaitGroup>>, UpdateOpenLeaseResult), DbError> {
        enum Swap {
            Installed,
            Wait(Arc<WaitGroup>),
            OutOfOrder,
            Rotated(Option<Arc<WaitGroup>>, Vec<BorrowableSeeker>),
        }

        let mut new_active = Some(self.new_seekers_and_bloom(
            descriptor.shard,
            descriptor.block_start,
            state.volume,
        )?);
        let by_time = self.seekers_by_time(descriptor.shard)?;

        loop {
            let decision = {
                let mut shard_state = by_time.state.write()?;
                if let Some(rot) = shard_state.seekers.get_mut(&descriptor.block_start) {
                    if let Some(wg) = &rot.active.wg {
                        // A sibling opener owns the entry; wait it out.
                        Swap::Wait(Arc::clone(wg))
                    } else if rot.active.volume >= state.volume {
                        Swap::OutOfOrder
                    } else {
                        let taken = new_active.take().expect("new seekers consumed once");
                        rot.inactive = std::mem::replace(&mut rot.active, taken);

                        if rot.inactive.any_borrowed() {
                            let wg = Arc::new(WaitGroup::new(1));
                            rot.inactive.wg = Some(Arc::clone(&wg));
                            Swap::Rotated(Some(wg), Vec::new())
                        } else {
                            // Nothing borrowed; the previous volume can be
                            // released right away.
                            let inactive = std::mem::take(&mut rot.inactive);
                            Swap::Rotated(None, inactive.seekers)
                        }
                    }
                } else {
                    // No existing seekers; install the new set directly.
                    let taken = new_active.take().expect("new seekers consumed once");
                    shard_state.seekers.insert(
                        descriptor.block_start,
                        RotatableSeekers {
                            active: taken,
                            inactive: SeekersAndBloom::default(),
                        },
                    );
                    Swap::Installed
                }
            };

            match decision {
                Swap::Installed => return Ok((None, UpdateOpenLeaseResult::NoOpenLease)),
                Swap::Wait(wg) => wg.wait(),
                Swap::OutOfOrder => {
                    let taken = new_active.take().expect("new seekers consumed once");
                    self.close_seekers_logging(descriptor, taken.seekers);
                    return Err(DbError::OutOfOrderUpdateOpenLease);
                }
                Swap::Rotated(wg, to_close) => {
                    // Close outside the shard lock; closing does I/O.
                    self.close_seekers_logging(descriptor, to_close);
                    self.opts
                        .event_listener
                        .on_event(DbEvent::SeekerVolumeRotated {
                            shard: descriptor.shard,
                            block_start: descriptor.block_start,
                            volume: state.volume,
                        });
                    return Ok((wg, UpdateOpenLeaseResult::UpdateOpenLease));
                }
            }
        }
    }

    fn close_seekers_logging(&self, descriptor: &LeaseDescriptor, seekers: Vec<BorrowableSeeker>) {
        for borrowable in seekers {
            if let Err(err) = borrowable.seeker.close() {
                self.opts.event_listener.on_event(DbEvent::SeekerCloseFailed {
                    shard: descriptor.shard,
                    block_start: descriptor.block_start,
                    error: err.to_string(),
                });
            }
        }
    }
}

impl Leaser for SeekerManager {
    /// Hot-swaps to the volume in `state`. When this returns successfully no
    /// resources from any prior volume remain: every borrowed seeker of the
    /// previous volume has been returned and closed.
    fn update_open_lease(
        &self,
        descriptor: &LeaseDescriptor,
        state: LeaseState,
    ) -> Result<UpdateOpenLeaseResult, DbError> {
        let started = Instant::now();

        {
            let mut mgr = self.state.write()?;
            if mgr.status != SeekerManagerStatus::Open {
                return Err(DbError::UpdateOpenLeaseNotOpen);
            }
            if mgr.is_updating_lease {
                // Correctness would survive concurrent updates for different
                // filesets, but callers have no need for them; keep the
                // simple guard.
                return Err(DbError::ConcurrentUpdateOpenLeaseNotAllowed);
            }
            if mgr.namespace.as_deref() != Some(descriptor.namespace.as_str()) {
                return Ok(UpdateOpenLeaseResult::NoOpenLease);
            }
            mgr.is_updating_lease = true;
        }

        let outcome = (|| {
            let (wg, result) = self.hot_swap_seekers(descriptor, state)?;
            if let Some(wg) = wg {
                // Block until the last inactive seeker is returned; its
                // return closes the set and signals this waitgroup.
                wg.wait();
            }
            Ok(result)
        })();

        if let Ok(mut mgr) = self.state.write() {
            mgr.is_updating_lease = false;
        }

        db_metrics::record_lease_update(started.elapsed());
        outcome
    }
}
