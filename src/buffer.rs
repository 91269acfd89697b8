//! Per-series in-memory write buffer: block-aligned, version-tagged buckets
//! of immutable stream encoders. Classifies writes as warm or cold, produces
//! merged streams for snapshots and flushes, and performs tick-time
//! maintenance (version-based eviction, duplicate encoder merging).
//!
//! The buffer performs no internal locking; the enclosing shard owns the
//! series and is responsible for synchronization.

use crate::encoding::{
    segment_checksum, BlockReader, Encoder, MultiReaderIterator, Segment, SegmentReader,
    StreamEncoder,
};
use crate::error::DbError;
use crate::pool::ObjectPool;
use crate::telemetry::{db_metrics, noop_event_listener, DbEvent, EventListener};
use crate::clock::{system_clock, ClockHandle};
use crate::types::{
    block_start, duration_nanos, BlockStates, Datapoint, FlushOutcome, OptimizedTimes, SeriesId,
    Tags, TimeUnit, Timestamp, TruncateType, Value, Volume, WriteOptions, WriteType,
    WRITABLE_BUCKET_VERSION,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Size of the most-recently-accessed bucket cache kept alongside the bucket
/// map.
pub const BUCKETS_CACHE_SIZE: usize = 2;

/// Persist function invoked by snapshot and flush with the merged segment and
/// its checksum. Performs disk I/O; the buffer mutates its own state only
/// before and after the call, never concurrently with it.
pub type PersistFn<'a> =
    dyn FnMut(&[u8], &Tags, &Segment, u32) -> Result<(), DbError> + 'a;

/// Shared object pools for buffer containers. Pools hand out ownership and
/// expect it back on reset; containers hold no back-pointers to the pools.
pub struct BufferPools {
    encoders: ObjectPool<Box<dyn Encoder>>,
    buckets: ObjectPool<BufferBucket>,
    bucket_versions: ObjectPool<BufferBucketVersions>,
}

impl std::fmt::Debug for BufferPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPools").finish_non_exhaustive()
    }
}

impl BufferPools {
    pub fn new(capacity: usize) -> Self {
        Self {
            encoders: ObjectPool::new(capacity, || {
                Box::new(StreamEncoder::default()) as Box<dyn Encoder>
            }),
            buckets: ObjectPool::new(capacity, BufferBucket::default),
            bucket_versions: ObjectPool::new(capacity, BufferBucketVersions::default),
        }
    }

    fn encoder(&self, block_start: Timestamp) -> Box<dyn Encoder> {
        let mut encoder = self.encoders.get();
        encoder.reset(block_start);
        encoder
    }

    fn recycle_encoder(&self, mut encoder: Box<dyn Encoder>) {
        encoder.close();
        self.encoders.put(encoder);
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new(crate::pool::DEFAULT_POOL_SIZE)
    }
}

/// Configuration for a series buffer. One instance is shared by every series
/// of a namespace shard.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Size of one time block.
    pub block_size: Duration,
    /// How far in the past a write may land and still be warm.
    pub buffer_past: Duration,
    /// How far in the future a write may land and still be warm.
    pub buffer_future: Duration,
    /// Total retention window; cold writes older than this are rejected.
    pub retention_period: Duration,
    /// Future retention window; cold writes beyond it (plus one block) are rejected.
    pub future_retention_period: Duration,
    /// Whether cold (out-of-window) writes are accepted at all.
    pub cold_writes_enabled: bool,
    pub clock: ClockHandle,
    pub event_listener: Arc<dyn EventListener>,
    pub pools: Arc<BufferPools>,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            block_size: Duration::from_secs(2 * 3600),
            buffer_past: Duration::from_secs(10 * 60),
            buffer_future: Duration::from_secs(2 * 60),
            retention_period: Duration::from_secs(48 * 3600),
            future_retention_period: Duration::ZERO,
            cold_writes_enabled: false,
            clock: system_clock(),
            event_listener: noop_event_listener(),
            pools: Arc::new(BufferPools::default()),
        }
    }
}

/// Result of one buffer tick.
#[derive(Debug, Default)]
pub struct BufferTickResult {
    /// Number of block starts whose warm encoders were merged to reclaim memory.
    pub merged_out_of_order_blocks: usize,
    /// Block starts whose buckets were fully evicted; the owning shard uses
    /// these to invalidate its block cache entries.
    pub evicted_bucket_times: OptimizedTimes,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    /// Number of block starts currently wired in memory.
    pub wired_blocks: usize,
}

/// Unmerged streams for one block start.
#[derive(Debug)]
pub struct FetchBlockResult {
    pub start: Timestamp,
    pub readers: Vec<BlockReader>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchBlocksMetadataOptions {
    pub include_sizes: bool,
    pub include_last_read: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchBlockMetadataResult {
    pub start: Timestamp,
    pub size: Option<usize>,
    pub last_read: Option<Timestamp>,
}

/// An opaque immutable block supplied by the bootstrap process.
#[derive(Debug, Clone)]
pub struct BootstrapBlock {
    pub start: Timestamp,
    pub segment: Segment,
}

/// The per-series write buffer.
#[derive(Debug)]
pub struct SeriesBuffer {
    id: SeriesId,
    tags: Tags,
    opts: BufferOptions,

    /// Block start to its bucket versions.
    buckets_map: HashMap<Timestamp, BufferBucketVersions>,
    /// Most-recently-accessed block starts, newest first. Every entry must
    /// also be a key of `buckets_map`.
    bucket_cache: [Option<Timestamp>; BUCKETS_CACHE_SIZE],
    /// Chronologically sorted keys of `buckets_map`, maintained to avoid
    /// sorting ad hoc when operating in time order.
    in_order_block_starts: Vec<Timestamp>,
}

impl SeriesBuffer {
    pub fn new(id: SeriesId, tags: Tags, opts: BufferOptions) -> Self {
        Self {
            id,
            tags,
            opts,
            buckets_map: HashMap::new(),
            bucket_cache: [None; BUCKETS_CACHE_SIZE],
            in_order_block_starts: Vec::with_capacity(BUCKETS_CACHE_SIZE),
        }
    }

    /// Rebinds a pooled buffer to a new series, dropping all held state.
    pub fn reset(&mut self, id: SeriesId, tags: Tags, opts: BufferOptions) {
        let pools = self.opts.pools.clone();
        let starts: Vec<Timestamp> = self.buckets_map.keys().copied().collect();
        for start in starts {
            if let Some(mut bv) = self.buckets_map.remove(&start) {
                bv.clear(&pools);
                pools.bucket_versions.put(bv);
            }
        }
        self.bucket_cache = [None; BUCKETS_CACHE_SIZE];
        self.in_order_block_starts.clear();
        self.id = id;
        self.tags = tags;
        self.opts = opts;
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Ingests one datapoint, classifying it against the current buffer
    /// window and dispatching it to the writable bucket for its block start.
    /// Returns `Ok(false)` when the write was a no-op (same timestamp and
    /// value as an existing point).
    pub fn write(
        &mut self,
        timestamp: Timestamp,
        value: Value,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
        w_opts: &WriteOptions,
    ) -> Result<bool, DbError> {
        let now = self.opts.clock.now();
        let past_limit = now.saturating_sub(duration_nanos(self.opts.buffer_past));
        let future_limit = now.saturating_add(duration_nanos(self.opts.buffer_future));

        let write_type = if timestamp >= past_limit && timestamp < future_limit {
            WriteType::Warm
        } else {
            WriteType::Cold
        };

        if write_type == WriteType::Cold {
            if !self.opts.cold_writes_enabled {
                return Err(DbError::invalid_params(format!(
                    "datapoint outside buffer window: timestamp={}, past_limit={}, future_limit={}",
                    timestamp, past_limit, future_limit
                )));
            }
            if timestamp < now.saturating_sub(duration_nanos(self.opts.retention_period)) {
                return Err(DbError::TooPast);
            }
            let future_bound = now
                .saturating_add(duration_nanos(self.opts.future_retention_period))
                .saturating_add(duration_nanos(self.opts.block_size));
            if timestamp >= future_bound {
                return Err(DbError::TooFuture);
            }
        }

        let start = block_start(timestamp, self.opts.block_size);
        let pools = self.opts.pools.clone();

        let mut timestamp = timestamp;
        if w_opts.truncate_type == TruncateType::Block {
            timestamp = start;
        }
        let value = w_opts.force_value.unwrap_or(value);

        self.bucket_versions_at_create(start);
        self.put_bucket_in_cache(start);
        let bv = self
            .buckets_map
            .get_mut(&start)
            .expect("bucket versions were just created");

        let written = bv.write(timestamp, value, unit, annotation, write_type, &pools)?;
        if written {
            db_metrics::record_buffer_write();
        }
        Ok(written)
    }

    /// Registers a bootstrapped block. Bootstrap buckets are merged into
    /// reads and snapshots but never participate in cold flush version
    /// rotation; they live until their block start is evicted.
    pub fn bootstrap(&mut self, block: BootstrapBlock) {
        let pools = self.opts.pools.clone();
        let start = block.start;
        self.bucket_versions_at_create(start);
        let bv = self
            .buckets_map
            .get_mut(&start)
            .expect("bucket versions were just created");
        bv.bootstrap(block, &pools);
    }

    /// A buffer is empty iff no buckets are wired: buckets are created on the
    /// first write for a block start and removed when evicted.
    pub fn is_empty(&self) -> bool {
        self.buckets_map.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            wired_blocks: self.buckets_map.len(),
        }
    }

    /// Block starts that still hold cold data needing a flush: a cold bucket
    /// that is writable, or one whose version exceeds the durably flushed
    /// cold version recorded in `block_states` (a prior cold flush made it
    /// partway and must be retried).
    pub fn cold_flush_block_starts(&self, block_states: &BlockStates) -> OptimizedTimes {
        let mut times = OptimizedTimes::default();
        for (&t, bv) in &self.buckets_map {
            let flushed_version = block_states
                .get(&t)
                .map(|s| s.cold_version)
                .unwrap_or(0);
            for bucket in &bv.buckets {
                if bucket.write_type == WriteType::Cold
                    && (bucket.version == WRITABLE_BUCKET_VERSION
                        || bucket.version > flushed_version)
                {
                    times.add(t);
                    break;
                }
            }
        }
        times
    }

    /// Merges all buckets for `start` (warm and cold, every version) into a
    /// single stream and persists it. Returns silently when the block holds
    /// no data or the merged segment is empty.
    pub fn snapshot(
        &mut self,
        start: Timestamp,
        persist_fn: &mut PersistFn<'_>,
    ) -> Result<(), DbError> {
        let pools = self.opts.pools.clone();
        let id = self.id.clone();
        let tags = self.tags.clone();

        let streams = match self.buckets_map.get_mut(&start) {
            Some(bv) => bv.merge_to_streams(None, &pools)?,
            None => return Ok(()),
        };
        if streams.is_empty() {
            return Ok(());
        }

        // Snapshot must take both cold and warm writes because cold flushes
        // don't happen for the current block. The per-bucket merge above does
        // not merge across write types or versions, so merge once more here.
        let stream = if streams.len() == 1 {
            streams.into_iter().next().expect("one stream")
        } else {
            let (encoder, _) = merge_streams_to_encoder(start, streams, &pools)?;
            let stream = encoder.stream();
            pools.recycle_encoder(encoder);
            match stream {
                Some(s) => s,
                // Don't write out series with no data.
                None => return Ok(()),
            }
        };

        let segment = stream.to_segment()?;
        if segment.is_empty() {
            return Ok(());
        }

        let checksum = segment_checksum(&segment);
        db_metrics::record_flush_segment_bytes(segment.len() as u64);
        persist_fn(&id, &tags, &segment, checksum)
    }

    /// Merges only warm buckets for `start` and persists the result. On
    /// success the writable warm bucket's version becomes `1` (warm flushes
    /// happen once per block). I/O errors leave the bucket unchanged so the
    /// flush is retried on the next cycle.
    pub fn warm_flush(
        &mut self,
        start: Timestamp,
        persist_fn: &mut PersistFn<'_>,
    ) -> Result<FlushOutcome, DbError> {
        let pools = self.opts.pools.clone();
        let id = self.id.clone();
        let tags = self.tags.clone();

        let bv = match self.buckets_map.get_mut(&start) {
            Some(bv) => bv,
            None => return Ok(FlushOutcome::BlockDoesNotExist),
        };

        // Only warm buckets; cold writes are persisted via the compaction
        // cycle. Multiple streams only occur when a previous flush failed
        // midway; merge them to one stream and retry.
        let streams = bv.merge_to_streams(Some(WriteType::Warm), &pools)?;
        let stream = match streams.len() {
            0 => return Ok(FlushOutcome::BlockDoesNotExist),
            1 => streams.into_iter().next().expect("one stream"),
            _ => {
                let (encoder, _) = merge_streams_to_encoder(start, streams, &pools)?;
                let stream = encoder.stream();
                pools.recycle_encoder(encoder);
                match stream {
                    Some(s) => s,
                    None => return Ok(FlushOutcome::BlockDoesNotExist),
                }
            }
        };

        let segment = stream.to_segment()?;
        if segment.is_empty() {
            // Empty segment is equivalent to no stream: data does not exist.
            return Ok(FlushOutcome::BlockDoesNotExist);
        }

        let checksum = segment_checksum(&segment);
        db_metrics::record_flush_segment_bytes(segment.len() as u64);
        persist_fn(&id, &tags, &segment, checksum)?;

        if let Some(bucket) = bv.writable_bucket_mut(WriteType::Warm) {
            bucket.version = 1;
        }

        Ok(FlushOutcome::FlushedToDisk)
    }

    /// Returns merged cold-only streams for `start` and promotes the
    /// writable cold bucket to `version`, marking it as belonging to the
    /// cold fileset volume about to be persisted.
    pub fn fetch_blocks_for_cold_flush(
        &mut self,
        start: Timestamp,
        version: Volume,
    ) -> Result<Vec<BlockReader>, DbError> {
        let pools = self.opts.pools.clone();
        let block_size = self.opts.block_size;

        let bv = match self.buckets_map.get_mut(&start) {
            // Checked as having cold data before this call; missing buckets
            // mean the block fell out of retention and was evicted since.
            None => return Ok(Vec::new()),
            Some(bv) => bv,
        };

        let streams = bv.merge_to_streams(Some(WriteType::Cold), &pools)?;
        if streams.is_empty() {
            return Ok(Vec::new());
        }

        match bv.writable_bucket_mut(WriteType::Cold) {
            Some(bucket) => bucket.version = version,
            None => return Err(DbError::NoWritableBucket { block_start: start }),
        }

        Ok(streams
            .into_iter()
            .map(|reader| BlockReader {
                reader,
                start,
                block_size,
            })
            .collect())
    }

    /// Returns one entry per overlapping block start in chronological order,
    /// each holding the readers of all buckets at that block start, and
    /// records the access time.
    pub fn read_encoded(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Vec<BlockReader>>, DbError> {
        let block_size = self.opts.block_size;
        let block_size_ns = duration_nanos(block_size);
        let now = self.opts.clock.now();
        let mut res = Vec::new();

        for &t in &self.in_order_block_starts {
            if t >= end || start >= t.saturating_add(block_size_ns) {
                continue;
            }

            let bv = match self.buckets_map.get(&t) {
                Some(bv) => bv,
                None => return Err(self.bucket_cache_out_of_sync(t)),
            };

            let streams = bv.streams(None, block_size);
            if !streams.is_empty() {
                res.push(streams);
            }

            // Reads initiated by external entities update access statistics;
            // fetch_blocks (node-to-node streaming) deliberately does not.
            bv.set_last_read(now);
        }

        Ok(res)
    }

    /// Unmerged streams for explicit block starts, ascending. Does not touch
    /// access statistics.
    pub fn fetch_blocks(&self, starts: &[Timestamp]) -> Vec<FetchBlockResult> {
        let block_size = self.opts.block_size;
        let mut res: Vec<FetchBlockResult> = Vec::new();

        for &start in starts {
            if let Some(bv) = self.buckets_map.get(&start) {
                let readers = bv.streams(None, block_size);
                if !readers.is_empty() {
                    res.push(FetchBlockResult { start, readers });
                }
            }
        }

        res.sort_by_key(|r| r.start);
        res
    }

    /// Stream sizes and last-read times per overlapping block, skipping
    /// blocks with no data.
    pub fn fetch_blocks_metadata(
        &self,
        start: Timestamp,
        end: Timestamp,
        opts: FetchBlocksMetadataOptions,
    ) -> Result<Vec<FetchBlockMetadataResult>, DbError> {
        let block_size_ns = duration_nanos(self.opts.block_size);
        let mut res = Vec::new();

        for &t in &self.in_order_block_starts {
            if t >= end || start >= t.saturating_add(block_size_ns) {
                continue;
            }

            let bv = match self.buckets_map.get(&t) {
                Some(bv) => bv,
                None => return Err(self.bucket_cache_out_of_sync(t)),
            };

            let size = bv.streams_len();
            if size == 0 {
                continue;
            }

            res.push(FetchBlockMetadataResult {
                start: t,
                size: opts.include_sizes.then_some(size),
                last_read: opts.include_last_read.then(|| bv.last_read()),
            });
        }

        Ok(res)
    }

    /// Periodic maintenance: drops bucket versions that the shard has
    /// recorded as durably persisted, removes bucket sets that hold no
    /// streams, and merges duplicate warm encoders in the remainder.
    pub fn tick(&mut self, block_states: &BlockStates) -> BufferTickResult {
        let pools = self.opts.pools.clone();
        let mut merged_out_of_order = 0;
        let mut evicted = OptimizedTimes::default();

        let starts: Vec<Timestamp> = self.in_order_block_starts.clone();
        for t in starts {
            // The block states are a snapshot; real flush versions may be
            // higher. That is safe: an under-removed bucket is collected on
            // the next tick.
            let state = block_states.get(&t).copied().unwrap_or_default();
            let mut remove = false;

            if let Some(bv) = self.buckets_map.get_mut(&t) {
                if state.warm_retrievable || state.cold_version > 0 {
                    if state.warm_retrievable {
                        // Warm buckets that persisted are always version 1.
                        bv.remove_buckets_up_to_version(WriteType::Warm, 1, &pools);
                    }
                    if state.cold_version > 0 {
                        bv.remove_buckets_up_to_version(
                            WriteType::Cold,
                            state.cold_version,
                            &pools,
                        );
                    }
                    remove = bv.streams_len() == 0;
                }

                if !remove {
                    match bv.merge(WriteType::Warm, &pools) {
                        Ok(merges) => {
                            if merges > 0 {
                                merged_out_of_order += 1;
                                db_metrics::record_buffer_merges(merges as u64);
                            }
                        }
                        Err(err) => {
                            self.opts.event_listener.on_event(DbEvent::BufferMergeFailed {
                                block_start: t,
                                error: err.to_string(),
                            });
                        }
                    }
                }
            }

            if remove {
                // All underlying buckets persisted; drop the set and tell the
                // shard so it invalidates its now-stale cache entry.
                self.remove_bucket_versions_at(t);
                self.opts
                    .event_listener
                    .on_event(DbEvent::BufferBucketsEvicted { block_start: t });
                evicted.add(t);
            }
        }

        BufferTickResult {
            merged_out_of_order_blocks: merged_out_of_order,
            evicted_bucket_times: evicted,
        }
    }

    /// Chronologically sorted block starts currently wired.
    pub fn block_starts(&self) -> Vec<Timestamp> {
        self.in_order_block_starts.clone()
    }

    /// Block starts currently in the recency cache, newest first.
    pub fn cached_block_starts(&self) -> Vec<Timestamp> {
        self.bucket_cache.iter().filter_map(|t| *t).collect()
    }

    fn bucket_cache_out_of_sync(&self, t: Timestamp) -> DbError {
        // The sorted key cache disagrees with the bucket map; this should
        // never happen.
        let err = DbError::BucketMapCacheNotInSync { block_start: t };
        self.opts
            .event_listener
            .on_event(DbEvent::InvariantViolated {
                detail: err.to_string(),
            });
        err
    }

    fn bucket_versions_at_create(&mut self, t: Timestamp) {
        if self.buckets_map.contains_key(&t) {
            return;
        }
        let pools = self.opts.pools.clone();
        let mut bv = pools.bucket_versions.get();
        bv.reset_to(t);
        self.buckets_map.insert(t, bv);
        self.in_order_block_starts_add(t);
    }

    fn put_bucket_in_cache(&mut self, t: Timestamp) {
        let mut replace_idx = BUCKETS_CACHE_SIZE - 1;
        for (i, cached) in self.bucket_cache.iter().enumerate() {
            if *cached == Some(t) {
                replace_idx = i;
            }
        }
        for i in (1..=replace_idx).rev() {
            self.bucket_cache[i] = self.bucket_cache[i - 1];
        }
        self.bucket_cache[0] = Some(t);
    }

    fn remove_bucket_from_cache(&mut self, t: Timestamp) {
        let mut nil_idx = None;
        for (i, cached) in self.bucket_cache.iter().enumerate() {
            if *cached == Some(t) {
                nil_idx = Some(i);
            }
        }
        let Some(nil_idx) = nil_idx else { return };
        for i in nil_idx..BUCKETS_CACHE_SIZE - 1 {
            self.bucket_cache[i] = self.bucket_cache[i + 1];
        }
        self.bucket_cache[BUCKETS_CACHE_SIZE - 1] = None;
    }

    fn remove_bucket_versions_at(&mut self, t: Timestamp) {
        let pools = self.opts.pools.clone();
        if let Some(mut bv) = self.buckets_map.remove(&t) {
            self.remove_bucket_from_cache(t);
            self.in_order_block_starts_remove(t);
            bv.clear(&pools);
            pools.bucket_versions.put(bv);
        }
    }

    fn in_order_block_starts_add(&mut self, t: Timestamp) {
        // There are few starts; linear search is fine.
        let idx = self
            .in_order_block_starts
            .iter()
            .position(|&existing| existing > t)
            .unwrap_or(self.in_order_block_starts.len());
        self.in_order_block_starts.insert(idx, t);
    }

    fn in_order_block_starts_remove(&mut self, t: Timestamp) {
        if let Some(idx) = self.in_order_block_starts.iter().position(|&e| e == t) {
            self.in_order_block_starts.remove(idx);
        }
    }
}

/// Groups all buckets for one block start across write types and versions.
/// Bucket versions separate writes already persisted as a fileset from those
/// that are not: the bucket at [`WRITABLE_BUCKET_VERSION`] receives all
/// writes; after persisting, a bucket's version is set to the durable volume
/// the shard hands down.
#[derive(Debug, Default)]
pub struct BufferBucketVersions {
    start: Timestamp,
    buckets: Vec<BufferBucket>,
    last_read_nanos: AtomicU64,
}

impl BufferBucketVersions {
    fn reset_to(&mut self, start: Timestamp) {
        debug_assert!(self.buckets.is_empty(), "pooled bucket versions not cleared");
        self.start = start;
        self.last_read_nanos.store(0, Ordering::Release);
    }

    fn clear(&mut self, pools: &BufferPools) {
        for mut bucket in self.buckets.drain(..) {
            bucket.clear(pools);
            pools.buckets.put(bucket);
        }
        self.start = 0;
        self.last_read_nanos.store(0, Ordering::Release);
    }

    fn write(
        &mut self,
        timestamp: Timestamp,
        value: Value,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
        write_type: WriteType,
        pools: &BufferPools,
    ) -> Result<bool, DbError> {
        let start = self.start;
        self.writable_bucket_create(write_type, pools)
            .write(timestamp, value, unit, annotation, start, pools)
    }

    fn bootstrap(&mut self, block: BootstrapBlock, pools: &BufferPools) {
        self.writable_bucket_create(WriteType::Bootstrap, pools)
            .bootstrapped
            .push(block);
    }

    /// All streams across buckets, optionally filtered by write type.
    fn streams(&self, filter: Option<WriteType>, block_size: Duration) -> Vec<BlockReader> {
        let mut res = Vec::new();
        for bucket in &self.buckets {
            if filter.map_or(true, |wt| bucket.write_type == wt) {
                res.extend(bucket.streams(block_size));
            }
        }
        res
    }

    fn streams_len(&self) -> usize {
        self.buckets.iter().map(|b| b.streams_len()).sum()
    }

    /// Merges duplicate encoders inside each writable bucket of the given
    /// write type. Returns the number of streams merged.
    fn merge(&mut self, write_type: WriteType, pools: &BufferPools) -> Result<usize, DbError> {
        let mut res = 0;
        for bucket in &mut self.buckets {
            // Only writable buckets are worth merging.
            if bucket.version == WRITABLE_BUCKET_VERSION && bucket.write_type == write_type {
                res += bucket.merge(pools)?;
            }
        }
        Ok(res)
    }

    /// Drops persisted buckets of `write_type` whose version is at most
    /// `version`; those are durably on disk and no longer needed in memory.
    fn remove_buckets_up_to_version(
        &mut self,
        write_type: WriteType,
        version: Volume,
        pools: &BufferPools,
    ) {
        let mut kept = Vec::with_capacity(self.buckets.len());
        for mut bucket in self.buckets.drain(..) {
            if bucket.write_type == write_type
                && bucket.version != WRITABLE_BUCKET_VERSION
                && bucket.version <= version
            {
                bucket.clear(pools);
                pools.buckets.put(bucket);
            } else {
                kept.push(bucket);
            }
        }
        self.buckets = kept;
    }

    fn set_last_read(&self, now: Timestamp) {
        self.last_read_nanos.store(now, Ordering::Release);
    }

    fn last_read(&self) -> Timestamp {
        self.last_read_nanos.load(Ordering::Acquire)
    }

    fn writable_bucket_mut(&mut self, write_type: WriteType) -> Option<&mut BufferBucket> {
        self.buckets
            .iter_mut()
            .find(|b| b.version == WRITABLE_BUCKET_VERSION && b.write_type == write_type)
    }

    fn writable_bucket_create(
        &mut self,
        write_type: WriteType,
        pools: &BufferPools,
    ) -> &mut BufferBucket {
        let existing = self
            .buckets
            .iter()
            .position(|b| b.version == WRITABLE_BUCKET_VERSION && b.write_type == write_type);
        let idx = match existing {
            Some(idx) => idx,
            None => {
                let mut bucket = pools.buckets.get();
                bucket.reset_to(self.start, write_type);
                self.buckets.push(bucket);
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[idx]
    }

    /// Merges each matching bucket's streams into one and returns a single
    /// stream per bucket. Does not merge across buckets; versions and write
    /// types stay separate.
    fn merge_to_streams(
        &mut self,
        filter: Option<WriteType>,
        pools: &BufferPools,
    ) -> Result<Vec<SegmentReader>, DbError> {
        let mut res = Vec::with_capacity(self.buckets.len());
        for bucket in &mut self.buckets {
            if filter.map_or(true, |wt| bucket.write_type == wt) {
                if let Some(stream) = bucket.merge_to_stream(pools)? {
                    res.push(stream);
                }
            }
        }
        Ok(res)
    }
}

/// A specific version of a bucket of encoders for one (block start, write
/// type); where writes live before they are persisted as a fileset.
#[derive(Debug, Default)]
pub struct BufferBucket {
    start: Timestamp,
    write_type: WriteType,
    version: Volume,
    encoders: Vec<InOrderEncoder>,
    bootstrapped: Vec<BootstrapBlock>,
}

#[derive(Debug)]
struct InOrderEncoder {
    encoder: Box<dyn Encoder>,
    last_write_at: Timestamp,
}

impl BufferBucket {
    pub fn version(&self) -> Volume {
        self.version
    }

    pub fn write_type(&self) -> WriteType {
        self.write_type
    }

    fn reset_to(&mut self, start: Timestamp, write_type: WriteType) {
        debug_assert!(
            self.encoders.is_empty() && self.bootstrapped.is_empty(),
            "pooled bucket not cleared"
        );
        self.start = start;
        self.write_type = write_type;
        // Buckets are only ever created to be written to.
        self.version = WRITABLE_BUCKET_VERSION;
    }

    fn clear(&mut self, pools: &BufferPools) {
        self.reset_encoders(pools);
        self.bootstrapped.clear();
    }

    fn write(
        &mut self,
        timestamp: Timestamp,
        value: Value,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
        block_start: Timestamp,
        pools: &BufferPools,
    ) -> Result<bool, DbError> {
        // Find an encoder to write to: exact timestamp match with the same
        // value is a no-op; an exact match with a different value is skipped
        // so the point lands in a later encoder (reads resolve
        // last-write-wins by reverse encoder precedence); otherwise any
        // encoder whose last write is older can be extended in order.
        let mut idx = None;
        for (i, in_order) in self.encoders.iter().enumerate() {
            if timestamp == in_order.last_write_at {
                if let Some(last) = in_order.encoder.last_encoded() {
                    if last.value == value {
                        return Ok(false);
                    }
                }
                continue;
            }
            if timestamp > in_order.last_write_at {
                idx = Some(i);
                break;
            }
        }

        let datapoint = Datapoint { timestamp, value };
        if let Some(idx) = idx {
            return self.write_to_encoder_index(idx, datapoint, unit, annotation);
        }

        // No encoder can take the write; allocate a new one.
        db_metrics::record_encoder_created();
        let encoder = pools.encoder(block_start);
        self.encoders.push(InOrderEncoder {
            encoder,
            last_write_at: timestamp,
        });
        let idx = self.encoders.len() - 1;
        match self.write_to_encoder_index(idx, datapoint, unit, annotation) {
            Ok(written) => Ok(written),
            Err(err) => {
                let in_order = self.encoders.remove(idx);
                pools.recycle_encoder(in_order.encoder);
                Err(err)
            }
        }
    }

    fn write_to_encoder_index(
        &mut self,
        idx: usize,
        datapoint: Datapoint,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
    ) -> Result<bool, DbError> {
        let timestamp = datapoint.timestamp;
        self.encoders[idx].encoder.encode(datapoint, unit, annotation)?;
        self.encoders[idx].last_write_at = timestamp;
        Ok(true)
    }

    fn streams(&self, block_size: Duration) -> Vec<BlockReader> {
        let mut streams = Vec::with_capacity(self.bootstrapped.len() + self.encoders.len());
        for block in &self.bootstrapped {
            if let Ok(reader) = SegmentReader::from_segment(&block.segment) {
                if !reader.is_empty() {
                    streams.push(BlockReader {
                        reader,
                        start: self.start,
                        block_size,
                    });
                }
            }
        }
        for in_order in &self.encoders {
            if let Some(reader) = in_order.encoder.stream() {
                streams.push(BlockReader {
                    reader,
                    start: self.start,
                    block_size,
                });
            }
        }
        streams
    }

    fn streams_len(&self) -> usize {
        let bootstrapped: usize = self
            .bootstrapped
            .iter()
            .map(|b| {
                SegmentReader::from_segment(&b.segment)
                    .map(|r| r.remaining())
                    .unwrap_or(0)
            })
            .sum();
        let encoded: usize = self.encoders.iter().map(|e| e.encoder.len()).sum();
        bootstrapped + encoded
    }

    fn reset_encoders(&mut self, pools: &BufferPools) {
        for in_order in self.encoders.drain(..) {
            pools.recycle_encoder(in_order.encoder);
        }
    }

    fn has_just_single_encoder(&self) -> bool {
        self.encoders.len() == 1 && self.bootstrapped.is_empty()
    }

    fn has_just_single_bootstrapped_block(&self) -> bool {
        let encoders_empty = self.encoders.is_empty()
            || (self.encoders.len() == 1 && self.encoders[0].encoder.is_empty());
        encoders_empty && self.bootstrapped.len() == 1
    }

    fn needs_merge(&self) -> bool {
        !(self.has_just_single_encoder() || self.has_just_single_bootstrapped_block())
    }

    /// Merges every stream in this bucket into a single new encoder,
    /// replacing the old encoders and bootstrapped blocks. On error the
    /// bucket is left unchanged so a retry on the next tick remains valid.
    /// Returns the number of streams merged.
    fn merge(&mut self, pools: &BufferPools) -> Result<usize, DbError> {
        if !self.needs_merge() {
            return Ok(0);
        }

        let mut readers = Vec::with_capacity(self.bootstrapped.len() + self.encoders.len());
        let mut merges = 0;

        // Bootstrapped blocks rank as data that appeared before anything that
        // arrived locally in the buffer.
        for block in &self.bootstrapped {
            if let Ok(reader) = SegmentReader::from_segment(&block.segment) {
                if !reader.is_empty() {
                    merges += 1;
                    readers.push(reader);
                }
            }
        }
        for in_order in &self.encoders {
            if let Some(reader) = in_order.encoder.stream() {
                merges += 1;
                readers.push(reader);
            }
        }

        let (encoder, last_write_at) = merge_streams_to_encoder(self.start, readers, pools)?;

        self.reset_encoders(pools);
        self.bootstrapped.clear();
        self.encoders.push(InOrderEncoder {
            encoder,
            last_write_at,
        });

        Ok(merges)
    }

    /// Merges all streams in this bucket into one and returns it; `None`
    /// when the bucket holds no data.
    fn merge_to_stream(&mut self, pools: &BufferPools) -> Result<Option<SegmentReader>, DbError> {
        if self.has_just_single_encoder() {
            self.bootstrapped.clear();
            return Ok(self.encoders[0].encoder.stream());
        }

        if self.has_just_single_bootstrapped_block() {
            self.reset_encoders(pools);
            let reader = SegmentReader::from_segment(&self.bootstrapped[0].segment)?;
            return Ok(Some(reader));
        }

        self.merge(pools)?;

        // A successful merge leaves exactly one encoder behind.
        if !self.has_just_single_encoder() {
            return Err(DbError::IncompleteMerge);
        }
        Ok(self.encoders[0].encoder.stream())
    }
}

/// Feeds `readers` through the chronological merge iterator into a fresh
/// encoder. Returns the encoder and the timestamp of its last write; the
/// caller owns the encoder.
fn merge_streams_to_encoder(
    block_start: Timestamp,
    readers: Vec<SegmentReader>,
    pools: &BufferPools,
) -> Result<(Box<dyn Encoder>, Timestamp), DbError> {
    let mut encoder = pools.encoder(block_start);
    let mut last_write_at = 0;
    for entry in MultiReaderIterator::new(readers) {
        last_write_at = entry.datapoint.timestamp;
        if let Err(err) = encoder.encode(entry.datapoint, entry.unit, entry.annotation.as_deref()) {
            pools.recycle_encoder(encoder);
            return Err(err);
        }
    }
    Ok((encoder, last_write_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::BlockState;

    const HOUR: Duration = Duration::from_secs(3600);

    fn hour_ns() -> u64 {
        duration_nanos(HOUR)
    }

    fn test_opts(clock: &ManualClock, cold_writes: bool) -> BufferOptions {
        BufferOptions {
            block_size: HOUR,
            buffer_past: Duration::from_secs(10 * 60),
            buffer_future: Duration::from_secs(2 * 60),
            retention_period: Duration::from_secs(24 * 3600),
            future_retention_period: Duration::ZERO,
            cold_writes_enabled: cold_writes,
            clock: clock.handle(),
            ..BufferOptions::default()
        }
    }

    fn buffer(clock: &ManualClock, cold_writes: bool) -> SeriesBuffer {
        SeriesBuffer::new(
            b"cpu.total".to_vec(),
            vec![("host".to_string(), "a01".to_string())],
            test_opts(clock, cold_writes),
        )
    }

    fn write(buf: &mut SeriesBuffer, ts: Timestamp, value: Value) -> Result<bool, DbError> {
        buf.write(ts, value, TimeUnit::Nanoseconds, None, &WriteOptions::default())
    }

    fn read_all(buf: &SeriesBuffer, start: Timestamp, end: Timestamp) -> Vec<(Timestamp, Value)> {
        let mut out = Vec::new();
        for block in buf.read_encoded(start, end).unwrap() {
            let readers: Vec<SegmentReader> = block.into_iter().map(|b| b.reader).collect();
            for entry in MultiReaderIterator::new(readers) {
                out.push((entry.datapoint.timestamp, entry.datapoint.value));
            }
        }
        out
    }

    #[test]
    fn warm_write_within_window() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);

        assert!(write(&mut buf, 10 * hour_ns(), 1.0).unwrap());
        assert_eq!(buf.stats().wired_blocks, 1);
        assert!(!buf.is_empty());
    }

    #[test]
    fn cold_write_rejected_when_disabled() {
        let clock = ManualClock::new(12 * hour_ns());
        let mut buf = buffer(&clock, false);

        // 20 minutes in the past, outside the 10 minute buffer_past window.
        let ts = 12 * hour_ns() - duration_nanos(Duration::from_secs(20 * 60));
        let res = write(&mut buf, ts, 1.0);
        assert!(matches!(res, Err(DbError::InvalidParams { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn cold_write_bounds() {
        let now = 48 * hour_ns();
        let clock = ManualClock::new(now);
        let mut buf = buffer(&clock, true);

        // Within retention: accepted as cold.
        assert!(write(&mut buf, now - 2 * hour_ns(), 1.0).unwrap());

        // Older than retention.
        let res = write(&mut buf, now - 25 * hour_ns(), 1.0);
        assert!(matches!(res, Err(DbError::TooPast)));

        // Beyond future retention plus one block.
        let res = write(&mut buf, now + 2 * hour_ns(), 1.0);
        assert!(matches!(res, Err(DbError::TooFuture)));
    }

    #[test]
    fn equal_timestamp_same_value_is_noop() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let ts = 10 * hour_ns();

        assert!(write(&mut buf, ts, 1.0).unwrap());
        assert!(!write(&mut buf, ts, 1.0).unwrap());
        assert_eq!(read_all(&buf, 0, u64::MAX), vec![(ts, 1.0)]);
    }

    #[test]
    fn equal_timestamp_different_value_last_write_wins() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let ts = 10 * hour_ns();

        assert!(write(&mut buf, ts, 1.0).unwrap());
        assert!(write(&mut buf, ts, 2.0).unwrap());
        assert!(write(&mut buf, ts + 10, 3.0).unwrap());

        assert_eq!(read_all(&buf, 0, u64::MAX), vec![(ts, 2.0), (ts + 10, 3.0)]);
    }

    #[test]
    fn out_of_order_writes_use_multiple_encoders_and_merge_on_tick() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let base = 10 * hour_ns();

        write(&mut buf, base + 30, 3.0).unwrap();
        write(&mut buf, base + 10, 1.0).unwrap();
        write(&mut buf, base + 20, 2.0).unwrap();

        let res = buf.tick(&BlockStates::new());
        assert_eq!(res.merged_out_of_order_blocks, 1);
        assert_eq!(res.evicted_bucket_times.len(), 0);

        assert_eq!(
            read_all(&buf, 0, u64::MAX),
            vec![(base + 10, 1.0), (base + 20, 2.0), (base + 30, 3.0)]
        );

        // Second tick has nothing left to merge.
        let res = buf.tick(&BlockStates::new());
        assert_eq!(res.merged_out_of_order_blocks, 0);
    }

    #[test]
    fn write_transforms() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let ts = 10 * hour_ns() + 12345;

        let opts = WriteOptions {
            truncate_type: TruncateType::Block,
            force_value: Some(42.0),
        };
        buf.write(ts, 1.0, TimeUnit::Nanoseconds, None, &opts).unwrap();

        assert_eq!(read_all(&buf, 0, u64::MAX), vec![(10 * hour_ns(), 42.0)]);
    }

    #[test]
    fn warm_flush_sets_version_and_tick_evicts() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let start = 10 * hour_ns();

        write(&mut buf, start + 5, 1.0).unwrap();
        write(&mut buf, start + 15, 2.0).unwrap();

        let mut persisted = Vec::new();
        let outcome = buf
            .warm_flush(start, &mut |id: &[u8], _tags: &Tags, segment: &Segment, checksum| {
                assert_eq!(id, b"cpu.total");
                assert_eq!(segment_checksum(segment), checksum);
                persisted.push(segment.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, FlushOutcome::FlushedToDisk);
        assert_eq!(persisted.len(), 1);

        // Buffer still serves the block until tick observes it retrievable.
        assert_eq!(read_all(&buf, 0, u64::MAX).len(), 2);

        let mut states = BlockStates::new();
        states.insert(
            start,
            BlockState {
                warm_retrievable: true,
                cold_version: 0,
            },
        );
        let res = buf.tick(&states);
        assert_eq!(res.evicted_bucket_times.to_vec(), vec![start]);
        assert!(buf.is_empty());
        assert!(buf.block_starts().is_empty());
        assert!(buf.cached_block_starts().is_empty());
    }

    #[test]
    fn warm_flush_missing_block() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let outcome = buf
            .warm_flush(5 * hour_ns(), &mut |_, _, _, _| Ok(()))
            .unwrap();
        assert_eq!(outcome, FlushOutcome::BlockDoesNotExist);
    }

    #[test]
    fn warm_flush_error_leaves_version_writable() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let start = 10 * hour_ns();
        write(&mut buf, start + 5, 1.0).unwrap();

        let res = buf.warm_flush(start, &mut |_, _, _, _| {
            Err(DbError::Internal("disk full".to_string()))
        });
        assert!(res.is_err());

        // Retry works and only then bumps the version.
        let outcome = buf.warm_flush(start, &mut |_, _, _, _| Ok(())).unwrap();
        assert_eq!(outcome, FlushOutcome::FlushedToDisk);
    }

    #[test]
    fn snapshot_merges_warm_and_cold() {
        let now = 10 * hour_ns();
        let clock = ManualClock::new(now);
        let mut buf = buffer(&clock, true);
        let start = block_start(now, HOUR);

        // Warm write in the current block.
        write(&mut buf, now, 1.0).unwrap();
        // Cold write into the same block (moved clock forward past the
        // buffer_past window while staying in the block).
        clock.set(now + duration_nanos(Duration::from_secs(30 * 60)));
        write(&mut buf, now + 1, 2.0).unwrap();

        let mut segments = Vec::new();
        buf.snapshot(start, &mut |_, _, segment: &Segment, _| {
            segments.push(segment.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(segments.len(), 1);
        let decoded: Vec<_> = SegmentReader::from_segment(&segments[0])
            .unwrap()
            .map(|e| (e.datapoint.timestamp, e.datapoint.value))
            .collect();
        assert_eq!(decoded, vec![(now, 1.0), (now + 1, 2.0)]);
    }

    #[test]
    fn snapshot_empty_block_is_silent() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let mut called = false;
        buf.snapshot(0, &mut |_, _, _, _| {
            called = true;
            Ok(())
        })
        .unwrap();
        assert!(!called);
    }

    #[test]
    fn cold_flush_block_starts_and_promotion() {
        let now = 48 * hour_ns();
        let clock = ManualClock::new(now);
        let mut buf = buffer(&clock, true);

        let cold_ts = now - 3 * hour_ns();
        let cold_start = block_start(cold_ts, HOUR);
        write(&mut buf, cold_ts, 7.0).unwrap();
        write(&mut buf, now, 1.0).unwrap(); // warm, should not show up

        let starts = buf.cold_flush_block_starts(&BlockStates::new());
        assert_eq!(starts.to_vec(), vec![cold_start]);

        let readers = buf.fetch_blocks_for_cold_flush(cold_start, 1).unwrap();
        assert_eq!(readers.len(), 1);

        // Promoted to version 1: with the shard recording cold version 1,
        // nothing remains to cold flush.
        let mut states = BlockStates::new();
        states.insert(
            cold_start,
            BlockState {
                warm_retrievable: false,
                cold_version: 1,
            },
        );
        assert!(buf.cold_flush_block_starts(&states).is_empty());

        // Without the shard state it would be re-reported (flush retry).
        assert_eq!(
            buf.cold_flush_block_starts(&BlockStates::new()).to_vec(),
            vec![cold_start]
        );
    }

    #[test]
    fn fetch_blocks_for_cold_flush_missing_block() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, true);
        let res = buf.fetch_blocks_for_cold_flush(0, 1).unwrap();
        assert!(res.is_empty());
    }

    #[test]
    fn tick_drops_cold_versions_up_to_flushed() {
        let now = 48 * hour_ns();
        let clock = ManualClock::new(now);
        let mut buf = buffer(&clock, true);

        let cold_ts = now - 3 * hour_ns();
        let cold_start = block_start(cold_ts, HOUR);
        write(&mut buf, cold_ts, 7.0).unwrap();
        buf.fetch_blocks_for_cold_flush(cold_start, 3).unwrap();

        let mut states = BlockStates::new();
        states.insert(
            cold_start,
            BlockState {
                warm_retrievable: false,
                cold_version: 3,
            },
        );
        let res = buf.tick(&states);
        assert_eq!(res.evicted_bucket_times.to_vec(), vec![cold_start]);
        assert!(buf.is_empty());
    }

    #[test]
    fn bootstrap_blocks_merge_into_reads() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let start = 10 * hour_ns();

        let mut encoder = StreamEncoder::new(start);
        encoder
            .encode(
                Datapoint {
                    timestamp: start + 1,
                    value: 100.0,
                },
                TimeUnit::Nanoseconds,
                None,
            )
            .unwrap();
        let segment = encoder.stream().unwrap().to_segment().unwrap();
        buf.bootstrap(BootstrapBlock { start, segment });

        write(&mut buf, start + 2, 1.0).unwrap();

        assert_eq!(
            read_all(&buf, 0, u64::MAX),
            vec![(start + 1, 100.0), (start + 2, 1.0)]
        );

        // Bootstrap data never appears on the cold flush path.
        assert!(buf.cold_flush_block_starts(&BlockStates::new()).is_empty());
    }

    #[test]
    fn read_encoded_range_filters_blocks() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        write(&mut buf, 10 * hour_ns() + 1, 1.0).unwrap();

        clock.set(11 * hour_ns());
        write(&mut buf, 11 * hour_ns() + 1, 2.0).unwrap();

        // Only the first block overlaps.
        let res = buf.read_encoded(10 * hour_ns(), 11 * hour_ns()).unwrap();
        assert_eq!(res.len(), 1);

        // Both blocks overlap.
        let res = buf.read_encoded(10 * hour_ns(), 12 * hour_ns()).unwrap();
        assert_eq!(res.len(), 2);
    }

    #[test]
    fn fetch_blocks_metadata_reports_sizes_and_last_read() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        let start = 10 * hour_ns();
        write(&mut buf, start + 1, 1.0).unwrap();
        write(&mut buf, start + 2, 2.0).unwrap();

        let read_at = start + 55;
        clock.set(read_at);
        buf.read_encoded(0, u64::MAX).unwrap();

        let meta = buf
            .fetch_blocks_metadata(
                0,
                u64::MAX,
                FetchBlocksMetadataOptions {
                    include_sizes: true,
                    include_last_read: true,
                },
            )
            .unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].start, start);
        assert_eq!(meta[0].size, Some(2));
        assert_eq!(meta[0].last_read, Some(read_at));
    }

    #[test]
    fn bucket_cache_tracks_recent_blocks_and_stays_in_sync() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);

        write(&mut buf, 10 * hour_ns(), 1.0).unwrap();
        clock.set(11 * hour_ns());
        write(&mut buf, 11 * hour_ns(), 2.0).unwrap();
        clock.set(12 * hour_ns());
        write(&mut buf, 12 * hour_ns(), 3.0).unwrap();

        // Cache holds the two most recent accesses, newest first.
        assert_eq!(
            buf.cached_block_starts(),
            vec![12 * hour_ns(), 11 * hour_ns()]
        );
        // Sorted list matches map keys.
        let mut map_keys = buf.block_starts();
        map_keys.sort_unstable();
        assert_eq!(
            map_keys,
            vec![10 * hour_ns(), 11 * hour_ns(), 12 * hour_ns()]
        );
        for cached in buf.cached_block_starts() {
            assert!(buf.block_starts().contains(&cached));
        }
    }

    #[test]
    fn reset_recycles_state_for_new_series() {
        let clock = ManualClock::new(10 * hour_ns());
        let mut buf = buffer(&clock, false);
        write(&mut buf, 10 * hour_ns(), 1.0).unwrap();

        buf.reset(b"mem.used".to_vec(), Vec::new(), test_opts(&clock, false));
        assert!(buf.is_empty());
        assert_eq!(buf.id(), b"mem.used");
        assert!(buf.cached_block_starts().is_empty());
        assert!(read_all(&buf, 0, u64::MAX).is_empty());
    }
}
