//! Time-partitioned secondary index over tagged series. Holds a bounded set
//! of active index blocks, rotates them as the wall clock advances, seals
//! blocks that are no longer latest, and evicts blocks that fall out of
//! retention. Queries traverse blocks in descending block start order with a
//! shared, pooled results accumulator.

use crate::clock::{system_clock, ClockHandle};
use crate::error::{DbError, MultiError};
use crate::pool::{ObjectPool, DEFAULT_POOL_SIZE};
use crate::telemetry::{db_metrics, noop_event_listener, DbEvent, EventListener};
use crate::types::{block_start, duration_nanos, Cancellable, SeriesId, Tags, Timestamp};

use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A query over the tags of indexed series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    /// Matches every document.
    All,
    /// Matches documents carrying the exact (name, value) pair.
    FieldEquals { name: String, value: String },
    /// Matches documents carrying the field under any value.
    FieldExists { name: String },
    /// Matches documents satisfying every sub-query.
    Conjunction(Vec<IndexQuery>),
}

impl IndexQuery {
    pub fn matches(&self, tags: &Tags) -> bool {
        match self {
            IndexQuery::All => true,
            IndexQuery::FieldEquals { name, value } => {
                tags.iter().any(|(n, v)| n == name && v == value)
            }
            IndexQuery::FieldExists { name } => tags.iter().any(|(n, _)| n == name),
            IndexQuery::Conjunction(queries) => queries.iter().all(|q| q.matches(tags)),
        }
    }

    /// Whether the query is an `All` or `Field` form, which aggregate queries
    /// serve from the block's field/value enumeration instead of documents.
    fn is_aggregate_form(&self) -> bool {
        matches!(self, IndexQuery::All | IndexQuery::FieldExists { .. })
    }

    /// The field filter an aggregate-form query implies.
    fn aggregate_field_filter(&self) -> Option<Vec<String>> {
        match self {
            IndexQuery::FieldExists { name } => Some(vec![name.clone()]),
            _ => None,
        }
    }
}

/// One indexed series document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDoc {
    pub id: SeriesId,
    pub tags: Tags,
}

/// One entry of an index write batch.
#[derive(Debug, Clone)]
pub struct WriteBatchEntry {
    pub id: SeriesId,
    pub tags: Tags,
    pub timestamp: Timestamp,
}

/// Per-batch write outcome: entries can fail individually (sealed or
/// out-of-bounds blocks) without failing the batch.
#[derive(Debug, Default)]
pub struct WriteBatchResult {
    pub num_written: usize,
    pub rejected: Vec<(SeriesId, DbError)>,
}

/// An immutable set of documents attached to a block by bootstrap.
#[derive(Debug, Clone, Default)]
pub struct IndexSegment {
    pub docs: Vec<IndexDoc>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub start_inclusive: Timestamp,
    pub end_exclusive: Timestamp,
    /// Maximum number of results accumulated before a block reports a
    /// non-exhaustive result; `None` is unbounded.
    pub limit: Option<usize>,
}

/// Accumulates matched documents across blocks, deduplicating by series ID.
#[derive(Debug, Default)]
pub struct QueryResults {
    map: HashMap<SeriesId, Tags>,
    limit: Option<usize>,
}

impl QueryResults {
    fn reset(&mut self, limit: Option<usize>) {
        self.map.clear();
        self.limit = limit;
    }

    pub fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.map.len() >= limit)
    }

    pub fn add(&mut self, doc: &IndexDoc) {
        self.map
            .entry(doc.id.clone())
            .or_insert_with(|| doc.tags.clone());
    }

    fn drain(&mut self) -> HashMap<SeriesId, Tags> {
        std::mem::take(&mut self.map)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Accumulates field/value enumeration results across blocks.
#[derive(Debug, Default)]
pub struct AggregateResults {
    fields: HashMap<String, BTreeSet<String>>,
    num_pairs: usize,
    limit: Option<usize>,
}

impl AggregateResults {
    fn reset(&mut self, limit: Option<usize>) {
        self.fields.clear();
        self.num_pairs = 0;
        self.limit = limit;
    }

    pub fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.num_pairs >= limit)
    }

    pub fn add_pair(&mut self, name: &str, value: &str) {
        let values = self.fields.entry(name.to_string()).or_default();
        if values.insert(value.to_string()) {
            self.num_pairs += 1;
        }
    }

    fn drain(&mut self) -> HashMap<String, BTreeSet<String>> {
        self.num_pairs = 0;
        std::mem::take(&mut self.fields)
    }
}

/// Documents matched by a query, keyed by series ID, plus whether results
/// were truncated by the capacity limit anywhere along the traversal.
#[derive(Debug)]
pub struct QueryResult {
    pub results: HashMap<SeriesId, Tags>,
    pub exhaustive: bool,
}

#[derive(Debug)]
pub struct AggregateQueryResult {
    pub fields: HashMap<String, BTreeSet<String>>,
    pub exhaustive: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexBlockStats {
    pub num_segments: usize,
    pub num_docs: usize,
}

/// Result of one index tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexTickResult {
    pub num_blocks: usize,
    pub num_blocks_sealed: usize,
    pub num_blocks_evicted: usize,
    pub num_segments: usize,
    pub num_total_docs: usize,
}

/// One time-partitioned index block. `Open` accepts writes, `Sealed` is
/// query-only, `Closed` (evicted) released its segments.
pub trait IndexBlock: Send + Sync {
    fn start_time(&self) -> Timestamp;
    fn end_time(&self) -> Timestamp;
    fn is_sealed(&self) -> bool;
    fn seal(&self) -> Result<(), DbError>;
    fn write_batch(&self, entries: &[WriteBatchEntry]) -> Result<usize, DbError>;
    fn add_results(&self, segment: IndexSegment) -> Result<(), DbError>;
    fn query(
        &self,
        cancellable: &Cancellable,
        query: &IndexQuery,
        opts: &QueryOptions,
        results: &mut QueryResults,
    ) -> Result<bool, DbError>;
    fn aggregate(
        &self,
        cancellable: &Cancellable,
        field_filter: Option<&[String]>,
        opts: &QueryOptions,
        results: &mut AggregateResults,
    ) -> Result<bool, DbError>;
    fn tick(&self) -> Result<IndexBlockStats, DbError>;
    fn stats(&self) -> IndexBlockStats;
    /// Idempotent.
    fn close(&self) -> Result<(), DbError>;
}

/// Factory for index blocks, injectable so tests can substitute mocks.
pub type NewBlockFn =
    Arc<dyn Fn(Timestamp, Duration) -> Result<Arc<dyn IndexBlock>, DbError> + Send + Sync>;

#[derive(Clone)]
pub struct IndexOptions {
    pub block_size: Duration,
    pub retention_period: Duration,
    pub buffer_future: Duration,
    pub clock: ClockHandle,
    pub event_listener: Arc<dyn EventListener>,
    pub results_pool_size: usize,
    pub new_block_fn: NewBlockFn,
}

impl std::fmt::Debug for IndexOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexOptions")
            .field("block_size", &self.block_size)
            .field("retention_period", &self.retention_period)
            .field("buffer_future", &self.buffer_future)
            .finish_non_exhaustive()
    }
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            block_size: Duration::from_secs(2 * 3600),
            retention_period: Duration::from_secs(48 * 3600),
            buffer_future: Duration::from_secs(2 * 60),
            clock: system_clock(),
            event_listener: noop_event_listener(),
            results_pool_size: DEFAULT_POOL_SIZE,
            new_block_fn: Arc::new(|start, block_size| {
                Ok(Arc::new(MemIndexBlock::new(start, block_size)) as Arc<dyn IndexBlock>)
            }),
        }
    }
}

struct IndexState {
    blocks_by_time: HashMap<Timestamp, Arc<dyn IndexBlock>>,
    /// Keys of `blocks_by_time` in descending order; the head is always the
    /// latest block.
    block_starts_desc: Vec<Timestamp>,
    latest_block: Option<Arc<dyn IndexBlock>>,
    closed: bool,
}

/// The namespace index.
pub struct NamespaceIndex {
    opts: IndexOptions,
    state: RwLock<IndexState>,
    results_pool: ObjectPool<QueryResults>,
    aggregate_results_pool: ObjectPool<AggregateResults>,
}

impl std::fmt::Debug for NamespaceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceIndex")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl NamespaceIndex {
    pub fn new(opts: IndexOptions) -> Self {
        let pool_size = opts.results_pool_size;
        Self {
            opts,
            state: RwLock::new(IndexState {
                blocks_by_time: HashMap::new(),
                block_starts_desc: Vec::new(),
                latest_block: None,
                closed: false,
            }),
            results_pool: ObjectPool::new(pool_size, QueryResults::default),
            aggregate_results_pool: ObjectPool::new(pool_size, AggregateResults::default),
        }
    }

    /// Routes each entry to the block covering its timestamp, creating
    /// writable blocks on demand up to `now + buffer_future`. Entries that
    /// cannot be routed (sealed or out-of-bounds blocks) are rejected
    /// individually.
    pub fn write_batch(&self, batch: Vec<WriteBatchEntry>) -> Result<WriteBatchResult, DbError> {
        let block_size = self.opts.block_size;
        let now = self.opts.clock.now();
        let max_start = block_start(
            now.saturating_add(duration_nanos(self.opts.buffer_future)),
            block_size,
        );
        let min_start = block_start(
            now.saturating_sub(duration_nanos(self.opts.retention_period)),
            block_size,
        );

        let mut by_start: HashMap<Timestamp, Vec<WriteBatchEntry>> = HashMap::new();
        for entry in batch {
            let start = block_start(entry.timestamp, block_size);
            by_start.entry(start).or_default().push(entry);
        }

        let mut result = WriteBatchResult::default();
        let mut starts: Vec<Timestamp> = by_start.keys().copied().collect();
        starts.sort_unstable();

        for start in starts {
            let entries = by_start.remove(&start).expect("start key present");
            if start > max_start {
                result
                    .rejected
                    .extend(entries.into_iter().map(|e| (e.id, DbError::TooFuture)));
                continue;
            }
            if start < min_start {
                result
                    .rejected
                    .extend(entries.into_iter().map(|e| (e.id, DbError::TooPast)));
                continue;
            }

            let block = self.ensure_block_at(start)?;
            match block.write_batch(&entries) {
                Ok(written) => result.num_written += written,
                Err(err) => {
                    // Sealed (or closed) block: reject the group, keep going.
                    let msg = err.to_string();
                    result.rejected.extend(
                        entries
                            .into_iter()
                            .map(|e| (e.id, DbError::invalid_params(msg.clone()))),
                    );
                }
            }
        }

        Ok(result)
    }

    /// Scans blocks intersecting the query window in descending block start
    /// order, stopping early once any block reports a non-exhaustive result.
    /// The overall `exhaustive` flag is the conjunction over visited blocks.
    /// Cancellation stops the traversal between blocks and surfaces as a
    /// non-exhaustive result.
    pub fn query(
        &self,
        cancellable: &Cancellable,
        query: &IndexQuery,
        opts: &QueryOptions,
    ) -> Result<QueryResult, DbError> {
        db_metrics::record_index_query();
        let blocks = self.blocks_for_range_desc(opts)?;

        // The pooled container is rented once per query and must go back on
        // every exit path, errors included.
        let mut results = self.results_pool.get();
        results.reset(opts.limit);

        let outcome = (|| -> Result<bool, DbError> {
            let mut exhaustive = true;
            for block in &blocks {
                if cancellable.is_cancelled() {
                    return Ok(false);
                }
                let block_exhaustive = block.query(cancellable, query, opts, &mut results)?;
                exhaustive = exhaustive && block_exhaustive;
                if !block_exhaustive {
                    break;
                }
            }
            Ok(exhaustive)
        })();

        let docs = results.drain();
        self.results_pool.put(results);

        Ok(QueryResult {
            results: docs,
            exhaustive: outcome?,
        })
    }

    /// Same traversal as [`Self::query`]. `All` and `Field` query forms are
    /// served from each block's field/value enumeration; other forms take
    /// the document path and fold tags into the aggregate.
    pub fn aggregate_query(
        &self,
        cancellable: &Cancellable,
        query: &IndexQuery,
        opts: &QueryOptions,
    ) -> Result<AggregateQueryResult, DbError> {
        if !query.is_aggregate_form() {
            let doc_result = self.query(cancellable, query, opts)?;
            let mut fields: HashMap<String, BTreeSet<String>> = HashMap::new();
            for tags in doc_result.results.values() {
                for (name, value) in tags {
                    fields.entry(name.clone()).or_default().insert(value.clone());
                }
            }
            return Ok(AggregateQueryResult {
                fields,
                exhaustive: doc_result.exhaustive,
            });
        }

        db_metrics::record_index_query();
        let blocks = self.blocks_for_range_desc(opts)?;
        let field_filter = query.aggregate_field_filter();

        let mut results = self.aggregate_results_pool.get();
        results.reset(opts.limit);

        let outcome = (|| -> Result<bool, DbError> {
            let mut exhaustive = true;
            for block in &blocks {
                if cancellable.is_cancelled() {
                    return Ok(false);
                }
                let block_exhaustive =
                    block.aggregate(cancellable, field_filter.as_deref(), opts, &mut results)?;
                exhaustive = exhaustive && block_exhaustive;
                if !block_exhaustive {
                    break;
                }
            }
            Ok(exhaustive)
        })();

        let fields = results.drain();
        self.aggregate_results_pool.put(results);

        Ok(AggregateQueryResult {
            fields,
            exhaustive: outcome?,
        })
    }

    /// Attaches bootstrapped segments to their blocks. Fails when a result
    /// has no corresponding block.
    pub fn bootstrap(&self, results: Vec<(Timestamp, IndexSegment)>) -> Result<(), DbError> {
        let state = self.state.read()?;
        if state.closed {
            return Err(DbError::IndexBlockClosed);
        }
        for (start, segment) in results {
            let block = state
                .blocks_by_time
                .get(&start)
                .ok_or(DbError::IndexBootstrapMissingBlock { block_start: start })?;
            block.add_results(segment)?;
        }
        Ok(())
    }

    /// Periodic maintenance: evicts blocks outside retention, seals
    /// non-latest open blocks, creates the block for the current wall-clock
    /// time eagerly, and gathers stats from the remainder.
    pub fn tick(&self, cancellable: &Cancellable, now: Timestamp) -> Result<IndexTickResult, DbError> {
        // Rotation first, so the current block exists even without writes.
        self.ensure_block_at(block_start(now, self.opts.block_size))?;

        let block_size = duration_nanos(self.opts.block_size);
        let retention = duration_nanos(self.opts.retention_period);
        let mut result = IndexTickResult::default();

        let blocks: Vec<(Timestamp, Arc<dyn IndexBlock>)> = {
            let state = self.state.read()?;
            if state.closed {
                return Err(DbError::IndexBlockClosed);
            }
            state
                .blocks_by_time
                .iter()
                .map(|(&t, b)| (t, Arc::clone(b)))
                .collect()
        };

        let mut evicted: Vec<Timestamp> = Vec::new();
        for (start, block) in &blocks {
            if cancellable.is_cancelled() {
                break;
            }

            if start.saturating_add(block_size).saturating_add(retention) <= now {
                block.close()?;
                evicted.push(*start);
                result.num_blocks_evicted += 1;
                self.opts
                    .event_listener
                    .on_event(DbEvent::IndexBlockEvicted { block_start: *start });
                continue;
            }

            let stats = block.tick()?;
            result.num_segments += stats.num_segments;
            result.num_total_docs += stats.num_docs;
        }

        {
            let mut state = self.state.write()?;
            for start in &evicted {
                state.blocks_by_time.remove(start);
                state.block_starts_desc.retain(|t| t != start);
            }
            let latest = state
                .block_starts_desc
                .first()
                .and_then(|t| state.blocks_by_time.get(t))
                .map(Arc::clone);
            state.latest_block = latest;

            // Seal everything open that is no longer the latest block.
            let latest_start = state.block_starts_desc.first().copied();
            for (&start, block) in &state.blocks_by_time {
                if Some(start) != latest_start && !block.is_sealed() {
                    block.seal()?;
                    result.num_blocks_sealed += 1;
                    self.opts
                        .event_listener
                        .on_event(DbEvent::IndexBlockSealed { block_start: start });
                }
            }

            result.num_blocks = state.blocks_by_time.len();
        }

        db_metrics::record_index_blocks_evicted(result.num_blocks_evicted as u64);
        Ok(result)
    }

    /// Closes every block. Idempotent.
    pub fn close(&self) -> Result<(), DbError> {
        let mut state = self.state.write()?;
        if state.closed {
            return Ok(());
        }
        let mut multi = MultiError::new();
        for block in state.blocks_by_time.values() {
            multi.add_result(block.close());
        }
        state.blocks_by_time.clear();
        state.block_starts_desc.clear();
        state.latest_block = None;
        state.closed = true;
        multi.final_result()
    }

    /// Block starts currently held, descending.
    pub fn block_starts_desc(&self) -> Vec<Timestamp> {
        self.state
            .read()
            .map(|s| s.block_starts_desc.clone())
            .unwrap_or_default()
    }

    /// The block start of the latest (writable) block, if any.
    pub fn latest_block_start(&self) -> Option<Timestamp> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.latest_block.as_ref().map(|b| b.start_time()))
    }

    /// Number of idle containers in the two results pools; used to verify
    /// rent/release discipline.
    pub fn results_pool_sizes(&self) -> (usize, usize) {
        (self.results_pool.idle(), self.aggregate_results_pool.idle())
    }

    fn ensure_block_at(&self, start: Timestamp) -> Result<Arc<dyn IndexBlock>, DbError> {
        {
            let state = self.state.read()?;
            if state.closed {
                return Err(DbError::IndexBlockClosed);
            }
            if let Some(block) = state.blocks_by_time.get(&start) {
                return Ok(Arc::clone(block));
            }
        }

        let block = (self.opts.new_block_fn)(start, self.opts.block_size)?;
        let mut state = self.state.write()?;
        if state.closed {
            return Err(DbError::IndexBlockClosed);
        }
        // Raced with another creator; keep the installed one.
        if let Some(existing) = state.blocks_by_time.get(&start) {
            return Ok(Arc::clone(existing));
        }
        state.blocks_by_time.insert(start, Arc::clone(&block));
        let idx = state
            .block_starts_desc
            .iter()
            .position(|&t| t < start)
            .unwrap_or(state.block_starts_desc.len());
        state.block_starts_desc.insert(idx, start);
        let latest = state
            .block_starts_desc
            .first()
            .and_then(|t| state.blocks_by_time.get(t))
            .map(Arc::clone);
        state.latest_block = latest;
        Ok(block)
    }

    fn blocks_for_range_desc(
        &self,
        opts: &QueryOptions,
    ) -> Result<Vec<Arc<dyn IndexBlock>>, DbError> {
        let state = self.state.read()?;
        if state.closed {
            return Err(DbError::IndexBlockClosed);
        }
        let mut blocks = Vec::new();
        for &start in &state.block_starts_desc {
            let block = &state.blocks_by_time[&start];
            if block.start_time() < opts.end_exclusive && opts.start_inclusive < block.end_time() {
                blocks.push(Arc::clone(block));
            }
        }
        Ok(blocks)
    }
}

// --- in-memory index block ---

#[derive(Debug, Default)]
struct MemBlockInner {
    /// Documents written through the batch path, deduplicated by ID.
    mutable_docs: Vec<IndexDoc>,
    seen: HashSet<SeriesId>,
    /// Segments attached by bootstrap.
    attached: Vec<IndexSegment>,
    sealed: bool,
    closed: bool,
}

/// Heap-backed index block. Documents are matched with a parallel filter;
/// per-segment boundaries double as cancellation check points.
#[derive(Debug)]
pub struct MemIndexBlock {
    start: Timestamp,
    block_size: Duration,
    inner: RwLock<MemBlockInner>,
}

impl MemIndexBlock {
    pub fn new(start: Timestamp, block_size: Duration) -> Self {
        Self {
            start,
            block_size,
            inner: RwLock::new(MemBlockInner::default()),
        }
    }

    fn match_docs(
        docs: &[IndexDoc],
        query: &IndexQuery,
        results: &mut QueryResults,
    ) -> bool {
        let matched: Vec<&IndexDoc> = docs.par_iter().filter(|d| query.matches(&d.tags)).collect();
        for doc in matched {
            if results.is_full() {
                return false;
            }
            results.add(doc);
        }
        true
    }

    fn aggregate_docs(
        docs: &[IndexDoc],
        field_filter: Option<&[String]>,
        results: &mut AggregateResults,
    ) -> bool {
        for doc in docs {
            for (name, value) in &doc.tags {
                if let Some(filter) = field_filter {
                    if !filter.iter().any(|f| f == name) {
                        continue;
                    }
                }
                if results.is_full() {
                    return false;
                }
                results.add_pair(name, value);
            }
        }
        true
    }
}

impl IndexBlock for MemIndexBlock {
    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        self.start.saturating_add(duration_nanos(self.block_size))
    }

    fn is_sealed(&self) -> bool {
        self.inner.read().map(|i| i.sealed).unwrap_or(false)
    }

    fn seal(&self) -> Result<(), DbError> {
        let mut inner = self.inner.write()?;
        if inner.closed {
            return Err(DbError::IndexBlockClosed);
        }
        inner.sealed = true;
        Ok(())
    }

    fn write_batch(&self, entries: &[WriteBatchEntry]) -> Result<usize, DbError> {
        let mut inner = self.inner.write()?;
        if inner.closed {
            return Err(DbError::IndexBlockClosed);
        }
        if inner.sealed {
            return Err(DbError::IndexBlockSealed);
        }
        let mut written = 0;
        for entry in entries {
            if inner.seen.insert(entry.id.clone()) {
                inner.mutable_docs.push(IndexDoc {
                    id: entry.id.clone(),
                    tags: entry.tags.clone(),
                });
                written += 1;
            }
        }
        Ok(written)
    }

    fn add_results(&self, segment: IndexSegment) -> Result<(), DbError> {
        let mut inner = self.inner.write()?;
        if inner.closed {
            return Err(DbError::IndexBlockClosed);
        }
        inner.attached.push(segment);
        Ok(())
    }

    fn query(
        &self,
        cancellable: &Cancellable,
        query: &IndexQuery,
        _opts: &QueryOptions,
        results: &mut QueryResults,
    ) -> Result<bool, DbError> {
        let inner = self.inner.read()?;
        if inner.closed {
            return Err(DbError::IndexBlockClosed);
        }

        if !Self::match_docs(&inner.mutable_docs, query, results) {
            return Ok(false);
        }
        for segment in &inner.attached {
            if cancellable.is_cancelled() {
                return Ok(false);
            }
            if !Self::match_docs(&segment.docs, query, results) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn aggregate(
        &self,
        cancellable: &Cancellable,
        field_filter: Option<&[String]>,
        _opts: &QueryOptions,
        results: &mut AggregateResults,
    ) -> Result<bool, DbError> {
        let inner = self.inner.read()?;
        if inner.closed {
            return Err(DbError::IndexBlockClosed);
        }

        if !Self::aggregate_docs(&inner.mutable_docs, field_filter, results) {
            return Ok(false);
        }
        for segment in &inner.attached {
            if cancellable.is_cancelled() {
                return Ok(false);
            }
            if !Self::aggregate_docs(&segment.docs, field_filter, results) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn tick(&self) -> Result<IndexBlockStats, DbError> {
        Ok(self.stats())
    }

    fn stats(&self) -> IndexBlockStats {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return IndexBlockStats::default(),
        };
        if inner.closed {
            return IndexBlockStats::default();
        }
        let mutable_segments = usize::from(!inner.mutable_docs.is_empty());
        IndexBlockStats {
            num_segments: mutable_segments + inner.attached.len(),
            num_docs: inner.mutable_docs.len()
                + inner.attached.iter().map(|s| s.docs.len()).sum::<usize>(),
        }
    }

    fn close(&self) -> Result<(), DbError> {
        let mut inner = self.inner.write()?;
        inner.mutable_docs.clear();
        inner.seen.clear();
        inner.attached.clear();
        inner.sealed = true;
        inner.closed = true;
        Ok(())
    }
}
