//! In-memory fileset volume store: the persisted-fileset collaborator the
//! seeker manager reads through. Flush and snapshot paths write into it via
//! [`FilesetStore::persist_fn`]; the seeker side opens immutable snapshots
//! of a volume with a shared bloom filter over its series IDs.
//!
//! The on-disk binary layout is out of scope; this store keeps every
//! observable behavior (checksums, volumes, clone/close accounting) without
//! it.

use crate::bloom::BloomFilter;
use crate::encoding::{segment_checksum, Segment};
use crate::error::DbError;
use crate::seeker::{BlockSeeker, NewOpenSeekerFn, OpenSeekerRequest, ReusableSeekerResources};
use crate::types::{SeriesId, Shard, Tags, Timestamp, Volume};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

type FilesetKey = (Shard, Timestamp, Volume);

/// One persisted series entry of a fileset.
#[derive(Debug, Clone)]
pub struct FilesetEntry {
    pub tags: Tags,
    pub segment: Segment,
    pub checksum: u32,
}

#[derive(Debug, Default)]
struct FilesetData {
    entries: BTreeMap<SeriesId, FilesetEntry>,
}

/// In-memory map of `(shard, block start, volume)` to persisted filesets.
#[derive(Debug, Default)]
pub struct FilesetStore {
    filesets: RwLock<HashMap<FilesetKey, Arc<RwLock<FilesetData>>>>,
    open_seekers: Arc<AtomicUsize>,
}

impl FilesetStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A persist function writing into the given fileset volume, suitable
    /// for the buffer's snapshot and flush paths. The declared checksum is
    /// verified against the segment before the entry is accepted.
    pub fn persist_fn(
        self: &Arc<Self>,
        shard: Shard,
        block_start: Timestamp,
        volume: Volume,
    ) -> impl FnMut(&[u8], &Tags, &Segment, u32) -> Result<(), DbError> + '_ {
        move |id: &[u8], tags: &Tags, segment: &Segment, checksum: u32| {
            let actual = segment_checksum(segment);
            if actual != checksum {
                return Err(DbError::ChecksumMismatch {
                    declared: checksum,
                    actual,
                });
            }

            let fileset = self.fileset_create(shard, block_start, volume)?;
            let mut data = fileset.write()?;
            data.entries.insert(
                id.to_vec(),
                FilesetEntry {
                    tags: tags.clone(),
                    segment: segment.clone(),
                    checksum,
                },
            );
            Ok(())
        }
    }

    pub fn exists(&self, shard: Shard, block_start: Timestamp, volume: Volume) -> bool {
        self.filesets
            .read()
            .map(|f| f.contains_key(&(shard, block_start, volume)))
            .unwrap_or(false)
    }

    /// Highest persisted volume for the fileset, if any.
    pub fn latest_volume(&self, shard: Shard, block_start: Timestamp) -> Option<Volume> {
        self.filesets
            .read()
            .ok()?
            .keys()
            .filter(|(s, t, _)| *s == shard && *t == block_start)
            .map(|(_, _, v)| *v)
            .max()
    }

    /// Number of seekers (originals and clones) currently open against this
    /// store. Zero once every handle is closed.
    pub fn open_seeker_count(&self) -> usize {
        self.open_seekers.load(Ordering::SeqCst)
    }

    /// Opens a seeker over an immutable snapshot of the volume, building the
    /// shared ID bloom filter. The loaned resources are used as staging for
    /// checksum verification.
    pub fn open_seeker(
        self: &Arc<Self>,
        shard: Shard,
        block_start: Timestamp,
        volume: Volume,
        resources: &mut ReusableSeekerResources,
    ) -> Result<Arc<dyn BlockSeeker>, DbError> {
        let fileset = {
            let filesets = self.filesets.read()?;
            match filesets.get(&(shard, block_start, volume)) {
                Some(fileset) => Arc::clone(fileset),
                None => return Err(DbError::FileSetNotFound { shard, block_start }),
            }
        };

        let data = fileset.read()?;
        let mut entries = BTreeMap::new();
        let mut bloom = BloomFilter::with_expected_entries(data.entries.len());
        for (id, entry) in &data.entries {
            // Stage the segment bytes through the shared unread buffer and
            // re-verify the checksum; a corrupt entry fails the open.
            resources.unread_buf.clear();
            resources.unread_buf.extend_from_slice(entry.segment.as_bytes());
            let staged = Segment::from_bytes(resources.unread_buf.clone());
            let actual = segment_checksum(&staged);
            if actual != entry.checksum {
                return Err(DbError::ChecksumMismatch {
                    declared: entry.checksum,
                    actual,
                });
            }
            bloom.insert(id);
            entries.insert(id.clone(), entry.clone());
        }

        self.open_seekers.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemSeeker {
            volume,
            snapshot: Arc::new(SeekerSnapshot {
                entries,
                bloom: Arc::new(bloom),
            }),
            open_seekers: Arc::clone(&self.open_seekers),
            closed: AtomicBool::new(false),
        }))
    }

    /// A seeker factory bound to this store, for wiring into the seeker
    /// manager.
    pub fn new_open_seeker_fn(self: &Arc<Self>) -> NewOpenSeekerFn {
        let store = Arc::clone(self);
        Arc::new(move |request: &OpenSeekerRequest, resources: &mut ReusableSeekerResources| {
            store.open_seeker(request.shard, request.block_start, request.volume, resources)
        })
    }

    fn fileset_create(
        &self,
        shard: Shard,
        block_start: Timestamp,
        volume: Volume,
    ) -> Result<Arc<RwLock<FilesetData>>, DbError> {
        {
            let filesets = self.filesets.read()?;
            if let Some(fileset) = filesets.get(&(shard, block_start, volume)) {
                return Ok(Arc::clone(fileset));
            }
        }
        let mut filesets = self.filesets.write()?;
        let fileset = filesets
            .entry((shard, block_start, volume))
            .or_insert_with(|| Arc::new(RwLock::new(FilesetData::default())));
        Ok(Arc::clone(fileset))
    }
}

#[derive(Debug)]
struct SeekerSnapshot {
    entries: BTreeMap<SeriesId, FilesetEntry>,
    bloom: Arc<BloomFilter>,
}

/// Seeker over an immutable fileset snapshot. Clones share the snapshot and
/// bloom filter; each handle tracks its own closed state and store-wide open
/// accounting.
#[derive(Debug)]
pub struct MemSeeker {
    volume: Volume,
    snapshot: Arc<SeekerSnapshot>,
    open_seekers: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MemSeeker {
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Internal("seeker used after close".to_string()));
        }
        Ok(())
    }
}

impl BlockSeeker for MemSeeker {
    fn id_bloom_filter(&self) -> Arc<BloomFilter> {
        Arc::clone(&self.snapshot.bloom)
    }

    fn seek_by_id(&self, id: &[u8]) -> Result<Option<Segment>, DbError> {
        self.check_open()?;
        if !self.snapshot.bloom.contains(id) {
            return Ok(None);
        }
        Ok(self.snapshot.entries.get(id).map(|e| e.segment.clone()))
    }

    fn seek_id_range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Segment)>, DbError> {
        self.check_open()?;
        Ok(self
            .snapshot
            .entries
            .range(from.to_vec()..to.to_vec())
            .map(|(id, e)| (id.clone(), e.segment.clone()))
            .collect())
    }

    fn volume(&self) -> Volume {
        self.volume
    }

    fn concurrent_clone(&self) -> Result<Arc<dyn BlockSeeker>, DbError> {
        self.check_open()?;
        self.open_seekers.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemSeeker {
            volume: self.volume,
            snapshot: Arc::clone(&self.snapshot),
            open_seekers: Arc::clone(&self.open_seekers),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DbError::Internal("seeker closed twice".to_string()));
        }
        self.open_seekers.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
