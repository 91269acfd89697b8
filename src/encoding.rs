//! Stream encoding surface consumed by the write buffer: an append-only
//! in-order encoder, opaque byte segments with crc32 checksums, seekable
//! stream readers, and the chronological multi-reader merge iterator.
//!
//! The segment byte layout is internal to this crate; everything outside
//! consumes segments as opaque bytes plus a checksum.

use crate::error::DbError;
use crate::types::{Datapoint, TimeUnit, Timestamp, Value};

use crc32fast::Hasher as Crc32;
use std::io::Read;
use std::time::Duration;

const SEG_MAGIC: &[u8; 8] = b"TDMSEG01";
const SEG_VERSION: u32 = 1;

/// One decoded stream entry: the datapoint plus its capture unit and an
/// optional opaque annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub datapoint: Datapoint,
    pub unit: TimeUnit,
    pub annotation: Option<Vec<u8>>,
}

/// An immutable, opaque byte segment produced by an encoder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segment {
    bytes: Vec<u8>,
}

impl Segment {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Checksum over a merged byte segment, passed verbatim to persist functions
/// and verified again on the read side.
pub fn segment_checksum(segment: &Segment) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(segment.as_bytes());
    hasher.finalize()
}

/// A readable stream over decoded entries in chronological order.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    entries: Vec<StreamEntry>,
    pos: usize,
}

impl SegmentReader {
    pub(crate) fn from_entries(entries: Vec<StreamEntry>) -> Self {
        Self { entries, pos: 0 }
    }

    /// Decodes a persisted segment back into a readable stream.
    pub fn from_segment(segment: &Segment) -> Result<Self, DbError> {
        Ok(Self::from_entries(decode_segment(segment)?))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.entries.len() - self.pos
    }

    fn peek(&self) -> Option<&StreamEntry> {
        self.entries.get(self.pos)
    }

    /// Encodes the full stream (regardless of read position) into a segment.
    pub fn to_segment(&self) -> Result<Segment, DbError> {
        encode_segment(&self.entries)
    }
}

impl Iterator for SegmentReader {
    type Item = StreamEntry;

    fn next(&mut self) -> Option<StreamEntry> {
        let entry = self.entries.get(self.pos).cloned();
        if entry.is_some() {
            self.pos += 1;
        }
        entry
    }
}

/// A segment reader annotated with the block it belongs to.
#[derive(Debug, Clone)]
pub struct BlockReader {
    pub reader: SegmentReader,
    pub start: Timestamp,
    pub block_size: Duration,
}

/// Append-only encoder of in-order entries. Implementations must reject
/// out-of-order appends; equal timestamps are legal only across encoders,
/// never within one.
pub trait Encoder: Send + std::fmt::Debug {
    /// Rebinds a pooled encoder to a block start, discarding prior contents.
    fn reset(&mut self, block_start: Timestamp);

    fn encode(
        &mut self,
        datapoint: Datapoint,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
    ) -> Result<(), DbError>;

    /// The last datapoint appended, if any.
    fn last_encoded(&self) -> Option<Datapoint>;

    /// Number of entries held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A readable stream over the current contents; `None` when empty.
    fn stream(&self) -> Option<SegmentReader>;

    /// Releases held buffers. The encoder must be `reset` before reuse.
    fn close(&mut self);
}

/// The in-memory encoder implementation. Entries are buffered decoded and
/// serialized on demand; the buffer only ever touches the [`Encoder`]
/// surface so a compressed implementation can be swapped in underneath.
#[derive(Debug, Default)]
pub struct StreamEncoder {
    block_start: Timestamp,
    entries: Vec<StreamEntry>,
}

impl StreamEncoder {
    pub fn new(block_start: Timestamp) -> Self {
        Self {
            block_start,
            entries: Vec::new(),
        }
    }

    pub fn block_start(&self) -> Timestamp {
        self.block_start
    }
}

impl Encoder for StreamEncoder {
    fn reset(&mut self, block_start: Timestamp) {
        self.block_start = block_start;
        self.entries.clear();
    }

    fn encode(
        &mut self,
        datapoint: Datapoint,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
    ) -> Result<(), DbError> {
        if let Some(last) = self.entries.last() {
            if datapoint.timestamp < last.datapoint.timestamp {
                return Err(DbError::Internal(format!(
                    "out of order encode: {} < {}",
                    datapoint.timestamp, last.datapoint.timestamp
                )));
            }
        }
        self.entries.push(StreamEntry {
            datapoint,
            unit,
            annotation: annotation.map(|a| a.to_vec()),
        });
        Ok(())
    }

    fn last_encoded(&self) -> Option<Datapoint> {
        self.entries.last().map(|e| e.datapoint.clone())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stream(&self) -> Option<SegmentReader> {
        if self.entries.is_empty() {
            return None;
        }
        Some(SegmentReader::from_entries(self.entries.clone()))
    }

    fn close(&mut self) {
        self.entries = Vec::new();
    }
}

/// Merges multiple chronological streams into one chronological stream.
///
/// On equal timestamps the entry from the reader **latest in the input list**
/// wins and the losers are consumed, which is how last-write-wins between
/// encoders is resolved: callers list streams oldest-first.
#[derive(Debug)]
pub struct MultiReaderIterator {
    readers: Vec<SegmentReader>,
}

impl MultiReaderIterator {
    pub fn new(readers: Vec<SegmentReader>) -> Self {
        Self { readers }
    }
}

impl Iterator for MultiReaderIterator {
    type Item = StreamEntry;

    fn next(&mut self) -> Option<StreamEntry> {
        let mut min_ts: Option<Timestamp> = None;
        for reader in &self.readers {
            if let Some(entry) = reader.peek() {
                let ts = entry.datapoint.timestamp;
                if min_ts.map_or(true, |m| ts < m) {
                    min_ts = Some(ts);
                }
            }
        }
        let min_ts = min_ts?;

        // Consume the head of every reader sitting at min_ts; the last one
        // encountered is the winner.
        let mut winner: Option<StreamEntry> = None;
        for reader in &mut self.readers {
            if reader.peek().map(|e| e.datapoint.timestamp) == Some(min_ts) {
                winner = reader.next();
            }
        }
        winner
    }
}

// --- segment binary layout ---
//
// magic, version, entry count, then columnar: base timestamp + varint deltas,
// raw IEEE-754 value bits, unit bytes, annotation lengths (0 = none, else
// len+1) + blob.

fn encode_segment(entries: &[StreamEntry]) -> Result<Segment, DbError> {
    if entries.is_empty() {
        return Ok(Segment::default());
    }
    if entries.len() > u32::MAX as usize {
        return Err(DbError::Internal("segment too large".to_string()));
    }

    let mut buf = Vec::with_capacity(16 + entries.len() * 10);
    buf.extend_from_slice(SEG_MAGIC);
    write_u32(&mut buf, SEG_VERSION);
    write_u32(&mut buf, entries.len() as u32);

    let base_ts = entries[0].datapoint.timestamp;
    write_u64(&mut buf, base_ts);
    let mut prev = base_ts;
    for entry in &entries[1..] {
        let ts = entry.datapoint.timestamp;
        if ts < prev {
            return Err(DbError::Internal(
                "entries must be sorted by timestamp for delta encoding".to_string(),
            ));
        }
        write_var_u64(&mut buf, ts - prev);
        prev = ts;
    }

    for entry in entries {
        buf.extend_from_slice(&entry.datapoint.value.to_bits().to_le_bytes());
    }

    for entry in entries {
        buf.push(unit_code(entry.unit));
    }

    for entry in entries {
        match &entry.annotation {
            None => write_var_u64(&mut buf, 0),
            Some(a) => write_var_u64(&mut buf, a.len() as u64 + 1),
        }
    }
    for entry in entries {
        if let Some(a) = &entry.annotation {
            buf.extend_from_slice(a);
        }
    }

    Ok(Segment::from_bytes(buf))
}

fn decode_segment(segment: &Segment) -> Result<Vec<StreamEntry>, DbError> {
    if segment.is_empty() {
        return Ok(Vec::new());
    }
    let mut cur = std::io::Cursor::new(segment.as_bytes());

    let mut magic = [0u8; 8];
    cur.read_exact(&mut magic)
        .map_err(|e| DbError::Internal(format!("segment truncated: {}", e)))?;
    if &magic != SEG_MAGIC {
        return Err(DbError::Internal("bad segment magic".to_string()));
    }
    let version = read_u32(&mut cur)?;
    if version != SEG_VERSION {
        return Err(DbError::Internal(format!(
            "unsupported segment version {}",
            version
        )));
    }
    let count = read_u32(&mut cur)? as usize;

    let base_ts = read_u64(&mut cur)?;
    let mut timestamps = Vec::with_capacity(count);
    timestamps.push(base_ts);
    let mut prev = base_ts;
    for _ in 1..count {
        let delta = read_var_u64(&mut cur)?;
        prev = prev
            .checked_add(delta)
            .ok_or_else(|| DbError::Internal("timestamp delta overflow".to_string()))?;
        timestamps.push(prev);
    }

    let mut values: Vec<Value> = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(f64::from_bits(read_u64_raw(&mut cur)?));
    }

    let mut units = Vec::with_capacity(count);
    for _ in 0..count {
        units.push(unit_from_code(read_u8(&mut cur)?)?);
    }

    let mut annotation_lens = Vec::with_capacity(count);
    for _ in 0..count {
        annotation_lens.push(read_var_u64(&mut cur)?);
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let annotation = match annotation_lens[i] {
            0 => None,
            len_plus_one => {
                let mut a = vec![0u8; (len_plus_one - 1) as usize];
                cur.read_exact(&mut a)
                    .map_err(|e| DbError::Internal(format!("segment truncated: {}", e)))?;
                Some(a)
            }
        };
        entries.push(StreamEntry {
            datapoint: Datapoint {
                timestamp: timestamps[i],
                value: values[i],
            },
            unit: units[i],
            annotation,
        });
    }
    Ok(entries)
}

fn unit_code(unit: TimeUnit) -> u8 {
    match unit {
        TimeUnit::Nanoseconds => 0,
        TimeUnit::Microseconds => 1,
        TimeUnit::Milliseconds => 2,
        TimeUnit::Seconds => 3,
    }
}

fn unit_from_code(code: u8) -> Result<TimeUnit, DbError> {
    match code {
        0 => Ok(TimeUnit::Nanoseconds),
        1 => Ok(TimeUnit::Microseconds),
        2 => Ok(TimeUnit::Milliseconds),
        3 => Ok(TimeUnit::Seconds),
        other => Err(DbError::Internal(format!("unknown unit code {}", other))),
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, DbError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)
        .map_err(|e| DbError::Internal(format!("segment truncated: {}", e)))?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, DbError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)
        .map_err(|e| DbError::Internal(format!("segment truncated: {}", e)))?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, DbError> {
    read_u64_raw(r)
}

fn read_u64_raw<R: Read>(r: &mut R) -> Result<u64, DbError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)
        .map_err(|e| DbError::Internal(format!("segment truncated: {}", e)))?;
    Ok(u64::from_le_bytes(b))
}

fn read_var_u64<R: Read>(r: &mut R) -> Result<u64, DbError> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(r)?;
        if shift >= 64 {
            return Err(DbError::Internal("varint overflow".to_string()));
        }
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}
