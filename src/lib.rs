#![doc = r#"
tidemark: In-Memory Write Path and Read-Handle Manager for a Time-Series Database Node

This crate provides the three tightly coupled subsystems at the core of a
distributed time-series database node:
- Per-series write buffering into block-aligned, version-tagged buckets, with
  out-of-order and late-arriving (cold) writes, snapshots, warm flushes and
  merge compactions
- A time-partitioned namespace index over tagged series, rotating blocks on
  time progression, sealing and evicting by retention
- A seeker manager owning pools of read handles per (shard, block start,
  volume) fileset, with concurrent cloned seekers and zero-downtime hot-swap
  when a background compaction publishes a new volume

Query planning, the commit log, cluster placement and the on-disk fileset
layout live outside this crate; filesets are consumed through the seeker
abstraction and encoders produce opaque segments.
"#]

// Declare modules
pub mod bloom;
pub mod buffer;
pub mod clock;
pub mod encoding;
pub mod error;
pub mod fileset;
pub mod index;
pub mod lease;
pub mod pool;
pub mod seeker;
pub mod telemetry;
pub mod types;

/// Error type for database operations.
pub use crate::error::DbError;
/// Per-series write buffer.
pub use crate::buffer::{BufferOptions, SeriesBuffer};
/// Time-partitioned namespace index.
pub use crate::index::{IndexOptions, IndexQuery, NamespaceIndex};
/// Read-handle manager for persisted filesets.
pub use crate::seeker::{SeekerManager, SeekerManagerOptions};
/// In-memory fileset collaborator (persist target and seeker source).
pub use crate::fileset::FilesetStore;
/// Lease manager contract used for volume hot-swaps.
pub use crate::lease::{LeaseDescriptor, LeaseManager, LeaseState, MemLeaseManager};
/// Injected wall clock; tests drive time through `ManualClock`.
pub use crate::clock::{Clock, ManualClock, SystemClock};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, EventListener};
/// Core value and identity types.
pub use crate::types::{Tags, Timestamp, Value};
