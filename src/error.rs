use crate::types::Timestamp;
use thiserror::Error;

/// Custom error type for the database core operations.
///
/// Variants fall into three tiers: caller-contract violations (a bug in the
/// consuming subsystem), expected domain errors (surfaced to the user), and
/// invariant violations (must never occur under correct operation; also
/// emitted to the event listener).
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid parameters: {reason}")]
    InvalidParams { reason: String },

    #[error("Datapoint is too far in the past (outside retention)")]
    TooPast,

    #[error("Datapoint is too far in the future (outside future retention)")]
    TooFuture,

    #[error("Seeker manager already open or is closed")]
    SeekerManagerAlreadyOpenOrClosed,

    #[error("Seeker manager already closed")]
    SeekerManagerAlreadyClosed,

    #[error("Fileset not found: shard={shard}, block_start={block_start}")]
    FileSetNotFound { shard: u32, block_start: Timestamp },

    #[error("No available seekers (all seekers for the fileset are borrowed)")]
    NoAvailableSeekers,

    #[error("Seekers don't exist for the requested fileset")]
    SeekersDontExist,

    #[error("Can't close seeker manager while seekers are borrowed")]
    CantCloseWhileBorrowed,

    #[error("Can't return a seeker not managed by the seeker manager")]
    ReturnedUnmanagedSeeker,

    #[error("Can't update open lease because seeker manager is not open")]
    UpdateOpenLeaseNotOpen,

    #[error("Concurrent open lease updates are not allowed")]
    ConcurrentUpdateOpenLeaseNotAllowed,

    #[error("Received update open lease volumes out of order")]
    OutOfOrderUpdateOpenLease,

    #[error("Merge did not result in a single encoder")]
    IncompleteMerge,

    #[error("Bucket map and sorted block start cache out of sync: block_start={block_start}")]
    BucketMapCacheNotInSync { block_start: Timestamp },

    #[error("Index block is sealed and no longer accepts writes")]
    IndexBlockSealed,

    #[error("Index block is closed")]
    IndexBlockClosed,

    #[error("Bootstrap result has no corresponding index block: block_start={block_start}")]
    IndexBootstrapMissingBlock { block_start: Timestamp },

    #[error("No buckets exist for block_start={block_start}")]
    NoBucketsFound { block_start: Timestamp },

    #[error("No writable bucket exists for block_start={block_start}")]
    NoWritableBucket { block_start: Timestamp },

    #[error("Checksum mismatch: declared={declared}, actual={actual}")]
    ChecksumMismatch { declared: u32, actual: u32 },

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Multiple errors: {}", format_multi(.0))]
    Multi(Vec<DbError>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Whether this error is an invariant violation (tier 3); these are
    /// additionally emitted to the event listener wherever they originate.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            DbError::IncompleteMerge | DbError::BucketMapCacheNotInSync { .. }
        )
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        DbError::InvalidParams {
            reason: reason.into(),
        }
    }
}

fn format_multi(errs: &[DbError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

/// Accumulates errors across batch paths (shard cache warming, close-time
/// cleanup) and resolves to at most one final error.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<DbError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, err: DbError) {
        self.errors.push(err);
    }

    pub fn add_result<T>(&mut self, res: Result<T, DbError>) {
        if let Err(err) = res {
            self.errors.push(err);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Resolves to `Ok(())` when empty, the sole error when singular, and a
    /// `DbError::Multi` otherwise.
    pub fn final_result(mut self) -> Result<(), DbError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(DbError::Multi(self.errors)),
        }
    }
}
