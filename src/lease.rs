//! Block lease plumbing between the seeker manager and whatever publishes
//! new fileset volumes (background compactions). Registration is
//! bidirectional, but lock ordering is fixed: the lease manager never calls
//! back into a leaser while holding its own registry lock.

use crate::error::DbError;
use crate::types::{Shard, Timestamp, Volume};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Identifies one fileset a lease covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseDescriptor {
    pub namespace: String,
    pub shard: Shard,
    pub block_start: Timestamp,
}

/// State carried by a lease: the volume the holder is authorized to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaseState {
    pub volume: Volume,
}

/// Outcome of an open lease update as reported by a leaser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOpenLeaseResult {
    /// The leaser held no resources for the descriptor (or does not own the
    /// namespace); nothing was swapped.
    NoOpenLease,
    /// The leaser swapped to the new volume and released the previous one.
    UpdateOpenLease,
}

/// A holder of per-volume resources that can hot-swap them when a new volume
/// is published. When `update_open_lease` returns successfully, all
/// resources for volumes below the new one must have been released.
pub trait Leaser: Send + Sync {
    fn update_open_lease(
        &self,
        descriptor: &LeaseDescriptor,
        state: LeaseState,
    ) -> Result<UpdateOpenLeaseResult, DbError>;
}

/// Counts of leasers touched by a broadcast update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateLeasesResult {
    pub leasers_updated: usize,
    pub leasers_no_open_lease: usize,
}

/// The lease registry consumed by the seeker manager.
pub trait LeaseManager: Send + Sync {
    fn register_leaser(&self, leaser: Arc<dyn Leaser>) -> Result<(), DbError>;
    fn unregister_leaser(&self, leaser: &dyn Leaser) -> Result<(), DbError>;
    /// The volume a leaser opening the descriptor's fileset should use.
    fn open_latest_lease(
        &self,
        leaser: &dyn Leaser,
        descriptor: &LeaseDescriptor,
    ) -> Result<LeaseState, DbError>;
    /// Records a newly published volume and pushes it to every registered
    /// leaser.
    fn update_open_leases(
        &self,
        descriptor: &LeaseDescriptor,
        state: LeaseState,
    ) -> Result<UpdateLeasesResult, DbError>;
}

/// In-memory lease manager tracking the latest volume per descriptor.
#[derive(Default)]
pub struct MemLeaseManager {
    leasers: Mutex<Vec<Arc<dyn Leaser>>>,
    volumes: Mutex<HashMap<LeaseDescriptor, Volume>>,
}

impl MemLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the latest known volume for a descriptor without broadcasting,
    /// e.g. when discovering existing filesets at startup.
    pub fn set_latest_volume(&self, descriptor: &LeaseDescriptor, volume: Volume) {
        if let Ok(mut volumes) = self.volumes.lock() {
            let entry = volumes.entry(descriptor.clone()).or_insert(volume);
            if *entry < volume {
                *entry = volume;
            }
        }
    }

    fn leaser_ptr(leaser: &dyn Leaser) -> *const () {
        leaser as *const dyn Leaser as *const ()
    }
}

impl std::fmt::Debug for MemLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemLeaseManager").finish_non_exhaustive()
    }
}

impl LeaseManager for MemLeaseManager {
    fn register_leaser(&self, leaser: Arc<dyn Leaser>) -> Result<(), DbError> {
        let mut leasers = self.leasers.lock()?;
        leasers.push(leaser);
        Ok(())
    }

    fn unregister_leaser(&self, leaser: &dyn Leaser) -> Result<(), DbError> {
        let mut leasers = self.leasers.lock()?;
        let target = Self::leaser_ptr(leaser);
        let before = leasers.len();
        leasers.retain(|l| Self::leaser_ptr(l.as_ref()) != target);
        if leasers.len() == before {
            return Err(DbError::Internal(
                "unregistering a leaser that was never registered".to_string(),
            ));
        }
        Ok(())
    }

    fn open_latest_lease(
        &self,
        _leaser: &dyn Leaser,
        descriptor: &LeaseDescriptor,
    ) -> Result<LeaseState, DbError> {
        let volumes = self.volumes.lock()?;
        Ok(LeaseState {
            volume: volumes.get(descriptor).copied().unwrap_or(0),
        })
    }

    fn update_open_leases(
        &self,
        descriptor: &LeaseDescriptor,
        state: LeaseState,
    ) -> Result<UpdateLeasesResult, DbError> {
        {
            let mut volumes = self.volumes.lock()?;
            let current = volumes.get(descriptor).copied().unwrap_or(0);
            if state.volume <= current && current != 0 {
                return Err(DbError::OutOfOrderUpdateOpenLease);
            }
            volumes.insert(descriptor.clone(), state.volume);
        }

        // Snapshot the registry so no lock is held while calling leasers;
        // a leaser may call back into this manager.
        let leasers: Vec<Arc<dyn Leaser>> = self.leasers.lock()?.clone();

        let mut result = UpdateLeasesResult::default();
        for leaser in leasers {
            match leaser.update_open_lease(descriptor, state)? {
                UpdateOpenLeaseResult::UpdateOpenLease => result.leasers_updated += 1,
                UpdateOpenLeaseResult::NoOpenLease => result.leasers_no_open_lease += 1,
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct RecordingLeaser {
        updates: AtomicUsize,
    }

    impl Leaser for RecordingLeaser {
        fn update_open_lease(
            &self,
            _descriptor: &LeaseDescriptor,
            _state: LeaseState,
        ) -> Result<UpdateOpenLeaseResult, DbError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(UpdateOpenLeaseResult::UpdateOpenLease)
        }
    }

    fn descriptor() -> LeaseDescriptor {
        LeaseDescriptor {
            namespace: "metrics".to_string(),
            shard: 0,
            block_start: 0,
        }
    }

    #[test]
    fn broadcast_reaches_registered_leasers() {
        let manager = MemLeaseManager::new();
        let leaser = Arc::new(RecordingLeaser::default());
        manager.register_leaser(leaser.clone()).unwrap();

        let res = manager
            .update_open_leases(&descriptor(), LeaseState { volume: 1 })
            .unwrap();
        assert_eq!(res.leasers_updated, 1);
        assert_eq!(leaser.updates.load(Ordering::SeqCst), 1);

        manager.unregister_leaser(leaser.as_ref()).unwrap();
        manager
            .update_open_leases(&descriptor(), LeaseState { volume: 2 })
            .unwrap();
        assert_eq!(leaser.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_latest_lease_tracks_published_volumes() {
        let manager = MemLeaseManager::new();
        let leaser = Arc::new(RecordingLeaser::default());

        let state = manager
            .open_latest_lease(leaser.as_ref(), &descriptor())
            .unwrap();
        assert_eq!(state.volume, 0);

        manager.set_latest_volume(&descriptor(), 3);
        let state = manager
            .open_latest_lease(leaser.as_ref(), &descriptor())
            .unwrap();
        assert_eq!(state.volume, 3);
    }

    #[test]
    fn out_of_order_publication_is_rejected() {
        let manager = MemLeaseManager::new();
        manager
            .update_open_leases(&descriptor(), LeaseState { volume: 3 })
            .unwrap();
        let err = manager
            .update_open_leases(&descriptor(), LeaseState { volume: 2 })
            .unwrap_err();
        assert!(matches!(err, DbError::OutOfOrderUpdateOpenLease));
    }
}
