//! Seeker manager behavior: borrow/return bookkeeping, lease-driven volume
//! hot-swap under load, and shutdown resource accounting against the
//! in-memory fileset store.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tidemark::clock::ManualClock;
use tidemark::encoding::{segment_checksum, Encoder, Segment, StreamEncoder};
use tidemark::error::DbError;
use tidemark::fileset::FilesetStore;
use tidemark::lease::{
    LeaseDescriptor, LeaseManager, LeaseState, Leaser, MemLeaseManager, UpdateOpenLeaseResult,
};
use tidemark::seeker::{SeekerManager, SeekerManagerOptions};
use tidemark::types::{duration_nanos, Datapoint, TimeUnit, Timestamp, Volume};

const HOUR: Duration = Duration::from_secs(3600);
const NAMESPACE: &str = "metrics";

fn hour_ns() -> u64 {
    duration_nanos(HOUR)
}

fn segment_with_value(value: f64) -> Segment {
    let mut encoder = StreamEncoder::new(0);
    encoder
        .encode(
            Datapoint {
                timestamp: 1,
                value,
            },
            TimeUnit::Nanoseconds,
            None,
        )
        .unwrap();
    encoder.stream().unwrap().to_segment().unwrap()
}

fn persist_volume(store: &Arc<FilesetStore>, start: Timestamp, volume: Volume, value: f64) {
    let segment = segment_with_value(value);
    let mut persist_fn = store.persist_fn(0, start, volume);
    persist_fn(
        b"series-a",
        &Vec::new(),
        &segment,
        segment_checksum(&segment),
    )
    .unwrap();
}

struct Harness {
    clock: ManualClock,
    store: Arc<FilesetStore>,
    lease_manager: Arc<MemLeaseManager>,
    manager: Arc<SeekerManager>,
}

fn harness(fetch_concurrency: usize) -> Harness {
    let clock = ManualClock::new(10 * hour_ns());
    let store = FilesetStore::new();
    let lease_manager = Arc::new(MemLeaseManager::new());
    let manager = SeekerManager::new(
        SeekerManagerOptions {
            fetch_concurrency,
            block_size: HOUR,
            retention_period: Duration::from_secs(24 * 3600),
            clock: clock.handle(),
            ..SeekerManagerOptions::default()
        },
        Arc::clone(&lease_manager) as Arc<dyn tidemark::lease::LeaseManager>,
        store.new_open_seeker_fn(),
    );
    Harness {
        clock,
        store,
        lease_manager,
        manager,
    }
}

fn descriptor(start: Timestamp) -> LeaseDescriptor {
    LeaseDescriptor {
        namespace: NAMESPACE.to_string(),
        shard: 0,
        block_start: start,
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn double_open_fails() {
    let h = harness(2);
    h.manager.open(NAMESPACE).unwrap();
    let err = h.manager.open(NAMESPACE).unwrap_err();
    assert!(matches!(err, DbError::SeekerManagerAlreadyOpenOrClosed));
    h.manager.close().unwrap();
}

#[test]
fn borrow_return_and_caller_misuse() {
    let h = harness(2);
    let start = 9 * hour_ns();
    persist_volume(&h.store, start, 0, 1.0);
    h.manager.open(NAMESPACE).unwrap();

    let s1 = h.manager.borrow(0, start).unwrap();
    let s2 = h.manager.borrow(0, start).unwrap();

    // fetch_concurrency = 2; a third borrow is caller misuse.
    let err = h.manager.borrow(0, start).unwrap_err();
    assert!(matches!(err, DbError::NoAvailableSeekers));

    // A seeker the manager never handed out cannot be returned.
    let mut resources = tidemark::seeker::ReusableSeekerResources::default();
    let foreign = h.store.open_seeker(0, start, 0, &mut resources).unwrap();
    let err = h.manager.return_seeker(0, start, Arc::clone(&foreign)).unwrap_err();
    assert!(matches!(err, DbError::ReturnedUnmanagedSeeker));
    foreign.close().unwrap();

    // Closing while borrowed is refused.
    let err = h.manager.close().unwrap_err();
    assert!(matches!(err, DbError::CantCloseWhileBorrowed));

    h.manager.return_seeker(0, start, s1).unwrap();
    h.manager.return_seeker(0, start, s2).unwrap();
    h.manager.close().unwrap();

    // P4: nothing stays open after a clean close.
    assert_eq!(h.store.open_seeker_count(), 0);

    let err = h.manager.close().unwrap_err();
    assert!(matches!(err, DbError::SeekerManagerAlreadyClosed));
}

#[test]
fn borrowed_seeker_reads_persisted_data() {
    let h = harness(2);
    let start = 9 * hour_ns();
    persist_volume(&h.store, start, 0, 42.5);
    h.manager.open(NAMESPACE).unwrap();

    let bloom = h.manager.concurrent_id_bloom_filter(0, start).unwrap();
    assert!(bloom.contains(b"series-a"));

    let seeker = h.manager.borrow(0, start).unwrap();
    let segment = seeker.seek_by_id(b"series-a").unwrap().expect("series exists");
    let decoded: Vec<f64> = tidemark::encoding::SegmentReader::from_segment(&segment)
        .unwrap()
        .map(|e| e.datapoint.value)
        .collect();
    assert_eq!(decoded, vec![42.5]);
    assert!(seeker.seek_by_id(b"absent").unwrap().is_none());

    h.manager.return_seeker(0, start, seeker).unwrap();
    h.manager.close().unwrap();
    assert_eq!(h.store.open_seeker_count(), 0);
}

#[test]
fn missing_fileset_fails_borrow_but_not_cache_warming() {
    let h = harness(2);
    let start = 9 * hour_ns();
    h.manager.open(NAMESPACE).unwrap();

    let err = h.manager.borrow(0, start).unwrap_err();
    assert!(matches!(err, DbError::FileSetNotFound { .. }));

    // Cache warming spans every seekable block start; absent filesets are
    // filtered, not aggregated into the result.
    persist_volume(&h.store, start, 0, 1.0);
    h.manager.cache_shard_indices(&[0]).unwrap();

    // The persisted block start is now served from the warmed cache.
    let seeker = h.manager.borrow(0, start).unwrap();
    h.manager.return_seeker(0, start, seeker).unwrap();
    h.manager.close().unwrap();
}

#[test]
fn seeker_hot_swap_under_load() {
    let h = harness(2);
    let start = 9 * hour_ns();
    persist_volume(&h.store, start, 0, 1.0);
    h.manager.open(NAMESPACE).unwrap();

    // Two borrows drain volume 0's seeker set.
    let v0_a = h.manager.borrow(0, start).unwrap();
    let v0_b = h.manager.borrow(0, start).unwrap();
    assert_eq!(v0_a.volume(), 0);
    assert_eq!(v0_b.volume(), 0);

    // A compaction publishes volume 1 and the lease update arrives.
    persist_volume(&h.store, start, 1, 2.0);
    h.lease_manager.set_latest_volume(&descriptor(start), 1);

    let (done_tx, done_rx) = mpsc::channel();
    let manager = Arc::clone(&h.manager);
    let update_thread = thread::spawn(move || {
        let result = manager.update_open_lease(&descriptor(9 * hour_ns()), LeaseState { volume: 1 });
        done_tx.send(()).unwrap();
        result
    });

    // The update rotates promptly, then blocks draining the v0 borrows:
    // new borrows already come from volume 1.
    assert!(wait_until(Duration::from_secs(5), || {
        match h.manager.borrow(0, start) {
            Ok(seeker) => {
                let volume = seeker.volume();
                h.manager.return_seeker(0, start, seeker).unwrap();
                volume == 1
            }
            Err(_) => false,
        }
    }));
    assert!(
        done_rx.try_recv().is_err(),
        "update must still be waiting on outstanding volume 0 seekers"
    );

    // Returning the last v0 seeker completes the update.
    h.manager.return_seeker(0, start, v0_a).unwrap();
    assert!(done_rx.try_recv().is_err());
    h.manager.return_seeker(0, start, v0_b).unwrap();

    let result = update_thread.join().unwrap().unwrap();
    assert_eq!(result, UpdateOpenLeaseResult::UpdateOpenLease);

    // P5: every borrow now serves volume 1 and volume 0 is fully closed
    // (only the two v1 seekers remain open).
    let seeker = h.manager.borrow(0, start).unwrap();
    assert_eq!(seeker.volume(), 1);
    h.manager.return_seeker(0, start, seeker).unwrap();
    assert_eq!(h.store.open_seeker_count(), 2);

    h.manager.close().unwrap();
    assert_eq!(h.store.open_seeker_count(), 0);
}

#[test]
fn out_of_order_lease_update_is_rejected() {
    let h = harness(2);
    let start = 9 * hour_ns();
    persist_volume(&h.store, start, 3, 3.0);
    h.lease_manager.set_latest_volume(&descriptor(start), 3);
    h.manager.open(NAMESPACE).unwrap();

    // Open the active set at volume 3.
    let seeker = h.manager.borrow(0, start).unwrap();
    assert_eq!(seeker.volume(), 3);
    h.manager.return_seeker(0, start, seeker).unwrap();

    // A stale volume must not rotate anything.
    persist_volume(&h.store, start, 2, 2.0);
    let err = h
        .manager
        .update_open_lease(&descriptor(start), LeaseState { volume: 2 })
        .unwrap_err();
    assert!(matches!(err, DbError::OutOfOrderUpdateOpenLease));

    // Active set unchanged; the stale volume's freshly opened seekers were
    // closed again (only volume 3's set remains).
    let seeker = h.manager.borrow(0, start).unwrap();
    assert_eq!(seeker.volume(), 3);
    h.manager.return_seeker(0, start, seeker).unwrap();
    assert_eq!(h.store.open_seeker_count(), 2);

    h.manager.close().unwrap();
    assert_eq!(h.store.open_seeker_count(), 0);
}

#[test]
fn lease_update_for_foreign_namespace_is_a_noop() {
    let h = harness(2);
    h.manager.open(NAMESPACE).unwrap();

    let result = h
        .manager
        .update_open_lease(
            &LeaseDescriptor {
                namespace: "other".to_string(),
                shard: 0,
                block_start: 9 * hour_ns(),
            },
            LeaseState { volume: 1 },
        )
        .unwrap();
    assert_eq!(result, UpdateOpenLeaseResult::NoOpenLease);

    h.manager.close().unwrap();
}

#[test]
fn lease_manager_broadcast_drives_the_hot_swap() {
    let h = harness(2);
    let start = 9 * hour_ns();
    persist_volume(&h.store, start, 0, 1.0);
    h.manager.open(NAMESPACE).unwrap();

    let seeker = h.manager.borrow(0, start).unwrap();
    assert_eq!(seeker.volume(), 0);
    h.manager.return_seeker(0, start, seeker).unwrap();

    // Publishing through the lease manager reaches the registered seeker
    // manager; with nothing borrowed the swap completes inline.
    persist_volume(&h.store, start, 1, 2.0);
    let res = h
        .lease_manager
        .update_open_leases(&descriptor(start), LeaseState { volume: 1 })
        .unwrap();
    assert_eq!(res.leasers_updated, 1);

    let seeker = h.manager.borrow(0, start).unwrap();
    assert_eq!(seeker.volume(), 1);
    h.manager.return_seeker(0, start, seeker).unwrap();

    h.manager.close().unwrap();
    assert_eq!(h.store.open_seeker_count(), 0);
}

#[test]
fn concurrent_borrow_return_stress() {
    use rand::Rng;

    let h = harness(4);
    let start = 9 * hour_ns();
    persist_volume(&h.store, start, 0, 1.0);
    h.manager.open(NAMESPACE).unwrap();

    // Four workers, one borrow each at a time: never exceeds the configured
    // fetch concurrency.
    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&h.manager);
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..50 {
                let seeker = manager.borrow(0, 9 * hour_ns()).unwrap();
                assert!(seeker.seek_by_id(b"series-a").unwrap().is_some());
                if rng.gen_bool(0.3) {
                    thread::sleep(Duration::from_micros(rng.gen_range(0..100)));
                }
                manager.return_seeker(0, 9 * hour_ns(), seeker).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    h.manager.close().unwrap();
    assert_eq!(h.store.open_seeker_count(), 0);
}

#[test]
fn open_close_loop_closes_expired_block_starts() {
    let h = harness(2);
    let start = 9 * hour_ns();
    persist_volume(&h.store, start, 0, 1.0);

    // Shorten the loop so the test observes a pass quickly.
    let manager = SeekerManager::new(
        SeekerManagerOptions {
            fetch_concurrency: 2,
            close_interval: Duration::from_millis(10),
            block_size: HOUR,
            retention_period: 2 * HOUR,
            clock: h.clock.handle(),
            ..SeekerManagerOptions::default()
        },
        Arc::clone(&h.lease_manager) as Arc<dyn tidemark::lease::LeaseManager>,
        h.store.new_open_seeker_fn(),
    );
    manager.open(NAMESPACE).unwrap();

    let seeker = manager.borrow(0, start).unwrap();
    manager.return_seeker(0, start, seeker).unwrap();
    assert!(h.store.open_seeker_count() > 0);

    // Advance the clock so the block start falls behind the earliest
    // seekable one; the loop closes the fully returned set.
    h.clock.set(14 * hour_ns());
    assert!(wait_until(Duration::from_secs(5), || {
        h.store.open_seeker_count() == 0
    }));

    manager.close().unwrap();
}
