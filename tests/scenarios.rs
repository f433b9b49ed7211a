//! Deterministic reclamation scenarios, observed through a pool that
//! records every delivered address.

use crossbeam_utils::thread;
use nbr_recordmgr::{
    checkpoint, Config, Error, Nbr, NbrOrig, NbrPlus, NoReclaim, Pool, PoolNone, Reclaimer,
    RecordManager, ThreadId, BLOCK_SIZE,
};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CountingPool {
    inner: PoolNone,
    delivered: Mutex<Vec<usize>>,
}

impl CountingPool {
    fn delivered(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    fn was_delivered<T>(&self, record: *mut T) -> bool {
        self.delivered
            .lock()
            .unwrap()
            .contains(&(record as usize))
    }
}

impl<T> Pool<T> for CountingPool {
    fn get(&self, tid: ThreadId) -> NonNull<T> {
        Pool::<T>::get(&self.inner, tid)
    }

    unsafe fn add(&self, tid: ThreadId, ptr: NonNull<T>) {
        self.delivered.lock().unwrap().push(ptr.as_ptr() as usize);
        Pool::<T>::add(&self.inner, tid, ptr);
    }
}

type Manager<R> = RecordManager<u64, R, CountingPool>;

/// A whole operation that unlinks nothing, then retires a fresh record.
fn retire_one<R: Reclaimer<u64>>(mgr: &Manager<R>, tid: ThreadId) -> *mut u64 {
    let record = mgr.allocate(tid, tid.index() as u64);
    checkpoint!(mgr, tid);
    mgr.start_op(tid);
    mgr.upgrade_to_write_phase(tid);
    unsafe { mgr.retire(tid, record) };
    mgr.end_op(tid);
    record
}

#[test]
fn single_thread_signals_past_threshold() {
    let mgr = Manager::<Nbr<u64>>::new(Config::new(1)).unwrap();
    let tid = ThreadId::new(0);
    mgr.init_thread(tid);
    assert_eq!(mgr.status(tid).high_watermark, 32);

    for _ in 0..33 {
        retire_one(&mgr, tid);
    }
    let status = mgr.status(tid);
    assert_eq!(status.signal_rounds, 0);
    assert_eq!(status.unreclaimed, 33);
    assert_eq!(mgr.pool().delivered(), 0);

    retire_one(&mgr, tid);
    let status = mgr.status(tid);
    assert_eq!(status.signal_rounds, 1);
    assert_eq!(status.unreclaimed, 1);
    assert_eq!(status.announced_ts, 2);
    assert_eq!(mgr.pool().delivered(), 33);

    unsafe { mgr.deinit_thread(tid) };
    assert_eq!(mgr.pool().delivered(), 34);
}

#[test]
fn published_record_survives_signal_round() {
    let config = Config::new(2)
        .with_bag_capacity(64)
        .with_randomized_thresholds(false);
    let mgr = &Manager::<Nbr<u64>>::new(config).unwrap();
    let barrier = &Barrier::new(2);
    let published = &AtomicBool::new(false);
    let swept = &AtomicBool::new(false);
    let target = &AtomicUsize::new(0);

    thread::scope(|s| {
        // Reader: publishes the target and holds it across the round.
        s.spawn(move |_| {
            let tid = ThreadId::new(0);
            mgr.init_thread(tid);
            barrier.wait();

            let record = mgr.allocate(tid, 7);
            target.store(record as usize, Ordering::SeqCst);
            checkpoint!(mgr, tid);
            mgr.start_op(tid);
            mgr.save_for_write_phase(tid, record);
            mgr.upgrade_to_write_phase(tid);
            published.store(true, Ordering::SeqCst);

            while !swept.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            assert_eq!(unsafe { *record }, 7);
            mgr.end_op(tid);

            barrier.wait();
            unsafe { mgr.deinit_thread(tid) };
        });

        // Reclaimer: retires the target first, then enough to start a round.
        s.spawn(move |_| {
            let tid = ThreadId::new(1);
            mgr.init_thread(tid);
            barrier.wait();

            while !published.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            let record = target.load(Ordering::SeqCst) as *mut u64;
            assert!(mgr.is_protected(tid, record));
            unsafe { mgr.retire(tid, record) };
            for _ in 0..64 {
                retire_one(mgr, tid);
            }
            assert_eq!(mgr.status(tid).signal_rounds, 0);

            retire_one(mgr, tid);
            let status = mgr.status(tid);
            assert_eq!(status.signal_rounds, 1);
            assert_eq!(status.unreclaimed, 2);
            assert_eq!(mgr.pool().delivered(), 64);
            assert!(!mgr.pool().was_delivered(record));
            swept.store(true, Ordering::SeqCst);

            barrier.wait();
            unsafe { mgr.deinit_thread(tid) };
        });
    })
    .unwrap();

    assert_eq!(mgr.pool().delivered(), 66);
}

#[test]
fn end_op_is_idempotent() {
    let mgr = Manager::<NbrPlus<u64>>::new(Config::new(1)).unwrap();
    let tid = ThreadId::new(0);
    mgr.init_thread(tid);
    let record = mgr.allocate(tid, 1);

    checkpoint!(mgr, tid);
    mgr.start_op(tid);
    assert!(!mgr.is_quiescent(tid));
    assert!(mgr.recovery().is_restartable(tid));
    mgr.save_for_write_phase(tid, record);
    mgr.upgrade_to_write_phase(tid);
    assert!(!mgr.recovery().is_restartable(tid));
    assert_eq!(mgr.status(tid).published, 1);

    mgr.end_op(tid);
    let first = mgr.status(tid);
    mgr.end_op(tid);
    let second = mgr.status(tid);

    assert!(mgr.is_quiescent(tid));
    assert!(!mgr.recovery().is_restartable(tid));
    assert!(!mgr.is_protected(tid, record));
    assert_eq!(first.published, 0);
    assert_eq!(second.published, 0);
    assert_eq!(first.retired, second.retired);

    unsafe {
        mgr.deallocate(tid, record);
        mgr.deinit_thread(tid);
    }
}

fn neutralize_spinning_readers<R: Reclaimer<u64>>() {
    const READERS: usize = 4;
    let config = Config::new(READERS + 1)
        .with_bag_capacity(2)
        .with_randomized_thresholds(false);
    let mgr = &Manager::<R>::new(config).unwrap();
    let barrier = &Barrier::new(READERS + 1);
    let entered = &AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..READERS {
            s.spawn(move |_| {
                let tid = ThreadId::new(t);
                mgr.init_thread(tid);
                barrier.wait();

                mgr.read_phase(tid, |phase| {
                    if phase.restarts() == 0 {
                        entered.fetch_add(1, Ordering::SeqCst);
                        loop {
                            std::thread::sleep(Duration::from_micros(1));
                        }
                    }
                });
                mgr.end_op(tid);
                assert_eq!(mgr.status(tid).restarts, 1);

                barrier.wait();
                unsafe { mgr.deinit_thread(tid) };
            });
        }

        let tid = ThreadId::new(READERS);
        mgr.init_thread(tid);
        barrier.wait();
        while entered.load(Ordering::SeqCst) < READERS {
            std::thread::yield_now();
        }
        // The fourth retire finds more than two records in the bag.
        for _ in 0..4 {
            retire_one(mgr, tid);
        }
        assert!(mgr.status(tid).signal_rounds >= 1);

        barrier.wait();
        unsafe { mgr.deinit_thread(tid) };
    })
    .unwrap();
}

#[test]
fn neutralize_spinning_readers_nbr() {
    neutralize_spinning_readers::<Nbr<u64>>();
}

#[test]
fn neutralize_spinning_readers_nbrplus() {
    neutralize_spinning_readers::<NbrPlus<u64>>();
}

#[test]
fn lo_watermark_piggybacks_on_peer_round() {
    let config = Config::new(2)
        .with_bag_capacity(128)
        .with_randomized_thresholds(false)
        .with_lo_watermark_cadence(1);
    let mgr = &Manager::<NbrPlus<u64>>::new(config).unwrap();
    let barrier = &Barrier::new(2);

    thread::scope(|s| {
        s.spawn(move |_| {
            let tid = ThreadId::new(0);
            mgr.init_thread(tid);
            barrier.wait();

            // Past half of the threshold: bookmark 65 records.
            for _ in 0..66 {
                retire_one(mgr, tid);
            }
            assert_eq!(mgr.status(tid).lo_reclaims, 0);
            barrier.wait();

            // The peer completes a round here.
            barrier.wait();
            let delivered = mgr.pool().delivered();
            retire_one(mgr, tid);
            let status = mgr.status(tid);
            assert_eq!(status.signal_rounds, 0);
            assert_eq!(status.lo_reclaims, 1);
            assert_eq!(status.unreclaimed, 2);
            assert_eq!(mgr.pool().delivered() - delivered, 65);

            barrier.wait();
            unsafe { mgr.deinit_thread(tid) };
        });

        s.spawn(move |_| {
            let tid = ThreadId::new(1);
            mgr.init_thread(tid);
            barrier.wait();

            barrier.wait();
            for _ in 0..130 {
                retire_one(mgr, tid);
            }
            let status = mgr.status(tid);
            assert_eq!(status.signal_rounds, 1);
            assert_eq!(status.announced_ts, 2);
            assert_eq!(status.unreclaimed, 1);
            barrier.wait();

            barrier.wait();
            unsafe { mgr.deinit_thread(tid) };
        });
    })
    .unwrap();
}

#[test]
fn nbr_orig_lo_watermark_reclaims_below_head_block() {
    const CAPACITY: usize = 1024;
    let patience = CAPACITY / BLOCK_SIZE;
    let config = Config::new(2)
        .with_bag_capacity(CAPACITY)
        .with_randomized_thresholds(false)
        .with_lo_watermark_cadence(1);
    let mgr = &Manager::<NbrOrig<u64>>::new(config).unwrap();
    let barrier = &Barrier::new(2);

    thread::scope(|s| {
        s.spawn(move |_| {
            let tid = ThreadId::new(0);
            mgr.init_thread(tid);
            barrier.wait();

            // Tid 0 passes its low watermark at half of the patience: the
            // last retire bookmarks the start of a fresh head block.
            let below_head = patience / 2 * BLOCK_SIZE;
            for _ in 0..below_head + 1 {
                retire_one(mgr, tid);
            }
            let status = mgr.status(tid);
            assert_eq!(status.lo_reclaims, 0);
            assert_eq!(status.unreclaimed, below_head + 1);
            barrier.wait();

            // The peer completes a round here.
            barrier.wait();
            let delivered = mgr.pool().delivered();
            retire_one(mgr, tid);
            let status = mgr.status(tid);
            assert_eq!(status.signal_rounds, 0);
            assert_eq!(status.lo_reclaims, 1);
            assert_eq!(status.unreclaimed, 2);
            assert_eq!(mgr.pool().delivered() - delivered, below_head);

            barrier.wait();
            unsafe { mgr.deinit_thread(tid) };
        });

        s.spawn(move |_| {
            let tid = ThreadId::new(1);
            mgr.init_thread(tid);
            barrier.wait();

            barrier.wait();
            for _ in 0..patience * BLOCK_SIZE + 1 {
                retire_one(mgr, tid);
            }
            let status = mgr.status(tid);
            assert_eq!(status.signal_rounds, 1);
            assert_eq!(status.announced_ts, 2);
            assert_eq!(status.lo_reclaims, 0);
            assert_eq!(status.unreclaimed, 1);
            barrier.wait();

            barrier.wait();
            unsafe { mgr.deinit_thread(tid) };
        });
    })
    .unwrap();
}

#[test]
fn nbr_orig_counts_blocks() {
    let mgr = Manager::<NbrOrig<u64>>::new(Config::new(1).with_bag_capacity(128)).unwrap();
    let tid = ThreadId::new(0);
    mgr.init_thread(tid);
    // Two blocks of patience.
    let high_watermark = mgr.status(tid).high_watermark;
    assert_eq!(high_watermark, 2 * BLOCK_SIZE);

    // The round starts once a third block is in use.
    while mgr.status(tid).signal_rounds == 0 {
        retire_one(&mgr, tid);
    }
    assert_eq!(mgr.status(tid).retired, high_watermark + 1);
    assert_eq!(mgr.status(tid).unreclaimed, 1);

    unsafe { mgr.deinit_thread(tid) };
}

#[test]
fn bottleneck_mode_drains_on_start_op() {
    let config = Config::new(1)
        .with_bag_capacity(64)
        .with_allocator_bottleneck_test(true);
    let mgr = Manager::<NoReclaim<u64>>::new(config).unwrap();
    let tid = ThreadId::new(0);
    mgr.init_thread(tid);
    assert!(!Manager::<NoReclaim<u64>>::needs_set_jmp());

    for _ in 0..63 {
        retire_one(&mgr, tid);
    }
    assert!(!mgr.start_op(tid));
    mgr.end_op(tid);
    retire_one(&mgr, tid);
    assert_eq!(mgr.pool().delivered(), 0);

    assert!(mgr.start_op(tid));
    mgr.end_op(tid);
    assert_eq!(mgr.pool().delivered(), 64);
    assert_eq!(mgr.status(tid).unreclaimed, 0);

    unsafe { mgr.deinit_thread(tid) };
}

#[test]
fn no_reclaim_keeps_records_until_deinit() {
    let mgr = Manager::<NoReclaim<u64>>::new(Config::new(1).with_bag_capacity(8)).unwrap();
    let tid = ThreadId::new(0);
    mgr.init_thread(tid);
    for _ in 0..100 {
        retire_one(&mgr, tid);
    }
    assert_eq!(mgr.pool().delivered(), 0);
    assert_eq!(mgr.status(tid).unreclaimed, 100);

    unsafe { mgr.deinit_thread(tid) };
    assert_eq!(mgr.pool().delivered(), 100);
}

#[test]
fn records_of_live_threads_are_released_on_drop() {
    let mgr = Manager::<Nbr<u64>>::new(Config::new(1)).unwrap();
    let tid = ThreadId::new(0);
    mgr.init_thread(tid);
    for _ in 0..10 {
        retire_one(&mgr, tid);
    }
    mgr.recovery().deinit_thread(tid);
    drop(mgr);
}

#[test]
fn invalid_configs_are_rejected() {
    fn error_of(config: Config) -> Option<Error> {
        Manager::<Nbr<u64>>::new(config).err()
    }

    assert_eq!(error_of(Config::new(0)), Some(Error::ZeroThreads));
    assert_eq!(
        error_of(Config::new(1).with_max_hazptrs(0)),
        Some(Error::ZeroHazardCapacity)
    );
    assert_eq!(
        error_of(Config::new(1).with_bag_capacity(0)),
        Some(Error::ZeroBagCapacity)
    );
    assert_eq!(
        error_of(Config::new(1).with_bag_capacity(100)),
        Some(Error::BagCapacityNotPowerOfTwo(100))
    );
    assert_eq!(
        error_of(Config::new(1).with_lo_watermark_cadence(0)),
        Some(Error::ZeroLoWatermarkCadence)
    );
    assert!(error_of(Config::new(4)).is_none());
}
