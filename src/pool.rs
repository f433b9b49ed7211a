use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::block_bag::BlockBag;
use crate::config::ThreadId;

/// Obtains fresh memory for records and gives it back.
pub trait Allocator<T>: Send + Sync {
    /// Returns uninitialized memory for one record.
    fn allocate(&self, tid: ThreadId) -> NonNull<T>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` of this allocator, be initialized,
    /// and be unreachable by every thread.
    unsafe fn deallocate(&self, tid: ThreadId, ptr: NonNull<T>);
}

/// Where reclaimed records go.
pub trait Pool<T>: Send + Sync {
    /// Returns uninitialized memory for one record.
    fn get(&self, tid: ThreadId) -> NonNull<T>;

    /// Take back one reclaimed record.
    ///
    /// # Safety
    ///
    /// `ptr` must be initialized and unreachable by every thread.
    unsafe fn add(&self, tid: ThreadId, ptr: NonNull<T>);

    /// Take back every record of `bag`, leaving it empty.
    ///
    /// # Safety
    ///
    /// Same as `add`, for every record in the bag.
    unsafe fn add_move_all(&self, tid: ThreadId, bag: &mut BlockBag<T>) {
        while !bag.is_empty() {
            self.add(tid, bag.remove());
        }
    }
}

/// The global allocator, with counters for leak checks.
#[derive(Default)]
pub struct AllocatorNew {
    allocated: AtomicUsize,
    deallocated: AtomicUsize,
}

impl AllocatorNew {
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> usize {
        self.deallocated.load(Ordering::Relaxed)
    }
}

impl<T> Allocator<T> for AllocatorNew {
    fn allocate(&self, _: ThreadId) -> NonNull<T> {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        let ptr = Box::into_raw(Box::<MaybeUninit<T>>::new(MaybeUninit::uninit()));
        unsafe { NonNull::new_unchecked(ptr.cast()) }
    }

    unsafe fn deallocate(&self, _: ThreadId, ptr: NonNull<T>) {
        self.deallocated.fetch_add(1, Ordering::Relaxed);
        drop(Box::from_raw(ptr.as_ptr()));
    }
}

/// A pool that keeps nothing: records go straight back to the allocator.
#[derive(Default)]
pub struct PoolNone<A = AllocatorNew> {
    allocator: A,
}

impl<A> PoolNone<A> {
    pub fn new(allocator: A) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<T, A: Allocator<T>> Pool<T> for PoolNone<A> {
    #[inline]
    fn get(&self, tid: ThreadId) -> NonNull<T> {
        self.allocator.allocate(tid)
    }

    #[inline]
    unsafe fn add(&self, tid: ThreadId, ptr: NonNull<T>) {
        self.allocator.deallocate(tid, ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn pool_none_drops_records() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = PoolNone::<AllocatorNew>::default();
        let tid = ThreadId::new(0);

        let mut bag = BlockBag::new();
        for _ in 0..100 {
            let ptr: NonNull<Tracked> = pool.get(tid);
            unsafe { ptr.as_ptr().write(Tracked(drops.clone())) };
            bag.add(ptr);
        }
        unsafe { pool.add_move_all(tid, &mut bag) };

        assert!(bag.is_empty());
        assert_eq!(drops.load(Ordering::Relaxed), 100);
        assert_eq!(pool.allocator().allocated(), 100);
        assert_eq!(pool.allocator().deallocated(), 100);
    }
}
