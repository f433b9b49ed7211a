use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Records a thread saved for its write phase.
/// (Single-Writer Multi-Reader)
///
/// The owner publishes with `push` and resets with `clear`; reclaimers
/// read `len` and then the slots below it.
pub struct HazardSlots<T> {
    len: AtomicUsize,
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> HazardSlots<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            len: AtomicUsize::new(0),
            slots: (0..capacity)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish `ptr`. A null pointer needs no protection and is skipped.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is exhausted.
    #[inline]
    pub fn push(&self, ptr: *mut T) {
        if ptr.is_null() {
            return;
        }
        let len = self.len.load(Ordering::Relaxed);
        assert!(
            len < self.slots.len(),
            "more than {} records saved for one write phase",
            self.slots.len()
        );
        self.slots[len].store(ptr, Ordering::Release);
        self.len.store(len + 1, Ordering::Release);
    }

    #[inline]
    pub fn clear(&self) {
        self.len.store(0, Ordering::Release);
    }

    #[inline]
    pub fn get(&self, index: usize) -> *mut T {
        self.slots[index].load(Ordering::Acquire)
    }

    pub fn contains(&self, ptr: *mut T) -> bool {
        self.iter().any(|p| p == ptr)
    }

    pub fn iter(&self) -> impl Iterator<Item = *mut T> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_clear() {
        let slots = HazardSlots::new(2);
        let mut a = 1;
        let mut b = 2;
        slots.push(ptr::null_mut());
        assert!(slots.is_empty());

        slots.push(&mut a);
        slots.push(&mut b);
        assert_eq!(slots.len(), 2);
        assert!(slots.contains(&mut a));
        assert_eq!(slots.iter().collect::<Vec<_>>(), vec![&mut a as *mut _, &mut b as *mut _]);

        slots.clear();
        assert!(slots.is_empty());
        assert!(!slots.contains(&mut a));
    }

    #[test]
    #[should_panic]
    fn overflow() {
        let slots = HazardSlots::new(1);
        let mut a = 1;
        let mut b = 2;
        slots.push(&mut a);
        slots.push(&mut b);
    }
}
