use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{compiler_fence, Ordering};

// A block spans about BLOCK_SIZE_DESIRED_BYTES. "-3" leaves room for
// `next`, `size` and the allocator header.
const BLOCK_SIZE_DESIRED_BYTES: usize = 512;
pub const BLOCK_SIZE: usize = BLOCK_SIZE_DESIRED_BYTES / std::mem::size_of::<usize>() - 3;

const MAX_BLOCK_POOL_SIZE: usize = 32;

/// A bag of retired records: a stack of fixed-size blocks, newest first.
///
/// Only the owner thread touches it, so nothing here is atomic. Blocks are
/// recycled through a small private pool.
pub struct BlockBag<T> {
    size_in_blocks: usize,
    head: NonNull<Block<T>>,
    pool: Box<BlockPool<T>>,
}

/// A position in a [`BlockBag`]: the block and the slot index in it.
///
/// Everything pushed after the position was taken is "newer" than it, as
/// long as no record was removed in between.
pub struct BagPosition<T> {
    block: *const Block<T>,
    index: usize,
}

impl<T> Clone for BagPosition<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BagPosition<T> {}

impl<T> PartialEq for BagPosition<T> {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block && self.index == other.index
    }
}

impl<T> Eq for BagPosition<T> {}

impl<T> fmt::Debug for BagPosition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BagPosition")
            .field("block", &self.block)
            .field("index", &self.index)
            .finish()
    }
}

impl<T> Default for BlockBag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockBag<T> {
    pub fn new() -> Self {
        let mut pool = Box::<BlockPool<T>>::default();
        let head = pool.allocate(ptr::null_mut());
        Self {
            size_in_blocks: 1,
            head,
            pool,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = unsafe { self.head.as_ref() };
        head.next.is_null() && head.is_empty()
    }

    #[inline]
    pub fn size_in_blocks(&self) -> usize {
        self.size_in_blocks
    }

    /// The number of records in the head block.
    #[inline]
    pub fn head_size(&self) -> usize {
        unsafe { self.head.as_ref() }.size
    }

    /// The number of records. Only the head block may be partially filled.
    #[inline]
    pub fn len(&self) -> usize {
        (self.size_in_blocks - 1) * BLOCK_SIZE + self.head_size()
    }

    pub fn add(&mut self, obj: NonNull<T>) {
        let head_ref = unsafe { self.head.as_mut() };
        head_ref.push(obj);
        if head_ref.is_full() {
            let new_head = self.pool.allocate(self.head.as_ptr());
            self.size_in_blocks += 1;
            compiler_fence(Ordering::SeqCst);
            self.head = new_head;
        }
    }

    /// Pop the newest record.
    ///
    /// # Panics
    ///
    /// Panics if the bag is empty.
    pub fn remove(&mut self) -> NonNull<T> {
        assert!(!self.is_empty());
        unsafe {
            let head_ref = self.head.as_mut();
            if head_ref.is_empty() {
                let block = self.head;
                self.head = NonNull::new_unchecked(head_ref.next);
                self.pool.try_recycle(block);
                self.size_in_blocks -= 1;
                self.head.as_mut().pop()
            } else {
                head_ref.pop()
            }
        }
    }

    /// The newest record, if any.
    pub fn peek(&self) -> Option<NonNull<T>> {
        let head_ref = unsafe { self.head.as_ref() };
        if !head_ref.is_empty() {
            return Some(head_ref.top());
        }
        unsafe { head_ref.next.as_ref() }.map(Block::top)
    }

    /// The position the next `add` writes to.
    #[inline]
    pub fn position(&self) -> BagPosition<T> {
        BagPosition {
            block: self.head.as_ptr(),
            index: self.head_size(),
        }
    }

    /// The start of the head block: records of the head block count as
    /// newer than this position.
    #[inline]
    pub fn block_start_position(&self) -> BagPosition<T> {
        BagPosition {
            block: self.head.as_ptr(),
            index: 0,
        }
    }

    /// Whether the newest record was added after `bookmark` was taken.
    ///
    /// `bookmark` must have been taken from this bag, and no record may have
    /// been removed since.
    #[inline]
    pub fn is_newer_than(&self, bookmark: BagPosition<T>) -> bool {
        if self.is_empty() {
            return false;
        }
        let head = self.head.as_ptr() as *const Block<T>;
        head != bookmark.block || self.head_size() > bookmark.index
    }

    /// Records from the newest to the oldest, each with its position.
    pub fn iter(&self) -> BagIter<'_, T> {
        BagIter {
            block: self.head.as_ptr(),
            index: self.head_size(),
            _marker: PhantomData,
        }
    }
}

/// See [`BlockBag::iter`].
pub struct BagIter<'a, T> {
    block: *const Block<T>,
    index: usize,
    _marker: PhantomData<&'a BlockBag<T>>,
}

impl<'a, T> Iterator for BagIter<'a, T> {
    type Item = (BagPosition<T>, NonNull<T>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let block = unsafe { self.block.as_ref() }?;
            if self.index > 0 {
                self.index -= 1;
                let record = unsafe { NonNull::new_unchecked(block.data[self.index]) };
                let position = BagPosition {
                    block: self.block,
                    index: self.index,
                };
                return Some((position, record));
            }
            self.block = block.next;
            self.index = unsafe { self.block.as_ref() }.map_or(0, |next| next.size);
        }
    }
}

impl<T> Drop for BlockBag<T> {
    fn drop(&mut self) {
        // Records must have been handed over to a pool already; the
        // remaining pointers are forgotten.
        let mut curr = self.head.as_ptr();
        unsafe {
            while let Some(curr_ref) = curr.as_ref() {
                let next = curr_ref.next;
                self.pool.try_recycle(NonNull::new_unchecked(curr));
                curr = next;
            }
        }
    }
}

struct BlockPool<T> {
    pool: [*mut Block<T>; MAX_BLOCK_POOL_SIZE],
    size: usize,
}

impl<T> Default for BlockPool<T> {
    fn default() -> Self {
        Self {
            pool: [ptr::null_mut(); MAX_BLOCK_POOL_SIZE],
            size: 0,
        }
    }
}

impl<T> Drop for BlockPool<T> {
    fn drop(&mut self) {
        for i in 0..self.size {
            drop(unsafe { Box::from_raw(self.pool[i]) });
        }
    }
}

impl<T> BlockPool<T> {
    fn allocate(&mut self, next: *mut Block<T>) -> NonNull<Block<T>> {
        unsafe {
            // If there is an available block, reuse it.
            if self.size > 0 {
                let result = self.pool[self.size - 1];
                self.size -= 1;
                (*result).next = next;
                (*result).size = 0;
                NonNull::new_unchecked(result)
            } else {
                NonNull::new_unchecked(Box::into_raw(Box::new(Block::new(next))))
            }
        }
    }

    fn try_recycle(&mut self, block: NonNull<Block<T>>) {
        if self.size == MAX_BLOCK_POOL_SIZE {
            drop(unsafe { Box::from_raw(block.as_ptr()) });
        } else {
            self.pool[self.size] = block.as_ptr();
            self.size += 1;
        }
    }
}

struct Block<T> {
    next: *mut Block<T>,
    size: usize,
    data: [*mut T; BLOCK_SIZE],
}

impl<T> Block<T> {
    fn new(next: *mut Block<T>) -> Self {
        Self {
            next,
            size: 0,
            data: [ptr::null_mut(); BLOCK_SIZE],
        }
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.size == BLOCK_SIZE
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    fn push(&mut self, obj: NonNull<T>) {
        assert!(self.size < BLOCK_SIZE);
        let prev_size = self.size;
        self.data[prev_size] = obj.as_ptr();
        compiler_fence(Ordering::SeqCst);
        self.size = prev_size + 1;
    }

    #[inline]
    fn pop(&mut self) -> NonNull<T> {
        assert!(self.size > 0);
        self.size -= 1;
        unsafe { NonNull::new_unchecked(self.data[self.size]) }
    }

    #[inline]
    fn top(&self) -> NonNull<T> {
        unsafe { NonNull::new_unchecked(self.data[self.size - 1]) }
    }
}
