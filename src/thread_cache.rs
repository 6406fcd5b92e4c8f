//! Thread cache (front-end): per-class free lists owned by one thread.
//!
//! Nothing here locks. Misses refill from the central cache with a batch that
//! starts at one block and grows by one per refill up to the class's
//! [`batch_count`]. A list that grows to [`MAX_BATCH_BLOCKS`] hands one such
//! batch back.

use core::ptr::{NonNull, null_mut};

use crate::{
  block,
  config::{MAX_BATCH_BLOCKS, MAX_BYTES, MIN_ALIGN},
  error::{AllocError, fatal},
  heap::Heap,
  size_class::{CLASSES_COUNT, batch_count, class_index, class_size},
};

#[derive(Clone, Copy)]
struct FreeList {
  head: *mut u8,
  len: usize,
  /// Blocks requested by the next refill.
  slow_start: usize,
}

impl FreeList {
  const EMPTY: Self = Self {
    head: null_mut(),
    len: 0,
    slow_start: 1,
  };

  #[inline(always)]
  fn pop(&mut self) -> Option<*mut u8> {
    if self.head.is_null() {
      return None;
    }
    let block = self.head;
    self.head = unsafe { block::next_of(block) };
    self.len -= 1;
    Some(block)
  }

  #[inline(always)]
  unsafe fn push(&mut self, block: *mut u8) {
    unsafe { block::set_next(block, self.head) };
    self.head = block;
    self.len += 1;
  }

  /// Detaches the first `count` blocks as a null-terminated chain.
  unsafe fn split_off(&mut self, count: usize) -> *mut u8 {
    debug_assert!(count > 0 && count <= self.len);
    let head = self.head;
    let mut tail = head;
    for _ in 1..count {
      tail = unsafe { block::next_of(tail) };
    }
    self.head = unsafe { block::next_of(tail) };
    unsafe { block::set_next(tail, null_mut()) };
    self.len -= count;
    head
  }
}

/// Per-thread front-end bound to one [`Heap`].
pub struct ThreadCache<'h> {
  heap: &'h Heap,
  lists: [FreeList; CLASSES_COUNT],
  /// In-use byte delta not yet published to the heap counters.
  pending: isize,
}

// A cache only ever runs on one thread at a time; moving it is fine.
unsafe impl Send for ThreadCache<'_> {}

impl<'h> ThreadCache<'h> {
  pub(crate) fn new(heap: &'h Heap) -> Self {
    Self {
      heap,
      lists: [FreeList::EMPTY; CLASSES_COUNT],
      pending: 0,
    }
  }

  pub fn heap(&self) -> &'h Heap {
    self.heap
  }

  /// At least `size` usable bytes. Sizes above the ceiling go to the system
  /// allocator.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size > MAX_BYTES {
      return self.heap.allocate_oversize(size, MIN_ALIGN);
    }
    let class = class_index(size)?;
    let block = match self.lists[class].pop() {
      Some(block) => block,
      None => self.refill(class)?,
    };
    self.pending += class_size(class) as isize;
    // SAFETY: free lists only ever hold block addresses.
    Ok(unsafe { NonNull::new_unchecked(block) })
  }

  #[cold]
  fn refill(&mut self, class: usize) -> Result<*mut u8, AllocError> {
    let block_size = class_size(class);
    let limit = batch_count(block_size);
    let list = &mut self.lists[class];
    let want = list.slow_start.min(limit);
    if list.slow_start < limit {
      list.slow_start += 1;
    }

    let mut batch = self.heap.fetch_batch(class, want)?;
    let block = unsafe { batch.pop() }.ok_or(AllocError::OutOfMemory(block_size))?;
    if !batch.is_empty() {
      let list = &mut self.lists[class];
      unsafe { block::set_next(batch.tail, list.head) };
      list.head = batch.head;
      list.len += batch.len;
    }
    self.publish();
    Ok(block)
  }

  /// Returns a block obtained from [`Self::allocate`] with the same `size`.
  ///
  /// # Safety
  ///
  /// `ptr` must come from this heap for `size` bytes and not be used afterwards.
  pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
    if size > MAX_BYTES {
      unsafe { self.heap.release_oversize(ptr.as_ptr()) };
      return;
    }
    let class = match class_index(size) {
      Ok(class) => class,
      Err(err) => fatal(err),
    };
    let block_size = class_size(class);
    let list = &mut self.lists[class];
    unsafe { list.push(ptr.as_ptr()) };
    self.pending -= block_size as isize;

    if list.len >= MAX_BATCH_BLOCKS {
      self.release(class, batch_count(block_size));
    }
  }

  /// Frees `ptr` without its size, recovering the size from the page index
  /// (or the bypass header).
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn deallocate_unsized(&mut self, ptr: NonNull<u8>) {
    match unsafe { self.heap.allocation_size(ptr.as_ptr()) } {
      Ok(size) => unsafe { self.deallocate(ptr, size) },
      Err(err) => fatal(err),
    }
  }

  /// Hands the first `count` blocks of class `class` back to the central cache.
  fn release(&mut self, class: usize, count: usize) {
    let chain = unsafe { self.lists[class].split_off(count) };
    if let Err(err) = unsafe { self.heap.return_batch(class, chain) } {
      fatal(err);
    }
    self.publish();
  }

  /// Returns every cached block to the central cache.
  pub fn flush(&mut self) {
    for class in 0..CLASSES_COUNT {
      let len = self.lists[class].len;
      if len > 0 {
        self.release(class, len);
      }
    }
    self.publish();
  }

  /// Blocks cached for class `class`.
  pub fn cached(&self, class: usize) -> usize {
    self.lists[class].len
  }

  fn publish(&mut self) {
    if self.pending != 0 {
      self.heap.add_in_use(self.pending);
      self.pending = 0;
    }
  }
}

impl Drop for ThreadCache<'_> {
  fn drop(&mut self) {
    self.flush();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn slow_start_grows_one_block_per_refill() {
    let heap = Heap::new().unwrap();
    let mut cache = heap.thread_cache();
    let class = class_index(64).unwrap();

    // Refill k fetches k blocks: one is returned, k - 1 stay cached.
    let mut held = Vec::new();
    held.push(cache.allocate(64).unwrap());
    assert_eq!(cache.cached(class), 0);
    held.push(cache.allocate(64).unwrap());
    assert_eq!(cache.cached(class), 1);
    held.push(cache.allocate(64).unwrap());
    assert_eq!(cache.cached(class), 0);
    held.push(cache.allocate(64).unwrap());
    assert_eq!(cache.cached(class), 2);

    for ptr in held {
      unsafe { cache.deallocate(ptr, 64) };
    }
  }

  #[test]
  fn large_class_caches_up_to_the_shared_threshold() {
    let heap = Heap::new().unwrap();
    let mut cache = heap.thread_cache();
    let size = 64 * 1024;
    let class = class_index(size).unwrap();
    assert_eq!(batch_count(size), 8);

    let held: Vec<_> = (0..20).map(|_| cache.allocate(size).unwrap()).collect();
    let before = cache.cached(class);
    for ptr in held {
      unsafe { cache.deallocate(ptr, size) };
    }
    assert_eq!(cache.cached(class), before + 20);
  }

  #[test]
  fn full_list_releases_one_batch() {
    let heap = Heap::new().unwrap();
    let mut cache = heap.thread_cache();
    let size = 64 * 1024;
    let class = class_index(size).unwrap();
    let batch = batch_count(size);

    let held: Vec<_> = (0..MAX_BATCH_BLOCKS + 4).map(|_| cache.allocate(size).unwrap()).collect();
    let mut expected = cache.cached(class);
    for (freed, &ptr) in held.iter().enumerate() {
      unsafe { cache.deallocate(ptr, size) };
      expected += 1;
      if expected >= MAX_BATCH_BLOCKS {
        expected -= batch;
      }
      assert_eq!(cache.cached(class), expected, "after {} frees", freed + 1);
    }
    assert!(expected < MAX_BATCH_BLOCKS);
  }

  #[test]
  fn drop_returns_everything_to_the_page_cache() {
    let heap = Heap::new().unwrap();
    {
      let mut cache = heap.thread_cache();
      let held: Vec<_> = (1..2000).map(|i| (cache.allocate(i * 7).unwrap(), i * 7)).collect();
      for (ptr, size) in held {
        unsafe { ptr.as_ptr().write_bytes(0x5A, size) };
        unsafe { cache.deallocate(ptr, size) };
      }
    }
    let stats = heap.stats();
    assert_eq!(stats.in_use_bytes, 0);
    assert_eq!(stats.free_page_bytes, stats.mapped_bytes);
  }

  #[test]
  fn unsized_free_recovers_the_class() {
    let heap = Heap::new().unwrap();
    let mut cache = heap.thread_cache();
    let ptr = cache.allocate(130).unwrap();
    assert_eq!(heap.resolve_span(ptr.as_ptr()).map(|s| s.block_size), Some(144));
    unsafe { cache.deallocate_unsized(ptr) };
    assert_eq!(cache.cached(class_index(144).unwrap()), 1);
  }

  #[test]
  fn zero_bytes_is_invalid() {
    let heap = Heap::new().unwrap();
    let mut cache = heap.thread_cache();
    assert_eq!(cache.allocate(0), Err(AllocError::InvalidSize(0)));
  }

  #[test]
  fn oversize_requests_bypass_the_tiers() {
    let heap = Heap::new().unwrap();
    let mut cache = heap.thread_cache();
    let ptr = cache.allocate(600_000).unwrap();
    assert!(heap.resolve_span(ptr.as_ptr()).is_none());
    assert_eq!(heap.stats().oversize_bytes, 600_000);
    unsafe { cache.deallocate_unsized(ptr) };
    assert_eq!(heap.stats().oversize_bytes, 0);
  }
}
