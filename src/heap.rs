//! The process-wide state object: central cache, page cache and counters.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicIsize, AtomicUsize, Ordering},
};

use crate::{
  block::Batch,
  central_cache::CentralCache,
  config::{MAX_BYTES, MIN_ALIGN, PAGE_SIZE},
  error::{AllocError, fatal},
  oversize,
  page_cache::PageCache,
  size_class::{class_index, class_size},
  span::{SpanInfo, page_of},
  thread_cache::ThreadCache,
};

/// Counter snapshot returned by [`Heap::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Classified bytes handed to callers and not yet freed, as last published
  /// by the thread caches.
  pub in_use_bytes: usize,
  /// Bytes currently held by bypassed (oversize) allocations.
  pub oversize_bytes: usize,
  /// Bytes mapped from the OS for spans.
  pub mapped_bytes: usize,
  /// Mapped bytes sitting in free spans.
  pub free_page_bytes: usize,
}

/// One complete allocator instance.
///
/// The process-wide instance lives behind [`crate::heap`]; independent
/// instances can be created for embedding and tests. Dropping a heap unmaps
/// every span, so no block or thread cache may outlive it.
pub struct Heap {
  central: CentralCache,
  pages: PageCache,
  in_use_bytes: AtomicIsize,
  oversize_bytes: AtomicUsize,
}

impl Heap {
  pub fn new() -> Result<Self, AllocError> {
    let pages = PageCache::new()?;
    let central = CentralCache::new(&pages)?;
    Ok(Self {
      central,
      pages,
      in_use_bytes: AtomicIsize::new(0),
      oversize_bytes: AtomicUsize::new(0),
    })
  }

  /// A fresh, empty front-end for the calling thread.
  pub fn thread_cache(&self) -> ThreadCache<'_> {
    ThreadCache::new(self)
  }

  // ===========================================================================
  // Tier plumbing
  // ===========================================================================

  #[inline]
  pub(crate) fn fetch_batch(&self, class: usize, want: usize) -> Result<Batch, AllocError> {
    self.central.fetch_batch(&self.pages, class, want)
  }

  /// # Safety
  ///
  /// See [`CentralCache::return_batch`].
  #[inline]
  pub(crate) unsafe fn return_batch(&self, class: usize, head: *mut u8) -> Result<(), AllocError> {
    unsafe { self.central.return_batch(&self.pages, class, head) }
  }

  pub(crate) fn add_in_use(&self, delta: isize) {
    self.in_use_bytes.fetch_add(delta, Ordering::Relaxed);
  }

  // ===========================================================================
  // Oversize bypass
  // ===========================================================================

  pub(crate) fn allocate_oversize(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    let ptr = oversize::allocate(size, align)?;
    self.oversize_bytes.fetch_add(size, Ordering::Relaxed);
    Ok(ptr)
  }

  /// # Safety
  ///
  /// `ptr` must come from [`Self::allocate_oversize`] and not be used afterwards.
  pub(crate) unsafe fn release_oversize(&self, ptr: *mut u8) {
    match unsafe { oversize::deallocate(ptr) } {
      Ok(size) => {
        self.oversize_bytes.fetch_sub(size, Ordering::Relaxed);
      }
      Err(err) => fatal(err),
    }
  }

  /// Size to pass when freeing `ptr`: its block size, or the requested size of
  /// a bypassed allocation.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap (pointers the page index
  /// does not know are read as bypassed allocations).
  pub(crate) unsafe fn allocation_size(&self, ptr: *const u8) -> Result<usize, AllocError> {
    if self.pages.lookup(page_of(ptr as usize)).is_none() {
      return unsafe { oversize::size_of_allocation(ptr) };
    }
    self.pages.block_size_of(ptr)
  }

  // ===========================================================================
  // Cache-less path
  // ===========================================================================

  /// Allocates without a thread cache, one central transfer per block. Used
  /// while the calling thread has no usable context.
  pub fn allocate_direct(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size > MAX_BYTES {
      return self.allocate_oversize(size, MIN_ALIGN);
    }
    let class = class_index(size)?;
    let mut batch = self.fetch_batch(class, 1)?;
    let block = unsafe { batch.pop() }.ok_or(AllocError::OutOfMemory(class_size(class)))?;
    self.add_in_use(class_size(class) as isize);
    // SAFETY: batches only ever hold block addresses.
    Ok(unsafe { NonNull::new_unchecked(block) })
  }

  /// # Safety
  ///
  /// `ptr` must come from this heap for `size` bytes and not be used afterwards.
  pub unsafe fn deallocate_direct(&self, ptr: NonNull<u8>, size: usize) {
    if size > MAX_BYTES {
      unsafe { self.release_oversize(ptr.as_ptr()) };
      return;
    }
    let class = match class_index(size) {
      Ok(class) => class,
      Err(err) => fatal(err),
    };
    let mut batch = Batch::empty();
    unsafe { batch.push(ptr.as_ptr()) };
    if let Err(err) = unsafe { self.return_batch(class, batch.head) } {
      fatal(err);
    }
    self.add_in_use(-(class_size(class) as isize));
  }

  /// [`Self::deallocate_direct`] recovering the size from the page index.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn deallocate_unsized_direct(&self, ptr: NonNull<u8>) {
    match unsafe { self.allocation_size(ptr.as_ptr()) } {
      Ok(size) => unsafe { self.deallocate_direct(ptr, size) },
      Err(err) => fatal(err),
    }
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Span covering `ptr`, looked up under the page lock.
  pub fn resolve_span(&self, ptr: *const u8) -> Option<SpanInfo> {
    self.pages.resolve_span(ptr)
  }

  /// Visits every free span in the page cache. Runs under the page lock, so
  /// `f` must not allocate from this heap.
  pub fn for_each_free_span(&self, f: impl FnMut(SpanInfo)) {
    self.pages.for_each_free_span(f);
  }

  pub fn stats(&self) -> HeapStats {
    let (mapped, free) = self.pages.page_counts();
    HeapStats {
      in_use_bytes: self.in_use_bytes.load(Ordering::Relaxed).max(0) as usize,
      oversize_bytes: self.oversize_bytes.load(Ordering::Relaxed),
      mapped_bytes: mapped * PAGE_SIZE,
      free_page_bytes: free * PAGE_SIZE,
    }
  }
}
