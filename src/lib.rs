#![allow(clippy::missing_safety_doc)]

//! Three-tier memory allocator: per-thread caches in front of per-size-class
//! central lists in front of one page cache that maps memory from the OS.
//!
//! Requests up to [`config::MAX_BYTES`] are rounded to one of
//! [`CLASSES_COUNT`] size classes; bigger ones bypass to the system allocator.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  ptr::{self, NonNull, null_mut},
};
use std::sync::OnceLock;

mod block;
mod central_cache;
pub mod config;
mod error;
mod heap;
mod object_pool;
mod oversize;
mod page_cache;
mod page_map;
mod platform;
mod size_class;
mod span;
mod sync;
mod thread_cache;

pub use config::{MAX_BYTES, MAX_PAGES, PAGE_SIZE};
pub use error::AllocError;
pub use heap::{Heap, HeapStats};
pub use size_class::{CLASSES_COUNT, aligned_size, batch_count, class_index, class_size, page_count};
pub use span::SpanInfo;
pub use thread_cache::ThreadCache;

use object_pool::ObjectPool;

// =============================================================================
// Process-wide heap
// =============================================================================

static HEAP: OnceLock<Heap> = OnceLock::new();

/// The process-wide heap, set up on first use.
pub fn heap() -> &'static Heap {
  HEAP.get_or_init(|| match Heap::new() {
    Ok(heap) => heap,
    Err(err) => panic!("trimalloc: heap setup failed: {err}"),
  })
}

// =============================================================================
// TLS
// =============================================================================

/// Thread caches of the process-wide heap live here, never in the heap itself.
static THREAD_CACHES: ObjectPool<ThreadCache<'static>> = ObjectPool::new();

struct ThreadContext {
  cache: Cell<Option<NonNull<ThreadCache<'static>>>>,
}

impl Drop for ThreadContext {
  fn drop(&mut self) {
    // Dropping the cache hands every cached block back to the central cache.
    if let Some(cache) = self.cache.take() {
      unsafe { THREAD_CACHES.release(cache) };
    }
  }
}

thread_local! {
  static CONTEXT: ThreadContext = const { ThreadContext { cache: Cell::new(None) } };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Clears `IN_ALLOC` on scope exit, unwinding included.
struct EntryGuard;

impl Drop for EntryGuard {
  fn drop(&mut self) {
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
}

/// Runs `f` on this thread's cache, creating it on first use. `None` when the
/// context is being torn down, when called re-entrantly, or when the cache
/// record cannot be mapped; callers then take the direct path.
fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache<'static>) -> R) -> Option<R> {
  // TLS may already be destroyed during thread exit.
  let entered = IN_ALLOC.try_with(|flag| !flag.replace(true)).unwrap_or(false);
  if !entered {
    return None;
  }
  let _guard = EntryGuard;

  CONTEXT
    .try_with(|context| {
      let cache = match context.cache.get() {
        Some(cache) => cache,
        None => {
          let cache = THREAD_CACHES.acquire(heap().thread_cache()).ok()?;
          context.cache.set(Some(cache));
          cache
        }
      };
      Some(f(unsafe { &mut *cache.as_ptr() }))
    })
    .ok()
    .flatten()
}

// =============================================================================
// Public API
// =============================================================================

/// At least `size` bytes, aligned to the size class quantum (16 bytes for the
/// system-allocator bypass).
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
  with_thread_cache(|cache| cache.allocate(size)).unwrap_or_else(|| heap().allocate_direct(size))
}

/// Frees a pointer from [`allocate`]. `size` must be the size it was requested
/// with (or any size of the same class).
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
  if with_thread_cache(|cache| unsafe { cache.deallocate(ptr, size) }).is_none() {
    unsafe { heap().deallocate_direct(ptr, size) };
  }
}

/// Frees a pointer from [`allocate`] without its size, at the cost of one
/// page-index lookup. Panics if `ptr` is not a live allocation.
pub unsafe fn deallocate_unsized(ptr: NonNull<u8>) {
  if with_thread_cache(|cache| unsafe { cache.deallocate_unsized(ptr) }).is_none() {
    unsafe { heap().deallocate_unsized_direct(ptr) };
  }
}

/// Span covering `ptr` in the process-wide heap.
pub fn resolve_span(ptr: *const u8) -> Option<SpanInfo> {
  heap().resolve_span(ptr)
}

/// Hands every block cached by the calling thread back to the central cache.
pub fn flush_thread_cache() {
  with_thread_cache(ThreadCache::flush);
}

/// Moves `value` into storage from the process-wide heap.
pub fn construct<T>(value: T) -> Result<NonNull<T>, AllocError> {
  let layout = Layout::new::<T>();
  if layout.size() == 0 {
    core::mem::forget(value);
    return Ok(NonNull::dangling());
  }
  let ptr = alloc_layout(layout)?.cast::<T>();
  unsafe { ptr.as_ptr().write(value) };
  Ok(ptr)
}

/// Drops the value behind `ptr` and frees its storage.
pub unsafe fn destroy<T>(ptr: NonNull<T>) {
  unsafe { ptr::drop_in_place(ptr.as_ptr()) };
  let layout = Layout::new::<T>();
  if layout.size() != 0 {
    unsafe { dealloc_layout(ptr.cast(), layout) };
  }
}

// =============================================================================
// Layouts
// =============================================================================

/// Size to classify `layout` with, or `None` if it has to bypass the tiers.
///
/// Blocks start on page-aligned span bases and are spaced by their block size,
/// so rounding the size up to the alignment makes every block aligned.
#[inline]
fn classified_size(layout: Layout) -> Option<usize> {
  let align = layout.align();
  if align > PAGE_SIZE {
    return None;
  }
  let size = layout.size().max(1).checked_add(align - 1)? & !(align - 1);
  (size <= MAX_BYTES).then_some(size)
}

fn alloc_layout(layout: Layout) -> Result<NonNull<u8>, AllocError> {
  match classified_size(layout) {
    Some(size) => allocate(size),
    None => heap().allocate_oversize(layout.size(), layout.align()),
  }
}

unsafe fn dealloc_layout(ptr: NonNull<u8>, layout: Layout) {
  match classified_size(layout) {
    Some(size) => unsafe { deallocate(ptr, size) },
    None => unsafe { heap().release_oversize(ptr.as_ptr()) },
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `#[global_allocator]` adapter over the process-wide heap.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    alloc_layout(layout).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { dealloc_layout(ptr, layout) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };

    // Same size class: the block already fits.
    if let (Some(old), Some(new)) = (classified_size(layout), classified_size(new_layout))
      && aligned_size(old) == aligned_size(new)
    {
      return ptr;
    }

    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn layouts_round_to_their_alignment() {
    let layout = |size, align| Layout::from_size_align(size, align).unwrap();
    assert_eq!(classified_size(layout(0, 1)), Some(1));
    assert_eq!(classified_size(layout(24, 8)), Some(24));
    assert_eq!(classified_size(layout(100, 64)), Some(128));
    assert_eq!(classified_size(layout(1, PAGE_SIZE)), Some(PAGE_SIZE));
    assert_eq!(classified_size(layout(1, 2 * PAGE_SIZE)), None);
    assert_eq!(classified_size(layout(MAX_BYTES, 16)), Some(MAX_BYTES));
    assert_eq!(classified_size(layout(MAX_BYTES + 1, 16)), None);
  }

  #[test]
  fn aligned_layouts_get_aligned_blocks() {
    for align in [8, 32, 64, 256, 4096] {
      for size in [1, 40, 100, 3000, 9000] {
        let layout = Layout::from_size_align(size, align).unwrap();
        let ptr = alloc_layout(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % align, 0, "size {size} align {align}");
        unsafe { dealloc_layout(ptr, layout) };
      }
    }
  }

  #[test]
  fn thread_cache_survives_a_caught_fatal_free() {
    let mut local = [0u64; 8];
    let bogus = NonNull::new(local[4..].as_mut_ptr().cast::<u8>()).unwrap();
    let caught = std::panic::catch_unwind(move || unsafe { deallocate_unsized(bogus) });
    assert!(caught.is_err());

    assert!(with_thread_cache(|_| ()).is_some());
    let ptr = allocate(64).unwrap();
    unsafe { deallocate(ptr, 64) };
  }

  #[test]
  fn zero_sized_values_skip_the_heap() {
    let ptr = construct(()).unwrap();
    assert_eq!(ptr, NonNull::dangling());
    unsafe { destroy(ptr) };
  }

  #[test]
  fn construct_and_destroy() {
    let ptr = construct([7u64; 20]).unwrap();
    assert_eq!(unsafe { ptr.as_ref() }[19], 7);
    assert_eq!(resolve_span(ptr.as_ptr().cast()).map(|s| s.block_size), Some(160));
    unsafe { destroy(ptr) };
  }
}
