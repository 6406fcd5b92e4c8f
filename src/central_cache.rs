//! Central cache (middle-end): one spin-locked span list per size class.
//!
//! A size-class lock is never held while the page lock is taken. Fetching a
//! new span drops the class lock, carves the span under the page lock, stripes
//! it with no lock held, then re-locks the class to publish it.

use core::ptr::{NonNull, null_mut};

use crate::{
  block::{self, Batch},
  error::AllocError,
  page_cache::PageCache,
  size_class::{CLASSES_COUNT, class_size, page_count},
  span::{Span, SpanList, page_of},
  sync::SpinMutex,
};

pub(crate) struct CentralCache {
  lists: [SpinMutex<SpanList>; CLASSES_COUNT],
}

impl CentralCache {
  pub(crate) fn new(pages: &PageCache) -> Result<Self, AllocError> {
    let mut sentinels = [NonNull::dangling(); CLASSES_COUNT];
    for sentinel in &mut sentinels {
      *sentinel = pages.new_sentinel()?;
    }
    Ok(Self {
      lists: sentinels.map(|sentinel| SpinMutex::new(unsafe { SpanList::with_sentinel(sentinel) })),
    })
  }

  /// Detaches between 1 and `want` blocks of class `class`.
  pub(crate) fn fetch_batch(
    &self,
    pages: &PageCache,
    class: usize,
    want: usize,
  ) -> Result<Batch, AllocError> {
    debug_assert!(want > 0);
    {
      let list = self.lists[class].lock();
      if let Some(span) = list.iter().find(|s| unsafe { !s.as_ref().free_list.is_null() }) {
        return Ok(unsafe { (*span.as_ptr()).take(want) });
      }
    }

    let block_size = class_size(class);
    let span = {
      let mut page = pages.lock();
      let span = page.alloc_span(page_count(block_size))?;
      page.assign_block_size(span, block_size);
      span
    };
    // The span is reachable only through this thread until it is published.
    unsafe { (*span.as_ptr()).stripe(block_size) };

    let mut list = self.lists[class].lock();
    unsafe {
      list.push_front(span);
      Ok((*span.as_ptr()).take(want))
    }
  }

  /// Hands a chain of class `class` blocks back to their spans. Spans left
  /// with no checked-out blocks go back to the page cache.
  ///
  /// # Safety
  ///
  /// `head` must start a null-terminated chain of blocks handed out for this
  /// class and not returned since.
  pub(crate) unsafe fn return_batch(
    &self,
    pages: &PageCache,
    class: usize,
    head: *mut u8,
  ) -> Result<(), AllocError> {
    let block_size = class_size(class);
    let mut list = self.lists[class].lock();
    let mut block = head;

    while !block.is_null() {
      let addr = block as usize;
      let next = unsafe { block::next_of(block) };
      let span = pages.lookup(page_of(addr)).ok_or(AllocError::CorruptedFreeList(addr))?;
      let s = span.as_ptr();

      unsafe {
        check_block(&*s, addr, block_size)?;
        block::set_next(block, (*s).free_list);
        (*s).free_list = block;
        (*s).use_count -= 1;

        if (*s).use_count == 0 {
          list.unlink(span);
          (*s).free_list = null_mut();
          drop(list);
          pages.lock().free_span(span);
          list = self.lists[class].lock();
        }
      }
      block = next;
    }
    Ok(())
  }

  /// Spans currently attached to class `class`.
  #[cfg(test)]
  pub(crate) fn spans_in(&self, class: usize) -> usize {
    self.lists[class].lock().iter().count()
  }
}

/// Validates that `addr` is a checked-out block of an attached span of the
/// expected class.
#[inline]
fn check_block(span: &Span, addr: usize, block_size: usize) -> Result<(), AllocError> {
  if !span.covers(page_of(addr)) {
    return Err(AllocError::CorruptedFreeList(addr));
  }
  if !span.in_use || span.use_count == 0 {
    return Err(AllocError::DoubleFree(addr));
  }
  if span.block_size != block_size || !span.is_block_start(addr) {
    return Err(AllocError::CorruptedFreeList(addr));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::{MAX_BYTES, PAGE_SIZE},
    size_class::{batch_count, class_index},
  };

  fn setup() -> (PageCache, CentralCache) {
    let pages = PageCache::new().unwrap();
    let central = CentralCache::new(&pages).unwrap();
    (pages, central)
  }

  #[test]
  fn first_fetch_carves_one_span() {
    let (pages, central) = setup();
    let class = class_index(64).unwrap();
    let batch = central.fetch_batch(&pages, class, 10).unwrap();
    assert_eq!(batch.len, 10);
    assert_eq!(central.spans_in(class), 1);

    let span = pages.resolve_span(batch.head).unwrap();
    assert!(span.in_use);
    assert_eq!(span.block_size, 64);
    assert_eq!(span.pages, page_count(64));
  }

  #[test]
  fn second_fetch_reuses_the_span() {
    let (pages, central) = setup();
    let class = class_index(256).unwrap();
    let a = central.fetch_batch(&pages, class, 4).unwrap();
    let b = central.fetch_batch(&pages, class, 4).unwrap();
    assert_eq!(central.spans_in(class), 1);
    assert_eq!(pages.resolve_span(a.head), pages.resolve_span(b.head));
  }

  #[test]
  fn returning_every_block_releases_the_span() {
    let (pages, central) = setup();
    let class = class_index(1024).unwrap();
    let want = batch_count(1024);
    let batch = central.fetch_batch(&pages, class, want).unwrap();
    assert_eq!(batch.len, want);

    unsafe { central.return_batch(&pages, class, batch.head).unwrap() };
    assert_eq!(central.spans_in(class), 0);
    let (mapped, free) = pages.page_counts();
    assert_eq!(mapped, free);
  }

  #[test]
  fn partial_batch_when_span_runs_dry() {
    let (pages, central) = setup();
    let class = class_index(MAX_BYTES).unwrap();
    let span_blocks = page_count(MAX_BYTES) * PAGE_SIZE / MAX_BYTES;
    let batch = central.fetch_batch(&pages, class, span_blocks + 5).unwrap();
    assert_eq!(batch.len, span_blocks);
  }

  #[test]
  fn return_after_release_is_a_double_free() {
    let (pages, central) = setup();
    let class = class_index(32).unwrap();
    let batch = central.fetch_batch(&pages, class, 1).unwrap();
    let block = batch.head;
    unsafe {
      central.return_batch(&pages, class, block).unwrap();
      block::set_next(block, null_mut());
      let err = central.return_batch(&pages, class, block).unwrap_err();
      assert_eq!(err, AllocError::DoubleFree(block as usize));
    }
  }

  #[test]
  fn wrong_class_is_rejected() {
    let (pages, central) = setup();
    let batch = central.fetch_batch(&pages, class_index(8).unwrap(), 2).unwrap();
    let err = unsafe { central.return_batch(&pages, class_index(16).unwrap(), batch.head) };
    assert_eq!(err, Err(AllocError::CorruptedFreeList(batch.head as usize)));
  }

  #[test]
  fn foreign_pointer_is_rejected() {
    let (pages, central) = setup();
    let mut local = [0u64; 2];
    let ptr: *mut u8 = local.as_mut_ptr().cast();
    let err = unsafe { central.return_batch(&pages, 0, ptr) };
    assert_eq!(err, Err(AllocError::CorruptedFreeList(ptr as usize)));
  }
}
