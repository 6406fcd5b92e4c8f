//! Spans: metadata for contiguous page runs, and the circular intrusive list
//! that threads them into central-cache and page-cache buckets.

use core::{
  marker::PhantomData,
  ptr::{NonNull, null_mut},
};

use crate::{
  block::{self, Batch},
  config::{PAGE_SHIFT, PAGE_SIZE},
};

/// Page id of the page containing `addr`.
#[inline(always)]
pub(crate) const fn page_of(addr: usize) -> usize {
  addr >> PAGE_SHIFT
}

/// Metadata for a run of pages. Lives in the page cache's span pool, never in
/// the run itself.
#[repr(C)]
pub(crate) struct Span {
  pub(crate) page_id: usize,
  pub(crate) pages: usize,
  /// Embedded free list of blocks carved from the run.
  pub(crate) free_list: *mut u8,
  /// Blocks currently checked out to thread caches.
  pub(crate) use_count: usize,
  /// Block size the run is committed to; 0 while free.
  pub(crate) block_size: usize,
  /// Attached to a central-cache list (as opposed to a page-cache bucket).
  pub(crate) in_use: bool,
  prev: *mut Span,
  next: *mut Span,
}

unsafe impl Send for Span {}

impl Span {
  pub(crate) const fn new(page_id: usize, pages: usize) -> Self {
    Self {
      page_id,
      pages,
      free_list: null_mut(),
      use_count: 0,
      block_size: 0,
      in_use: false,
      prev: null_mut(),
      next: null_mut(),
    }
  }

  #[inline]
  pub(crate) fn base(&self) -> *mut u8 {
    (self.page_id << PAGE_SHIFT) as *mut u8
  }

  #[inline]
  pub(crate) fn bytes(&self) -> usize {
    self.pages * PAGE_SIZE
  }

  #[inline]
  pub(crate) fn last_page(&self) -> usize {
    self.page_id + self.pages - 1
  }

  /// One past the last page.
  #[inline]
  pub(crate) fn end_page(&self) -> usize {
    self.page_id + self.pages
  }

  #[inline]
  pub(crate) fn covers(&self, page: usize) -> bool {
    page >= self.page_id && page < self.end_page()
  }

  pub(crate) fn info(&self) -> SpanInfo {
    SpanInfo {
      page_id: self.page_id,
      pages: self.pages,
      block_size: self.block_size,
      in_use: self.in_use,
    }
  }

  /// Carves the whole run into `block_size` blocks threaded in address order.
  /// Returns the number of blocks. `block_size` itself is committed by the
  /// page cache under its lock.
  ///
  /// # Safety
  ///
  /// The run must be mapped and owned exclusively by the caller.
  pub(crate) unsafe fn stripe(&mut self, block_size: usize) -> usize {
    let count = self.bytes() / block_size;
    debug_assert!(count > 0, "span of {} pages cannot hold {block_size}B", self.pages);
    let base = self.base();
    let mut next = null_mut();
    for i in (0..count).rev() {
      let block = unsafe { base.add(i * block_size) };
      unsafe { block::set_next(block, next) };
      next = block;
    }
    self.free_list = next;
    count
  }

  /// Detaches up to `want` blocks from the embedded free list.
  ///
  /// # Safety
  ///
  /// The embedded free list must be well formed.
  pub(crate) unsafe fn take(&mut self, want: usize) -> Batch {
    let mut batch = Batch::empty();
    if self.free_list.is_null() || want == 0 {
      return batch;
    }
    let head = self.free_list;
    let mut tail = head;
    let mut len = 1;
    while len < want {
      let next = unsafe { block::next_of(tail) };
      if next.is_null() {
        break;
      }
      tail = next;
      len += 1;
    }
    self.free_list = unsafe { block::next_of(tail) };
    unsafe { block::set_next(tail, null_mut()) };
    self.use_count += len;
    batch.head = head;
    batch.tail = tail;
    batch.len = len;
    batch
  }

  /// True if `addr` is the start of a block of this span.
  #[inline]
  pub(crate) fn is_block_start(&self, addr: usize) -> bool {
    let base = self.base() as usize;
    self.block_size != 0
      && addr >= base
      && addr < base + self.bytes()
      && (addr - base) % self.block_size == 0
  }
}

/// Snapshot of a span's placement, as reported by page lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanInfo {
  /// First page (address >> page shift).
  pub page_id: usize,
  pub pages: usize,
  /// Block size of the committed size class, 0 for a free span.
  pub block_size: usize,
  /// Attached to the central cache rather than parked in the page cache.
  pub in_use: bool,
}

impl SpanInfo {
  /// Base address of the run.
  pub fn base(&self) -> usize {
    self.page_id << PAGE_SHIFT
  }

  /// One past the last page.
  pub fn end_page(&self) -> usize {
    self.page_id + self.pages
  }

  pub fn bytes(&self) -> usize {
    self.pages * PAGE_SIZE
  }
}

// =============================================================================
// Span List
// =============================================================================

/// Circular doubly linked list of spans around a sentinel record.
///
/// The list links spans but does not own them; callers guarantee a span is in
/// at most one list at a time.
pub(crate) struct SpanList {
  sentinel: NonNull<Span>,
}

unsafe impl Send for SpanList {}

impl SpanList {
  /// # Safety
  ///
  /// `sentinel` must point to writable span storage reserved for this list.
  pub(crate) unsafe fn with_sentinel(sentinel: NonNull<Span>) -> Self {
    let s = sentinel.as_ptr();
    unsafe {
      s.write(Span::new(0, 0));
      (*s).prev = s;
      (*s).next = s;
    }
    Self { sentinel }
  }

  #[inline]
  pub(crate) fn front(&self) -> Option<NonNull<Span>> {
    let first = unsafe { (*self.sentinel.as_ptr()).next };
    if first == self.sentinel.as_ptr() {
      None
    } else {
      NonNull::new(first)
    }
  }

  /// Links `span` immediately before `pos` (`pos` may be the sentinel).
  ///
  /// # Safety
  ///
  /// `pos` must be in this list, `span` in none.
  pub(crate) unsafe fn insert_before(&mut self, pos: NonNull<Span>, span: NonNull<Span>) {
    let pos = pos.as_ptr();
    let span = span.as_ptr();
    unsafe {
      let prev = (*pos).prev;
      (*span).prev = prev;
      (*span).next = pos;
      (*prev).next = span;
      (*pos).prev = span;
    }
  }

  /// # Safety
  ///
  /// `span` must currently be linked in this list.
  pub(crate) unsafe fn unlink(&mut self, span: NonNull<Span>) {
    let span = span.as_ptr();
    debug_assert!(span != self.sentinel.as_ptr(), "unlinking sentinel");
    unsafe {
      let prev = (*span).prev;
      let next = (*span).next;
      debug_assert!(!prev.is_null() && !next.is_null(), "span {span:p} is not linked");
      (*prev).next = next;
      (*next).prev = prev;
      (*span).prev = null_mut();
      (*span).next = null_mut();
    }
  }

  /// # Safety
  ///
  /// `span` must not be linked in any list.
  #[inline]
  pub(crate) unsafe fn push_front(&mut self, span: NonNull<Span>) {
    let first = unsafe { (*self.sentinel.as_ptr()).next };
    unsafe { self.insert_before(NonNull::new_unchecked(first), span) };
  }

  #[inline]
  pub(crate) fn pop_front(&mut self) -> Option<NonNull<Span>> {
    let span = self.front()?;
    unsafe { self.unlink(span) };
    Some(span)
  }

  pub(crate) fn iter(&self) -> SpanIter<'_> {
    SpanIter {
      current: unsafe { (*self.sentinel.as_ptr()).next },
      sentinel: self.sentinel.as_ptr(),
      marker: PhantomData,
    }
  }
}

pub(crate) struct SpanIter<'a> {
  current: *mut Span,
  sentinel: *mut Span,
  marker: PhantomData<&'a SpanList>,
}

impl Iterator for SpanIter<'_> {
  type Item = NonNull<Span>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.current == self.sentinel {
      return None;
    }
    let span = self.current;
    self.current = unsafe { (*span).next };
    NonNull::new(span)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::object_pool::ObjectPool;

  fn list(pool: &ObjectPool<Span>) -> SpanList {
    let sentinel = pool.acquire(Span::new(0, 0)).unwrap();
    unsafe { SpanList::with_sentinel(sentinel) }
  }

  fn ids(list: &SpanList) -> Vec<usize> {
    list.iter().map(|s| unsafe { s.as_ref().page_id }).collect()
  }

  #[test]
  fn push_pop_and_unlink() {
    let pool = ObjectPool::new();
    let mut list = list(&pool);
    assert_eq!(list.iter().count(), 0);
    assert!(list.pop_front().is_none());

    let spans: Vec<_> = (1..=3).map(|id| pool.acquire(Span::new(id, 1)).unwrap()).collect();
    unsafe {
      for &span in &spans {
        list.push_front(span);
      }
    }
    assert_eq!(ids(&list), [3, 2, 1]);
    assert_eq!(list.iter().count(), 3);

    unsafe { list.unlink(spans[1]) };
    assert_eq!(ids(&list), [3, 1]);

    unsafe { list.insert_before(spans[0], spans[1]) };
    assert_eq!(ids(&list), [3, 2, 1]);

    assert_eq!(list.pop_front(), Some(spans[2]));
    assert_eq!(list.pop_front(), Some(spans[1]));
    assert_eq!(list.pop_front(), Some(spans[0]));
    assert_eq!(list.iter().count(), 0);
    assert!(list.front().is_none());
  }

  #[test]
  fn stripe_and_take() {
    // Two pages of backing always contain one whole page.
    let mut backing = vec![0u8; 2 * PAGE_SIZE];
    let page_id = (backing.as_mut_ptr() as usize).div_ceil(PAGE_SIZE);

    let mut span = Span::new(page_id, 1);
    span.block_size = 48;
    let blocks = unsafe { span.stripe(48) };
    assert_eq!(blocks, PAGE_SIZE / 48);

    let batch = unsafe { span.take(5) };
    assert_eq!(batch.len, 5);
    assert_eq!(span.use_count, 5);
    assert_eq!(batch.head, span.base());
    assert_eq!(batch.tail as usize, span.base() as usize + 4 * 48);
    assert!(span.is_block_start(batch.tail as usize));
    assert!(!span.is_block_start(batch.tail as usize + 8));

    let rest = unsafe { span.take(usize::MAX) };
    assert_eq!(rest.len, blocks - 5);
    assert!(span.free_list.is_null());
    assert_eq!(unsafe { span.take(1) }.len, 0);
  }
}
