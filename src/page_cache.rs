//! Page cache (back-end): free spans bucketed by page count, the page-id index,
//! OS mappings, and span splitting / coalescing.
//!
//! One lock guards the buckets and index writes together. Callers take it
//! through [`PageCache::lock`] and must not hold any size-class lock while
//! they do.

use core::ptr::{NonNull, null_mut};

use crate::{
  config::{MAX_PAGES, PAGE_SIZE},
  error::AllocError,
  object_pool::ObjectPool,
  page_map::PageMap,
  platform::{os_mmap, os_munmap},
  span::{Span, SpanInfo, SpanList, page_of},
  sync::{SpinGuard, SpinMutex},
};

/// Bytes requested from the OS each time the buckets run dry.
const CHUNK_BYTES: usize = MAX_PAGES * PAGE_SIZE;

/// Record of one OS mapping, kept for teardown.
struct Chunk {
  base: NonNull<u8>,
  next: *mut Chunk,
}

unsafe impl Send for Chunk {}

pub(crate) struct PageState {
  /// Bucket `k` holds free spans of exactly `k + 1` pages.
  buckets: [SpanList; MAX_PAGES],
  chunks: *mut Chunk,
  mapped_pages: usize,
  free_pages: usize,
}

unsafe impl Send for PageState {}

pub struct PageCache {
  state: SpinMutex<PageState>,
  map: PageMap,
  spans: ObjectPool<Span>,
  chunks: ObjectPool<Chunk>,
}

impl PageCache {
  pub(crate) fn new() -> Result<Self, AllocError> {
    let spans = ObjectPool::new();
    let mut sentinels = [NonNull::dangling(); MAX_PAGES];
    for sentinel in &mut sentinels {
      *sentinel = spans.acquire(Span::new(0, 0))?;
    }
    let buckets = sentinels.map(|sentinel| unsafe { SpanList::with_sentinel(sentinel) });

    Ok(Self {
      state: SpinMutex::new(PageState {
        buckets,
        chunks: null_mut(),
        mapped_pages: 0,
        free_pages: 0,
      }),
      map: PageMap::new(),
      spans,
      chunks: ObjectPool::new(),
    })
  }

  /// Acquires the process-wide page lock.
  #[inline]
  pub(crate) fn lock(&self) -> PageLock<'_> {
    PageLock {
      cache: self,
      state: self.state.lock(),
    }
  }

  /// Sentinel record for a span list kept outside the page cache.
  pub(crate) fn new_sentinel(&self) -> Result<NonNull<Span>, AllocError> {
    self.spans.acquire(Span::new(0, 0))
  }

  /// Lock-free lookup for a page whose span has blocks checked out.
  #[inline]
  pub(crate) fn lookup(&self, page: usize) -> Option<NonNull<Span>> {
    self.map.get(page)
  }

  /// Span covering `ptr`, if the address belongs to this heap.
  pub fn resolve_span(&self, ptr: *const u8) -> Option<SpanInfo> {
    let page = page_of(ptr as usize);
    let _state = self.state.lock();
    let info = unsafe { self.map.get(page)?.as_ref() }.info();
    (page >= info.page_id && page < info.end_page()).then_some(info)
  }

  /// Block size of the in-use block starting at `ptr`.
  pub(crate) fn block_size_of(&self, ptr: *const u8) -> Result<usize, AllocError> {
    let addr = ptr as usize;
    let page = page_of(addr);
    let _state = self.state.lock();
    let span = self.map.get(page).ok_or(AllocError::CorruptedFreeList(addr))?;
    let span = unsafe { span.as_ref() };
    if !span.covers(page) {
      return Err(AllocError::CorruptedFreeList(addr));
    }
    if !span.in_use {
      return Err(AllocError::DoubleFree(addr));
    }
    if !span.is_block_start(addr) {
      return Err(AllocError::CorruptedFreeList(addr));
    }
    Ok(span.block_size)
  }

  /// Visits every free span, smallest bucket first, under the page lock. `f`
  /// must not allocate from this heap.
  pub fn for_each_free_span(&self, mut f: impl FnMut(SpanInfo)) {
    let state = self.state.lock();
    for bucket in &state.buckets {
      for span in bucket.iter() {
        f(unsafe { span.as_ref() }.info());
      }
    }
  }

  /// `(mapped, free)` page totals.
  pub fn page_counts(&self) -> (usize, usize) {
    let state = self.state.lock();
    (state.mapped_pages, state.free_pages)
  }
}

impl Drop for PageCache {
  fn drop(&mut self) {
    let state = self.state.get_mut();
    let mut chunk = state.chunks;
    while let Some(record) = NonNull::new(chunk) {
      unsafe {
        chunk = (*record.as_ptr()).next;
        os_munmap((*record.as_ptr()).base, CHUNK_BYTES);
      }
    }
    state.chunks = null_mut();
  }
}

// =============================================================================
// Locked operations
// =============================================================================

pub(crate) struct PageLock<'a> {
  cache: &'a PageCache,
  state: SpinGuard<'a, PageState>,
}

impl PageLock<'_> {
  /// Hands out a span of exactly `pages` pages, marked in use with every page
  /// indexed.
  pub(crate) fn alloc_span(&mut self, pages: usize) -> Result<NonNull<Span>, AllocError> {
    debug_assert!((1..=MAX_PAGES).contains(&pages), "bad span length {pages}");
    let span = match self.take(pages)? {
      Some(span) => span,
      None => {
        self.grow()?;
        // A fresh maximal run always satisfies the request.
        self
          .take(pages)?
          .ok_or(AllocError::OutOfMemory(pages * PAGE_SIZE))?
      }
    };

    let s = span.as_ptr();
    unsafe {
      (*s).in_use = true;
      (*s).use_count = 0;
      (*s).block_size = 0;
      (*s).free_list = null_mut();
      self.cache.map.set_range((*s).page_id, (*s).pages, s);
    }
    self.state.free_pages -= pages;
    Ok(span)
  }

  /// Commits an in-use span to blocks of `block_size` bytes.
  pub(crate) fn assign_block_size(&mut self, span: NonNull<Span>, block_size: usize) {
    unsafe { (*span.as_ptr()).block_size = block_size };
  }

  /// Pops an exact fit, or carves `pages` off the front of the first larger
  /// free span.
  fn take(&mut self, pages: usize) -> Result<Option<NonNull<Span>>, AllocError> {
    if let Some(span) = self.state.buckets[pages - 1].pop_front() {
      return Ok(Some(span));
    }

    for bucket in pages..MAX_PAGES {
      let Some(big) = self.state.buckets[bucket].front() else {
        continue;
      };
      let b = big.as_ptr();
      let carved = self.cache.spans.acquire(Span::new(unsafe { (*b).page_id }, pages))?;

      unsafe {
        self.state.buckets[bucket].unlink(big);
        (*b).page_id += pages;
        (*b).pages -= pages;
        self.state.buckets[(*b).pages - 1].push_front(big);
        self.cache.map.set((*b).page_id, b);
        self.cache.map.set((*b).last_page(), b);
      }
      return Ok(Some(carved));
    }

    Ok(None)
  }

  /// Maps a maximal run from the OS into the largest bucket. Nothing is
  /// recorded unless the mapping and its metadata all succeed.
  fn grow(&mut self) -> Result<(), AllocError> {
    let base = os_mmap(CHUNK_BYTES).ok_or(AllocError::OutOfMemory(CHUNK_BYTES))?;
    let page_id = page_of(base.as_ptr() as usize);

    if let Err(err) = self.cache.map.reserve(page_id, MAX_PAGES) {
      unsafe { os_munmap(base, CHUNK_BYTES) };
      return Err(err);
    }
    let chunk = match self.cache.chunks.acquire(Chunk {
      base,
      next: self.state.chunks,
    }) {
      Ok(chunk) => chunk,
      Err(err) => {
        unsafe { os_munmap(base, CHUNK_BYTES) };
        return Err(err);
      }
    };
    let span = match self.cache.spans.acquire(Span::new(page_id, MAX_PAGES)) {
      Ok(span) => span,
      Err(err) => {
        unsafe {
          self.cache.chunks.release(chunk);
          os_munmap(base, CHUNK_BYTES);
        }
        return Err(err);
      }
    };

    self.state.chunks = chunk.as_ptr();
    self.state.mapped_pages += MAX_PAGES;
    self.state.free_pages += MAX_PAGES;
    unsafe { self.state.buckets[MAX_PAGES - 1].push_front(span) };
    self.cache.map.set(page_id, span.as_ptr());
    self.cache.map.set(page_id + MAX_PAGES - 1, span.as_ptr());
    Ok(())
  }

  /// Takes back a span from the central cache, merging it with free
  /// neighbours on both sides.
  ///
  /// # Safety
  ///
  /// `span` must come from [`Self::alloc_span`] and be linked in no list.
  pub(crate) unsafe fn free_span(&mut self, span: NonNull<Span>) {
    let s = span.as_ptr();
    unsafe {
      debug_assert!((*s).in_use, "span {s:p} freed twice");
      (*s).in_use = false;
      (*s).use_count = 0;
      (*s).block_size = 0;
      (*s).free_list = null_mut();
      self.state.free_pages += (*s).pages;

      while let Some(prev) = (*s).page_id.checked_sub(1).and_then(|p| self.cache.map.get(p)) {
        let p = prev.as_ptr();
        if (*p).in_use || (*p).end_page() != (*s).page_id || (*p).pages + (*s).pages > MAX_PAGES {
          break;
        }
        self.state.buckets[(*p).pages - 1].unlink(prev);
        (*s).page_id = (*p).page_id;
        (*s).pages += (*p).pages;
        self.cache.spans.release(prev);
      }

      while let Some(next) = self.cache.map.get((*s).end_page()) {
        let n = next.as_ptr();
        if (*n).in_use || (*n).page_id != (*s).end_page() || (*n).pages + (*s).pages > MAX_PAGES {
          break;
        }
        self.state.buckets[(*n).pages - 1].unlink(next);
        (*s).pages += (*n).pages;
        self.cache.spans.release(next);
      }

      self.state.buckets[(*s).pages - 1].push_front(span);
      self.cache.map.set((*s).page_id, s);
      self.cache.map.set((*s).last_page(), s);
    }
  }
}
