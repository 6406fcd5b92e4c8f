//! Page-id to span index: a three-level radix tree whose nodes are anonymous
//! mappings.
//!
//! Writers hold the page lock. Readers may go lock-free for pages whose span
//! cannot change under them (a span with blocks checked out is never split or
//! merged); every other lookup takes the page lock.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
  config::{ADDRESS_BITS, PAGE_SHIFT},
  error::AllocError,
  platform::{os_mmap, os_munmap},
  span::Span,
};

const PAGE_ID_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const LEAF_BITS: usize = 12;
const MID_BITS: usize = 12;
const ROOT_BITS: usize = PAGE_ID_BITS - LEAF_BITS - MID_BITS;

const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

type Leaf = [AtomicPtr<Span>; LEAF_LEN];
type Mid = [AtomicPtr<Leaf>; MID_LEN];

pub(crate) struct PageMap {
  root: [AtomicPtr<Mid>; ROOT_LEN],
}

impl PageMap {
  pub(crate) const fn new() -> Self {
    Self {
      root: [const { AtomicPtr::new(null_mut()) }; ROOT_LEN],
    }
  }

  #[inline(always)]
  fn split(page: usize) -> Option<(usize, usize, usize)> {
    if page >> PAGE_ID_BITS != 0 {
      return None;
    }
    Some((
      page >> (LEAF_BITS + MID_BITS),
      (page >> LEAF_BITS) & (MID_LEN - 1),
      page & (LEAF_LEN - 1),
    ))
  }

  #[inline]
  fn leaf(&self, page: usize) -> Option<(&Leaf, usize)> {
    let (r, m, l) = Self::split(page)?;
    let mid = self.root[r].load(Ordering::Acquire);
    if mid.is_null() {
      return None;
    }
    let leaf = unsafe { (*mid)[m].load(Ordering::Acquire) };
    if leaf.is_null() {
      return None;
    }
    Some((unsafe { &*leaf }, l))
  }

  /// Span last recorded for `page`.
  #[inline]
  pub(crate) fn get(&self, page: usize) -> Option<NonNull<Span>> {
    let (leaf, l) = self.leaf(page)?;
    NonNull::new(leaf[l].load(Ordering::Acquire))
  }

  /// Makes sure nodes exist for `first..first + count` so later writes to that
  /// range cannot fail. Caller holds the page lock.
  pub(crate) fn reserve(&self, first: usize, count: usize) -> Result<(), AllocError> {
    let end = first + count;
    let mut page = first;
    while page < end {
      self.ensure_leaf(page)?;
      page = (page | (LEAF_LEN - 1)) + 1;
    }
    Ok(())
  }

  fn ensure_leaf(&self, page: usize) -> Result<(), AllocError> {
    let (r, m, _) = Self::split(page).ok_or(AllocError::OutOfMemory(0))?;
    let mut mid = self.root[r].load(Ordering::Acquire);
    if mid.is_null() {
      mid = map_node::<Mid>()?;
      self.root[r].store(mid, Ordering::Release);
    }
    let slot = unsafe { &(*mid)[m] };
    if slot.load(Ordering::Acquire).is_null() {
      slot.store(map_node::<Leaf>()?, Ordering::Release);
    }
    Ok(())
  }

  /// Records `span` for `page`. The page must have been reserved; caller holds
  /// the page lock.
  #[inline]
  pub(crate) fn set(&self, page: usize, span: *mut Span) {
    let leaf = self.leaf(page);
    debug_assert!(leaf.is_some(), "page {page:#x} written before reserve");
    if let Some((leaf, l)) = leaf {
      leaf[l].store(span, Ordering::Release);
    }
  }

  pub(crate) fn set_range(&self, first: usize, count: usize, span: *mut Span) {
    for page in first..first + count {
      self.set(page, span);
    }
  }
}

impl Drop for PageMap {
  fn drop(&mut self) {
    for entry in &self.root {
      let mid = entry.swap(null_mut(), Ordering::Relaxed);
      let Some(mid) = NonNull::new(mid) else {
        continue;
      };
      for slot in unsafe { mid.as_ref() } {
        if let Some(leaf) = NonNull::new(slot.load(Ordering::Relaxed)) {
          unsafe { os_munmap(leaf.cast(), size_of::<Leaf>()) };
        }
      }
      unsafe { os_munmap(mid.cast(), size_of::<Mid>()) };
    }
  }
}

/// Zeroed node; an all-zero node is all null pointers.
fn map_node<T>() -> Result<*mut T, AllocError> {
  os_mmap(size_of::<T>())
    .map(|node| node.as_ptr().cast())
    .ok_or(AllocError::OutOfMemory(size_of::<T>()))
}
