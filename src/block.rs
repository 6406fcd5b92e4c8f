//! Free blocks: the first machine word of every free block is reinterpreted as
//! the link to the next one. All such reinterpretation goes through this module.

use core::ptr::null_mut;

#[repr(C)]
struct FreeBlock {
  next: *mut u8,
}

/// Link stored in free block `block`.
///
/// # Safety
///
/// `block` must point to a free block of at least pointer size, aligned to 8.
#[inline(always)]
pub(crate) unsafe fn next_of(block: *mut u8) -> *mut u8 {
  debug_assert!(!block.is_null() && block as usize % 8 == 0, "bad block {block:p}");
  unsafe { (*block.cast::<FreeBlock>()).next }
}

/// # Safety
///
/// Same as [`next_of`]; the block's first word is overwritten.
#[inline(always)]
pub(crate) unsafe fn set_next(block: *mut u8, next: *mut u8) {
  debug_assert!(!block.is_null() && block as usize % 8 == 0, "bad block {block:p}");
  unsafe { (*block.cast::<FreeBlock>()).next = next };
}

/// A null-terminated chain of blocks moving between tiers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Batch {
  pub(crate) head: *mut u8,
  pub(crate) tail: *mut u8,
  pub(crate) len: usize,
}

impl Batch {
  pub(crate) const fn empty() -> Self {
    Self {
      head: null_mut(),
      tail: null_mut(),
      len: 0,
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Prepends `block`.
  ///
  /// # Safety
  ///
  /// `block` must be a free block not already linked anywhere.
  #[inline]
  pub(crate) unsafe fn push(&mut self, block: *mut u8) {
    unsafe { set_next(block, self.head) };
    if self.head.is_null() {
      self.tail = block;
    }
    self.head = block;
    self.len += 1;
  }

  /// Detaches the first block, returning it unlinked.
  ///
  /// # Safety
  ///
  /// The chain must be well formed.
  #[inline]
  pub(crate) unsafe fn pop(&mut self) -> Option<*mut u8> {
    if self.head.is_null() {
      return None;
    }
    let block = self.head;
    self.head = unsafe { next_of(block) };
    self.len -= 1;
    if self.head.is_null() {
      self.tail = null_mut();
    }
    unsafe { set_next(block, null_mut()) };
    Some(block)
  }
}
