//! Operating-system memory: anonymous mappings for page runs, index nodes and
//! metadata slabs.

use core::ptr::{NonNull, null_mut};

/// Maps `size` bytes of zeroed, page-aligned, read/write memory.
pub(crate) fn os_mmap(size: usize) -> Option<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    None
  } else {
    NonNull::new(ptr.cast())
  }
}

/// # Safety
///
/// `ptr..ptr + size` must be a range previously returned by [`os_mmap`] and no
/// longer referenced.
pub(crate) unsafe fn os_munmap(ptr: NonNull<u8>, size: usize) {
  unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
}
