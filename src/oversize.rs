//! Requests above the classification ceiling (or with alignment the tiers do
//! not provide) go straight to the system allocator. A header just below the
//! returned pointer lets a later free recognise and undo them.

use core::{mem::size_of, ptr::NonNull};

use crate::{config::MIN_ALIGN, error::AllocError};

/// "TRIMALLC"
const MAGIC: usize = 0x5452_494D_414C_4C43;

#[repr(C)]
struct Header {
  magic: usize,
  /// Distance from the system allocation to the returned pointer.
  offset: usize,
  size: usize,
  _reserved: usize,
}

const HEADER_SIZE: usize = size_of::<Header>();

const _: () = assert!(HEADER_SIZE == 32);
const _: () = assert!(HEADER_SIZE % MIN_ALIGN == 0);

#[inline(always)]
unsafe fn header_of(ptr: *const u8) -> *mut Header {
  unsafe { ptr.sub(HEADER_SIZE) as *mut Header }
}

/// `size` bytes aligned to `align` (a power of two) from the system allocator.
pub(crate) fn allocate(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
  let align = align.max(MIN_ALIGN);
  let offset = HEADER_SIZE.max(align);
  let total = size.checked_add(offset).ok_or(AllocError::OutOfMemory(size))?;

  let raw = if align <= MIN_ALIGN {
    unsafe { libc::malloc(total) }
  } else {
    let mut raw = core::ptr::null_mut();
    match unsafe { libc::posix_memalign(&mut raw, align, total) } {
      0 => raw,
      _ => core::ptr::null_mut(),
    }
  };
  let raw = NonNull::new(raw.cast::<u8>()).ok_or(AllocError::OutOfMemory(total))?;

  unsafe {
    let user = raw.as_ptr().add(offset);
    header_of(user).write(Header {
      magic: MAGIC,
      offset,
      size,
      _reserved: 0,
    });
    Ok(NonNull::new_unchecked(user))
  }
}

/// Requested size recorded for a live bypassed allocation.
///
/// # Safety
///
/// The 32 bytes below `ptr` must be readable.
pub(crate) unsafe fn size_of_allocation(ptr: *const u8) -> Result<usize, AllocError> {
  let header = unsafe { &*header_of(ptr) };
  if header.magic != MAGIC {
    return Err(AllocError::CorruptedFreeList(ptr as usize));
  }
  Ok(header.size)
}

/// Frees a bypassed allocation and returns its requested size.
///
/// # Safety
///
/// `ptr` must come from [`allocate`] and not be used afterwards.
pub(crate) unsafe fn deallocate(ptr: *mut u8) -> Result<usize, AllocError> {
  let header = unsafe { &mut *header_of(ptr) };
  if header.magic != MAGIC {
    return Err(AllocError::CorruptedFreeList(ptr as usize));
  }
  header.magic = 0;
  let size = header.size;
  unsafe { libc::free(ptr.sub(header.offset).cast()) };
  Ok(size)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_round_trip() {
    let ptr = allocate(600_000, MIN_ALIGN).unwrap();
    assert_eq!(ptr.as_ptr() as usize % MIN_ALIGN, 0);
    unsafe {
      ptr.as_ptr().write_bytes(0xAB, 600_000);
      assert_eq!(size_of_allocation(ptr.as_ptr()), Ok(600_000));
      assert_eq!(deallocate(ptr.as_ptr()), Ok(600_000));
    }
  }

  #[test]
  fn honours_large_alignment() {
    for align in [64, 4096, 1 << 16] {
      let ptr = allocate(100, align).unwrap();
      assert_eq!(ptr.as_ptr() as usize % align, 0, "align {align}");
      assert_eq!(unsafe { deallocate(ptr.as_ptr()) }, Ok(100));
    }
  }

  #[test]
  fn foreign_memory_is_rejected() {
    let buffer = [0u64; 8];
    let ptr = unsafe { (buffer.as_ptr() as *const u8).add(HEADER_SIZE) };
    assert_eq!(
      unsafe { size_of_allocation(ptr) },
      Err(AllocError::CorruptedFreeList(ptr as usize))
    );
  }

  #[test]
  fn overflowing_size_fails_cleanly() {
    assert_eq!(allocate(usize::MAX, MIN_ALIGN), Err(AllocError::OutOfMemory(usize::MAX)));
  }
}
