use thiserror::Error;

/// Failures reported by the allocator tiers.
///
/// Addresses are carried as plain integers so the error stays `Copy` and can be
/// produced without touching the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// Zero-byte request, or a size outside the classified range handed to a
  /// classification function.
  #[error("invalid allocation size {0}")]
  InvalidSize(usize),
  /// The operating system (or the system allocator) refused `{0}` bytes.
  #[error("out of memory: {0} bytes could not be mapped")]
  OutOfMemory(usize),
  #[error("corrupted free list: {0:#x} does not belong to a live span")]
  CorruptedFreeList(usize),
  #[error("double free of {0:#x}")]
  DoubleFree(usize),
}

/// Unrecoverable metadata damage. Continuing would corrupt shared span state.
#[cold]
#[inline(never)]
pub(crate) fn fatal(err: AllocError) -> ! {
  panic!("trimalloc: {err}")
}
