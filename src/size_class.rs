//! Size-class table: byte size to class index, class to block size, and the
//! batch / page quanta used when moving blocks between tiers.
//!
//! Six alignment tiers partition `(0, MAX_BYTES]`:
//!
//! ```text
//! tier   range            quantum   classes
//!  0     (0, 128]             8B       16
//!  1     (128, 1K]           16B       56
//!  2     (1K, 8K]           128B       56
//!  3     (8K, 64K]           1KB       56
//!  4     (64K, 256K]         8KB       24
//!  5     (256K, 512K]       32KB        8
//! ```

use crate::config::{
  MAX_BATCH_BLOCKS, MAX_BYTES, MAX_PAGES, MAX_TRANSFER_BYTES, MIN_BATCH_BLOCKS, PAGE_SIZE,
};
use crate::error::AllocError;

/// `(inclusive upper bound, log2 of the alignment quantum)` per tier.
const TIERS: [(usize, u32); 6] = [
  (128, 3),
  (1024, 4),
  (8 * 1024, 7),
  (64 * 1024, 10),
  (256 * 1024, 13),
  (512 * 1024, 15),
];

/// Number of classes contributed by each tier.
const fn tier_classes(tier: usize) -> usize {
  let lower = if tier == 0 { 0 } else { TIERS[tier - 1].0 };
  (TIERS[tier].0 - lower) >> TIERS[tier].1
}

/// Index of the first class of each tier.
const fn tier_offset(tier: usize) -> usize {
  let mut offset = 0;
  let mut t = 0;
  while t < tier {
    offset += tier_classes(t);
    t += 1;
  }
  offset
}

/// Total number of size classes.
pub const CLASSES_COUNT: usize = tier_offset(TIERS.len());

const _: () = assert!(CLASSES_COUNT == 216);
const _: () = assert!(TIERS[TIERS.len() - 1].0 == MAX_BYTES);
const _: () = assert!(class_size(0) == 8);
const _: () = assert!(class_size(CLASSES_COUNT - 1) == MAX_BYTES);

#[inline(always)]
const fn tier_of(size: usize) -> usize {
  let mut tier = 0;
  while size > TIERS[tier].0 {
    tier += 1;
  }
  tier
}

/// Class index serving `size` bytes.
///
/// Fails with [`AllocError::InvalidSize`] for `0` and for anything above [`MAX_BYTES`].
#[inline]
pub const fn class_index(size: usize) -> Result<usize, AllocError> {
  if size == 0 || size > MAX_BYTES {
    return Err(AllocError::InvalidSize(size));
  }
  let tier = tier_of(size);
  let lower = if tier == 0 { 0 } else { TIERS[tier - 1].0 };
  let shift = TIERS[tier].1;
  let within = ((size - lower + (1 << shift) - 1) >> shift) - 1;
  Ok(tier_offset(tier) + within)
}

/// `size` rounded up to its tier's quantum. Equals the block size of
/// `class_index(size)`.
#[inline]
pub const fn aligned_size(size: usize) -> Result<usize, AllocError> {
  if size == 0 || size > MAX_BYTES {
    return Err(AllocError::InvalidSize(size));
  }
  let quantum = 1 << TIERS[tier_of(size)].1;
  Ok((size + quantum - 1) & !(quantum - 1))
}

/// Block size of class `class` (inverse of [`class_index`]).
///
/// `class` must be below [`CLASSES_COUNT`].
#[inline]
pub const fn class_size(class: usize) -> usize {
  let mut tier = 0;
  while tier + 1 < TIERS.len() && class >= tier_offset(tier + 1) {
    tier += 1;
  }
  let lower = if tier == 0 { 0 } else { TIERS[tier - 1].0 };
  lower + ((class - tier_offset(tier) + 1) << TIERS[tier].1)
}

/// Blocks moved per thread-cache refill for blocks of `size` bytes.
#[inline]
pub const fn batch_count(size: usize) -> usize {
  debug_assert!(size > 0);
  let natural = MAX_TRANSFER_BYTES / size;
  if natural < MIN_BATCH_BLOCKS {
    MIN_BATCH_BLOCKS
  } else if natural > MAX_BATCH_BLOCKS {
    MAX_BATCH_BLOCKS
  } else {
    natural
  }
}

/// Pages backing one batch of `size`-byte blocks, clamped to `[1, MAX_PAGES]`.
#[inline]
pub const fn page_count(size: usize) -> usize {
  let pages = (batch_count(size) * size).div_ceil(PAGE_SIZE);
  if pages < 1 {
    1
  } else if pages > MAX_PAGES {
    MAX_PAGES
  } else {
    pages
  }
}
