//! Compile-time tuning constants shared by every tier.

// =============================================================================
// Pages
// =============================================================================

pub const PAGE_SHIFT: usize = 12;
/// Granularity of every span and every OS mapping.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest span in pages. Also the size of each fresh OS run and the number
/// of page-count buckets in the page cache (bucket `k` holds `k + 1` pages).
pub const MAX_PAGES: usize = 128;

/// Virtual address width covered by the page-id index.
pub const ADDRESS_BITS: usize = 48;

// =============================================================================
// Size classes
// =============================================================================

/// Largest request served by the tiers; bigger ones bypass to the system allocator.
pub const MAX_BYTES: usize = 512 * 1024;

/// Upper bound on blocks moved between a thread cache and the central cache at once.
pub const MAX_BATCH_BLOCKS: usize = 256;
pub const MIN_BATCH_BLOCKS: usize = 2;

/// Byte budget a single refill tries to fill.
pub const MAX_TRANSFER_BYTES: usize = MAX_BYTES;

/// Alignment of every pointer handed out by the oversize bypass.
pub const MIN_ALIGN: usize = 16;

// =============================================================================
// Metadata
// =============================================================================

/// Size of each OS slab backing the fixed-size object pools.
pub const POOL_SLAB_SIZE: usize = 128 * 1024;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGES * PAGE_SIZE >= MAX_BYTES); // one block of the largest class fits a span
const _: () = assert!(MIN_BATCH_BLOCKS <= MAX_BATCH_BLOCKS);
const _: () = assert!(POOL_SLAB_SIZE % PAGE_SIZE == 0);
const _: () = assert!(ADDRESS_BITS > PAGE_SHIFT);
