#![allow(dead_code)]

use trimalloc::MAX_BYTES;

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
  state: u64,
}

impl XorShift64 {
  pub fn new(seed: u64) -> Self {
    Self { state: seed.max(1) }
  }

  pub fn next_u64(&mut self) -> u64 {
    // xorshift64*
    let mut x = self.state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    self.state = x;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
  }

  pub fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
    assert!(low <= high_inclusive);
    let span = high_inclusive - low + 1;
    low + (self.next_u64() as usize % span)
  }

  /// Classified size skewed towards small requests.
  pub fn gen_size(&mut self) -> usize {
    match self.next_u64() % 16 {
      0..=9 => self.gen_range_usize(1, 256),
      10..=13 => self.gen_range_usize(257, 8 * 1024),
      14 => self.gen_range_usize(8 * 1024 + 1, 64 * 1024),
      _ => self.gen_range_usize(64 * 1024 + 1, MAX_BYTES),
    }
  }
}

/// Fills `len` bytes at `ptr` with a pattern derived from `tag`.
pub unsafe fn stamp(ptr: *mut u8, len: usize, tag: u8) {
  unsafe { ptr.write_bytes(tag, len) };
}

/// True if the first and last byte of the stamped region still carry `tag`.
pub unsafe fn stamped(ptr: *const u8, len: usize, tag: u8) -> bool {
  unsafe { *ptr == tag && *ptr.add(len - 1) == tag }
}
