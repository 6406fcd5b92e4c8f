//! Fixed-size object pool for allocator metadata (span records, thread caches).
//!
//! Objects are bump-carved from OS-mapped slabs and recycled through an
//! embedded free list, so creating metadata never re-enters the allocator.

use core::{
  marker::PhantomData,
  mem::{align_of, size_of},
  ptr::{self, NonNull, null_mut},
};

use crate::{
  block,
  config::POOL_SLAB_SIZE,
  error::AllocError,
  platform::{os_mmap, os_munmap},
  sync::SpinMutex,
};

/// Bytes reserved at the start of each slab for the slab chain.
const SLAB_HEADER: usize = 16;

struct PoolState {
  /// Recycled slots, linked through their first word.
  free: *mut u8,
  bump: *mut u8,
  bump_end: *mut u8,
  /// Mapped slabs, linked through their first word.
  slabs: *mut u8,
}

unsafe impl Send for PoolState {}

pub(crate) struct ObjectPool<T> {
  state: SpinMutex<PoolState>,
  marker: PhantomData<T>,
}

unsafe impl<T: Send> Sync for ObjectPool<T> {}
unsafe impl<T: Send> Send for ObjectPool<T> {}

impl<T> ObjectPool<T> {
  const SLOT_ALIGN: usize = if align_of::<T>() > align_of::<*mut u8>() {
    align_of::<T>()
  } else {
    align_of::<*mut u8>()
  };
  const SLOT_SIZE: usize = {
    let size = if size_of::<T>() > size_of::<*mut u8>() {
      size_of::<T>()
    } else {
      size_of::<*mut u8>()
    };
    align_up(size, Self::SLOT_ALIGN)
  };
  const FITS: () = assert!(align_up(SLAB_HEADER, Self::SLOT_ALIGN) + Self::SLOT_SIZE <= POOL_SLAB_SIZE);

  pub(crate) const fn new() -> Self {
    Self {
      state: SpinMutex::new(PoolState {
        free: null_mut(),
        bump: null_mut(),
        bump_end: null_mut(),
        slabs: null_mut(),
      }),
      marker: PhantomData,
    }
  }

  /// Moves `value` into a pooled slot.
  pub(crate) fn acquire(&self, value: T) -> Result<NonNull<T>, AllocError> {
    let () = Self::FITS;
    let slot = {
      let mut state = self.state.lock();
      let slot = if !state.free.is_null() {
        let slot = state.free;
        state.free = unsafe { block::next_of(slot) };
        slot
      } else {
        if (state.bump as usize) + Self::SLOT_SIZE > state.bump_end as usize {
          let slab = os_mmap(POOL_SLAB_SIZE).ok_or(AllocError::OutOfMemory(POOL_SLAB_SIZE))?;
          let slab = slab.as_ptr();
          unsafe { block::set_next(slab, state.slabs) };
          state.slabs = slab;
          state.bump = align_up(slab as usize + SLAB_HEADER, Self::SLOT_ALIGN) as *mut u8;
          state.bump_end = unsafe { slab.add(POOL_SLAB_SIZE) };
        }
        let slot = state.bump;
        state.bump = unsafe { slot.add(Self::SLOT_SIZE) };
        slot
      };
      slot.cast::<T>()
    };

    unsafe { slot.write(value) };
    // SAFETY: slots come from a successful mapping.
    Ok(unsafe { NonNull::new_unchecked(slot) })
  }

  /// Drops the object in place and recycles its slot.
  ///
  /// # Safety
  ///
  /// `object` must come from [`Self::acquire`] on this pool and not be used afterwards.
  pub(crate) unsafe fn release(&self, object: NonNull<T>) {
    unsafe { ptr::drop_in_place(object.as_ptr()) };
    let slot = object.as_ptr().cast::<u8>();
    let mut state = self.state.lock();
    unsafe { block::set_next(slot, state.free) };
    state.free = slot;
  }
}

impl<T> Drop for ObjectPool<T> {
  fn drop(&mut self) {
    let state = self.state.get_mut();
    let mut slab = state.slabs;
    while !slab.is_null() {
      let next = unsafe { block::next_of(slab) };
      if let Some(mapping) = NonNull::new(slab) {
        unsafe { os_munmap(mapping, POOL_SLAB_SIZE) };
      }
      slab = next;
    }
    state.slabs = null_mut();
  }
}

#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
