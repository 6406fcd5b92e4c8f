//! Many threads, one private heap, random classified sizes.

mod common;

use std::{collections::HashSet, sync::Mutex, thread};

use common::{XorShift64, stamp, stamped};
use trimalloc::{Heap, aligned_size};

const THREADS: usize = 8;
const ROUNDS: usize = 4;
const ITERATIONS: usize = 2_000;
const WINDOW: usize = 64;

#[test]
fn threads_never_share_a_live_block_and_leave_nothing_in_use() {
  let heap = Heap::new().unwrap();
  let live = Mutex::new(HashSet::new());

  thread::scope(|s| {
    for t in 0..THREADS {
      let heap = &heap;
      let live = &live;
      s.spawn(move || {
        let mut cache = heap.thread_cache();
        let mut rng = XorShift64::new(0x5EED_0000 + t as u64);
        let tag = t as u8 + 1;

        for _ in 0..ROUNDS {
          let mut held = Vec::with_capacity(WINDOW);
          for _ in 0..ITERATIONS {
            let size = rng.gen_size();
            let ptr = cache.allocate(size).unwrap();
            assert!(live.lock().unwrap().insert(ptr.as_ptr() as usize), "{ptr:p} handed out twice");
            unsafe { stamp(ptr.as_ptr(), size, tag) };

            let span = heap.resolve_span(ptr.as_ptr()).unwrap();
            assert_eq!(Ok(span.block_size), aligned_size(size));
            held.push((ptr, size));

            if held.len() == WINDOW {
              let (ptr, size) = held.swap_remove(rng.gen_range_usize(0, WINDOW - 1));
              assert!(unsafe { stamped(ptr.as_ptr(), size, tag) }, "{ptr:p} overwritten");
              live.lock().unwrap().remove(&(ptr.as_ptr() as usize));
              unsafe { cache.deallocate(ptr, size) };
            }
          }
          for (ptr, size) in held {
            assert!(unsafe { stamped(ptr.as_ptr(), size, tag) });
            live.lock().unwrap().remove(&(ptr.as_ptr() as usize));
            unsafe { cache.deallocate(ptr, size) };
          }
        }
      });
    }
  });

  assert!(live.lock().unwrap().is_empty());
  let stats = heap.stats();
  assert_eq!(stats.in_use_bytes, 0);
  assert_eq!(stats.free_page_bytes, stats.mapped_bytes);
}

#[test]
fn blocks_freed_on_another_thread_return_home() {
  let heap = Heap::new().unwrap();
  let (tx, rx) = std::sync::mpsc::channel::<(usize, usize)>();

  thread::scope(|s| {
    s.spawn(|| {
      let mut cache = heap.thread_cache();
      let mut rng = XorShift64::new(42);
      for _ in 0..5_000 {
        let size = rng.gen_range_usize(1, 4096);
        let ptr = cache.allocate(size).unwrap();
        tx.send((ptr.as_ptr() as usize, size)).unwrap();
      }
      drop(tx);
    });
    s.spawn(|| {
      let mut cache = heap.thread_cache();
      for (addr, size) in rx {
        let ptr = std::ptr::NonNull::new(addr as *mut u8).unwrap();
        unsafe { cache.deallocate(ptr, size) };
      }
    });
  });

  let stats = heap.stats();
  assert_eq!(stats.in_use_bytes, 0);
  assert_eq!(stats.free_page_bytes, stats.mapped_bytes);
}
