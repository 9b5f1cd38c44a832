//! Checks that the churn loop performs exactly one heap allocation and one free per
//! iteration, counted at the global allocator.

use core::{
  alloc::{GlobalAlloc, Layout},
  sync::atomic::{AtomicU64, Ordering},
};
use std::alloc::System;

use churnbench::{ChurnConfig, KernelObject, run};

struct Counting {
  allocs: AtomicU64,
  frees: AtomicU64,
}

#[global_allocator]
static ALLOCATOR: Counting = Counting {
  allocs: AtomicU64::new(0),
  frees: AtomicU64::new(0),
};

fn is_object(layout: Layout) -> bool {
  layout == Layout::new::<KernelObject>()
}

unsafe impl GlobalAlloc for Counting {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if is_object(layout) {
      self.allocs.fetch_add(1, Ordering::Relaxed);
    }
    unsafe { System.alloc(layout) }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if is_object(layout) {
      self.frees.fetch_add(1, Ordering::Relaxed);
    }
    unsafe { System.dealloc(ptr, layout) }
  }
}

#[test]
fn one_allocation_and_one_free_per_iteration() {
  const ITERATIONS: u64 = 1000;

  let allocs = ALLOCATOR.allocs.load(Ordering::Relaxed);
  let frees = ALLOCATOR.frees.load(Ordering::Relaxed);

  let total = run(&ChurnConfig::new(ITERATIONS, 7, ITERATIONS), &mut ());

  assert_eq!(total, 499_500);
  assert_eq!(ALLOCATOR.allocs.load(Ordering::Relaxed) - allocs, ITERATIONS);
  assert_eq!(ALLOCATOR.frees.load(Ordering::Relaxed) - frees, ITERATIONS);
}
