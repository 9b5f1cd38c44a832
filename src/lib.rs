use core::time::Duration;
use std::{
  alloc::{self, Layout},
  io::{self, Write},
};

use tracing::warn;

// =============================================================================
// Constants
// =============================================================================

/// Entries in each object's data buffer.
pub const DATA_LEN: usize = 64;

/// Clears the sign bit of a 64-bit two's-complement value.
pub const NON_NEGATIVE_MASK: i64 = 0x7FFF_FFFF_FFFF_FFFF;

/// A run is representative once every slot has been evicted at least once.
pub const MIN_CHURN_FACTOR: u64 = 2;

/// Prefix of every line written to stdout.
pub const LABEL: &str = "Rust";

// =============================================================================
// Configuration
// =============================================================================

/// Shape of one churn run. Fixed at construction, never read from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChurnConfig {
  /// Total loop iterations (I).
  pub iterations: u64,
  /// Slot table capacity (N).
  pub slots: usize,
  /// Progress period (P).
  pub report_every: u64,
}

impl ChurnConfig {
  /// 10^8 iterations over 1000 slots, reporting every 10^7.
  pub const CANONICAL: Self = Self::new(100_000_000, 1000, 10_000_000);

  pub const fn new(iterations: u64, slots: usize, report_every: u64) -> Self {
    if slots == 0 {
      panic!("churn needs at least one slot");
    }
    if report_every == 0 {
      panic!("progress period must be non-zero");
    }
    Self {
      iterations,
      slots,
      report_every,
    }
  }

  /// `true` once I is at least `MIN_CHURN_FACTOR * N`, so every slot sees an eviction.
  pub const fn is_representative(&self) -> bool {
    self.iterations >= MIN_CHURN_FACTOR.saturating_mul(self.slots as u64)
  }
}

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(NON_NEGATIVE_MASK == i64::MAX);
const _: () = assert!(NON_NEGATIVE_MASK >= 0);
const _: () = assert!(DATA_LEN > 0);
const _: () = assert!(ChurnConfig::CANONICAL.is_representative());
const _: () = assert!(core::mem::size_of::<KernelObject>() == 8 * (DATA_LEN + 1));

// =============================================================================
// Kernel Object
// =============================================================================

/// One unit of allocated work: an identifier plus a buffer the work step overwrites.
#[derive(Debug)]
pub struct KernelObject {
  id: i64,
  data: [i64; DATA_LEN],
}

impl KernelObject {
  /// Zeroed buffer, given identifier.
  pub const fn new(id: i64) -> Self {
    Self {
      id,
      data: [0; DATA_LEN],
    }
  }

  /// Heap-allocates a fresh object. Running out of memory ends the process.
  #[inline]
  pub fn allocate(id: i64) -> Box<Self> {
    let layout = Layout::new::<Self>();
    let ptr = unsafe { alloc::alloc(layout) }.cast::<Self>();
    if ptr.is_null() {
      tracing::error!(id, size = layout.size(), "object allocation failed, aborting run");
      alloc::handle_alloc_error(layout);
    }

    // SAFETY: `ptr` came from the global allocator with `Self`'s layout.
    unsafe {
      ptr.write(Self::new(id));
      Box::from_raw(ptr)
    }
  }

  #[inline]
  pub fn perform_work(&mut self) {
    for (k, entry) in self.data.iter_mut().enumerate() {
      *entry = self.id.wrapping_add(k as i64) & NON_NEGATIVE_MASK;
    }
  }

  #[inline(always)]
  pub fn id(&self) -> i64 {
    self.id
  }

  /// Panics if `index >= DATA_LEN`.
  #[inline(always)]
  pub fn data(&self, index: usize) -> i64 {
    self.data[index]
  }

  pub fn buffer(&self) -> &[i64; DATA_LEN] {
    &self.data
  }
}

/// Adds `value` into the running total, keeping it non-negative.
#[inline(always)]
pub const fn fold(total: i64, value: i64) -> i64 {
  total.wrapping_add(value) & NON_NEGATIVE_MASK
}

// =============================================================================
// Slot Table
// =============================================================================

/// Fixed-capacity table where each slot exclusively owns at most one object.
pub struct SlotTable {
  slots: Box<[Option<Box<KernelObject>>]>,
}

impl SlotTable {
  /// All slots start empty.
  pub fn new(len: usize) -> Self {
    Self {
      slots: (0..len).map(|_| None).collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// Number of slots currently owning an object.
  pub fn occupied(&self) -> usize {
    self.slots.iter().filter(|slot| slot.is_some()).count()
  }

  pub fn get(&self, index: usize) -> Option<&KernelObject> {
    self.slots[index].as_deref()
  }

  /// Empties the slot, handing its object (if any) to the caller.
  #[inline]
  pub fn evict(&mut self, index: usize) -> Option<Box<KernelObject>> {
    self.slots[index].take()
  }

  /// Moves `object` into an empty slot.
  #[inline]
  pub fn populate(&mut self, index: usize, object: Box<KernelObject>) -> &mut KernelObject {
    let slot = &mut self.slots[index];
    debug_assert!(slot.is_none(), "slot {index} populated without eviction");
    &mut **slot.insert(object)
  }

  /// Empties every slot in index order.
  pub fn drain(&mut self) -> impl Iterator<Item = Box<KernelObject>> + '_ {
    self.slots.iter_mut().filter_map(Option::take)
  }
}

// =============================================================================
// Observers
// =============================================================================

/// Hooks invoked by [`run`]. All default to no-ops; `()` observes nothing.
pub trait ChurnObserver {
  fn constructed(&mut self, _id: i64) {}

  fn destroyed(&mut self, _id: i64) {}

  fn progress(&mut self, _iteration: u64, _total: i64) {}
}

impl ChurnObserver for () {}

/// Construction and destruction counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
  pub constructed: u64,
  pub destroyed: u64,
}

impl Tally {
  /// Objects constructed but not yet destroyed.
  pub fn live(&self) -> u64 {
    self.constructed - self.destroyed
  }
}

impl ChurnObserver for Tally {
  #[inline(always)]
  fn constructed(&mut self, _id: i64) {
    self.constructed += 1;
  }

  #[inline(always)]
  fn destroyed(&mut self, _id: i64) {
    self.destroyed += 1;
  }
}

/// Writes progress lines and the final total.
pub struct Console<W: Write> {
  out: W,
  label: &'static str,
  muted: bool,
}

impl<W: Write> Console<W> {
  pub fn new(out: W, label: &'static str) -> Self {
    Self {
      out,
      label,
      muted: false,
    }
  }

  /// Writes the completion line and returns the writer.
  pub fn finish(mut self, total: i64) -> io::Result<W> {
    writeln!(self.out, "{} version completed, total: {}", self.label, total)?;
    self.out.flush()?;
    Ok(self.out)
  }
}

impl<W: Write> ChurnObserver for Console<W> {
  fn progress(&mut self, iteration: u64, total: i64) {
    if self.muted {
      return;
    }
    if let Err(err) = writeln!(self.out, "{} Intermediate {}: {}", self.label, iteration, total) {
      warn!(%err, iteration, "progress output failed, suppressing further progress lines");
      self.muted = true;
    }
  }
}

// =============================================================================
// Churn Loop
// =============================================================================

/// Runs the churn loop and returns the final accumulator.
///
/// Each iteration evicts whatever occupies slot `i % N`, installs a new object with
/// identifier `i`, runs the work step on it and folds `data[0]` into the total.
/// Objects still held after the last iteration are destroyed in slot order.
pub fn run<O: ChurnObserver>(config: &ChurnConfig, observer: &mut O) -> i64 {
  let mut table = SlotTable::new(config.slots);
  let slots = config.slots as u64;
  let mut total = 0i64;

  for i in 0..config.iterations {
    let index = (i % slots) as usize;

    if let Some(evicted) = table.evict(index) {
      observer.destroyed(evicted.id());
      drop(evicted);
    }

    let id = i as i64;
    let object = table.populate(index, KernelObject::allocate(id));
    observer.constructed(id);

    object.perform_work();
    total = fold(total, object.data(0));

    if i % config.report_every == 0 {
      observer.progress(i, total);
    }
  }

  for object in table.drain() {
    observer.destroyed(object.id());
  }

  total
}

// =============================================================================
// Telemetry
// =============================================================================

/// Process resource counters, as `/usr/bin/time -v` would report them.
#[derive(Clone, Copy, Debug)]
pub struct ResourceUsage {
  pub user: Duration,
  pub system: Duration,
  pub max_rss_kib: u64,
}

impl ResourceUsage {
  #[cfg(unix)]
  pub fn current() -> Option<Self> {
    let mut usage = core::mem::MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) } != 0 {
      return None;
    }
    let usage = unsafe { usage.assume_init() };

    Some(Self {
      user: timeval_to_duration(usage.ru_utime),
      system: timeval_to_duration(usage.ru_stime),
      max_rss_kib: max_rss_kib(usage.ru_maxrss),
    })
  }

  #[cfg(not(unix))]
  pub fn current() -> Option<Self> {
    None
  }
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
  Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

// macOS reports bytes, everyone else KiB.
#[cfg(all(unix, target_os = "macos"))]
fn max_rss_kib(raw: libc::c_long) -> u64 {
  raw.max(0) as u64 / 1024
}

#[cfg(all(unix, not(target_os = "macos")))]
fn max_rss_kib(raw: libc::c_long) -> u64 {
  raw.max(0) as u64
}

// =============================================================================
// Logging
// =============================================================================

/// Installs a stderr `fmt` subscriber filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
  use tracing_subscriber::{EnvFilter, fmt, prelude::*};
  let filter = match EnvFilter::try_from_default_env() {
    Ok(f) => f,
    Err(_) => EnvFilter::new("info"),
  };

  // A second call keeps the first subscriber.
  let _ = tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(io::stderr))
    .try_init();
}

// =============================================================================
// Tests
// =============================================================================
