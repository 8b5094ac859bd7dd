//! A global allocator wrapper that samples allocations.
//!
//! Install it in the binary:
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: liveprof_capture::TrackingAllocator = liveprof_capture::TrackingAllocator::system();
//! ```
//!
//! It records two independent things. While allocation sampling is on, every
//! Nth allocation is appended to a sample buffer together with its stack.
//! While heap tracking is on (fixed at startup), every Mth allocation is
//! kept in a live set until it is freed; heap snapshots are built from it.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use backtrace::trace_unsynchronized;
use dashmap::DashMap;

pub(crate) const MAX_STACK_DEPTH: usize = 32;
const MAX_ALLOCATION_SAMPLES: usize = 65_536;

#[derive(Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) struct StackKey {
    len: u8,
    frames: [usize; MAX_STACK_DEPTH],
}

impl Default for StackKey {
    fn default() -> Self {
        Self {
            len: 0,
            frames: [0; MAX_STACK_DEPTH],
        }
    }
}

impl StackKey {
    /// Return addresses, innermost first.
    pub(crate) fn frames(&self) -> &[usize] {
        &self.frames[..self.len as usize]
    }
}

#[derive(Clone, Copy)]
pub(crate) struct AllocationRecord {
    pub(crate) stack: StackKey,
    pub(crate) size: usize,
}

pub(crate) struct SampledAllocations {
    pub(crate) records: Vec<AllocationRecord>,
    pub(crate) dropped: u64,
    pub(crate) interval: u64,
}

struct AllocationTracker {
    installed: AtomicBool,
    sampling: AtomicBool,
    sample_interval: AtomicU64,
    sample_seq: AtomicU64,
    samples: Mutex<Vec<AllocationRecord>>,
    dropped_samples: AtomicU64,
    heap_interval: AtomicU64,
    heap_seq: AtomicU64,
    live: OnceLock<DashMap<usize, AllocationRecord>>,
}

static TRACKER: AllocationTracker = AllocationTracker::new();

impl AllocationTracker {
    const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
            sampling: AtomicBool::new(false),
            sample_interval: AtomicU64::new(1),
            sample_seq: AtomicU64::new(0),
            samples: Mutex::new(Vec::new()),
            dropped_samples: AtomicU64::new(0),
            heap_interval: AtomicU64::new(0),
            heap_seq: AtomicU64::new(0),
            live: OnceLock::new(),
        }
    }

    fn on_alloc(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        if !self.installed.load(Ordering::Relaxed) {
            self.installed.store(true, Ordering::Relaxed);
        }
        let sampling = self.sampling.load(Ordering::Relaxed);
        let heap_interval = self.heap_interval.load(Ordering::Relaxed);
        if !sampling && heap_interval == 0 {
            return;
        }
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };

        let sample_now = sampling
            && tick(
                &self.sample_seq,
                self.sample_interval.load(Ordering::Relaxed),
            );
        let track_now = heap_interval != 0 && tick(&self.heap_seq, heap_interval);
        if !sample_now && !track_now {
            return;
        }

        let record = AllocationRecord {
            stack: capture_stack(),
            size,
        };
        if sample_now {
            if let Ok(mut samples) = self.samples.lock() {
                if samples.len() < MAX_ALLOCATION_SAMPLES {
                    samples.push(record);
                } else {
                    self.dropped_samples.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if track_now {
            if let Some(live) = self.live.get() {
                live.insert(ptr as usize, record);
            }
        }
    }

    fn on_dealloc(&self, ptr: *mut u8) {
        if ptr.is_null() || self.heap_interval.load(Ordering::Relaxed) == 0 {
            return;
        }
        let Some(live) = self.live.get() else {
            return;
        };
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };
        live.remove(&(ptr as usize));
    }
}

fn tick(seq: &AtomicU64, interval: u64) -> bool {
    let interval = interval.max(1);
    seq.fetch_add(1, Ordering::Relaxed) % interval == 0
}

fn capture_stack() -> StackKey {
    let mut key = StackKey::default();
    let mut index = 0_usize;
    // SAFETY: we only walk the current thread's stack and don't symbolicate
    // here, so no other backtrace call can race with this one.
    unsafe {
        trace_unsynchronized(|frame| {
            let ip = frame.ip() as usize;
            if ip == 0 {
                return true;
            }
            if index >= MAX_STACK_DEPTH {
                return false;
            }
            key.frames[index] = ip;
            index += 1;
            true
        });
    }
    key.len = index as u8;
    key
}

thread_local! {
    static IN_TRACKER_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as being inside the tracker. Allocations made
/// while the guard is held are not recorded. Any code that takes the
/// tracker's locks from outside an allocator hook must hold one, otherwise
/// an allocation under the lock would re-enter and deadlock.
pub(crate) struct ReentryGuard;

impl ReentryGuard {
    pub(crate) fn enter() -> Option<Self> {
        IN_TRACKER_HOOK
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(ReentryGuard)
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_TRACKER_HOOK.try_with(|flag| flag.set(false));
    }
}

/// A [`GlobalAlloc`] that forwards to `A` and reports to the allocation tracker.
pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl TrackingAllocator<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> TrackingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        TRACKER.on_alloc(ptr, layout.size());
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        TRACKER.on_alloc(ptr, layout.size());
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        TRACKER.on_dealloc(ptr);
        self.inner.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            TRACKER.on_dealloc(ptr);
            TRACKER.on_alloc(new_ptr, new_size);
        }
        new_ptr
    }
}

/// Whether a [`TrackingAllocator`] has served at least one allocation in
/// this process, i.e. whether it is the global allocator.
pub fn is_installed() -> bool {
    TRACKER.installed.load(Ordering::Relaxed)
}

/// Keeps every `interval`th allocation in the live set until it is freed.
/// 0 turns tracking off. Meant to be called once, at startup.
pub fn enable_heap_tracking(interval: u64) {
    if interval != 0 {
        let _guard = ReentryGuard::enter();
        TRACKER.live.get_or_init(DashMap::new);
    }
    TRACKER.heap_interval.store(interval, Ordering::Relaxed);
}

pub fn heap_tracking_interval() -> u64 {
    TRACKER.heap_interval.load(Ordering::Relaxed)
}

/// Converts a sampling probability into "every Nth allocation". The
/// interval is capped at `i64::MAX` so it fits a pprof period.
pub(crate) fn interval_for_rate(sample_rate: f64) -> u64 {
    if !(sample_rate > 0.0) || sample_rate >= 1.0 {
        return 1;
    }
    ((1.0 / sample_rate).round().max(1.0) as u64).min(i64::MAX as u64)
}

pub(crate) fn start_sampling(interval: u64) {
    TRACKER.sample_interval.store(interval.max(1), Ordering::Relaxed);
    TRACKER.sample_seq.store(0, Ordering::Relaxed);
    TRACKER.sampling.store(true, Ordering::Release);
}

pub(crate) fn stop_sampling() {
    TRACKER.sampling.store(false, Ordering::Release);
}

pub(crate) fn clear_samples() {
    let _guard = ReentryGuard::enter();
    if let Ok(mut samples) = TRACKER.samples.lock() {
        samples.clear();
    }
    TRACKER.dropped_samples.store(0, Ordering::Relaxed);
}

pub(crate) fn sampled_allocations() -> SampledAllocations {
    let _guard = ReentryGuard::enter();
    let records = match TRACKER.samples.lock() {
        Ok(samples) => samples.clone(),
        Err(_) => Vec::new(),
    };
    SampledAllocations {
        records,
        dropped: TRACKER.dropped_samples.load(Ordering::Relaxed),
        interval: TRACKER.sample_interval.load(Ordering::Relaxed),
    }
}

pub(crate) fn live_allocations() -> Vec<AllocationRecord> {
    let _guard = ReentryGuard::enter();
    match TRACKER.live.get() {
        Some(live) => live.iter().map(|entry| *entry.value()).collect(),
        None => Vec::new(),
    }
}
