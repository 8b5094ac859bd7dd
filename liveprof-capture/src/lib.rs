//! In-process sampling capabilities for liveprof.
//!
//! A [`ProfilerCapability`] owns the process-wide samplers. The builtin one,
//! [`BuiltinCapability`], samples CPU time with pprof-rs, records
//! allocations through [`TrackingAllocator`] and reads task state from
//! procfs. Sampled profiles come back as a [`RawProfile`], which can be
//! encoded as gzipped pprof with [`encode_pprof_gz`].

mod alloc;
mod builtin;
mod capability;
#[cfg(all(unix, feature = "cpu"))]
mod cpu;
mod error;
#[cfg(feature = "fake")]
mod fake;
mod heap;
mod kind;
mod pprof_format;
pub mod proto;
mod raw;
mod symbolize;
mod tasks;

pub use alloc::{enable_heap_tracking, heap_tracking_interval, is_installed, TrackingAllocator};
pub use builtin::BuiltinCapability;
pub use capability::{HeapSnapshotParts, ProfilerCapability};
pub use error::{CaptureError, Result};
#[cfg(feature = "fake")]
pub use fake::{FakeCall, FakeCapability};
pub use heap::HeapSnapshotBuilder;
pub use kind::{ProfileKind, SampleClock, Sampler, SamplerConfig, SupportedKinds};
pub use pprof_format::{decode_pprof_gz, encode_pprof_gz, to_pprof};
pub use raw::{RawFrame, RawProfile, RawProfileBuilder, RawSample, ValueType};
pub use tasks::write_task_backtraces;
