use std::path::Path;
use std::sync::Mutex;
use std::time::{Instant, SystemTime};

use crate::alloc;
use crate::capability::{HeapSnapshotParts, ProfilerCapability};
#[cfg(all(unix, feature = "cpu"))]
use crate::cpu::CpuSampler;
use crate::error::{CaptureError, Result};
use crate::heap::HeapSnapshotBuilder;
use crate::kind::{ProfileKind, Sampler, SamplerConfig, SupportedKinds};
use crate::raw::{RawProfile, RawProfileBuilder};
use crate::symbolize::Symbolizer;
use crate::tasks;

#[derive(Debug, Default)]
struct AllocationSession {
    interval: u64,
    started_at: Option<(SystemTime, Instant)>,
    stopped_after: Option<std::time::Duration>,
}

/// The in-process profilers: pprof-rs for CPU time, [`TrackingAllocator`]
/// for allocations and heap snapshots, and procfs for task backtraces.
///
/// [`TrackingAllocator`]: crate::TrackingAllocator
pub struct BuiltinCapability {
    supported: SupportedKinds,
    #[cfg(all(unix, feature = "cpu"))]
    cpu: CpuSampler,
    allocations: Mutex<AllocationSession>,
}

impl BuiltinCapability {
    /// Probes what this build and process can offer. Call this after the
    /// first allocation (any `main` has made one by then) and after
    /// [`enable_heap_tracking`](crate::enable_heap_tracking).
    pub fn negotiate() -> Self {
        let mut supported = SupportedKinds::none();
        if cfg!(all(unix, feature = "cpu")) {
            supported.insert(ProfileKind::Cpu);
        }
        if alloc::is_installed() {
            supported.insert(ProfileKind::Allocations);
            if alloc::heap_tracking_interval() != 0 {
                supported.insert(ProfileKind::HeapSnapshot);
            }
        }
        if cfg!(target_os = "linux") {
            supported.insert(ProfileKind::TaskBacktraces);
        }
        log::info!("Supported profile kinds: {supported}");
        for kind in ProfileKind::ALL {
            if !supported.contains(kind) {
                log::debug!("{} profiling is unavailable. {}", kind.display_name(), kind.requirement());
            }
        }
        BuiltinCapability {
            supported,
            #[cfg(all(unix, feature = "cpu"))]
            cpu: CpuSampler::new(),
            allocations: Mutex::new(AllocationSession::default()),
        }
    }

    fn check(&self, kind: ProfileKind) -> Result<()> {
        if self.supported.contains(kind) {
            Ok(())
        } else {
            Err(CaptureError::Unsupported(kind))
        }
    }

    fn check_sampler(&self, sampler: Sampler) -> Result<()> {
        match sampler {
            Sampler::Cpu => self.check(ProfileKind::Cpu),
            Sampler::Allocations => self.check(ProfileKind::Allocations),
        }
    }

    fn allocation_session(&self) -> Result<std::sync::MutexGuard<'_, AllocationSession>> {
        self.allocations.lock().map_err(|_| {
            CaptureError::StartFailed(
                Sampler::Allocations,
                "sampler state lock was poisoned".to_string(),
            )
        })
    }

    fn allocation_profile(&self) -> Result<RawProfile> {
        let session = self.allocation_session()?;
        let sampled = alloc::sampled_allocations();
        let interval = i64::try_from(sampled.interval.max(1)).unwrap_or(i64::MAX);
        let mut builder = RawProfileBuilder::for_sampler(Sampler::Allocations, interval);
        if let Some((started_at, started)) = session.started_at {
            let duration = session.stopped_after.unwrap_or_else(|| started.elapsed());
            builder = builder.time_range(started_at, duration);
        }
        drop(session);

        let mut symbolizer = Symbolizer::new();
        for record in &sampled.records {
            let stack = symbolizer.stack(record.stack.frames());
            let bytes = i64::try_from(record.size)
                .unwrap_or(i64::MAX)
                .saturating_mul(interval);
            builder.add_sample(stack, vec![interval, bytes], None);
        }
        let mut profile = builder.build();
        profile.dropped_samples += sampled.dropped;
        Ok(profile)
    }
}

impl ProfilerCapability for BuiltinCapability {
    fn supported_kinds(&self) -> SupportedKinds {
        self.supported
    }

    fn clear(&self, sampler: Sampler) -> Result<()> {
        self.check_sampler(sampler)?;
        match sampler {
            #[cfg(all(unix, feature = "cpu"))]
            Sampler::Cpu => self.cpu.clear(),
            #[cfg(not(all(unix, feature = "cpu")))]
            Sampler::Cpu => Err(CaptureError::Unsupported(ProfileKind::Cpu)),
            Sampler::Allocations => {
                alloc::clear_samples();
                Ok(())
            }
        }
    }

    fn configure(&self, config: &SamplerConfig) -> Result<()> {
        self.check_sampler(config.sampler())?;
        match config {
            #[cfg(all(unix, feature = "cpu"))]
            SamplerConfig::Cpu { .. } => self.cpu.configure(config),
            #[cfg(not(all(unix, feature = "cpu")))]
            SamplerConfig::Cpu { .. } => Err(CaptureError::Unsupported(ProfileKind::Cpu)),
            SamplerConfig::Allocations { sample_rate } => {
                self.allocation_session()?.interval = alloc::interval_for_rate(*sample_rate);
                Ok(())
            }
        }
    }

    fn start(&self, sampler: Sampler) -> Result<()> {
        self.check_sampler(sampler)?;
        match sampler {
            #[cfg(all(unix, feature = "cpu"))]
            Sampler::Cpu => self.cpu.start(),
            #[cfg(not(all(unix, feature = "cpu")))]
            Sampler::Cpu => Err(CaptureError::Unsupported(ProfileKind::Cpu)),
            Sampler::Allocations => {
                let mut session = self.allocation_session()?;
                let interval = session.interval.max(1);
                session.started_at = Some((SystemTime::now(), Instant::now()));
                session.stopped_after = None;
                alloc::start_sampling(interval);
                log::info!("Allocation sampler started, recording every {interval}th allocation");
                Ok(())
            }
        }
    }

    fn stop(&self, sampler: Sampler) -> Result<()> {
        self.check_sampler(sampler)?;
        match sampler {
            #[cfg(all(unix, feature = "cpu"))]
            Sampler::Cpu => self.cpu.stop(),
            #[cfg(not(all(unix, feature = "cpu")))]
            Sampler::Cpu => Err(CaptureError::Unsupported(ProfileKind::Cpu)),
            Sampler::Allocations => {
                alloc::stop_sampling();
                let mut session = self.allocation_session()?;
                if session.stopped_after.is_none() {
                    if let Some((_, started)) = session.started_at {
                        session.stopped_after = Some(started.elapsed());
                        log::info!("Allocation sampler stopped");
                    }
                }
                Ok(())
            }
        }
    }

    fn retrieve(&self, sampler: Sampler) -> Result<RawProfile> {
        self.check_sampler(sampler)?;
        match sampler {
            #[cfg(all(unix, feature = "cpu"))]
            Sampler::Cpu => self.cpu.retrieve(),
            #[cfg(not(all(unix, feature = "cpu")))]
            Sampler::Cpu => Err(CaptureError::Unsupported(ProfileKind::Cpu)),
            Sampler::Allocations => self.allocation_profile(),
        }
    }

    fn take_heap_snapshot(&self, dir: &Path, collapse_object_sizes: bool) -> Result<HeapSnapshotParts> {
        self.check(ProfileKind::HeapSnapshot)?;
        let live = alloc::live_allocations();
        let mut symbolizer = Symbolizer::new();
        let mut builder = HeapSnapshotBuilder::new(collapse_object_sizes)
            .sample_interval(alloc::heap_tracking_interval());
        for record in &live {
            let stack = symbolizer.stack(record.stack.frames());
            builder.add_allocation(&stack, record.size as u64);
        }
        log::info!(
            "Heap snapshot of {} tracked allocations, {} nodes",
            builder.allocation_count(),
            builder.node_count()
        );
        builder.write_parts(dir, "heap_snapshot")
    }

    fn capture_task_backtraces(&self, path: &Path) -> Result<()> {
        self.check(ProfileKind::TaskBacktraces)?;
        tasks::write_task_backtraces(path)
    }
}
