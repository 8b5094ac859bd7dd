use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use liveprof_capture::{
    ProfileKind, ProfilerCapability, SampleClock, Sampler, SamplerConfig, SupportedKinds,
};

use crate::artifact::{Artifact, ArtifactName, ArtifactWriter, Destination, ProfileFormat};
use crate::error::SessionError;
use crate::params::{parse_pprof_flag, AllocParams, CpuParams, HeapSnapshotParams, Params};
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running { since: Instant },
}

/// A parsed sampling request.
struct SamplingPlan {
    config: SamplerConfig,
    duration: Duration,
    format: ProfileFormat,
    label: String,
}

impl SamplingPlan {
    fn parse(kind: ProfileKind, params: &Params) -> Result<Self, SessionError> {
        match kind {
            ProfileKind::Cpu | ProfileKind::Wall => {
                let cpu = CpuParams::parse(params)?;
                let clock = match kind {
                    ProfileKind::Wall => SampleClock::Wall,
                    _ => SampleClock::Cpu,
                };
                Ok(SamplingPlan {
                    config: cpu.sampler_config(clock),
                    duration: cpu.duration(),
                    format: ProfileFormat::from_pprof_flag(cpu.pprof),
                    label: cpu.label(),
                })
            }
            ProfileKind::Allocations => {
                let alloc = AllocParams::parse(params)?;
                Ok(SamplingPlan {
                    config: alloc.sampler_config(),
                    duration: alloc.duration(),
                    format: ProfileFormat::Pprof,
                    label: alloc.label(),
                })
            }
            ProfileKind::HeapSnapshot | ProfileKind::TaskBacktraces => {
                Err(SessionError::UnsupportedOperation(kind))
            }
        }
    }
}

#[derive(Debug)]
struct SamplerSlot {
    kind: ProfileKind,
    state: SessionState,
}

/// Drives the capability through clear, configure, start, stop and
/// retrieve, and hands the samples to the [`ArtifactWriter`].
///
/// The capability is shared process-wide state. Operations on different
/// samplers are independent; operations on the same sampler are not
/// serialized, so a second session of the same kind restarts the first.
pub struct SessionController {
    capability: Arc<dyn ProfilerCapability>,
    supported: SupportedKinds,
    writer: ArtifactWriter,
    pool: WorkerPool,
    cpu: Mutex<SamplerSlot>,
    allocations: Mutex<SamplerSlot>,
}

impl SessionController {
    /// Queries the capability's supported kinds once; they stay fixed for
    /// the lifetime of the controller.
    pub fn new(capability: Arc<dyn ProfilerCapability>, pool: WorkerPool) -> Self {
        let supported = capability.supported_kinds();
        SessionController {
            capability,
            supported,
            writer: ArtifactWriter,
            pool,
            cpu: Mutex::new(SamplerSlot {
                kind: ProfileKind::Cpu,
                state: SessionState::Idle,
            }),
            allocations: Mutex::new(SamplerSlot {
                kind: ProfileKind::Allocations,
                state: SessionState::Idle,
            }),
        }
    }

    pub fn supported_kinds(&self) -> SupportedKinds {
        self.supported
    }

    pub fn check_supported(&self, kind: ProfileKind) -> Result<(), SessionError> {
        if self.supported.contains(kind) {
            Ok(())
        } else {
            Err(SessionError::Unsupported(kind))
        }
    }

    fn slot(&self, sampler: Sampler) -> &Mutex<SamplerSlot> {
        match sampler {
            Sampler::Cpu => &self.cpu,
            Sampler::Allocations => &self.allocations,
        }
    }

    fn set_state(&self, sampler: Sampler, kind: ProfileKind, state: SessionState) {
        let mut slot = self.slot(sampler).lock().unwrap_or_else(|e| e.into_inner());
        slot.kind = kind;
        slot.state = state;
    }

    /// The state of `kind`'s session. Kinds that share a sampler are only
    /// reported as running for the kind that started it.
    pub fn state(&self, kind: ProfileKind) -> SessionState {
        let Some(sampler) = kind.sampler() else {
            return SessionState::Idle;
        };
        let slot = self.slot(sampler).lock().unwrap_or_else(|e| e.into_inner());
        if slot.kind == kind {
            slot.state
        } else {
            SessionState::Idle
        }
    }

    fn sampler_of(kind: ProfileKind) -> Result<Sampler, SessionError> {
        kind.sampler().ok_or(SessionError::UnsupportedOperation(kind))
    }

    /// Clears, configures and starts the sampler. Parameters are parsed
    /// before this is called, so a rejected request never gets here.
    fn begin(&self, kind: ProfileKind, sampler: Sampler, config: &SamplerConfig) -> Result<(), SessionError> {
        if let SessionState::Running { since } = self.state(kind) {
            log::info!(
                "Restarting {} profiling that was started {:.1}s ago",
                kind.display_name(),
                since.elapsed().as_secs_f64()
            );
        }
        self.capability.clear(sampler)?;
        self.capability.configure(config)?;
        self.capability.start(sampler)?;
        self.set_state(sampler, kind, SessionState::Running { since: Instant::now() });
        Ok(())
    }

    /// Stops the sampler and builds the artifact on the worker pool.
    async fn finish(
        &self,
        kind: ProfileKind,
        sampler: Sampler,
        format: ProfileFormat,
        name: ArtifactName,
        destination: &Destination,
    ) -> Result<Artifact, SessionError> {
        let capability = self.capability.clone();
        let writer = self.writer;
        let destination = destination.clone();
        let result = self
            .pool
            .run(move || {
                capability.stop(sampler)?;
                let profile = capability.retrieve(sampler)?;
                log::info!(
                    "{} profile has {} samples ({} dropped)",
                    kind.display_name(),
                    profile.sample_count(),
                    profile.dropped_samples
                );
                writer.write_profile(&profile, format, &name, &destination)
            })
            .await;
        self.set_state(sampler, kind, SessionState::Idle);
        result
    }

    /// Samples `kind` for the requested duration and returns the profile.
    pub async fn run_for_duration(
        &self,
        kind: ProfileKind,
        params: &Params,
        destination: &Destination,
    ) -> Result<Artifact, SessionError> {
        self.check_supported(kind)?;
        let sampler = Self::sampler_of(kind)?;
        let plan = SamplingPlan::parse(kind, params)?;
        self.begin(kind, sampler, &plan.config)?;
        log::info!(
            "{} profiling for {:.2}s",
            kind.display_name(),
            plan.duration.as_secs_f64()
        );
        tokio::time::sleep(plan.duration).await;
        let name = ArtifactName::new(kind, Some(&plan.label), plan.format.extension());
        self.finish(kind, sampler, plan.format, name, destination).await
    }

    /// Starts continuous sampling and returns the acknowledgement text.
    pub fn start(&self, kind: ProfileKind, params: &Params) -> Result<String, SessionError> {
        self.check_supported(kind)?;
        let sampler = Self::sampler_of(kind)?;
        let plan = SamplingPlan::parse(kind, params)?;
        self.begin(kind, sampler, &plan.config)?;
        log::info!("{} profiling started", kind.display_name());
        Ok(format!("{} profiling started.", kind.display_name()))
    }

    /// Stops sampling and returns what is buffered. Stopping a stopped
    /// sampler returns the same samples again.
    pub async fn stop(
        &self,
        kind: ProfileKind,
        params: &Params,
        destination: &Destination,
    ) -> Result<Artifact, SessionError> {
        self.check_supported(kind)?;
        let sampler = Self::sampler_of(kind)?;
        let format = match sampler {
            Sampler::Cpu => ProfileFormat::from_pprof_flag(parse_pprof_flag(params)?),
            Sampler::Allocations => ProfileFormat::Pprof,
        };
        let name = ArtifactName::new(kind, None, format.extension());
        self.finish(kind, sampler, format, name, destination).await
    }

    /// Captures a heap snapshot or the task backtraces.
    pub async fn one_shot(
        &self,
        kind: ProfileKind,
        params: &Params,
        destination: &Destination,
    ) -> Result<Artifact, SessionError> {
        self.check_supported(kind)?;
        let capability = self.capability.clone();
        let writer = self.writer;
        let destination = destination.clone();
        match kind {
            ProfileKind::HeapSnapshot => {
                let heap = HeapSnapshotParams::parse(params)?;
                let name = ArtifactName::new(kind, Some(&heap.label()), "heapsnapshot");
                self.pool
                    .run(move || {
                        writer.write_heap_snapshot(&*capability, heap.all_one, &name, &destination)
                    })
                    .await
            }
            ProfileKind::TaskBacktraces => {
                let name = ArtifactName::new(kind, None, "txt");
                self.pool
                    .run(move || writer.write_task_backtraces(&*capability, &name, &destination))
                    .await
            }
            ProfileKind::Cpu | ProfileKind::Wall | ProfileKind::Allocations => {
                Err(SessionError::UnsupportedOperation(kind))
            }
        }
    }
}
