//! A deterministic [`ProfilerCapability`] for tests of the layers above.
//!
//! It produces synthetic samples whose function names carry the sampler's
//! name, so tests can tell the buffers apart, and it logs every call.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use rustc_hash::FxHashMap;

use crate::capability::{HeapSnapshotParts, ProfilerCapability};
use crate::error::{CaptureError, Result};
use crate::heap::HeapSnapshotBuilder;
use crate::kind::{ProfileKind, Sampler, SamplerConfig, SupportedKinds};
use crate::raw::{RawFrame, RawProfile, RawProfileBuilder};
use crate::tasks::{render_report, TaskInfo};

const FAKE_STACKS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum FakeCall {
    Clear(Sampler),
    Configure(SamplerConfig),
    Start(Sampler),
    Stop(Sampler),
    Retrieve(Sampler),
    HeapSnapshot { collapse_object_sizes: bool },
    TaskBacktraces,
}

#[derive(Debug, Default)]
struct FakeSampler {
    config: Option<SamplerConfig>,
    running: Option<SystemTime>,
    profile: Option<RawProfile>,
}

#[derive(Debug, Default)]
struct FakeState {
    samplers: FxHashMap<Sampler, FakeSampler>,
    calls: Vec<FakeCall>,
}

pub struct FakeCapability {
    supported: SupportedKinds,
    state: Mutex<FakeState>,
}

impl FakeCapability {
    pub fn new(supported: SupportedKinds) -> Self {
        FakeCapability {
            supported,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn all() -> Self {
        Self::new(SupportedKinds::all())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn is_running(&self, sampler: Sampler) -> bool {
        self.state()
            .samplers
            .get(&sampler)
            .is_some_and(|s| s.running.is_some())
    }

    pub fn config(&self, sampler: Sampler) -> Option<SamplerConfig> {
        self.state().samplers.get(&sampler).and_then(|s| s.config.clone())
    }

    fn check(&self, kind: ProfileKind) -> Result<()> {
        if self.supported.contains(kind) {
            Ok(())
        } else {
            Err(CaptureError::Unsupported(kind))
        }
    }

    fn check_sampler(&self, sampler: Sampler) -> Result<()> {
        let kind = match sampler {
            Sampler::Cpu => ProfileKind::Cpu,
            Sampler::Allocations => ProfileKind::Allocations,
        };
        // Wall shares the CPU sampler, so either kind unlocks it.
        if sampler == Sampler::Cpu && self.supported.contains(ProfileKind::Wall) {
            return Ok(());
        }
        self.check(kind)
    }
}

fn synthetic_profile(sampler: Sampler, config: Option<&SamplerConfig>, started: SystemTime) -> RawProfile {
    let (period, capacity) = match config {
        Some(SamplerConfig::Cpu {
            buffer_size, delay, ..
        }) => (
            i64::try_from(delay.as_nanos()).unwrap_or(i64::MAX),
            *buffer_size,
        ),
        Some(SamplerConfig::Allocations { sample_rate }) => {
            ((1.0 / sample_rate).round().clamp(1.0, 1e9) as i64, 0)
        }
        None => (1, 0),
    };
    let elapsed = started.elapsed().unwrap_or_default();
    let mut builder = RawProfileBuilder::for_sampler(sampler, period)
        .frame_capacity(capacity)
        .time_range(started, elapsed);
    for i in 0..FAKE_STACKS {
        let stack = vec![
            RawFrame {
                function: format!("{sampler}_leaf_{i}"),
                file: Some("src/workload.rs".to_string()),
                line: 10 + i as u32,
                address: 0x1000 + i as u64,
            },
            RawFrame {
                function: format!("{sampler}_root"),
                file: Some("src/main.rs".to_string()),
                line: 1,
                address: 0x100,
            },
        ];
        let weight = i as i64 + 1;
        builder.add_sample(
            stack,
            vec![weight, weight.saturating_mul(period.max(1)).saturating_mul(64)],
            Some(format!("{sampler}-thread")),
        );
    }
    builder.build()
}

impl ProfilerCapability for FakeCapability {
    fn supported_kinds(&self) -> SupportedKinds {
        self.supported
    }

    fn clear(&self, sampler: Sampler) -> Result<()> {
        self.check_sampler(sampler)?;
        let mut state = self.state();
        state.calls.push(FakeCall::Clear(sampler));
        state.samplers.entry(sampler).or_default().profile = None;
        Ok(())
    }

    fn configure(&self, config: &SamplerConfig) -> Result<()> {
        self.check_sampler(config.sampler())?;
        let mut state = self.state();
        state.calls.push(FakeCall::Configure(config.clone()));
        state.samplers.entry(config.sampler()).or_default().config = Some(config.clone());
        Ok(())
    }

    fn start(&self, sampler: Sampler) -> Result<()> {
        self.check_sampler(sampler)?;
        let mut state = self.state();
        state.calls.push(FakeCall::Start(sampler));
        let entry = state.samplers.entry(sampler).or_default();
        entry.profile = None;
        entry.running = Some(SystemTime::now());
        Ok(())
    }

    fn stop(&self, sampler: Sampler) -> Result<()> {
        self.check_sampler(sampler)?;
        let mut state = self.state();
        state.calls.push(FakeCall::Stop(sampler));
        let entry = state.samplers.entry(sampler).or_default();
        if let Some(started) = entry.running.take() {
            entry.profile = Some(synthetic_profile(sampler, entry.config.as_ref(), started));
        }
        Ok(())
    }

    fn retrieve(&self, sampler: Sampler) -> Result<RawProfile> {
        self.check_sampler(sampler)?;
        let mut state = self.state();
        state.calls.push(FakeCall::Retrieve(sampler));
        Ok(state
            .samplers
            .get(&sampler)
            .and_then(|s| s.profile.clone())
            .unwrap_or_else(|| RawProfile::empty(sampler)))
    }

    fn take_heap_snapshot(&self, dir: &Path, collapse_object_sizes: bool) -> Result<HeapSnapshotParts> {
        self.check(ProfileKind::HeapSnapshot)?;
        self.state().calls.push(FakeCall::HeapSnapshot {
            collapse_object_sizes,
        });
        let mut builder = HeapSnapshotBuilder::new(collapse_object_sizes);
        for i in 0..FAKE_STACKS {
            let stack = [
                RawFrame::new(format!("make_object_{i}")),
                RawFrame::new("main"),
            ];
            builder.add_allocation(&stack, 32 << i);
        }
        builder.write_parts(dir, "heap_snapshot")
    }

    fn capture_task_backtraces(&self, path: &Path) -> Result<()> {
        self.check(ProfileKind::TaskBacktraces)?;
        self.state().calls.push(FakeCall::TaskBacktraces);
        let tasks: Vec<TaskInfo> = (1..=3)
            .map(|tid| TaskInfo {
                tid,
                name: format!("fake-worker-{tid}"),
                state: 'S',
                wchan: Some("futex_wait_queue".to_string()),
                kernel_stack: None,
            })
            .collect();
        let report = render_report(std::process::id(), 0, &tasks, Some((1, "fake_backtrace\nmain")));
        std::fs::write(path, report).map_err(CaptureError::io(path))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn buffers_are_per_sampler() {
        let fake = FakeCapability::all();
        fake.start(Sampler::Cpu).unwrap();
        fake.start(Sampler::Allocations).unwrap();
        fake.stop(Sampler::Cpu).unwrap();
        fake.stop(Sampler::Allocations).unwrap();

        let cpu = fake.retrieve(Sampler::Cpu).unwrap();
        let allocs = fake.retrieve(Sampler::Allocations).unwrap();
        assert!(cpu.frames.iter().all(|f| f.function.starts_with("cpu_")));
        assert!(allocs.frames.iter().all(|f| f.function.starts_with("allocations_")));

        fake.clear(Sampler::Cpu).unwrap();
        assert!(fake.retrieve(Sampler::Cpu).unwrap().is_empty());
        assert!(!fake.retrieve(Sampler::Allocations).unwrap().is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let fake = FakeCapability::all();
        fake.start(Sampler::Cpu).unwrap();
        fake.stop(Sampler::Cpu).unwrap();
        let first = fake.retrieve(Sampler::Cpu).unwrap();
        fake.stop(Sampler::Cpu).unwrap();
        assert_eq!(fake.retrieve(Sampler::Cpu).unwrap(), first);
        assert!(!fake.is_running(Sampler::Cpu));
    }

    #[test]
    fn buffer_size_limits_frames() {
        let fake = FakeCapability::all();
        fake.configure(&SamplerConfig::Cpu {
            buffer_size: 4,
            delay: Duration::from_millis(10),
            clock: Default::default(),
        })
        .unwrap();
        fake.start(Sampler::Cpu).unwrap();
        fake.stop(Sampler::Cpu).unwrap();
        let profile = fake.retrieve(Sampler::Cpu).unwrap();
        assert_eq!(profile.sample_count(), 2);
        assert_eq!(profile.dropped_samples, FAKE_STACKS as u64 - 2);
    }

    #[test]
    fn unsupported_kind() {
        let fake = FakeCapability::new(SupportedKinds::none().with(ProfileKind::Cpu));
        assert!(matches!(
            fake.start(Sampler::Allocations),
            Err(CaptureError::Unsupported(ProfileKind::Allocations))
        ));
        assert!(fake.calls().is_empty());
    }
}
