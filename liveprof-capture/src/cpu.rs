use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use pprof::{ProfilerGuard, ProfilerGuardBuilder};

use crate::error::{CaptureError, Result};
use crate::kind::{ProfileKind, SampleClock, Sampler, SamplerConfig};
use crate::raw::{RawFrame, RawProfile, RawProfileBuilder};

const PROFILE_BLOCK_LIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];
const MAX_FREQUENCY_HZ: i32 = 10_000;

#[derive(Debug, Clone, Copy)]
struct CpuSettings {
    buffer_size: usize,
    frequency: i32,
}

impl Default for CpuSettings {
    fn default() -> Self {
        CpuSettings {
            buffer_size: 0,
            frequency: 100,
        }
    }
}

struct Running {
    guard: ProfilerGuard<'static>,
    settings: CpuSettings,
    started_at: SystemTime,
    started: Instant,
}

/// The CPU-time sampler, driven by pprof-rs's `SIGPROF` timer.
pub(crate) struct CpuSampler {
    settings: Mutex<CpuSettings>,
    running: Mutex<Option<Running>>,
    report: Mutex<Option<RawProfile>>,
}

pub(crate) fn frequency_for_delay(delay: Duration) -> i32 {
    let secs = delay.as_secs_f64();
    if secs <= 0.0 {
        return MAX_FREQUENCY_HZ;
    }
    (1.0 / secs).round().clamp(1.0, f64::from(MAX_FREQUENCY_HZ)) as i32
}

fn lock_err(sampler: Sampler) -> CaptureError {
    CaptureError::StartFailed(sampler, "sampler state lock was poisoned".to_string())
}

impl CpuSampler {
    pub(crate) fn new() -> Self {
        CpuSampler {
            settings: Mutex::new(CpuSettings::default()),
            running: Mutex::new(None),
            report: Mutex::new(None),
        }
    }

    pub(crate) fn configure(&self, config: &SamplerConfig) -> Result<()> {
        let SamplerConfig::Cpu {
            buffer_size,
            delay,
            clock,
        } = config
        else {
            return Err(CaptureError::MismatchedConfig(Sampler::Cpu, config.sampler()));
        };
        if *clock == SampleClock::Wall {
            return Err(CaptureError::Unsupported(ProfileKind::Wall));
        }
        let mut settings = self.settings.lock().map_err(|_| lock_err(Sampler::Cpu))?;
        *settings = CpuSettings {
            buffer_size: *buffer_size,
            frequency: frequency_for_delay(*delay),
        };
        Ok(())
    }

    pub(crate) fn clear(&self) -> Result<()> {
        let mut report = self.report.lock().map_err(|_| lock_err(Sampler::Cpu))?;
        *report = None;
        Ok(())
    }

    pub(crate) fn start(&self) -> Result<()> {
        let settings = *self.settings.lock().map_err(|_| lock_err(Sampler::Cpu))?;
        let mut running = self.running.lock().map_err(|_| lock_err(Sampler::Cpu))?;
        // pprof-rs allows one guard per process; drop the old one first.
        if running.take().is_some() {
            log::debug!("Restarting the running CPU sampler");
        }
        self.clear()?;
        let guard = ProfilerGuardBuilder::default()
            .frequency(settings.frequency)
            .blocklist(PROFILE_BLOCK_LIST)
            .build()
            .map_err(|e| CaptureError::StartFailed(Sampler::Cpu, e.to_string()))?;
        log::info!("CPU sampler started at {} Hz", settings.frequency);
        *running = Some(Running {
            guard,
            settings,
            started_at: SystemTime::now(),
            started: Instant::now(),
        });
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<()> {
        let Some(running) = self
            .running
            .lock()
            .map_err(|_| lock_err(Sampler::Cpu))?
            .take()
        else {
            return Ok(());
        };
        let elapsed = running.started.elapsed();
        let report = running
            .guard
            .report()
            .build()
            .map_err(|e| CaptureError::ReportFailed(Sampler::Cpu, e.to_string()))?;
        drop(running.guard);

        let period = 1_000_000_000 / i64::from(running.settings.frequency.max(1));
        let mut builder = RawProfileBuilder::for_sampler(Sampler::Cpu, period)
            .frame_capacity(running.settings.buffer_size)
            .time_range(running.started_at, elapsed);
        for (frames, count) in &report.data {
            let stack = frames.frames.iter().flatten().map(|symbol| RawFrame {
                function: symbol.name(),
                file: symbol.filename.as_ref().map(|p| p.display().to_string()),
                line: symbol.lineno.unwrap_or(0),
                address: symbol.addr.map(|a| a as u64).unwrap_or(0),
            });
            let count = *count as i64;
            builder.add_sample(
                stack,
                vec![count, count * period],
                Some(frames.thread_name.clone()),
            );
        }
        if builder.dropped_samples() != 0 {
            log::warn!(
                "CPU profile buffer was full, dropped {} samples",
                builder.dropped_samples()
            );
        }
        let profile = builder.build();
        log::info!(
            "CPU sampler stopped after {:.2}s with {} distinct stacks",
            elapsed.as_secs_f64(),
            profile.sample_count()
        );
        *self.report.lock().map_err(|_| lock_err(Sampler::Cpu))? = Some(profile);
        Ok(())
    }

    pub(crate) fn retrieve(&self) -> Result<RawProfile> {
        let report = self.report.lock().map_err(|_| lock_err(Sampler::Cpu))?;
        Ok(report
            .clone()
            .unwrap_or_else(|| RawProfile::empty(Sampler::Cpu)))
    }
}
