use std::hint::black_box;
use std::sync::{Mutex, MutexGuard};

use liveprof_capture::{
    decode_pprof_gz, encode_pprof_gz, enable_heap_tracking, is_installed, BuiltinCapability,
    ProfileKind, ProfilerCapability, Sampler, SamplerConfig, TrackingAllocator,
};

#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator::system();

#[inline(never)]
fn allocate_many(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![0u8; 64 + i % 512]).collect()
}

// The allocation sampler is process-wide, so tests that drive it take turns.
static ALLOCATION_SAMPLER: Mutex<()> = Mutex::new(());

fn allocation_sampler() -> MutexGuard<'static, ()> {
    ALLOCATION_SAMPLER.lock().unwrap_or_else(|e| e.into_inner())
}

fn capability() -> BuiltinCapability {
    black_box(Vec::<u8>::with_capacity(16));
    enable_heap_tracking(8);
    BuiltinCapability::negotiate()
}

#[test]
fn tracking_allocator_enables_allocation_kinds() {
    let capability = capability();
    assert!(is_installed());
    let kinds = capability.supported_kinds();
    assert!(kinds.contains(ProfileKind::Allocations));
    assert!(kinds.contains(ProfileKind::HeapSnapshot));
    assert!(!kinds.contains(ProfileKind::Wall));
}

#[test]
fn allocation_sampling_round_trip() {
    let _sampler = allocation_sampler();
    let capability = capability();
    capability.clear(Sampler::Allocations).unwrap();
    capability
        .configure(&SamplerConfig::Allocations { sample_rate: 0.5 })
        .unwrap();
    capability.start(Sampler::Allocations).unwrap();
    let kept = black_box(allocate_many(2_000));
    capability.stop(Sampler::Allocations).unwrap();
    drop(kept);

    let profile = capability.retrieve(Sampler::Allocations).unwrap();
    assert_eq!(profile.sampler, Sampler::Allocations);
    assert!(!profile.is_empty());
    assert_eq!(profile.period, 2);
    assert!(profile.samples.iter().all(|s| s.values[0] == 2 && s.values[1] > 0));

    // A second stop keeps the buffer.
    capability.stop(Sampler::Allocations).unwrap();
    let again = capability.retrieve(Sampler::Allocations).unwrap();
    assert_eq!(again.sample_count(), profile.sample_count());

    let bytes = encode_pprof_gz(&profile).unwrap();
    let decoded = decode_pprof_gz(&bytes).unwrap();
    assert_eq!(decoded.sample.len(), profile.sample_count());
}

#[test]
fn tiny_sample_rates_keep_values_in_range() {
    let _sampler = allocation_sampler();
    let capability = capability();
    for (sample_rate, expected_period) in [(1e-15, 1_000_000_000_000_000), (1e-20, i64::MAX)] {
        capability.clear(Sampler::Allocations).unwrap();
        capability
            .configure(&SamplerConfig::Allocations { sample_rate })
            .unwrap();
        capability.start(Sampler::Allocations).unwrap();
        // The first allocation after a start is always recorded.
        let big = black_box(vec![0u8; 1 << 20]);
        capability.stop(Sampler::Allocations).unwrap();
        drop(big);

        let profile = capability.retrieve(Sampler::Allocations).unwrap();
        assert_eq!(profile.period, expected_period, "{sample_rate}");
        assert!(!profile.is_empty(), "{sample_rate}");
        for sample in &profile.samples {
            assert_eq!(sample.values[0], expected_period);
            assert!(sample.values[1] > 0, "{sample_rate}: {:?}", sample.values);
        }
        let decoded = decode_pprof_gz(&encode_pprof_gz(&profile).unwrap()).unwrap();
        assert_eq!(decoded.period, expected_period);
    }
}

#[test]
fn heap_snapshot_parts() {
    let capability = capability();
    let kept = black_box(allocate_many(512));
    let dir = tempfile::tempdir().unwrap();
    let parts = capability.take_heap_snapshot(dir.path(), true).unwrap();
    for path in parts.paths() {
        assert!(path.exists(), "{} is missing", path.display());
    }
    let meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&parts.metadata).unwrap()).unwrap();
    assert!(meta["node_count"].as_u64().unwrap() > 1);
    assert_eq!(meta["collapsed_object_sizes"], true);
    drop(kept);
}

#[cfg(target_os = "linux")]
#[test]
fn task_backtraces_list_this_process() {
    let capability = capability();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.txt");
    capability.capture_task_backtraces(&path).unwrap();
    let report = std::fs::read_to_string(&path).unwrap();
    assert!(report.contains("(capturing task)"));
}

#[cfg(all(unix, feature = "cpu"))]
#[test]
fn cpu_sampler_start_stop() {
    use std::time::{Duration, Instant};

    let capability = capability();
    capability.clear(Sampler::Cpu).unwrap();
    capability
        .configure(&SamplerConfig::Cpu {
            buffer_size: 100_000,
            delay: Duration::from_millis(10),
            clock: Default::default(),
        })
        .unwrap();
    capability.start(Sampler::Cpu).unwrap();
    let deadline = Instant::now() + Duration::from_millis(200);
    let mut x = 0u64;
    while Instant::now() < deadline {
        x = black_box(x.wrapping_mul(31).wrapping_add(7));
    }
    capability.stop(Sampler::Cpu).unwrap();
    capability.stop(Sampler::Cpu).unwrap();
    let profile = capability.retrieve(Sampler::Cpu).unwrap();
    assert_eq!(profile.sampler, Sampler::Cpu);
    assert_eq!(profile.period, 10_000_000);
}
