use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use liveprof::cli::Opt;
use liveprof::liveprof_capture::{self, BuiltinCapability};

#[cfg(feature = "alloc-tracking")]
#[global_allocator]
static GLOBAL: liveprof_capture::TrackingAllocator = liveprof_capture::TrackingAllocator::system();

fn main() {
    let opt = Opt::parse();

    let default_level = if opt.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    liveprof_capture::enable_heap_tracking(opt.heap_sample_interval);
    let capability = Arc::new(BuiltinCapability::negotiate());

    if opt.demo_workload {
        spawn_demo_workload();
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not start the tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(liveprof::serve(opt.server_config(), capability)) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

/// Keeps a thread busy hashing and allocating, so the endpoints have
/// something to show.
fn spawn_demo_workload() {
    let spawned = std::thread::Builder::new()
        .name("demo-workload".to_string())
        .spawn(|| {
            let mut retained: Vec<Vec<u64>> = Vec::new();
            let mut round: u64 = 0;
            loop {
                round = round.wrapping_add(1);
                black_box(fibonacci(24 + round % 4));
                retained.push((0..(round % 512)).collect());
                if retained.len() > 256 {
                    retained.drain(..128);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });
    match spawned {
        Ok(_) => log::info!("Started the demo workload"),
        Err(e) => log::warn!("Could not start the demo workload: {e}"),
    }
}

fn fibonacci(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fibonacci(n - 1) + fibonacci(n - 2)
    }
}
