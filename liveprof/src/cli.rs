use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::server::{ServerConfig, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(
    name = "liveprof",
    version,
    about = r#"
liveprof serves CPU, allocation, heap and task profiles of its own process over HTTP.

EXAMPLES:
    # Serve on the default port with a demo workload to profile:
    liveprof --demo-workload

    # Take a 3 second CPU profile:
    curl -OJ 'http://127.0.0.1:16825/profile?duration=3'

    # Start and stop allocation sampling:
    curl 'http://127.0.0.1:16825/allocs_profile_start?sample_rate=0.001'
    curl -OJ 'http://127.0.0.1:16825/allocs_profile_stop'

    # Write a heap snapshot into the stage directory:
    curl -X POST -d '{"profile_type":"heap_snapshot"}' http://127.0.0.1:16825/debug_engine
"#
)]
pub struct Opt {
    /// The address to listen on
    #[arg(long, env = "LIVEPROF_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// The port to listen on
    #[arg(short = 'P', long, env = "LIVEPROF_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory for debug_engine artifacts. A temporary directory is used if unset.
    #[arg(long, env = "LIVEPROF_STAGE_DIR")]
    pub stage_dir: Option<PathBuf>,

    /// Number of background workers for symbolication and encoding
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// Track every Nth live allocation for heap snapshots (0 disables heap snapshots).
    /// Snapshot sizes are scaled by N.
    #[arg(long, default_value_t = 256)]
    pub heap_sample_interval: u64,

    /// Run a background CPU and allocation workload, for trying out the endpoints.
    #[arg(long)]
    pub demo_workload: bool,

    /// Print debugging output.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Opt {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: SocketAddr::new(self.host, self.port),
            stage_dir: self.stage_dir.clone(),
            workers: self.workers,
        }
    }
}
