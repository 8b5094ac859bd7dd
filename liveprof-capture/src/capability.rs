use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::kind::{Sampler, SamplerConfig, SupportedKinds};
use crate::raw::RawProfile;

/// The streamed pieces of a heap snapshot. The caller concatenates them
/// into a single container and then removes them.
///
/// `nodes`, `edges` and `strings` hold comma-separated JSON array elements
/// without the surrounding brackets; `metadata` holds one JSON object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapSnapshotParts {
    pub metadata: PathBuf,
    pub nodes: PathBuf,
    pub edges: PathBuf,
    pub strings: PathBuf,
}

impl HeapSnapshotParts {
    /// Part paths for a snapshot whose parts live in `dir` and share `stem`.
    pub fn in_dir(dir: &Path, stem: &str) -> Self {
        HeapSnapshotParts {
            metadata: dir.join(format!("{stem}.metadata.json")),
            nodes: dir.join(format!("{stem}.nodes")),
            edges: dir.join(format!("{stem}.edges")),
            strings: dir.join(format!("{stem}.strings")),
        }
    }

    pub fn paths(&self) -> [&Path; 4] {
        [&self.metadata, &self.nodes, &self.edges, &self.strings]
    }
}

/// A process-wide profiling facility.
///
/// Implementations are shared mutable state: there is one buffer per
/// [`Sampler`], and every caller sees the same one. Calls for different
/// samplers must not interfere with each other; calls for the same sampler
/// are last-writer-wins.
///
/// `stop` must be idempotent, and `retrieve` must keep returning the
/// buffered samples until the next `clear` or `start`.
pub trait ProfilerCapability: Send + Sync {
    /// The kinds this capability offers. Queried once, at startup.
    fn supported_kinds(&self) -> SupportedKinds;

    /// Discards any buffered samples.
    fn clear(&self, sampler: Sampler) -> Result<()>;

    /// Applies `config` to the sampler it names. Takes effect on the next `start`.
    fn configure(&self, config: &SamplerConfig) -> Result<()>;

    /// Starts sampling. Starting a running sampler restarts it.
    fn start(&self, sampler: Sampler) -> Result<()>;

    /// Stops sampling and keeps the buffered samples. A no-op if the sampler
    /// is not running. This may symbolicate, so don't call it on a thread
    /// that serves requests.
    fn stop(&self, sampler: Sampler) -> Result<()>;

    /// Returns the buffered samples.
    fn retrieve(&self, sampler: Sampler) -> Result<RawProfile>;

    /// Writes a snapshot of the live heap into part files under `dir`.
    /// With `collapse_object_sizes`, every object counts as size 1.
    fn take_heap_snapshot(&self, dir: &Path, collapse_object_sizes: bool)
        -> Result<HeapSnapshotParts>;

    /// Writes a text report with a backtrace per task to `path`.
    fn capture_task_backtraces(&self, path: &Path) -> Result<()>;
}
