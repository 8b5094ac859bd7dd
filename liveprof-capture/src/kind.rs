use std::fmt;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

/// The kinds of profile a capability can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProfileKind {
    Cpu,
    Wall,
    Allocations,
    HeapSnapshot,
    TaskBacktraces,
}

impl ProfileKind {
    pub const ALL: [ProfileKind; 5] = [
        ProfileKind::Cpu,
        ProfileKind::Wall,
        ProfileKind::Allocations,
        ProfileKind::HeapSnapshot,
        ProfileKind::TaskBacktraces,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileKind::Cpu => "cpu",
            ProfileKind::Wall => "wall",
            ProfileKind::Allocations => "allocations",
            ProfileKind::HeapSnapshot => "heap_snapshot",
            ProfileKind::TaskBacktraces => "task_backtraces",
        }
    }

    /// The human-readable name used in acknowledgements and error messages.
    pub fn display_name(self) -> &'static str {
        match self {
            ProfileKind::Cpu => "CPU",
            ProfileKind::Wall => "Wall-clock",
            ProfileKind::Allocations => "Allocation",
            ProfileKind::HeapSnapshot => "Heap snapshot",
            ProfileKind::TaskBacktraces => "Task backtrace",
        }
    }

    /// The stateful sampler behind this kind, or `None` for the one-shot kinds.
    pub fn sampler(self) -> Option<Sampler> {
        match self {
            ProfileKind::Cpu | ProfileKind::Wall => Some(Sampler::Cpu),
            ProfileKind::Allocations => Some(Sampler::Allocations),
            ProfileKind::HeapSnapshot | ProfileKind::TaskBacktraces => None,
        }
    }

    /// What a build needs in order to offer this kind. Shown to clients
    /// when the kind is unsupported.
    pub fn requirement(self) -> &'static str {
        match self {
            ProfileKind::Cpu => {
                "CPU profiling requires a unix build of liveprof-capture with the `cpu` feature enabled."
            }
            ProfileKind::Wall => {
                "Wall-clock profiling requires a capability with a wall-clock sampler; the builtin pprof sampler only measures CPU time."
            }
            ProfileKind::Allocations => {
                "Allocation profiling requires liveprof_capture::TrackingAllocator to be installed as the #[global_allocator] (the liveprof binary does this with its default `alloc-tracking` feature)."
            }
            ProfileKind::HeapSnapshot => {
                "Heap snapshots require liveprof_capture::TrackingAllocator as the #[global_allocator] and a nonzero heap sample interval (--heap-sample-interval, 256 by default). Only every Nth allocation is tracked and its size is scaled by N."
            }
            ProfileKind::TaskBacktraces => {
                "Task backtraces require Linux (they are read from /proc/self/task)."
            }
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A process-wide sampler. At most one session per sampler runs at a time;
/// the two samplers are independent of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampler {
    Cpu,
    Allocations,
}

impl Sampler {
    pub fn as_str(self) -> &'static str {
        match self {
            Sampler::Cpu => "cpu",
            Sampler::Allocations => "allocations",
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which clock drives the CPU sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleClock {
    #[default]
    Cpu,
    Wall,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SamplerConfig {
    Cpu {
        /// Maximum number of stack frames retained across all samples.
        buffer_size: usize,
        /// Time between two samples.
        delay: Duration,
        clock: SampleClock,
    },
    Allocations {
        /// Fraction of allocations that are recorded, in (0, 1].
        sample_rate: f64,
    },
}

impl SamplerConfig {
    pub fn sampler(&self) -> Sampler {
        match self {
            SamplerConfig::Cpu { .. } => Sampler::Cpu,
            SamplerConfig::Allocations { .. } => Sampler::Allocations,
        }
    }
}

/// The fixed set of kinds a capability offers for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportedKinds(u8);

impl SupportedKinds {
    pub const fn none() -> Self {
        SupportedKinds(0)
    }

    pub fn all() -> Self {
        ProfileKind::ALL.into_iter().collect()
    }

    fn bit(kind: ProfileKind) -> u8 {
        1 << (kind as u8)
    }

    pub fn with(mut self, kind: ProfileKind) -> Self {
        self.insert(kind);
        self
    }

    pub fn without(mut self, kind: ProfileKind) -> Self {
        self.0 &= !Self::bit(kind);
        self
    }

    pub fn insert(&mut self, kind: ProfileKind) {
        self.0 |= Self::bit(kind);
    }

    pub fn contains(&self, kind: ProfileKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ProfileKind> + '_ {
        ProfileKind::ALL.into_iter().filter(|k| self.contains(*k))
    }
}

impl FromIterator<ProfileKind> for SupportedKinds {
    fn from_iter<I: IntoIterator<Item = ProfileKind>>(iter: I) -> Self {
        let mut kinds = SupportedKinds::none();
        for kind in iter {
            kinds.insert(kind);
        }
        kinds
    }
}

impl fmt::Display for SupportedKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(ProfileKind::as_str).collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(", "))
        }
    }
}
