//! Request parameters.
//!
//! Parameters arrive as strings, either in the query string of the
//! path-based routes or as JSON values in a `debug_engine` body. They are
//! collected into [`Params`] first and parsed into the typed records below
//! with defaults substituted for missing keys.

use std::collections::BTreeMap;
use std::time::Duration;

use liveprof_capture::{ProfileKind, SampleClock, SamplerConfig};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("Invalid value {value:?} for parameter `{name}`: {reason}. Example: {example}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
        example: &'static str,
    },

    #[error("Parameter `{name}` must be a string, a number or a boolean, got {value}")]
    NotAScalar { name: String, value: String },
}

/// Describes one parameter for the usage text.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub meaning: &'static str,
    pub default: &'static str,
    pub hint: &'static str,
}

const N: ParamSpec = ParamSpec {
    name: "n",
    meaning: "Sample buffer size, in stack frames (integer >= 1).",
    default: "100000000",
    hint: "A 30 second profile at delay=0.01 of 8 busy threads with 50-frame stacks needs 30 * 100 * 8 * 50 = 1200000 frames, so n=2000000 leaves headroom.",
};

const DELAY: ParamSpec = ParamSpec {
    name: "delay",
    meaning: "Seconds between two samples (float > 0).",
    default: "0.01",
    hint: "delay=0.01 takes 100 samples per second; delay=0.001 takes 1000 per second at about ten times the overhead.",
};

const DURATION: ParamSpec = ParamSpec {
    name: "duration",
    meaning: "Seconds to sample before the profile is returned (float > 0).",
    default: "10.0",
    hint: "duration=30 covers a 30 second window; keep it below your HTTP client's timeout.",
};

const PPROF: ParamSpec = ParamSpec {
    name: "pprof",
    meaning: "Return gzipped pprof (true) or the raw samples as JSON (false).",
    default: "true",
    hint: "pprof=true produces a .pb.gz for `go tool pprof`; pprof=false produces .json.",
};

const SAMPLE_RATE: ParamSpec = ParamSpec {
    name: "sample_rate",
    meaning: "Fraction of allocations to record (float in (0, 1]).",
    default: "0.0001",
    hint: "sample_rate=0.0001 records one allocation in 10000; a service doing 1000000 allocations per second then records about 100 per second.",
};

const ALL_ONE: ParamSpec = ParamSpec {
    name: "all_one",
    meaning: "Count every object as size 1 instead of its byte size (true/false).",
    default: "false",
    hint: "all_one=true ranks call sites by object count, all_one=false by retained bytes.",
};

pub const CPU_PARAMS: &[ParamSpec] = &[N, DELAY, DURATION, PPROF];
pub const CPU_START_PARAMS: &[ParamSpec] = &[N, DELAY];
pub const CPU_STOP_PARAMS: &[ParamSpec] = &[PPROF];
pub const ALLOC_PARAMS: &[ParamSpec] = &[SAMPLE_RATE, DURATION];
pub const ALLOC_START_PARAMS: &[ParamSpec] = &[SAMPLE_RATE];
pub const HEAP_SNAPSHOT_PARAMS: &[ParamSpec] = &[ALL_ONE];

/// The parameters of a run-for-duration request of `kind`.
pub fn run_params(kind: ProfileKind) -> &'static [ParamSpec] {
    match kind {
        ProfileKind::Cpu | ProfileKind::Wall => CPU_PARAMS,
        ProfileKind::Allocations => ALLOC_PARAMS,
        ProfileKind::HeapSnapshot => HEAP_SNAPSHOT_PARAMS,
        ProfileKind::TaskBacktraces => &[],
    }
}

/// The 400 body for a request without parameters.
pub fn usage(kind: ProfileKind, path: &str) -> String {
    let specs = run_params(kind);
    let query: Vec<String> = specs
        .iter()
        .map(|spec| format!("{}=<{}>", spec.name, spec.default))
        .collect();
    let mut text = format!(
        "{} profiling needs at least one query parameter.\n\nUsage: GET {}?{}\n\nParameters (missing ones take the default):\n",
        kind.display_name(),
        path,
        query.join("&")
    );
    for spec in specs {
        text.push_str(&format!(
            "  {}: {} Default: {}.\n      {}\n",
            spec.name, spec.meaning, spec.default, spec.hint
        ));
    }
    let defaults: Vec<String> = specs
        .iter()
        .map(|spec| format!("{}={}", spec.name, spec.default))
        .collect();
    text.push_str(&format!(
        "\nExample: GET {}?{}\n",
        path,
        defaults.join("&")
    ));
    text
}

/// Raw string parameters, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `a=1&b=2`. Names and values are percent-decoded, `+` is a
    /// space, and a later duplicate overrides an earlier one.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = Params::new();
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(decode_component(name), decode_component(value));
        }
        params
    }

    /// Collects the scalar members of a JSON object, skipping `skip`.
    /// `null` members count as absent.
    pub fn from_json(
        object: &serde_json::Map<String, Value>,
        skip: &[&str],
    ) -> Result<Self, ParamError> {
        let mut params = Params::new();
        for (name, value) in object {
            if skip.contains(&name.as_str()) {
                continue;
            }
            let value = match value {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(ParamError::NotAScalar {
                        name: name.clone(),
                        value: other.to_string(),
                    })
                }
            };
            params.insert(name.clone(), value);
        }
        Ok(params)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn parse<T>(
        &self,
        spec: &ParamSpec,
        example: &'static str,
        parse: impl FnOnce(&str) -> Result<T, &'static str>,
    ) -> Result<Option<T>, ParamError> {
        match self.get(spec.name) {
            None => Ok(None),
            Some(value) => parse(value.trim()).map(Some).map_err(|reason| ParamError::Invalid {
                name: spec.name,
                value: value.to_string(),
                reason,
                example,
            }),
        }
    }
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
}

fn parse_count(s: &str) -> Result<u64, &'static str> {
    match s.parse::<u64>() {
        Ok(0) => Err("must be at least 1"),
        Ok(n) => Ok(n),
        Err(_) => Err("expected a positive integer"),
    }
}

fn parse_positive_seconds(s: &str) -> Result<f64, &'static str> {
    match s.parse::<f64>() {
        Ok(v) if !v.is_finite() => Err("expected a finite number of seconds"),
        Ok(v) if v <= 0.0 => Err("must be greater than 0"),
        // Duration::from_secs_f64 panics past u64::MAX seconds.
        Ok(v) if v > 1e12 => Err("is too large"),
        Ok(v) => Ok(v),
        Err(_) => Err("expected a number of seconds"),
    }
}

fn parse_rate(s: &str) -> Result<f64, &'static str> {
    match s.parse::<f64>() {
        Ok(v) if !v.is_finite() => Err("expected a finite number"),
        Ok(v) if v <= 0.0 || v > 1.0 => Err("must be greater than 0 and at most 1"),
        Ok(v) => Ok(v),
        Err(_) => Err("expected a number between 0 and 1"),
    }
}

fn parse_bool(s: &str) -> Result<bool, &'static str> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err("expected true or false"),
    }
}

/// Parameters of the CPU and wall-clock routes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuParams {
    pub buffer_size: u64,
    pub delay: f64,
    pub duration: f64,
    pub pprof: bool,
}

impl Default for CpuParams {
    fn default() -> Self {
        CpuParams {
            buffer_size: 100_000_000,
            delay: 0.01,
            duration: 10.0,
            pprof: true,
        }
    }
}

impl CpuParams {
    pub fn parse(params: &Params) -> Result<Self, ParamError> {
        let defaults = CpuParams::default();
        Ok(CpuParams {
            buffer_size: params
                .parse(&N, "n=1000000", parse_count)?
                .unwrap_or(defaults.buffer_size),
            delay: params
                .parse(&DELAY, "delay=0.01", parse_positive_seconds)?
                .unwrap_or(defaults.delay),
            duration: params
                .parse(&DURATION, "duration=30", parse_positive_seconds)?
                .unwrap_or(defaults.duration),
            pprof: params
                .parse(&PPROF, "pprof=true", parse_bool)?
                .unwrap_or(defaults.pprof),
        })
    }

    pub fn sampler_config(&self, clock: SampleClock) -> SamplerConfig {
        SamplerConfig::Cpu {
            buffer_size: usize::try_from(self.buffer_size).unwrap_or(usize::MAX),
            delay: Duration::from_secs_f64(self.delay),
            clock,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration)
    }

    /// The parameter part of the artifact name.
    pub fn label(&self) -> String {
        format!(
            "duration={:?}&delay={:?}&n={}",
            self.duration, self.delay, self.buffer_size
        )
    }
}

/// Parameters of the allocation routes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocParams {
    pub sample_rate: f64,
    pub duration: f64,
}

impl Default for AllocParams {
    fn default() -> Self {
        AllocParams {
            sample_rate: 0.0001,
            duration: 10.0,
        }
    }
}

impl AllocParams {
    pub fn parse(params: &Params) -> Result<Self, ParamError> {
        let defaults = AllocParams::default();
        Ok(AllocParams {
            sample_rate: params
                .parse(&SAMPLE_RATE, "sample_rate=0.001", parse_rate)?
                .unwrap_or(defaults.sample_rate),
            duration: params
                .parse(&DURATION, "duration=30", parse_positive_seconds)?
                .unwrap_or(defaults.duration),
        })
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig::Allocations {
            sample_rate: self.sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration)
    }

    pub fn label(&self) -> String {
        format!(
            "duration={:?}&sample_rate={:?}",
            self.duration, self.sample_rate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapSnapshotParams {
    pub all_one: bool,
}

impl HeapSnapshotParams {
    pub fn parse(params: &Params) -> Result<Self, ParamError> {
        Ok(HeapSnapshotParams {
            all_one: params
                .parse(&ALL_ONE, "all_one=true", parse_bool)?
                .unwrap_or(false),
        })
    }

    pub fn label(&self) -> String {
        format!("all_one={}", self.all_one)
    }
}

/// `pprof` on the CPU and wall-clock stop routes.
pub fn parse_pprof_flag(params: &Params) -> Result<bool, ParamError> {
    Ok(params
        .parse(&PPROF, "pprof=true", parse_bool)?
        .unwrap_or(true))
}
