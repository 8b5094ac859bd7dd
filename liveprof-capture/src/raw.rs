use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::kind::Sampler;

/// A `(type, unit)` pair, for example `("samples", "count")` or
/// `("alloc_space", "bytes")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueType {
    #[serde(rename = "type")]
    pub ty: String,
    pub unit: String,
}

impl ValueType {
    pub fn new(ty: &str, unit: &str) -> Self {
        ValueType {
            ty: ty.to_string(),
            unit: unit.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub address: u64,
}

impl RawFrame {
    pub fn new(function: impl Into<String>) -> Self {
        RawFrame {
            function: function.into(),
            file: None,
            line: 0,
            address: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSample {
    /// Indexes into [`RawProfile::frames`], leaf first.
    pub stack: Vec<u32>,
    /// One value per entry in [`RawProfile::sample_types`].
    pub values: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

/// Samples as a sampler buffered them, before any portable encoding.
///
/// This is the native interchange form: it is what gets serialized (as
/// JSON) when a client asks for the raw format instead of pprof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProfile {
    pub sampler: Sampler,
    pub sample_types: Vec<ValueType>,
    pub period_type: ValueType,
    pub period: i64,
    pub start_time_nanos: i64,
    pub duration_nanos: i64,
    pub frames: Vec<RawFrame>,
    pub samples: Vec<RawSample>,
    #[serde(default)]
    pub dropped_samples: u64,
}

impl RawProfile {
    /// A profile without samples, shaped like the ones `sampler` produces.
    pub fn empty(sampler: Sampler) -> Self {
        RawProfileBuilder::for_sampler(sampler, 0).build()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }


    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CaptureError::Serialization("raw profile", e))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CaptureError::Serialization("raw profile", e))
    }
}

/// Accumulates samples into a [`RawProfile`], interning frames and
/// enforcing a limit on the number of retained stack frames.
pub struct RawProfileBuilder {
    profile: RawProfile,
    frame_index: FxHashMap<RawFrame, u32>,
    /// 0 means unlimited.
    frame_capacity: usize,
    frames_used: usize,
    started_at: Option<SystemTime>,
}

impl RawProfileBuilder {
    pub fn new(
        sampler: Sampler,
        sample_types: Vec<ValueType>,
        period_type: ValueType,
        period: i64,
    ) -> Self {
        RawProfileBuilder {
            profile: RawProfile {
                sampler,
                sample_types,
                period_type,
                period,
                start_time_nanos: 0,
                duration_nanos: 0,
                frames: Vec::new(),
                samples: Vec::new(),
                dropped_samples: 0,
            },
            frame_index: FxHashMap::default(),
            frame_capacity: 0,
            frames_used: 0,
            started_at: None,
        }
    }

    /// The sample layout used by the builtin samplers.
    pub fn for_sampler(sampler: Sampler, period: i64) -> Self {
        match sampler {
            Sampler::Cpu => RawProfileBuilder::new(
                sampler,
                vec![
                    ValueType::new("samples", "count"),
                    ValueType::new("cpu", "nanoseconds"),
                ],
                ValueType::new("cpu", "nanoseconds"),
                period,
            ),
            Sampler::Allocations => RawProfileBuilder::new(
                sampler,
                vec![
                    ValueType::new("alloc_objects", "count"),
                    ValueType::new("alloc_space", "bytes"),
                ],
                ValueType::new("space", "bytes"),
                period,
            ),
        }
    }

    pub fn frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity;
        self
    }

    pub fn time_range(mut self, start: SystemTime, duration: Duration) -> Self {
        self.started_at = Some(start);
        self.profile.duration_nanos = duration.as_nanos().min(i64::MAX as u128) as i64;
        self
    }

    pub fn intern_frame(&mut self, frame: RawFrame) -> u32 {
        if let Some(index) = self.frame_index.get(&frame) {
            return *index;
        }
        let index = self.profile.frames.len() as u32;
        self.profile.frames.push(frame.clone());
        self.frame_index.insert(frame, index);
        index
    }

    /// Adds a sample whose stack is given leaf first. Returns `false` if the
    /// frame buffer is full and the sample was dropped.
    pub fn add_sample(
        &mut self,
        stack: impl IntoIterator<Item = RawFrame>,
        values: Vec<i64>,
        thread: Option<String>,
    ) -> bool {
        let stack: Vec<RawFrame> = stack.into_iter().collect();
        if self.frame_capacity != 0 && self.frames_used + stack.len() > self.frame_capacity {
            self.profile.dropped_samples += 1;
            return false;
        }
        self.frames_used += stack.len();
        let stack = stack.into_iter().map(|f| self.intern_frame(f)).collect();
        self.profile.samples.push(RawSample {
            stack,
            values,
            thread,
        });
        true
    }

    pub fn dropped_samples(&self) -> u64 {
        self.profile.dropped_samples
    }

    pub fn build(mut self) -> RawProfile {
        let start = self.started_at.unwrap_or_else(SystemTime::now);
        self.profile.start_time_nanos = start
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
            .unwrap_or(0);
        self.profile
    }
}
