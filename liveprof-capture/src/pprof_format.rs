use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use rustc_hash::FxHashMap;

use crate::error::{CaptureError, Result};
use crate::proto;
use crate::raw::{RawProfile, ValueType};

// Encoding runs on the worker pool while the request waits, so keep it
// cheap. The string table and repeated location ids compress well even
// at a low level.
const GZIP_COMPRESSION_LEVEL: u32 = 2;

#[derive(Debug, Default)]
struct StringTable {
    strings: Vec<String>,
    index: FxHashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = StringTable::default();
        // pprof requires string_table[0] == "".
        table.index_for_string("");
        table
    }

    fn index_for_string(&mut self, s: &str) -> i64 {
        match self.index.get(s) {
            Some(index) => *index,
            None => {
                let index = self.strings.len() as i64;
                self.strings.push(s.to_string());
                self.index.insert(s.to_string(), index);
                index
            }
        }
    }

    fn value_type(&mut self, value_type: &ValueType) -> proto::ValueType {
        proto::ValueType {
            r#type: self.index_for_string(&value_type.ty),
            unit: self.index_for_string(&value_type.unit),
        }
    }

    fn into_strings(self) -> Vec<String> {
        self.strings
    }
}

/// Converts the raw samples into a pprof `Profile` message.
pub fn to_pprof(raw: &RawProfile) -> proto::Profile {
    let mut strings = StringTable::new();
    let sample_type = raw
        .sample_types
        .iter()
        .map(|vt| strings.value_type(vt))
        .collect();
    let period_type = Some(strings.value_type(&raw.period_type));

    let mut functions: Vec<proto::Function> = Vec::new();
    let mut function_ids: FxHashMap<(i64, i64), u64> = FxHashMap::default();
    let mut locations = Vec::with_capacity(raw.frames.len());
    for (frame_index, frame) in raw.frames.iter().enumerate() {
        let name = strings.index_for_string(&frame.function);
        let filename = strings.index_for_string(frame.file.as_deref().unwrap_or(""));
        let function_id = *function_ids.entry((name, filename)).or_insert_with(|| {
            let id = functions.len() as u64 + 1;
            functions.push(proto::Function {
                id,
                name,
                system_name: name,
                filename,
                start_line: 0,
            });
            id
        });
        locations.push(proto::Location {
            id: frame_index as u64 + 1,
            mapping_id: 0,
            address: frame.address,
            line: vec![proto::Line {
                function_id,
                line: i64::from(frame.line),
            }],
            is_folded: false,
        });
    }

    let thread_name_key = strings.index_for_string("thread");
    let sample = raw
        .samples
        .iter()
        .map(|s| proto::Sample {
            location_id: s.stack.iter().map(|i| u64::from(*i) + 1).collect(),
            value: s.values.clone(),
            label: s
                .thread
                .as_deref()
                .map(|thread| proto::Label {
                    key: thread_name_key,
                    str: strings.index_for_string(thread),
                    num: 0,
                    num_unit: 0,
                })
                .into_iter()
                .collect(),
        })
        .collect();

    let mut comment = Vec::new();
    if raw.dropped_samples != 0 {
        let text = format!(
            "{} samples were dropped because the sample buffer was full",
            raw.dropped_samples
        );
        comment.push(strings.index_for_string(&text));
    }

    proto::Profile {
        sample_type,
        sample,
        mapping: Vec::new(),
        location: locations,
        function: functions,
        string_table: strings.into_strings(),
        drop_frames: 0,
        keep_frames: 0,
        time_nanos: raw.start_time_nanos,
        duration_nanos: raw.duration_nanos,
        period_type,
        period: raw.period,
        comment,
        default_sample_type: 0,
    }
}

/// Encodes the samples as a gzip-compressed pprof protobuf (`.pb.gz`).
pub fn encode_pprof_gz(raw: &RawProfile) -> Result<Vec<u8>> {
    let profile = to_pprof(raw);
    let mut buf = Vec::with_capacity(profile.encoded_len());
    profile.encode(&mut buf).map_err(CaptureError::PprofEncode)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::new(GZIP_COMPRESSION_LEVEL));
    gz.write_all(&buf).map_err(CaptureError::Gzip)?;
    gz.finish().map_err(CaptureError::Gzip)
}

/// The inverse of [`encode_pprof_gz`].
pub fn decode_pprof_gz(bytes: &[u8]) -> Result<proto::Profile> {
    let mut decoded = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .map_err(CaptureError::Gzip)?;
    proto::Profile::decode(decoded.as_slice()).map_err(CaptureError::PprofDecode)
}
