use std::ffi::c_void;

use rustc_hash::FxHashMap;

use crate::raw::RawFrame;

/// Frames from these modules belong to the tracker itself or to the
/// allocator plumbing above it, and are cut from the top of each stack.
const INTERNAL_PREFIXES: &[&str] = &[
    "backtrace::",
    "liveprof_capture::alloc::",
    "<liveprof_capture::alloc::",
    "__rust_",
    "__rdl_",
    "__rg_",
    "alloc::alloc::",
    "std::alloc::",
    "core::alloc::",
];

fn is_internal(function: &str) -> bool {
    INTERNAL_PREFIXES.iter().any(|p| function.starts_with(p))
}

/// Resolves instruction addresses to frames, caching per address.
#[derive(Default)]
pub(crate) struct Symbolizer {
    cache: FxHashMap<usize, Vec<RawFrame>>,
}

impl Symbolizer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The frames at `addr`, innermost inlined frame first.
    fn frames_for_address(&mut self, addr: usize) -> &[RawFrame] {
        self.cache.entry(addr).or_insert_with(|| {
            let mut frames = Vec::new();
            backtrace::resolve(addr as *mut c_void, |symbol| {
                let function = match symbol.name() {
                    Some(name) => format!("{name:#}"),
                    None => format!("{addr:#x}"),
                };
                frames.push(RawFrame {
                    function,
                    file: symbol.filename().map(|p| p.display().to_string()),
                    line: symbol.lineno().unwrap_or(0),
                    address: addr as u64,
                });
            });
            if frames.is_empty() {
                let mut frame = RawFrame::new(format!("{addr:#x}"));
                frame.address = addr as u64;
                frames.push(frame);
            }
            frames
        })
    }

    /// Symbolicates a stack of return addresses (innermost first) into
    /// frames, leaf first, without the tracker's own frames on top.
    pub(crate) fn stack(&mut self, addrs: &[usize]) -> Vec<RawFrame> {
        let mut stack = Vec::with_capacity(addrs.len());
        for addr in addrs {
            stack.extend(self.frames_for_address(*addr).iter().cloned());
        }
        let first_user_frame = stack
            .iter()
            .position(|f| !is_internal(&f.function))
            .unwrap_or(stack.len());
        stack.drain(..first_user_frame);
        stack
    }
}
