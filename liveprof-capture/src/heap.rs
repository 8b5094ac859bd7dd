//! Heap snapshots in the layout of V8's `.heapsnapshot` files.
//!
//! The graph is an allocation call tree: a synthetic root, one `code` node
//! per distinct call path, and one `native` node per live allocation hanging
//! off the node of the function that made it. Node and edge records are
//! flattened into integer arrays described by the `meta` object, and all
//! names are indexes into the string table.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rustc_hash::FxHashMap;
use serde_json::json;

use crate::capability::HeapSnapshotParts;
use crate::error::{CaptureError, Result};
use crate::raw::RawFrame;

const NODE_FIELDS: [&str; 5] = ["type", "name", "id", "self_size", "edge_count"];
const EDGE_FIELDS: [&str; 3] = ["type", "name_or_index", "to_node"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeType {
    Synthetic = 0,
    Code = 1,
    Native = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeType {
    Element = 0,
    Property = 1,
}

#[derive(Debug)]
struct Node {
    ty: NodeType,
    name: usize,
    self_size: u64,
    edges: Vec<Edge>,
}

#[derive(Debug)]
struct Edge {
    ty: EdgeType,
    name_or_index: usize,
    to: usize,
}

/// Builds the allocation graph and writes it out as [`HeapSnapshotParts`].
#[derive(Debug)]
pub struct HeapSnapshotBuilder {
    collapse_object_sizes: bool,
    nodes: Vec<Node>,
    strings: Vec<String>,
    string_index: FxHashMap<String, usize>,
    children: FxHashMap<(usize, usize), usize>,
    allocation_count: u64,
    sample_interval: u64,
}

impl HeapSnapshotBuilder {
    pub fn new(collapse_object_sizes: bool) -> Self {
        let mut builder = HeapSnapshotBuilder {
            collapse_object_sizes,
            nodes: Vec::new(),
            strings: Vec::new(),
            string_index: FxHashMap::default(),
            children: FxHashMap::default(),
            allocation_count: 0,
            sample_interval: 1,
        };
        let root_name = builder.intern("(root)");
        builder.nodes.push(Node {
            ty: NodeType::Synthetic,
            name: root_name,
            self_size: 0,
            edges: Vec::new(),
        });
        builder
    }

    /// Each added allocation stands for `interval` live allocations, so
    /// its `self_size` is scaled by `interval` unless sizes are collapsed.
    pub fn sample_interval(mut self, interval: u64) -> Self {
        self.sample_interval = interval.max(1);
        self
    }

    fn intern(&mut self, s: &str) -> usize {
        if let Some(index) = self.string_index.get(s) {
            return *index;
        }
        let index = self.strings.len();
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), index);
        index
    }

    fn push_node(&mut self, parent: usize, ty: NodeType, name: usize, self_size: u64) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            ty,
            name,
            self_size,
            edges: Vec::new(),
        });
        let parent_node = &mut self.nodes[parent];
        let edge = match ty {
            NodeType::Native => Edge {
                ty: EdgeType::Element,
                name_or_index: parent_node.edges.len(),
                to: index,
            },
            _ => Edge {
                ty: EdgeType::Property,
                name_or_index: name,
                to: index,
            },
        };
        parent_node.edges.push(edge);
        index
    }

    /// Adds one live allocation of `size` bytes made at `stack` (leaf first).
    pub fn add_allocation(&mut self, stack: &[RawFrame], size: u64) {
        let mut parent = 0;
        for frame in stack.iter().rev() {
            let name = self.intern(&frame.function);
            parent = match self.children.get(&(parent, name)) {
                Some(child) => *child,
                None => {
                    let child = self.push_node(parent, NodeType::Code, name, 0);
                    self.children.insert((parent, name), child);
                    child
                }
            };
        }
        let label = match stack.first() {
            Some(frame) => format!("{} ({} bytes)", frame.function, size),
            None => format!("(unknown) ({size} bytes)"),
        };
        let name = self.intern(&label);
        let self_size = if self.collapse_object_sizes {
            1
        } else {
            size.saturating_mul(self.sample_interval)
        };
        self.push_node(parent, NodeType::Native, name, self_size);
        self.allocation_count += 1;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.edges.len()).sum()
    }

    pub fn allocation_count(&self) -> u64 {
        self.allocation_count
    }

    fn metadata(&self) -> serde_json::Value {
        json!({
            "meta": {
                "node_fields": NODE_FIELDS,
                "node_types": [["synthetic", "code", "native"], "string", "number", "number", "number"],
                "edge_fields": EDGE_FIELDS,
                "edge_types": [["element", "property"], "string_or_number", "node"],
            },
            "node_count": self.node_count(),
            "edge_count": self.edge_count(),
            "tracked_allocations": self.allocation_count,
            "collapsed_object_sizes": self.collapse_object_sizes,
            "sample_interval": self.sample_interval,
        })
    }

    /// Writes the four parts into `dir`, named after `stem`.
    pub fn write_parts(&self, dir: &Path, stem: &str) -> Result<HeapSnapshotParts> {
        let parts = HeapSnapshotParts::in_dir(dir, stem);

        write_file(&parts.metadata, |w| {
            serde_json::to_writer(&mut *w, &self.metadata())
                .map_err(|e| CaptureError::Serialization("heap snapshot metadata", e))
        })?;

        write_file(&parts.nodes, |w| {
            for (index, node) in self.nodes.iter().enumerate() {
                let sep = if index == 0 { "" } else { ",\n" };
                write!(
                    w,
                    "{sep}{},{},{},{},{}",
                    node.ty as u8,
                    node.name,
                    // V8 gives every node an odd id; tools rely on it.
                    index * 2 + 1,
                    node.self_size,
                    node.edges.len()
                )
                .map_err(|e| CaptureError::Io(parts.nodes.clone(), e))?;
            }
            Ok(())
        })?;

        write_file(&parts.edges, |w| {
            let mut first = true;
            for edge in self.nodes.iter().flat_map(|n| &n.edges) {
                let sep = if first { "" } else { ",\n" };
                first = false;
                write!(
                    w,
                    "{sep}{},{},{}",
                    edge.ty as u8,
                    edge.name_or_index,
                    edge.to * NODE_FIELDS.len()
                )
                .map_err(|e| CaptureError::Io(parts.edges.clone(), e))?;
            }
            Ok(())
        })?;

        write_file(&parts.strings, |w| {
            for (index, s) in self.strings.iter().enumerate() {
                if index != 0 {
                    w.write_all(b",\n")
                        .map_err(|e| CaptureError::Io(parts.strings.clone(), e))?;
                }
                serde_json::to_writer(&mut *w, s)
                    .map_err(|e| CaptureError::Serialization("heap snapshot strings", e))?;
            }
            Ok(())
        })?;

        Ok(parts)
    }
}

fn write_file(
    path: &Path,
    body: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
) -> Result<()> {
    let file = File::create(path).map_err(CaptureError::io(path))?;
    let mut writer = BufWriter::new(file);
    body(&mut writer)?;
    writer.flush().map_err(CaptureError::io(path))
}
