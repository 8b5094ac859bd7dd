use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use liveprof_capture::{encode_pprof_gz, HeapSnapshotParts, ProfileKind, ProfilerCapability, RawProfile};
use uuid::Uuid;

use crate::error::SessionError;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// The result of a successful capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Inline {
        content_type: &'static str,
        filename: String,
        bytes: Vec<u8>,
    },
    /// An absolute path to a file under the stage directory.
    File(PathBuf),
}

/// Where the artifact should end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Inline,
    /// An existing directory.
    Stage(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFormat {
    /// Gzipped pprof protobuf.
    Pprof,
    /// [`RawProfile`] as JSON.
    Raw,
}

impl ProfileFormat {
    pub fn from_pprof_flag(pprof: bool) -> Self {
        if pprof {
            ProfileFormat::Pprof
        } else {
            ProfileFormat::Raw
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ProfileFormat::Pprof => "pb.gz",
            ProfileFormat::Raw => "json",
        }
    }
}

/// The prefix shared by every artifact of a kind.
pub fn artifact_prefix(kind: ProfileKind) -> &'static str {
    match kind {
        ProfileKind::Cpu => "cpu_profile",
        ProfileKind::Wall => "wall_profile",
        ProfileKind::Allocations => "allocs_profile",
        ProfileKind::HeapSnapshot => "heap_snapshot",
        ProfileKind::TaskBacktraces => "task_backtraces",
    }
}

/// `<stem>.<extension>`, where the stem is the kind's prefix optionally
/// followed by `-<parameters>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    stem: String,
    extension: &'static str,
}

impl ArtifactName {
    pub fn new(kind: ProfileKind, label: Option<&str>, extension: &'static str) -> Self {
        let stem = match label {
            Some(label) => format!("{}-{}", artifact_prefix(kind), label),
            None => artifact_prefix(kind).to_string(),
        };
        ArtifactName { stem, extension }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.stem, self.extension)
    }

    /// The name with a fresh v4 UUID appended to the stem, so concurrent
    /// writes into the same directory never collide.
    pub fn unique_file_name(&self) -> String {
        format!("{}-{}.{}", self.stem, Uuid::new_v4(), self.extension)
    }
}

/// Turns captures into [`Artifact`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactWriter;

impl ArtifactWriter {
    pub fn encode(&self, profile: &RawProfile, format: ProfileFormat) -> Result<Vec<u8>, SessionError> {
        Ok(match format {
            ProfileFormat::Pprof => encode_pprof_gz(profile)?,
            ProfileFormat::Raw => profile.to_json()?,
        })
    }

    pub fn to_inline(
        &self,
        profile: &RawProfile,
        format: ProfileFormat,
        name: &ArtifactName,
    ) -> Result<Artifact, SessionError> {
        Ok(Artifact::Inline {
            content_type: OCTET_STREAM,
            filename: name.file_name(),
            bytes: self.encode(profile, format)?,
        })
    }

    pub fn to_file(
        &self,
        profile: &RawProfile,
        format: ProfileFormat,
        name: &ArtifactName,
        dir: &Path,
    ) -> Result<Artifact, SessionError> {
        let bytes = self.encode(profile, format)?;
        let path = absolute(dir)?.join(name.unique_file_name());
        fs::write(&path, &bytes)
            .map_err(SessionError::filesystem(format!("Could not write {}", path.display())))?;
        log::info!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(Artifact::File(path))
    }

    pub fn write_profile(
        &self,
        profile: &RawProfile,
        format: ProfileFormat,
        name: &ArtifactName,
        destination: &Destination,
    ) -> Result<Artifact, SessionError> {
        match destination {
            Destination::Inline => self.to_inline(profile, format, name),
            Destination::Stage(dir) => self.to_file(profile, format, name, dir),
        }
    }

    /// Takes a heap snapshot and combines its parts into one `.heapsnapshot`
    /// document. The parts are removed afterwards.
    pub fn write_heap_snapshot(
        &self,
        capability: &dyn ProfilerCapability,
        collapse_object_sizes: bool,
        name: &ArtifactName,
        destination: &Destination,
    ) -> Result<Artifact, SessionError> {
        let parts_dir = match destination {
            Destination::Inline => tempfile::tempdir(),
            Destination::Stage(dir) => tempfile::tempdir_in(dir),
        }
        .map_err(SessionError::filesystem("Could not create a directory for the snapshot parts"))?;
        let parts = capability.take_heap_snapshot(parts_dir.path(), collapse_object_sizes)?;

        let artifact = match destination {
            Destination::Inline => {
                let mut bytes = Vec::new();
                assemble_heap_snapshot(&parts, &mut bytes)?;
                Artifact::Inline {
                    content_type: OCTET_STREAM,
                    filename: name.file_name(),
                    bytes,
                }
            }
            Destination::Stage(dir) => {
                let path = absolute(dir)?.join(name.unique_file_name());
                let file = File::create(&path)
                    .map_err(SessionError::filesystem(format!("Could not create {}", path.display())))?;
                let mut writer = BufWriter::new(file);
                assemble_heap_snapshot(&parts, &mut writer)?;
                writer
                    .flush()
                    .map_err(SessionError::filesystem(format!("Could not write {}", path.display())))?;
                log::info!("Wrote heap snapshot to {}", path.display());
                Artifact::File(path)
            }
        };

        for part in parts.paths() {
            if let Err(e) = fs::remove_file(part) {
                log::warn!("Could not remove snapshot part {}: {}", part.display(), e);
            }
        }
        Ok(artifact)
    }

    pub fn write_task_backtraces(
        &self,
        capability: &dyn ProfilerCapability,
        name: &ArtifactName,
        destination: &Destination,
    ) -> Result<Artifact, SessionError> {
        match destination {
            Destination::Inline => {
                let dir = tempfile::tempdir()
                    .map_err(SessionError::filesystem("Could not create a temporary directory"))?;
                let path = dir.path().join(name.file_name());
                capability.capture_task_backtraces(&path)?;
                let bytes = fs::read(&path)
                    .map_err(SessionError::filesystem(format!("Could not read {}", path.display())))?;
                Ok(Artifact::Inline {
                    content_type: OCTET_STREAM,
                    filename: name.file_name(),
                    bytes,
                })
            }
            Destination::Stage(dir) => {
                let path = absolute(dir)?.join(name.unique_file_name());
                capability.capture_task_backtraces(&path)?;
                log::info!("Wrote task backtraces to {}", path.display());
                Ok(Artifact::File(path))
            }
        }
    }
}

fn absolute(dir: &Path) -> Result<PathBuf, SessionError> {
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    std::path::absolute(dir)
        .map_err(SessionError::filesystem(format!("Could not resolve {}", dir.display())))
}

fn copy_part(path: &Path, out: &mut impl Write) -> Result<(), SessionError> {
    let context = || format!("Could not copy snapshot part {}", path.display());
    let mut file = File::open(path).map_err(SessionError::filesystem(context()))?;
    io::copy(&mut file, out).map_err(SessionError::filesystem(context()))?;
    Ok(())
}

/// Streams the parts into `{"snapshot":…,"nodes":[…],"edges":[…],"strings":[…]}`.
pub fn assemble_heap_snapshot(
    parts: &HeapSnapshotParts,
    out: &mut impl Write,
) -> Result<(), SessionError> {
    write_str(out, "{\"snapshot\":")?;
    copy_part(&parts.metadata, out)?;
    write_str(out, ",\n\"nodes\":[")?;
    copy_part(&parts.nodes, out)?;
    write_str(out, "],\n\"edges\":[")?;
    copy_part(&parts.edges, out)?;
    write_str(out, "],\n\"strings\":[")?;
    copy_part(&parts.strings, out)?;
    write_str(out, "]}\n")
}

fn write_str(out: &mut impl Write, s: &str) -> Result<(), SessionError> {
    out.write_all(s.as_bytes())
        .map_err(SessionError::filesystem("Could not write the heap snapshot"))
}
