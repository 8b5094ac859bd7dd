use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;

use crate::error::SessionError;
use crate::params::ParamError;

/// The directory under which `debug_engine` writes its artifacts.
#[derive(Debug)]
pub struct StageRoot {
    path: PathBuf,
    // Removes the directory on drop when we created it ourselves.
    _temp: Option<TempDir>,
}

impl StageRoot {
    /// Uses `dir`, creating it if needed, or a fresh temporary directory.
    pub fn new(dir: Option<&Path>) -> io::Result<Self> {
        match dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(StageRoot {
                    path: dir.canonicalize()?,
                    _temp: None,
                })
            }
            None => {
                let temp = tempfile::Builder::new().prefix("liveprof-stage-").tempdir()?;
                Ok(StageRoot {
                    path: temp.path().canonicalize()?,
                    _temp: Some(temp),
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory for a request with the given `subdir` query parameter.
    /// The subdirectory must already exist; it is never created here.
    pub fn resolve(&self, subdir: Option<&str>) -> Result<PathBuf, SessionError> {
        let Some(subdir) = subdir.filter(|s| !s.is_empty()) else {
            return Ok(self.path.clone());
        };
        let relative = Path::new(subdir);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ParamError::Invalid {
                name: "subdir",
                value: subdir.to_string(),
                reason: "must be a relative path inside the stage directory, without `..`",
                example: "subdir=incident-1234",
            }
            .into());
        }
        let dir = self.path.join(relative);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(SessionError::MissingSubdirectory(subdir.to_string()))
        }
    }
}
