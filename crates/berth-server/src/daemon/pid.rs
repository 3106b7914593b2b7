use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LifecycleError;

/// The PID marker: a file holding the process ID of the running daemon.
#[derive(Debug, Clone)]
pub struct PidMarker {
    path: PathBuf,
}

impl PidMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// The recorded PID, or `None` if there is no marker.
    pub fn read(&self) -> Result<Option<i32>, LifecycleError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        content
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(Some)
            .ok_or_else(|| LifecycleError::InvalidPidMarker {
                path: self.path.clone(),
            })
    }

    pub fn write(&self, pid: u32) -> Result<(), LifecycleError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{pid}\n"))?;
        debug!(pid, path = %self.path.display(), "wrote PID marker");
        Ok(())
    }

    pub fn remove(&self) -> Result<(), LifecycleError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the marker only if it still records `pid`. Returns whether it
    /// was removed.
    ///
    /// The marker is first renamed to a name private to `pid`, so a marker
    /// written by a newer daemon in the meantime is never deleted. A foreign
    /// marker is linked back into place unless a newer one already took it.
    pub fn remove_if_owned(&self, pid: u32) -> Result<bool, LifecycleError> {
        let claimed = self.claim_path(pid);
        match std::fs::rename(&self.path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let owned = matches!(
            PidMarker::new(&claimed).read(),
            Ok(Some(recorded)) if recorded as u32 == pid
        );
        if !owned {
            match std::fs::hard_link(&claimed, &self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(path = %self.path.display(), "newer PID marker in place");
                }
                Err(e) => {
                    let _ = std::fs::rename(&claimed, &self.path);
                    return Err(e.into());
                }
            }
        }
        std::fs::remove_file(&claimed)?;
        Ok(owned)
    }

    fn claim_path(&self, pid: u32) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(format!(".{pid}.release"));
        self.path.with_file_name(name)
    }
}
