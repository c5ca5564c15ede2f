//! Durable processed-fault set. The file store writes through a `.tmp` +
//! fsync + rename sequence while holding an exclusive lock on a sibling
//! lock file, so concurrent writers cannot interleave the read-merge-write.

use std::collections::HashSet;
use std::fs::{
    File,
    OpenOptions,
};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{
    Path,
    PathBuf,
};

use serde::{
    Deserialize,
    Serialize,
};
use tracing::{
    info,
    warn,
};

use crate::error::ControllerError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct FaultsFile {
    processed_switch_faults: Vec<String>,
}

/// Storage seam for the processed-fault set; an etcd-backed implementation
/// plugs in here when leader election is active.
pub trait FaultStore: Send + Sync {
    fn load(&self) -> Result<Vec<String>, ControllerError>;
    fn append(&self, new_faults: &[String]) -> Result<(), ControllerError>;
}

struct FileLockGuard {
    file: File,
}

impl FileLockGuard {
    fn acquire(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { file })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

pub struct FileFaultStore {
    path: PathBuf,
    strict_mode: bool,
}

impl FileFaultStore {
    pub fn new(path: impl Into<PathBuf>, strict_mode: bool) -> Self {
        Self {
            path: path.into(),
            strict_mode,
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path.as_os_str().to_owned();
        path.push(".lock");
        PathBuf::from(path)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut path = self.path.as_os_str().to_owned();
        path.push(".tmp");
        PathBuf::from(path)
    }

    fn file_mode(&self) -> u32 {
        if self.strict_mode {
            0o640
        } else {
            0o777
        }
    }

    fn read_current(&self) -> FaultsFile {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e,
                    "faults file unreadable, starting over");
                FaultsFile::default()
            }),
            Err(_) => FaultsFile::default(),
        }
    }
}

impl FaultStore for FileFaultStore {
    /// Duplicates on disk are tolerated; the in-memory set dedups.
    fn load(&self) -> Result<Vec<String>, ControllerError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ControllerError::Persist(e)),
        };
        let parsed: FaultsFile = serde_json::from_str(&raw)?;
        let mut seen = HashSet::new();
        let mut faults = Vec::new();
        for fault in parsed.processed_switch_faults {
            if seen.insert(fault.clone()) {
                faults.push(fault);
            }
        }
        info!(count = faults.len(), "loaded processed switch faults");
        Ok(faults)
    }

    fn append(&self, new_faults: &[String]) -> Result<(), ControllerError> {
        let _lock = FileLockGuard::acquire(&self.lock_path())?;

        let mut current = self.read_current();
        current
            .processed_switch_faults
            .extend(new_faults.iter().cloned());

        let tmp = self.tmp_path();
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(self.file_mode())
                .open(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&current)?.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        info!(
            total = current.processed_switch_faults.len(),
            "saved processed switch faults"
        );
        Ok(())
    }
}
