//! Free-space admission control

use logship_common::{Availability, Error, Result};
use nix::sys::statvfs::statvfs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Usable free bytes on the volume holding `path`
///
/// A path that does not exist yet is measured at its nearest existing
/// ancestor.
pub fn usable_bytes(path: &Path) -> Result<u64> {
    let mut existing = path;
    while !existing.exists() {
        existing = match existing.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            None => {
                return Err(Error::internal(format!(
                    "no existing ancestor of {}",
                    path.display()
                )));
            }
        };
    }
    let stat = statvfs(existing).map_err(|e| Error::Io(e.into()))?;
    #[allow(clippy::unnecessary_cast, clippy::useless_conversion)]
    let bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
    Ok(bytes)
}

/// Compares the target volume's free space with a configured minimum
#[derive(Debug)]
pub struct FreeSpaceMonitor {
    root: PathBuf,
    min_free_bytes: u64,
    failed: AtomicBool,
}

impl FreeSpaceMonitor {
    pub fn new(root: impl Into<PathBuf>, min_free_bytes: u64) -> Self {
        Self {
            root: root.into(),
            min_free_bytes,
            failed: AtomicBool::new(false),
        }
    }

    /// Current availability of the disk backend
    ///
    /// Reports `Failed` while usable space is below the minimum or cannot
    /// be measured. Transitions are logged once.
    pub fn availability_report(&self) -> Availability {
        let usable = match usable_bytes(&self.root) {
            Ok(bytes) => bytes,
            Err(e) => {
                if !self.failed.swap(true, Ordering::SeqCst) {
                    error!("Cannot measure free space of {}: {}", self.root.display(), e);
                }
                return Availability::Failed;
            }
        };

        if usable < self.min_free_bytes {
            if !self.failed.swap(true, Ordering::SeqCst) {
                error!(
                    "Free space on {} is {} bytes, below the minimum of {} bytes; rejecting writes",
                    self.root.display(),
                    usable,
                    self.min_free_bytes
                );
            }
            Availability::Failed
        } else {
            if self.failed.swap(false, Ordering::SeqCst) {
                info!(
                    "Free space on {} recovered to {} bytes",
                    self.root.display(),
                    usable
                );
            }
            Availability::Operational
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_usable_bytes_of_missing_subdir() {
        let dir = tempdir().unwrap();
        let existing = usable_bytes(dir.path()).unwrap();
        let missing = usable_bytes(&dir.path().join("not/yet/created")).unwrap();
        assert!(existing > 0);
        assert!(missing > 0);
    }

    #[test]
    fn test_threshold() {
        let dir = tempdir().unwrap();
        let relaxed = FreeSpaceMonitor::new(dir.path(), 0);
        assert_eq!(relaxed.availability_report(), Availability::Operational);

        let strict = FreeSpaceMonitor::new(dir.path(), u64::MAX);
        assert_eq!(strict.availability_report(), Availability::Failed);
        assert_eq!(strict.availability_report(), Availability::Failed);
    }
}
