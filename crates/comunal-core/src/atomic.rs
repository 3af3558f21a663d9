//! Atomic file replacement shared by the document store, snapshot restore
//! and the audit log.
//!
//! A write is staged into a temp file next to the destination (same
//! filesystem), flushed and fsynced, and only then renamed over the
//! destination. Dropping an uncommitted [`StagedWrite`] removes the temp file
//! and leaves the destination untouched.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub const BACKUP_SUFFIX: &str = "backup";
pub const OLD_SUFFIX: &str = "old";
pub const PREVIOUS_SUFFIX: &str = "anterior";

/// `dir/name` → `dir/name.<suffix>`.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[derive(Debug)]
pub struct StagedWrite {
    dest: PathBuf,
    temp: PathBuf,
    committed: bool,
}

/// Write `bytes` to a fresh temp file beside `dest`, fsynced before close.
pub fn stage(dest: &Path, bytes: &[u8]) -> io::Result<StagedWrite> {
    let dir = parent_dir(dest);
    fs::create_dir_all(&dir)?;
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?;
    let temp = dir.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));
    let staged = StagedWrite {
        dest: dest.to_path_buf(),
        temp,
        committed: false,
    };
    {
        let mut file = File::create(&staged.temp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    Ok(staged)
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn destination(&self) -> &Path {
        &self.dest
    }

    /// Move the staged bytes onto the destination.
    pub fn commit(mut self) -> io::Result<()> {
        self.replace_destination()?;
        self.committed = true;
        if let Err(e) = fsync_dir(&parent_dir(&self.dest)) {
            debug!(path = %self.dest.display(), "directory fsync skipped: {e}");
        }
        let old = sibling(&self.dest, OLD_SUFFIX);
        if old.exists() {
            if let Err(e) = fs::remove_file(&old) {
                warn!(path = %old.display(), "cannot remove stale copy: {e}");
            }
        }
        Ok(())
    }

    #[cfg(not(windows))]
    fn replace_destination(&self) -> io::Result<()> {
        // rename(2) swaps the directory entry in one step.
        fs::rename(&self.temp, &self.dest)
    }

    #[cfg(windows)]
    fn replace_destination(&self) -> io::Result<()> {
        let old = sibling(&self.dest, OLD_SUFFIX);
        let mut moved_aside = false;
        let mut deleted = false;
        if self.dest.exists() {
            match fs::remove_file(&self.dest) {
                Ok(()) => deleted = true,
                Err(e) => {
                    debug!(path = %self.dest.display(), "delete failed, moving aside: {e}");
                    fs::rename(&self.dest, &old)?;
                    moved_aside = true;
                }
            }
        }
        if let Err(e) = fs::rename(&self.temp, &self.dest) {
            if moved_aside {
                let _ = fs::rename(&old, &self.dest);
            } else if deleted {
                let backup = sibling(&self.dest, BACKUP_SUFFIX);
                if backup.exists() {
                    let _ = fs::copy(&backup, &self.dest);
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed && self.temp.exists() {
            if let Err(e) = fs::remove_file(&self.temp) {
                warn!(path = %self.temp.display(), "cannot remove temp file: {e}");
            }
        }
    }
}

pub fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    stage(dest, bytes)?.commit()
}

/// Best-effort copy of `path` to `path.<suffix>`. Never fails the caller.
pub fn copy_aside(path: &Path, suffix: &str) -> Option<PathBuf> {
    if !path.exists() {
        return None;
    }
    let target = sibling(path, suffix);
    match fs::copy(path, &target) {
        Ok(_) => Some(target),
        Err(e) => {
            warn!(path = %path.display(), "safety copy failed: {e}");
            None
        }
    }
}

/// Best-effort OS-level hide. Only Windows has a hidden attribute.
pub fn hide(path: &Path) {
    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{
            GetFileAttributesW, SetFileAttributesW, FILE_ATTRIBUTE_HIDDEN,
            INVALID_FILE_ATTRIBUTES,
        };
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        // SAFETY: `wide` is a NUL-terminated UTF-16 path that outlives both calls.
        unsafe {
            let attrs = GetFileAttributesW(wide.as_ptr());
            if attrs != INVALID_FILE_ATTRIBUTES
                && SetFileAttributesW(wide.as_ptr(), attrs | FILE_ATTRIBUTE_HIDDEN) == 0
            {
                debug!(path = %path.display(), "cannot set hidden attribute");
            }
        }
    }
    #[cfg(not(windows))]
    {
        let _ = path;
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn fsync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = fs::OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sibling_appends_suffix() {
        let p = Path::new("/data/habitantes.dat");
        assert_eq!(
            sibling(p, BACKUP_SUFFIX),
            PathBuf::from("/data/habitantes.dat.backup")
        );
    }

    #[test]
    fn commit_replaces_destination() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("doc.dat");
        fs::write(&dest, b"old").unwrap();
        write_atomic(&dest, b"new").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn uncommitted_stage_leaves_destination_untouched() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("doc.dat");
        fs::write(&dest, b"before").unwrap();
        let staged = stage(&dest, b"after").unwrap();
        let temp = staged.temp_path().to_path_buf();
        assert!(temp.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"before");
        drop(staged);
        assert!(!temp.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"before");
    }

    #[test]
    fn copy_aside_skips_missing_files() {
        let dir = tempdir().unwrap();
        assert!(copy_aside(&dir.path().join("missing"), BACKUP_SUFFIX).is_none());
        let file = dir.path().join("doc.dat");
        fs::write(&file, b"x").unwrap();
        let copy = copy_aside(&file, PREVIOUS_SUFFIX).unwrap();
        assert_eq!(fs::read(copy).unwrap(), b"x");
    }
}
