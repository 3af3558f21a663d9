//! Point-in-time snapshots of the encrypted document files.
//!
//! A snapshot is a folder `backup_DD_MM_YYYY_HHMMSS` under the backup root
//! holding raw copies of the (still encrypted) documents and a
//! `metadatos.json` descriptor. Two snapshots taken in the same second get a
//! numeric suffix (`_2`, `_3`, ...). Restoring keeps the current live bytes of
//! every overwritten document in `<file>.anterior`.

use crate::atomic::{self, PREVIOUS_SUFFIX};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SNAPSHOT_PREFIX: &str = "backup_";
pub const METADATA_FILE: &str = "metadatos.json";
const NAME_TIME_FORMAT: &str = "%d_%m_%Y_%H%M%S";

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("invalid snapshot name: {0:?}")]
    InvalidName(String),
    #[error("none of the documents exist yet")]
    NothingToBackUp,
    #[error("snapshot age must not be negative: {0} days")]
    InvalidAge(i64),
    #[error("backup io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ── Data Models ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub fecha_backup: NaiveDateTime,
    pub archivos: Vec<String>,
    pub cantidad_archivos: usize,
    #[serde(rename = "tamaño_carpeta")]
    pub tamano_carpeta: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub name: String,
    pub path: PathBuf,
    pub created_at: NaiveDateTime,
    pub files: Vec<String>,
    pub total_size: u64,
    /// `None` when `metadatos.json` is missing or unreadable.
    pub metadata: Option<SnapshotMetadata>,
    sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub snapshot: String,
    pub restored: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub safety_copies: Vec<PathBuf>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackupManager {
    data_dir: PathBuf,
    backup_root: PathBuf,
    documents: Vec<String>,
    retention: usize,
}

impl BackupManager {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        backup_root: impl Into<PathBuf>,
        documents: Vec<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup_root: backup_root.into(),
            documents,
            retention: 0,
        }
    }

    /// Keep at most `keep` snapshots after each new one; 0 disables pruning.
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.retention = keep;
        self
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Copy every existing document into a new snapshot folder.
    pub fn create_full_snapshot(&self) -> Result<SnapshotInfo, BackupError> {
        let sources: Vec<(String, PathBuf)> = self
            .documents
            .iter()
            .map(|name| (name.clone(), self.data_dir.join(name)))
            .filter(|(_, path)| path.is_file())
            .collect();
        if sources.is_empty() {
            warn!("snapshot skipped: no documents on disk");
            return Err(BackupError::NothingToBackUp);
        }

        let now = Local::now().naive_local();
        fs::create_dir_all(&self.backup_root).map_err(io_err(&self.backup_root))?;
        let (name, folder, sequence) = self.reserve_folder(now)?;

        match fill_snapshot(&folder, &sources, now) {
            Ok(metadata) => {
                atomic::hide(&folder);
                info!(
                    snapshot = %name,
                    files = metadata.cantidad_archivos,
                    bytes = metadata.tamano_carpeta,
                    "snapshot created"
                );
                if self.retention > 0 {
                    if let Err(e) = self.retain_most_recent(self.retention) {
                        warn!("retention pass failed: {e}");
                    }
                }
                Ok(SnapshotInfo {
                    name,
                    path: folder,
                    created_at: now,
                    files: metadata.archivos.clone(),
                    total_size: metadata.tamano_carpeta,
                    metadata: Some(metadata),
                    sequence,
                })
            }
            Err(e) => {
                warn!(snapshot = %name, "snapshot failed, removing partial folder: {e}");
                let _ = fs::remove_dir_all(&folder);
                Err(e)
            }
        }
    }

    /// Snapshot taken while closing; failures are logged only.
    pub fn snapshot_on_shutdown(&self) -> Option<SnapshotInfo> {
        match self.create_full_snapshot() {
            Ok(info) => Some(info),
            Err(BackupError::NothingToBackUp) => None,
            Err(e) => {
                warn!("shutdown snapshot failed: {e}");
                None
            }
        }
    }

    /// Snapshots, newest first.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, BackupError> {
        if !self.backup_root.exists() {
            return Ok(vec![]);
        }
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.backup_root).map_err(io_err(&self.backup_root))? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((created_at, sequence)) = parse_snapshot_name(&name) else {
                continue;
            };
            snapshots.push(describe(name, path, created_at, sequence));
        }
        snapshots.sort_by(|a, b| {
            (b.created_at, b.sequence).cmp(&(a.created_at, a.sequence))
        });
        Ok(snapshots)
    }

    pub fn latest_snapshot(&self) -> Result<Option<SnapshotInfo>, BackupError> {
        Ok(self.list_snapshots()?.into_iter().next())
    }

    /// Copy a snapshot's files over the live documents.
    pub fn restore_snapshot(&self, name: &str) -> Result<RestoreReport, BackupError> {
        let folder = self.snapshot_path(name)?;
        let files = snapshot_files(&folder).map_err(io_err(&folder))?;
        let mut report = RestoreReport {
            snapshot: name.to_string(),
            ..Default::default()
        };

        for file in files {
            let live = self.data_dir.join(&file);
            if live.exists() {
                match atomic::copy_aside(&live, PREVIOUS_SUFFIX) {
                    Some(copy) => report.safety_copies.push(copy),
                    None => {
                        report
                            .failed
                            .push((file, "cannot keep a copy of the live file".to_string()));
                        continue;
                    }
                }
            }
            let source = folder.join(&file);
            let result = fs::read(&source).and_then(|bytes| atomic::write_atomic(&live, &bytes));
            match result {
                Ok(()) => {
                    atomic::hide(&live);
                    report.restored.push(file);
                }
                Err(e) => {
                    warn!(snapshot = name, file = %file, "restore failed: {e}");
                    report.failed.push((file, e.to_string()));
                }
            }
        }

        if report.is_complete() {
            info!(snapshot = name, restored = report.restored.len(), "snapshot restored");
        } else {
            warn!(
                snapshot = name,
                restored = report.restored.len(),
                failed = report.failed.len(),
                "snapshot partially restored"
            );
        }
        Ok(report)
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<(), BackupError> {
        let folder = self.snapshot_path(name)?;
        fs::remove_dir_all(&folder).map_err(io_err(&folder))?;
        info!(snapshot = name, "snapshot deleted");
        Ok(())
    }

    /// Remove snapshots older than `days`. Returns the removed names.
    pub fn prune_older_than(&self, days: i64) -> Result<Vec<String>, BackupError> {
        if days < 0 {
            return Err(BackupError::InvalidAge(days));
        }
        // an age reaching past the calendar's range matches nothing
        let Some(cutoff) = ChronoDuration::try_days(days)
            .and_then(|age| Local::now().naive_local().checked_sub_signed(age))
        else {
            debug!(days, "prune cutoff out of range, nothing to remove");
            return Ok(vec![]);
        };
        let stale: Vec<String> = self
            .list_snapshots()?
            .into_iter()
            .filter(|s| s.created_at < cutoff)
            .map(|s| s.name)
            .collect();
        self.delete_all(stale)
    }

    /// Keep only the `keep` newest snapshots. Returns the removed names.
    pub fn retain_most_recent(&self, keep: usize) -> Result<Vec<String>, BackupError> {
        let stale: Vec<String> = self
            .list_snapshots()?
            .into_iter()
            .skip(keep)
            .map(|s| s.name)
            .collect();
        self.delete_all(stale)
    }

    fn delete_all(&self, names: Vec<String>) -> Result<Vec<String>, BackupError> {
        let mut removed = Vec::with_capacity(names.len());
        for name in names {
            self.delete_snapshot(&name)?;
            removed.push(name);
        }
        Ok(removed)
    }

    fn snapshot_path(&self, name: &str) -> Result<PathBuf, BackupError> {
        if parse_snapshot_name(name).is_none() || name.contains(['/', '\\']) {
            return Err(BackupError::InvalidName(name.to_string()));
        }
        let folder = self.backup_root.join(name);
        if !folder.is_dir() {
            return Err(BackupError::SnapshotNotFound(name.to_string()));
        }
        Ok(folder)
    }

    fn reserve_folder(&self, now: NaiveDateTime) -> Result<(String, PathBuf, u32), BackupError> {
        let base = format!("{SNAPSHOT_PREFIX}{}", now.format(NAME_TIME_FORMAT));
        let mut sequence = 1u32;
        loop {
            let name = if sequence == 1 {
                base.clone()
            } else {
                format!("{base}_{sequence}")
            };
            let folder = self.backup_root.join(&name);
            match fs::create_dir(&folder) {
                Ok(()) => return Ok((name, folder, sequence)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => sequence += 1,
                Err(e) => return Err(io_err(&folder)(e)),
            }
        }
    }
}

// ── helpers ─────────────────────────────────────────────────────────────────

fn fill_snapshot(
    folder: &Path,
    sources: &[(String, PathBuf)],
    now: NaiveDateTime,
) -> Result<SnapshotMetadata, BackupError> {
    let mut files = Vec::with_capacity(sources.len());
    let mut total = 0u64;
    for (name, source) in sources {
        total += fs::copy(source, folder.join(name)).map_err(io_err(source))?;
        files.push(name.clone());
    }
    let metadata = SnapshotMetadata {
        fecha_backup: now,
        cantidad_archivos: files.len(),
        archivos: files,
        tamano_carpeta: total,
    };
    let meta_path = folder.join(METADATA_FILE);
    let json = serde_json::to_vec_pretty(&metadata)?;
    fs::write(&meta_path, json).map_err(io_err(&meta_path))?;
    Ok(metadata)
}

/// `backup_19_10_2026_143000[_N]` → (timestamp, N).
pub fn parse_snapshot_name(name: &str) -> Option<(NaiveDateTime, u32)> {
    let rest = name.strip_prefix(SNAPSHOT_PREFIX)?;
    if let Ok(ts) = NaiveDateTime::parse_from_str(rest, NAME_TIME_FORMAT) {
        return Some((ts, 1));
    }
    let (stamp, suffix) = rest.rsplit_once('_')?;
    let sequence: u32 = suffix.parse().ok()?;
    let ts = NaiveDateTime::parse_from_str(stamp, NAME_TIME_FORMAT).ok()?;
    Some((ts, sequence))
}

fn snapshot_files(folder: &Path) -> io::Result<Vec<String>> {
    let mut files: Vec<String> = fs::read_dir(folder)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n != METADATA_FILE && !n.starts_with('.'))
        .collect();
    files.sort();
    Ok(files)
}

fn describe(name: String, path: PathBuf, created_at: NaiveDateTime, sequence: u32) -> SnapshotInfo {
    let meta_path = path.join(METADATA_FILE);
    let metadata = match fs::read(&meta_path) {
        Ok(bytes) => match serde_json::from_slice::<SnapshotMetadata>(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(snapshot = %name, "unreadable metadata: {e}");
                None
            }
        },
        Err(_) => None,
    };
    let (files, total_size) = match &metadata {
        Some(meta) => (meta.archivos.clone(), meta.tamano_carpeta),
        None => {
            let files = snapshot_files(&path).unwrap_or_default();
            let size = walkdir::WalkDir::new(&path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && e.file_name() != METADATA_FILE)
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum();
            (files, size)
        }
    };
    SnapshotInfo {
        name,
        path,
        created_at,
        files,
        total_size,
        metadata,
        sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(root: &Path) -> BackupManager {
        BackupManager::new(
            root.join("data"),
            root.join("data").join("backups"),
            vec!["habitantes.dat".into(), "faenas.dat".into(), "perfiles.dat".into()],
        )
    }

    fn seed(root: &Path) {
        let data = root.join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("habitantes.dat"), b"sealed-habitantes").unwrap();
        fs::write(data.join("faenas.dat"), b"sealed-faenas").unwrap();
    }

    #[test]
    fn parses_names_with_and_without_suffix() {
        let (ts, seq) = parse_snapshot_name("backup_19_10_2026_143005").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-10-19 14:30:05");
        assert_eq!(seq, 1);
        let (_, seq) = parse_snapshot_name("backup_19_10_2026_143005_3").unwrap();
        assert_eq!(seq, 3);
        assert!(parse_snapshot_name("backup_hoy").is_none());
        assert!(parse_snapshot_name("otra_cosa").is_none());
    }

    #[test]
    fn snapshot_copies_existing_documents_with_metadata() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let info = manager(dir.path()).create_full_snapshot().unwrap();
        assert!(info.name.starts_with(SNAPSHOT_PREFIX));
        assert_eq!(info.files, vec!["habitantes.dat", "faenas.dat"]);
        assert_eq!(info.total_size, 30);
        assert_eq!(
            fs::read(info.path.join("faenas.dat")).unwrap(),
            b"sealed-faenas"
        );

        let raw = fs::read_to_string(info.path.join(METADATA_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["cantidad_archivos"], 2);
        assert_eq!(json["tamaño_carpeta"], 30);
        assert!(json["fecha_backup"].is_string());
    }

    #[test]
    fn empty_data_dir_is_a_structured_failure() {
        let dir = tempdir().unwrap();
        let result = manager(dir.path()).create_full_snapshot();
        assert!(matches!(result, Err(BackupError::NothingToBackUp)));
        assert!(manager(dir.path()).snapshot_on_shutdown().is_none());
    }

    #[test]
    fn retention_keeps_most_recent() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let manager = manager(dir.path());
        let created: Vec<String> = (0..5)
            .map(|_| manager.create_full_snapshot().unwrap().name)
            .collect();

        let removed = manager.retain_most_recent(2).unwrap();
        assert_eq!(removed.len(), 3);
        let remaining: Vec<String> = manager
            .list_snapshots()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(remaining, vec![created[4].clone(), created[3].clone()]);
    }

    #[test]
    fn configured_retention_applies_on_create() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let manager = manager(dir.path()).with_retention(3);
        for _ in 0..6 {
            manager.create_full_snapshot().unwrap();
        }
        assert_eq!(manager.list_snapshots().unwrap().len(), 3);
    }

    #[test]
    fn restore_keeps_previous_live_bytes() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let manager = manager(dir.path());
        let info = manager.create_full_snapshot().unwrap();

        let live = dir.path().join("data").join("habitantes.dat");
        fs::write(&live, b"damaged").unwrap();
        fs::remove_file(dir.path().join("data").join("faenas.dat")).unwrap();

        let report = manager.restore_snapshot(&info.name).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.restored, vec!["faenas.dat", "habitantes.dat"]);
        assert_eq!(fs::read(&live).unwrap(), b"sealed-habitantes");
        assert_eq!(
            fs::read(dir.path().join("data").join("habitantes.dat.anterior")).unwrap(),
            b"damaged"
        );
        assert_eq!(report.safety_copies.len(), 1);
    }

    #[test]
    fn restore_unknown_snapshot_fails() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let manager = manager(dir.path());
        assert!(matches!(
            manager.restore_snapshot("backup_01_01_2000_000000"),
            Err(BackupError::SnapshotNotFound(_))
        ));
        assert!(matches!(
            manager.restore_snapshot("../data"),
            Err(BackupError::InvalidName(_))
        ));
    }

    #[test]
    fn prune_by_age_and_delete() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let manager = manager(dir.path());
        let fresh = manager.create_full_snapshot().unwrap();
        let old = manager.backup_root().join("backup_01_01_2020_120000");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("habitantes.dat"), b"old").unwrap();

        let listed = manager.list_snapshots().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[1].metadata.is_none());
        assert_eq!(listed[1].total_size, 3);

        let removed = manager.prune_older_than(30).unwrap();
        assert_eq!(removed, vec!["backup_01_01_2020_120000".to_string()]);
        manager.delete_snapshot(&fresh.name).unwrap();
        assert!(manager.latest_snapshot().unwrap().is_none());
    }

    #[test]
    fn prune_with_out_of_range_age_keeps_everything() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let manager = manager(dir.path());
        manager.create_full_snapshot().unwrap();
        let old = manager.backup_root().join("backup_01_01_2020_120000");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("habitantes.dat"), b"old").unwrap();

        for days in [i64::MAX, i64::MAX / 86_400, 1_000_000_000] {
            assert!(manager.prune_older_than(days).unwrap().is_empty());
        }
        assert!(matches!(
            manager.prune_older_than(-1),
            Err(BackupError::InvalidAge(-1))
        ));
        assert!(matches!(
            manager.prune_older_than(i64::MIN),
            Err(BackupError::InvalidAge(_))
        ));
        assert_eq!(manager.list_snapshots().unwrap().len(), 2);
    }

    #[test]
    fn restore_without_safety_copy_leaves_live_file_alone() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let manager = manager(dir.path());
        let info = manager.create_full_snapshot().unwrap();

        let data = dir.path().join("data");
        let live = data.join("habitantes.dat");
        fs::write(&live, b"edited-after-snapshot").unwrap();
        fs::write(data.join("faenas.dat"), b"edited-faenas").unwrap();
        // a directory squatting on the safety copy name makes the copy fail
        fs::create_dir(data.join("habitantes.dat.anterior")).unwrap();

        let report = manager.restore_snapshot(&info.name).unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "habitantes.dat");
        assert_eq!(report.restored, vec!["faenas.dat"]);
        assert_eq!(fs::read(&live).unwrap(), b"edited-after-snapshot");
        assert_eq!(fs::read(data.join("faenas.dat")).unwrap(), b"sealed-faenas");
        assert_eq!(
            fs::read(data.join("faenas.dat.anterior")).unwrap(),
            b"edited-faenas"
        );
    }
}
