//! Application root: one secure store, the four business documents, the audit
//! trail and the snapshot manager, built once per session.

use crate::audit::{AuditAction, AuditEvent, AuditTrail};
use crate::backup::{BackupManager, RestoreReport, SnapshotInfo};
use crate::config::StoreConfig;
use crate::debounce::{DebounceCoordinator, FlushReport, SaveDisposition};
use crate::document::{
    CooperationsDocument, DocumentKind, FaenasDocument, InhabitantsDocument, ProfilesDocument,
};
use crate::error::StoreError;
use crate::repository::{DocumentRepository, LoadStatus};
use crate::secure_store::SecureStore;
use anyhow::Context;
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

/// Entity name used in the audit trail for whole-document operations.
pub const DOCUMENT_ENTITY: &str = "documento";

macro_rules! with_repository {
    ($ws:expr, $kind:expr, $repo:ident => $body:expr) => {
        match $kind {
            DocumentKind::Habitantes => {
                let $repo = &$ws.inhabitants;
                $body
            }
            DocumentKind::Cooperaciones => {
                let $repo = &$ws.cooperations;
                $body
            }
            DocumentKind::Faenas => {
                let $repo = &$ws.faenas;
                $body
            }
            DocumentKind::Perfiles => {
                let $repo = &$ws.profiles;
                $body
            }
        }
    };
}

pub struct Workspace {
    config: StoreConfig,
    store: Arc<SecureStore>,
    inhabitants: Arc<DocumentRepository<InhabitantsDocument>>,
    cooperations: Arc<DocumentRepository<CooperationsDocument>>,
    faenas: Arc<DocumentRepository<FaenasDocument>>,
    profiles: Arc<DocumentRepository<ProfilesDocument>>,
    audit: AuditTrail,
    backups: BackupManager,
    coordinator: Option<DebounceCoordinator>,
}

impl Workspace {
    /// Open every document with `password`. Debounced saves are available
    /// only when called inside a tokio runtime; otherwise saves are written
    /// straight away.
    pub fn open(config: StoreConfig, password: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

        let store = Arc::new(SecureStore::from_config(&config));
        let audit = AuditTrail::open(config.audit_path(), config.audit_cap)
            .context("open audit trail")?;
        let backups = BackupManager::new(
            &config.data_dir,
            config.backup_dir(),
            config.documents.clone(),
        )
        .with_retention(config.backup_retention);
        let coordinator = DebounceCoordinator::from_current(config.debounce_window());

        let workspace = Self {
            inhabitants: DocumentRepository::open(Arc::clone(&store), password),
            cooperations: DocumentRepository::open(Arc::clone(&store), password),
            faenas: DocumentRepository::open(Arc::clone(&store), password),
            profiles: DocumentRepository::open(Arc::clone(&store), password),
            config,
            store,
            audit,
            backups,
            coordinator,
        };
        info!(
            data_dir = %workspace.config.data_dir.display(),
            debounced = workspace.coordinator.is_some(),
            "workspace opened"
        );
        Ok(workspace)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SecureStore> {
        &self.store
    }

    pub fn inhabitants(&self) -> &Arc<DocumentRepository<InhabitantsDocument>> {
        &self.inhabitants
    }

    pub fn cooperations(&self) -> &Arc<DocumentRepository<CooperationsDocument>> {
        &self.cooperations
    }

    pub fn faenas(&self) -> &Arc<DocumentRepository<FaenasDocument>> {
        &self.faenas
    }

    pub fn profiles(&self) -> &Arc<DocumentRepository<ProfilesDocument>> {
        &self.profiles
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn coordinator(&self) -> Option<&DebounceCoordinator> {
        self.coordinator.as_ref()
    }

    pub fn load_status(&self, kind: DocumentKind) -> LoadStatus {
        with_repository!(self, kind, repo => repo.load_status())
    }

    pub fn load_report(&self) -> Vec<(DocumentKind, LoadStatus)> {
        DocumentKind::ALL
            .into_iter()
            .map(|kind| (kind, self.load_status(kind)))
            .collect()
    }

    /// Current in-memory contents of a document as JSON.
    pub fn document_json(&self, kind: DocumentKind) -> Result<Value, StoreError> {
        with_repository!(self, kind, repo => repo.snapshot())
    }

    /// Persist a document, through the debounce window unless `immediate`.
    pub fn save(&self, kind: DocumentKind, immediate: bool) -> Result<SaveDisposition, StoreError> {
        with_repository!(self, kind, repo => match &self.coordinator {
            Some(coordinator) => repo.schedule_save(coordinator, immediate),
            None => repo.save_now().map(|()| SaveDisposition::Written),
        })
    }

    /// Replace a whole document, audit the field-level changes and write it
    /// immediately.
    pub fn import_document(
        &self,
        kind: DocumentKind,
        payload: Value,
        actor: &str,
    ) -> Result<(), StoreError> {
        with_repository!(self, kind, repo => repo.ensure_writable())?;
        let before = self.document_json(kind)?;
        with_repository!(self, kind, repo => repo.replace_json(payload))?;
        let after = self.document_json(kind)?;
        self.save(kind, true)?;
        self.audit
            .record_update(DOCUMENT_ENTITY, kind.name(), &before, &after, actor);
        Ok(())
    }

    /// Restore a snapshot over the live files and reload every document.
    pub fn restore_snapshot(&self, name: &str, actor: &str) -> anyhow::Result<RestoreReport> {
        // fence every document, including saves already past their timer
        if let Some(coordinator) = &self.coordinator {
            for kind in DocumentKind::ALL {
                coordinator.cancel(&kind.file_name());
            }
        }
        let report = self
            .backups
            .restore_snapshot(name)
            .with_context(|| format!("restore snapshot {name}"))?;
        for kind in DocumentKind::ALL {
            let status = with_repository!(self, kind, repo => repo.reload());
            if status != LoadStatus::Loaded {
                warn!(document = %kind, ?status, "document not usable after restore");
            }
        }
        self.audit.append_all([AuditEvent::new(
            AuditAction::Restore,
            "backup",
            name,
            actor,
        )]);
        Ok(report)
    }

    pub fn flush(&self) -> FlushReport {
        match &self.coordinator {
            Some(coordinator) => coordinator.flush_all(),
            None => FlushReport::default(),
        }
    }

    /// Write pending saves and, when configured, take a closing snapshot.
    pub fn close(self) -> Option<SnapshotInfo> {
        let report = self.flush();
        for (document, e) in &report.failed {
            warn!(document = %document, "unsaved on close: {e}");
        }
        let snapshot = if self.config.snapshot_on_close {
            self.backups.snapshot_on_shutdown()
        } else {
            None
        };
        info!(flushed = report.written.len(), "workspace closed");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Inhabitant;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(dir: &Path) -> StoreConfig {
        StoreConfig {
            kdf_iterations: 1_000,
            read_retry_delay_ms: 10,
            debounce_ms: 40,
            ..StoreConfig::for_data_dir(dir)
        }
    }

    #[test]
    fn saves_without_runtime_are_immediate() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(config(dir.path()), "pw").unwrap();
        assert!(ws.coordinator().is_none());
        assert!(ws
            .load_report()
            .iter()
            .all(|(_, status)| *status == LoadStatus::Missing));

        ws.inhabitants().update(|d| {
            d.habitantes.push(Inhabitant {
                folio: "HAB-0001".into(),
                nombre: "Juan Perez".into(),
                ..Default::default()
            })
        });
        assert_eq!(
            ws.save(DocumentKind::Habitantes, false).unwrap(),
            SaveDisposition::Written
        );
        assert!(ws.store().exists("habitantes.dat"));

        let snapshot = ws.close().expect("closing snapshot");
        assert_eq!(snapshot.files, vec!["habitantes.dat".to_string()]);
    }

    #[test]
    fn import_records_changed_fields() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(config(dir.path()), "pw").unwrap();
        ws.import_document(
            DocumentKind::Faenas,
            json!({"faenas": [{"id": "F1", "nombre": "Limpieza"}]}),
            "ana",
        )
        .unwrap();

        let entries = ws.audit().by_entity(DOCUMENT_ENTITY, "faenas");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tipo, AuditAction::Update);
        assert!(entries[0].cambios.contains_key("faenas"));

        let reopened = Workspace::open(config(dir.path()), "pw").unwrap();
        assert_eq!(reopened.load_status(DocumentKind::Faenas), LoadStatus::Loaded);
        assert_eq!(reopened.faenas().read(|d| d.faenas[0].nombre.clone()), "Limpieza");
        assert_eq!(reopened.audit().len(), 1);
    }

    #[test]
    fn wrong_password_workspace_refuses_writes() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(config(dir.path()), "pw").unwrap();
        ws.import_document(
            DocumentKind::Habitantes,
            json!({"habitantes": [{"folio": "HAB-0001", "nombre": "Juan Perez"}]}),
            "ana",
        )
        .unwrap();
        drop(ws);

        let intruder = Workspace::open(config(dir.path()), "otra").unwrap();
        assert_eq!(intruder.load_status(DocumentKind::Habitantes), LoadStatus::Corrupted);
        intruder.inhabitants().update(|d| d.habitantes.push(Default::default()));
        assert!(matches!(
            intruder.save(DocumentKind::Habitantes, true),
            Err(StoreError::NotWritable { .. })
        ));
        assert!(matches!(
            intruder.import_document(DocumentKind::Habitantes, json!({"habitantes": []}), "x"),
            Err(StoreError::NotWritable { .. })
        ));
        assert!(intruder.audit().by_actor("x").is_empty());
        drop(intruder);

        let ws = Workspace::open(config(dir.path()), "pw").unwrap();
        assert_eq!(ws.load_status(DocumentKind::Habitantes), LoadStatus::Loaded);
        assert_eq!(ws.inhabitants().read(|d| d.habitantes[0].nombre.clone()), "Juan Perez");
    }

    #[test]
    fn restore_reloads_documents() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(config(dir.path()), "pw").unwrap();
        ws.import_document(DocumentKind::Perfiles, json!({"perfiles": [{"usuario": "ana"}]}), "ana")
            .unwrap();
        let snapshot = ws.backups().create_full_snapshot().unwrap();

        ws.import_document(DocumentKind::Perfiles, json!({"perfiles": []}), "ana")
            .unwrap();
        let report = ws.restore_snapshot(&snapshot.name, "ana").unwrap();
        assert!(report.is_complete());
        assert_eq!(ws.profiles().read(|d| d.perfiles.len()), 1);
        assert_eq!(ws.audit().by_action(AuditAction::Restore).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_flushes_pending_saves() {
        let dir = tempdir().unwrap();
        let cfg = StoreConfig {
            debounce_ms: 60_000,
            snapshot_on_close: false,
            ..config(dir.path())
        };
        let ws = Workspace::open(cfg, "pw").unwrap();
        assert!(ws.coordinator().is_some());
        ws.faenas().update(|d| d.faenas.push(Default::default()));
        assert_eq!(
            ws.save(DocumentKind::Faenas, false).unwrap(),
            SaveDisposition::Scheduled
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ws.store().exists("faenas.dat"));

        let store = Arc::clone(ws.store());
        assert!(ws.close().is_none());
        assert!(store.exists("faenas.dat"));
    }
}
