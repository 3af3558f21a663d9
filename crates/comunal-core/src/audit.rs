//! Append-only audit trail of document mutations.
//!
//! Entries live in memory for the whole session; after every append the most
//! recent `cap` entries are written as one plain JSON array. Older entries are
//! dropped from the file, not archived. A failed write is logged and never
//! reaches the operation being audited.

use crate::atomic;
use crate::error::AuditError;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use crate::config::DEFAULT_AUDIT_CAP;

/// Kind of mutation. Serialized as its Spanish label; labels written by
/// other tools are carried through as [`AuditAction::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Restore,
    Export,
    Other(String),
}

impl AuditAction {
    const KNOWN: [AuditAction; 5] = [
        AuditAction::Create,
        AuditAction::Update,
        AuditAction::Delete,
        AuditAction::Restore,
        AuditAction::Export,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::Create => "crear",
            AuditAction::Update => "modificar",
            AuditAction::Delete => "eliminar",
            AuditAction::Restore => "restaurar",
            AuditAction::Export => "exportar",
            AuditAction::Other(label) => label,
        }
    }

    pub fn parse(value: &str) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|a| a.as_str() == value)
            .unwrap_or_else(|| AuditAction::Other(value.to_string()))
    }
}

impl Serialize for AuditAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuditAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(AuditAction::parse(&label))
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub anterior: Value,
    pub nuevo: Value,
}

pub type FieldChanges = BTreeMap<String, FieldChange>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    #[serde(deserialize_with = "local_timestamp")]
    pub timestamp: DateTime<Local>,
    pub fecha: String,
    pub hora: String,
    pub tipo: AuditAction,
    pub entidad: String,
    pub id_entidad: String,
    pub usuario: String,
    #[serde(default)]
    pub cambios: FieldChanges,
}

/// A mutation to be recorded; the trail assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub entity_kind: String,
    pub entity_id: String,
    pub changes: FieldChanges,
    pub actor: String,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        entity_kind: impl Into<String>,
        entity_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            action,
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            changes: FieldChanges::new(),
            actor: actor.into(),
        }
    }

    pub fn with_changes(mut self, changes: FieldChanges) -> Self {
        self.changes = changes;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditStatistics {
    pub total: usize,
    pub por_tipo: BTreeMap<String, usize>,
    pub por_entidad: BTreeMap<String, usize>,
    pub por_usuario: BTreeMap<String, usize>,
    pub primera: Option<DateTime<Local>>,
    pub ultima: Option<DateTime<Local>>,
}

struct AuditState {
    /// Decoded entries, ordered by id; what queries see.
    entries: Vec<AuditEntry>,
    /// Everything the log file holds, in file order. Entries read from disk
    /// stay verbatim, including ones that did not decode.
    records: Vec<Value>,
    next_id: u64,
}

pub struct AuditTrail {
    path: PathBuf,
    cap: usize,
    state: Mutex<AuditState>,
}

impl AuditTrail {
    /// Load the persisted tail (if any) and continue its id sequence.
    pub fn open(path: impl Into<PathBuf>, cap: usize) -> Result<Self, AuditError> {
        let path = path.into();
        let records = load_records(&path)?;
        let entries = decode_records(&records);
        let next_id = records
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_u64))
            .chain(entries.iter().map(|e| e.id))
            .max()
            .unwrap_or(0)
            + 1;
        debug!(
            path = %path.display(),
            entries = entries.len(),
            undecoded = records.len() - entries.len(),
            "audit trail opened"
        );
        Ok(Self {
            path,
            cap: cap.max(1),
            state: Mutex::new(AuditState {
                entries,
                records,
                next_id,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(
        &self,
        action: AuditAction,
        entity_kind: &str,
        entity_id: &str,
        changes: FieldChanges,
        actor: &str,
    ) -> AuditEntry {
        let event = AuditEvent::new(action, entity_kind, entity_id, actor).with_changes(changes);
        let mut state = self.state.lock();
        let entry = push_entry(&mut state, event);
        self.persist(&state);
        entry
    }

    /// Append several events with a single write of the log file.
    pub fn append_all(&self, events: impl IntoIterator<Item = AuditEvent>) -> Vec<AuditEntry> {
        let mut state = self.state.lock();
        let appended: Vec<AuditEntry> = events
            .into_iter()
            .map(|event| push_entry(&mut state, event))
            .collect();
        if !appended.is_empty() {
            self.persist(&state);
        }
        appended
    }

    pub fn record_create(
        &self,
        entity_kind: &str,
        entity_id: &str,
        fields: &Value,
        actor: &str,
    ) -> AuditEntry {
        let changes = field_map(fields)
            .map(|(k, v)| (k, FieldChange { anterior: Value::Null, nuevo: v }))
            .collect();
        self.append(AuditAction::Create, entity_kind, entity_id, changes, actor)
    }

    pub fn record_delete(
        &self,
        entity_kind: &str,
        entity_id: &str,
        fields: &Value,
        actor: &str,
    ) -> AuditEntry {
        let changes = field_map(fields)
            .map(|(k, v)| (k, FieldChange { anterior: v, nuevo: Value::Null }))
            .collect();
        self.append(AuditAction::Delete, entity_kind, entity_id, changes, actor)
    }

    /// Record only the fields that differ. Returns `None` when nothing changed.
    pub fn record_update(
        &self,
        entity_kind: &str,
        entity_id: &str,
        before: &Value,
        after: &Value,
        actor: &str,
    ) -> Option<AuditEntry> {
        let changes = diff_fields(before, after);
        if changes.is_empty() {
            return None;
        }
        Some(self.append(AuditAction::Update, entity_kind, entity_id, changes, actor))
    }

    pub fn by_entity(&self, entity_kind: &str, entity_id: &str) -> Vec<AuditEntry> {
        self.filter(|e| e.entidad == entity_kind && e.id_entidad == entity_id)
    }

    pub fn by_actor(&self, actor: &str) -> Vec<AuditEntry> {
        self.filter(|e| e.usuario == actor)
    }

    pub fn by_action(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.filter(|e| e.tipo == action)
    }

    /// Entries whose local date falls within `[from, to]`.
    pub fn between(&self, from: NaiveDate, to: NaiveDate) -> Vec<AuditEntry> {
        self.filter(|e| {
            let day = e.timestamp.date_naive();
            day >= from && day <= to
        })
    }

    /// The `n` newest entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let state = self.state.lock();
        state.entries.iter().rev().take(n).cloned().collect()
    }

    pub fn compute_statistics(&self) -> AuditStatistics {
        let state = self.state.lock();
        let mut stats = AuditStatistics {
            total: state.entries.len(),
            ..Default::default()
        };
        for entry in &state.entries {
            *stats.por_tipo.entry(entry.tipo.to_string()).or_default() += 1;
            *stats.por_entidad.entry(entry.entidad.clone()).or_default() += 1;
            *stats.por_usuario.entry(entry.usuario.clone()).or_default() += 1;
        }
        stats.primera = state.entries.iter().map(|e| e.timestamp).min();
        stats.ultima = state.entries.iter().map(|e| e.timestamp).max();
        stats
    }

    /// Write every in-memory record (not only the capped tail) to `path`.
    pub fn export_all(&self, path: &Path) -> Result<usize, AuditError> {
        let state = self.state.lock();
        let json = serde_json::to_vec_pretty(&state.records)?;
        atomic::write_atomic(path, &json).map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(state.records.len())
    }

    fn filter(&self, keep: impl Fn(&AuditEntry) -> bool) -> Vec<AuditEntry> {
        let state = self.state.lock();
        state.entries.iter().filter(|e| keep(e)).cloned().collect()
    }

    fn persist(&self, state: &AuditState) {
        let start = state.records.len().saturating_sub(self.cap);
        let result = serde_json::to_vec_pretty(&state.records[start..])
            .map_err(AuditError::from)
            .and_then(|json| {
                atomic::write_atomic(&self.path, &json).map_err(|source| AuditError::Io {
                    path: self.path.clone(),
                    source,
                })
            });
        if let Err(e) = result {
            warn!("audit entry kept in memory only: {e}");
        }
    }
}

fn push_entry(state: &mut AuditState, event: AuditEvent) -> AuditEntry {
    let now = Local::now();
    let entry = AuditEntry {
        id: state.next_id,
        timestamp: now,
        fecha: now.format("%Y-%m-%d").to_string(),
        hora: now.format("%H:%M:%S").to_string(),
        tipo: event.action,
        entidad: event.entity_kind,
        id_entidad: event.entity_id,
        usuario: event.actor,
        cambios: event.changes,
    };
    state.next_id += 1;
    match serde_json::to_value(&entry) {
        Ok(record) => state.records.push(record),
        Err(e) => warn!(id = entry.id, "audit entry kept in memory only: {e}"),
    }
    state.entries.push(entry.clone());
    entry
}

fn load_records(path: &Path) -> Result<Vec<Value>, AuditError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(source) => {
            return Err(AuditError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(records) => Ok(records),
        Err(e) => {
            warn!(path = %path.display(), "audit log unreadable, starting a new one: {e}");
            atomic::copy_aside(path, "corrupto");
            Ok(vec![])
        }
    }
}

fn decode_records(records: &[Value]) -> Vec<AuditEntry> {
    let mut entries: Vec<AuditEntry> = records
        .iter()
        .filter_map(|record| match AuditEntry::deserialize(record) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("audit entry kept on disk but not queryable: {e}");
                None
            }
        })
        .collect();
    entries.sort_by_key(|e| e.id);
    entries
}

/// RFC 3339 timestamps, or naive ones taken as local time.
fn local_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Local>, D::Error> {
    let text = String::deserialize(deserializer)?;
    if let Ok(stamp) = DateTime::parse_from_rfc3339(&text) {
        return Ok(stamp.with_timezone(&Local));
    }
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {text:?}")))
}

fn field_map(fields: &Value) -> Box<dyn Iterator<Item = (String, Value)> + '_> {
    match fields {
        Value::Object(map) => Box::new(map.iter().map(|(k, v)| (k.clone(), v.clone()))),
        Value::Null => Box::new(std::iter::empty()),
        other => Box::new(std::iter::once(("valor".to_string(), other.clone()))),
    }
}

/// Field-level diff of two JSON objects; non-objects compare as one field.
pub fn diff_fields(before: &Value, after: &Value) -> FieldChanges {
    let mut changes = FieldChanges::new();
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                let new_value = new.get(key).cloned().unwrap_or(Value::Null);
                if *old_value != new_value {
                    changes.insert(
                        key.clone(),
                        FieldChange {
                            anterior: old_value.clone(),
                            nuevo: new_value,
                        },
                    );
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    changes.insert(
                        key.clone(),
                        FieldChange {
                            anterior: Value::Null,
                            nuevo: new_value.clone(),
                        },
                    );
                }
            }
        }
        (old, new) if old != new => {
            changes.insert(
                "valor".to_string(),
                FieldChange {
                    anterior: old.clone(),
                    nuevo: new.clone(),
                },
            );
        }
        _ => {}
    }
    changes
}
