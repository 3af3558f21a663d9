//! Business documents persisted through the secure store.
//!
//! Every struct defaults missing fields and keeps unknown ones in `extra`, so
//! files written by older or newer builds load without a migration step.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const DOCUMENT_EXTENSION: &str = "dat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Habitantes,
    Cooperaciones,
    Faenas,
    Perfiles,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::Habitantes,
        DocumentKind::Cooperaciones,
        DocumentKind::Faenas,
        DocumentKind::Perfiles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DocumentKind::Habitantes => "habitantes",
            DocumentKind::Cooperaciones => "cooperaciones",
            DocumentKind::Faenas => "faenas",
            DocumentKind::Perfiles => "perfiles",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.{}", self.name(), DOCUMENT_EXTENSION)
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().trim_end_matches(".dat");
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed payload stored as one encrypted document.
pub trait Document: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    const KIND: DocumentKind;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inhabitant {
    pub folio: String,
    pub nombre: String,
    pub fecha_registro: Option<String>,
    pub activo: bool,
    pub notas: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Inhabitant {
    fn default() -> Self {
        Self {
            folio: String::new(),
            nombre: String::new(),
            fecha_registro: None,
            activo: true,
            notas: String::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InhabitantsDocument {
    pub habitantes: Vec<Inhabitant>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for InhabitantsDocument {
    const KIND: DocumentKind = DocumentKind::Habitantes;
}

impl InhabitantsDocument {
    pub fn find(&self, folio: &str) -> Option<&Inhabitant> {
        self.habitantes.iter().find(|h| h.folio == folio)
    }

    pub fn folios(&self) -> impl Iterator<Item = &str> {
        self.habitantes.iter().map(|h| h.folio.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payment {
    pub folio: String,
    pub monto: f64,
    pub fecha: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cooperation {
    pub id: String,
    pub nombre: String,
    pub monto_por_persona: f64,
    pub activa: bool,
    pub pagos: Vec<Payment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cooperation {
    pub fn paid_by(&self, folio: &str) -> f64 {
        self.pagos
            .iter()
            .filter(|p| p.folio == folio)
            .map(|p| p.monto)
            .sum()
    }

    pub fn pending_for(&self, folio: &str) -> f64 {
        (self.monto_por_persona - self.paid_by(folio)).max(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooperationsDocument {
    pub cooperaciones: Vec<Cooperation>,
    pub cooperacion_activa: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for CooperationsDocument {
    const KIND: DocumentKind = DocumentKind::Cooperaciones;
}

impl CooperationsDocument {
    pub fn active(&self) -> Option<&Cooperation> {
        let id = self.cooperacion_activa.as_deref()?;
        self.cooperaciones.iter().find(|c| c.id == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Faena {
    pub id: String,
    pub nombre: String,
    pub fecha: Option<String>,
    pub peso: f64,
    pub participantes: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaenasDocument {
    pub faenas: Vec<Faena>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for FaenasDocument {
    const KIND: DocumentKind = DocumentKind::Faenas;
}

impl FaenasDocument {
    /// Sum of faena weights a person took part in.
    pub fn points_for(&self, folio: &str) -> f64 {
        self.faenas
            .iter()
            .filter(|f| f.participantes.iter().any(|p| p == folio))
            .map(|f| f.peso)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub usuario: String,
    pub nombre: String,
    pub rol: String,
    pub activo: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            usuario: String::new(),
            nombre: String::new(),
            rol: String::new(),
            activo: true,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesDocument {
    pub perfiles: Vec<Profile>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for ProfilesDocument {
    const KIND: DocumentKind = DocumentKind::Perfiles;
}
