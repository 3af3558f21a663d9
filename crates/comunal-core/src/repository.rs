use crate::debounce::{DebounceCoordinator, DocumentWriter, SaveDisposition};
use crate::document::{Document, DocumentKind};
use crate::error::StoreError;
use crate::secure_store::SecureStore;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// How the in-memory copy was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    Missing,
    /// The file exists but did not verify; the session started empty.
    Corrupted,
    /// Verified and decrypted, but the records do not fit the document type.
    Invalid,
    /// The file exists but could not be read.
    Unreadable,
}

impl LoadStatus {
    /// Whether saving the in-memory copy is safe. A document that exists on
    /// disk but was not read must not be replaced by the empty fallback.
    pub fn is_writable(self) -> bool {
        matches!(self, LoadStatus::Loaded | LoadStatus::Missing)
    }
}

/// Session-owned, decrypted copy of one business document.
pub struct DocumentRepository<D: Document> {
    store: Arc<SecureStore>,
    password: Zeroizing<String>,
    document: String,
    state: RwLock<D>,
    status: Mutex<LoadStatus>,
}

impl<D: Document> DocumentRepository<D> {
    pub fn open(store: Arc<SecureStore>, password: &str) -> Arc<Self> {
        let document = D::KIND.file_name();
        let (value, status) = load_document::<D>(&store, &document, password);
        Arc::new(Self {
            store,
            password: Zeroizing::new(password.to_string()),
            document,
            state: RwLock::new(value),
            status: Mutex::new(status),
        })
    }

    pub fn kind(&self) -> DocumentKind {
        D::KIND
    }

    pub fn load_status(&self) -> LoadStatus {
        *self.status.lock()
    }

    pub fn read<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.state.read())
    }

    /// Mutate the in-memory copy. Nothing is written until a save is requested.
    pub fn update<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.state.write())
    }

    pub fn replace(&self, value: D) {
        *self.state.write() = value;
    }

    /// Replace the in-memory copy with an untyped payload.
    pub fn replace_json(&self, payload: Value) -> Result<(), StoreError> {
        let value: D = serde_json::from_value(payload).map_err(|source| StoreError::Serialize {
            document: self.document.clone(),
            source,
        })?;
        self.replace(value);
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Value, StoreError> {
        serde_json::to_value(&*self.state.read()).map_err(|source| StoreError::Serialize {
            document: self.document.clone(),
            source,
        })
    }

    /// Fails with [`StoreError::NotWritable`] unless the file on disk was
    /// read cleanly or does not exist.
    pub fn ensure_writable(&self) -> Result<(), StoreError> {
        let status = self.load_status();
        if status.is_writable() {
            return Ok(());
        }
        warn!(document = %self.document, ?status, "write refused");
        Err(StoreError::NotWritable {
            document: self.document.clone(),
            reason: format!("{status:?}").to_lowercase(),
        })
    }

    pub fn save_now(&self) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let payload = self.snapshot()?;
        self.write_document(&payload)
    }

    pub fn schedule_save(
        self: &Arc<Self>,
        coordinator: &DebounceCoordinator,
        immediate: bool,
    ) -> Result<SaveDisposition, StoreError> {
        self.ensure_writable()?;
        let payload = self.snapshot()?;
        let writer: Arc<dyn DocumentWriter> = Arc::clone(self) as Arc<dyn DocumentWriter>;
        coordinator.request_save(writer, payload, immediate)
    }

    /// Discard the in-memory copy and read the file again.
    pub fn reload(&self) -> LoadStatus {
        let (value, status) = load_document::<D>(&self.store, &self.document, &self.password);
        *self.state.write() = value;
        *self.status.lock() = status;
        status
    }
}

impl<D: Document> DocumentWriter for DocumentRepository<D> {
    fn document_name(&self) -> &str {
        &self.document
    }

    fn write_document(&self, payload: &Value) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.store.save(&self.document, payload, &self.password)?;
        *self.status.lock() = LoadStatus::Loaded;
        Ok(())
    }
}

fn load_document<D: Document>(store: &SecureStore, document: &str, password: &str) -> (D, LoadStatus) {
    match store.load_as::<D>(document, password) {
        Ok(value) => {
            info!(document, "document loaded");
            (value, LoadStatus::Loaded)
        }
        // NotFound also covers reads that kept failing on a path that exists
        Err(StoreError::NotFound(_))
            if !store.document_path(document).is_ok_and(|path| path.exists()) =>
        {
            (D::default(), LoadStatus::Missing)
        }
        Err(e @ StoreError::Corrupted { .. }) => {
            warn!(document, "starting empty: {e}");
            (D::default(), LoadStatus::Corrupted)
        }
        Err(e @ StoreError::Schema { .. }) => {
            warn!(document, "starting empty: {e}");
            (D::default(), LoadStatus::Invalid)
        }
        Err(e) => {
            warn!(document, "cannot load, starting empty: {e}");
            (D::default(), LoadStatus::Unreadable)
        }
    }
}
