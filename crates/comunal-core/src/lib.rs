//! comunal-core: encrypted document storage for the community registry
//!
//! # Storage strategy
//! - Each business document (inhabitants, cooperations, faenas, profiles) is
//!   one JSON value sealed with XChaCha20-Poly1305 under a PBKDF2-derived key,
//!   prefixed by an HMAC-SHA256 line that exposes tampering before decryption.
//! - Every write is staged beside the destination and swapped in, so a crash
//!   leaves either the old or the new file.
//! - Saves requested in bursts are coalesced per document by the debounce
//!   coordinator.
//!
//! # Modules
//! - `secure_store`  seal/open documents on disk
//! - `repository`    in-memory typed copy of one document
//! - `debounce`      coalesced background saves
//! - `backup`        timestamped snapshots, retention, restore
//! - `audit`         append-only mutation log
//! - `workspace`     application root tying the above together

pub mod atomic;
pub mod audit;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod debounce;
pub mod document;
pub mod error;
pub mod folio;
pub mod paths;
pub mod repository;
pub mod secure_store;
pub mod workspace;

pub use audit::{AuditAction, AuditEntry, AuditTrail};
pub use backup::{BackupError, BackupManager, SnapshotInfo};
pub use config::StoreConfig;
pub use document::{Document, DocumentKind};
pub use error::{AuditError, ConfigError, CryptoError, StoreError};
pub use repository::{DocumentRepository, LoadStatus};
pub use secure_store::SecureStore;
pub use workspace::Workspace;
