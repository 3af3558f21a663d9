//! Folio allocation for new inhabitants.
//!
//! A remote service normally hands out folios. When it is not configured or
//! fails, the next local `HAB-NNNN` after the highest numeric suffix is used.

use tracing::warn;

pub const FOLIO_PREFIX: &str = "HAB-";

/// External folio service. Only consumed here; any error triggers the local
/// fallback.
pub trait FolioSource: Send + Sync {
    /// Existing folio for `name`, if the service knows the person.
    fn lookup(&self, name: &str) -> anyhow::Result<Option<String>>;
    /// Create a new folio for `name`.
    fn create(&self, name: &str) -> anyhow::Result<String>;
}

pub fn parse_folio_number(folio: &str) -> Option<u32> {
    folio.trim().strip_prefix(FOLIO_PREFIX)?.parse().ok()
}

pub fn next_local_folio<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let highest = existing
        .into_iter()
        .filter_map(parse_folio_number)
        .max()
        .unwrap_or(0);
    format!("{FOLIO_PREFIX}{:04}", highest.saturating_add(1))
}

pub fn allocate_folio<'a>(
    source: Option<&dyn FolioSource>,
    name: &str,
    existing: impl IntoIterator<Item = &'a str>,
) -> String {
    if let Some(source) = source {
        match source.lookup(name) {
            Ok(Some(folio)) => return folio,
            Ok(None) => match source.create(name) {
                Ok(folio) => return folio,
                Err(e) => warn!("folio service could not create folio, using local: {e:#}"),
            },
            Err(e) => warn!("folio service unavailable, using local: {e:#}"),
        }
    }
    next_local_folio(existing)
}
