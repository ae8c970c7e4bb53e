use crate::error::{Result, WorklineError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// File name constants
// ---------------------------------------------------------------------------

pub const LOCK_FILE: &str = ".lock";
pub const INDEX_FILE: &str = "index.json";
pub const CACHE_FILE: &str = "compliance-cache.json";
pub const AUDIT_LOG: &str = "audit.log";
pub const TEMPLATES_DIR: &str = "templates";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn collection_dir(root: &Path, collection: &str) -> PathBuf {
    root.join(collection)
}

pub fn record_path(root: &Path, collection: &str, id: &str) -> PathBuf {
    collection_dir(root, collection).join(format!("{id}.json"))
}

pub fn index_path(root: &Path, collection: &str) -> PathBuf {
    collection_dir(root, collection).join(INDEX_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub fn cache_path(root: &Path) -> PathBuf {
    root.join(CACHE_FILE)
}

pub fn audit_log_path(root: &Path) -> PathBuf {
    root.join(AUDIT_LOG)
}

pub fn templates_dir(root: &Path) -> PathBuf {
    root.join(TEMPLATES_DIR)
}

// ---------------------------------------------------------------------------
// Name validation
//
// Collections and ids become path segments, so validation doubles as the
// traversal guard: nothing that passes here can contain a separator or `..`.
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();
static COLLECTION_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9]{1,7}-\d{3,9}$").unwrap())
}

fn collection_re() -> &'static Regex {
    COLLECTION_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 32 || !id_re().is_match(id) {
        return Err(WorklineError::InvalidId(id.to_string()));
    }
    Ok(())
}

pub fn validate_collection(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !collection_re().is_match(name) {
        return Err(WorklineError::InvalidCollection(name.to_string()));
    }
    Ok(())
}

/// Format a work item id from a prefix and a sequence number, zero-padded to
/// three digits (`FEA`, 1 → `FEA-001`).
pub fn format_id(prefix: &str, seq: u32) -> String {
    format!("{prefix}-{seq:03}")
}

/// Parse the numeric suffix of an id with the given prefix. Returns `None`
/// for ids of other prefixes or malformed ids.
pub fn id_sequence(id: &str, prefix: &str) -> Option<u32> {
    let rest = id.strip_prefix(prefix)?.strip_prefix('-')?;
    rest.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
