use crate::error::{Result, WorklineError};
use crate::io;
use crate::item::WorkItem;
use crate::migrations::{self, CURRENT_SCHEMA_VERSION};
use crate::paths;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Typed JSON record storage rooted at a single directory. One file per
/// record, written atomically; readers never observe a partial write.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        io::ensure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validated record path. Collection and id are checked by the same
    /// regexes that gate creation, so no segment can carry a separator or
    /// `..`; the containment check backs that up for raw caller input.
    fn checked_record_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        paths::validate_collection(collection)?;
        paths::validate_id(id)?;
        let path = paths::record_path(&self.root, collection, id);
        if !path.starts_with(&self.root)
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(WorklineError::PathTraversal(path.display().to_string()));
        }
        Ok(path)
    }

    // ---------------------------------------------------------------------------
    // Raw access
    // ---------------------------------------------------------------------------

    pub fn read_raw(&self, collection: &str, id: &str) -> Result<serde_json::Value> {
        self.read_raw_opt(collection, id)?
            .ok_or_else(|| WorklineError::ItemNotFound(id.to_string()))
    }

    pub fn read_raw_opt(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.checked_record_path(collection, id)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    pub fn write_raw(&self, collection: &str, id: &str, value: &serde_json::Value) -> Result<()> {
        let path = self.checked_record_path(collection, id)?;
        io::atomic_write(&path, &serialize_record(value)?)
    }

    // ---------------------------------------------------------------------------
    // Typed access
    // ---------------------------------------------------------------------------

    pub fn read_record<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<T> {
        let value = self.read_raw(collection, id)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn write_record<T: Serialize>(&self, collection: &str, id: &str, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.write_raw(collection, id, &value)
    }

    /// Read a work item, running the schema migration chain first when the
    /// stored version is behind. The migrated form is not written back here;
    /// the next successful write persists it.
    pub fn read_item(&self, collection: &str, id: &str) -> Result<WorkItem> {
        let value = self.read_raw(collection, id)?;
        let version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let value = if version == CURRENT_SCHEMA_VERSION {
            value
        } else {
            migrations::migrate_item(value, version, id)?
        };
        serde_json::from_value(value).map_err(|e| WorklineError::SchemaMigration {
            id: id.to_string(),
            version,
            reason: e.to_string(),
        })
    }

    // ---------------------------------------------------------------------------
    // Delete / list / hash
    // ---------------------------------------------------------------------------

    pub fn delete_record(&self, collection: &str, id: &str) -> Result<()> {
        let path = self.checked_record_path(collection, id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WorklineError::ItemNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_if_exists(&self, collection: &str, id: &str) -> Result<()> {
        match self.delete_record(collection, id) {
            Ok(()) | Err(WorklineError::ItemNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.checked_record_path(collection, id)?.exists())
    }

    /// Ids of every record in the collection, sorted. Files that are not
    /// well-formed record names (including `index.json`) are skipped.
    pub fn list_ids(&self, collection: &str) -> Result<Vec<String>> {
        paths::validate_collection(collection)?;
        let dir = paths::collection_dir(&self.root, collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if paths::validate_id(stem).is_ok() {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Hex SHA-256 of the record's serialized bytes.
    pub fn content_hash(&self, collection: &str, id: &str) -> Result<String> {
        let path = self.checked_record_path(collection, id)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorklineError::ItemNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(hash_bytes(&data))
    }
}

/// Canonical on-disk form: pretty-printed JSON with a trailing newline.
/// Hashing this form before a write yields the same hash `content_hash`
/// computes after it.
pub fn serialize_record(value: &serde_json::Value) -> Result<Vec<u8>> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    Ok(data)
}

pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
