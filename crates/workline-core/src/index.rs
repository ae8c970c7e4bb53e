use crate::error::{Result, WorklineError};
use crate::io;
use crate::item::{WorkItem, WorkItemStatus};
use crate::paths;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

// ---------------------------------------------------------------------------
// IndexEntry
// ---------------------------------------------------------------------------

/// Denormalized projection of a work item. The index is a cache over these;
/// the record files stay the only source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub title: String,
    pub status: WorkItemStatus,
    pub phase: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub file_path: String,
    pub content_hash: String,
}

impl IndexEntry {
    pub fn from_item(item: &WorkItem, collection: &str, content_hash: String) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            status: item.status,
            phase: item.workflow.current_phase_id.clone(),
            created_at: item.created_at,
            updated_at: item.updated_at,
            file_path: format!("{collection}/{}.json", item.id),
            content_hash,
        }
    }
}

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Contains,
    Gt,
    Lt,
}

/// A predicate over one projected field. Predicates on fields absent from
/// the projection cannot be expressed here and are rejected; callers
/// post-filter on loaded records instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Id,
    Title,
    Status,
    Phase,
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub key: SortKey,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pagination {
    pub offset: usize,
    /// `None` means no limit.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<IndexEntry>,
    /// Matching entries before pagination was applied.
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// IndexManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IndexManager {
    root: PathBuf,
}

impl IndexManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn load(&self, collection: &str) -> Result<Vec<IndexEntry>> {
        let path = paths::index_path(&self.root, collection);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    fn save(&self, collection: &str, entries: &[IndexEntry]) -> Result<()> {
        let path = paths::index_path(&self.root, collection);
        let mut data = serde_json::to_vec_pretty(entries)?;
        data.push(b'\n');
        io::atomic_write(&path, &data)
    }

    pub fn upsert(&self, collection: &str, entry: IndexEntry) -> Result<()> {
        let mut entries = self.load(collection)?;
        entries.retain(|e| e.id != entry.id);
        entries.push(entry);
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        self.save(collection, &entries)
    }

    pub fn remove(&self, collection: &str, id: &str) -> Result<()> {
        let mut entries = self.load(collection)?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() != before {
            self.save(collection, &entries)?;
        }
        Ok(())
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Option<IndexEntry>> {
        Ok(self.load(collection)?.into_iter().find(|e| e.id == id))
    }

    /// Index lookup with fallback to a direct record read on a miss, so
    /// readers tolerate an eventually-consistent index during rebuild.
    pub fn get_or_load(
        &self,
        store: &Store,
        collection: &str,
        id: &str,
    ) -> Result<Option<IndexEntry>> {
        if let Some(entry) = self.get(collection, id)? {
            return Ok(Some(entry));
        }
        match store.read_item(collection, id) {
            Ok(item) => {
                let hash = store.content_hash(collection, id)?;
                Ok(Some(IndexEntry::from_item(&item, collection, hash)))
            }
            Err(WorklineError::ItemNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Recompute the whole index from the authoritative records and replace
    /// it wholesale. Idempotent; records that fail to load are skipped with
    /// a warning so one bad record cannot block recovery.
    pub fn rebuild(&self, store: &Store, collection: &str) -> Result<IndexStats> {
        let ids = store.list_ids(collection)?;
        let mut stats = IndexStats::default();
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            stats.scanned += 1;
            match store.read_item(collection, &id) {
                Ok(item) => {
                    let hash = store.content_hash(collection, &id)?;
                    entries.push(IndexEntry::from_item(&item, collection, hash));
                    stats.indexed += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping unreadable record during index rebuild");
                    stats.skipped += 1;
                }
            }
        }
        self.save(collection, &entries)?;
        Ok(stats)
    }

    /// Filter, sort, and paginate over the projection. Never loads records.
    pub fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        sort: Option<Sort>,
        page: Pagination,
    ) -> Result<Page> {
        // Reject unprojected fields up front, even when nothing is indexed.
        for filter in filters {
            if !is_projected_field(&filter.field) {
                return Err(WorklineError::UnsupportedFilter(filter.field.clone()));
            }
        }

        let mut entries = self.load(collection)?;
        for filter in filters {
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries {
                if apply_filter(filter, &entry)? {
                    kept.push(entry);
                }
            }
            entries = kept;
        }

        if let Some(sort) = sort {
            entries.sort_by(|a, b| {
                let ord = match sort.key {
                    SortKey::Id => a.id.cmp(&b.id),
                    SortKey::Title => a.title.cmp(&b.title),
                    SortKey::Status => a.status.as_str().cmp(b.status.as_str()),
                    SortKey::Phase => a.phase.cmp(&b.phase),
                    SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
                    SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                };
                match sort.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        let total = entries.len();
        let entries: Vec<_> = entries
            .into_iter()
            .skip(page.offset)
            .take(page.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(Page { entries, total })
    }
}

fn apply_filter(filter: &Filter, entry: &IndexEntry) -> Result<bool> {
    let actual = projected_field(entry, &filter.field)
        .ok_or_else(|| WorklineError::UnsupportedFilter(filter.field.clone()))?;
    Ok(match filter.op {
        FilterOp::Eq => actual == filter.value,
        FilterOp::Ne => actual != filter.value,
        FilterOp::Contains => match (actual.as_str(), filter.value.as_str()) {
            (Some(a), Some(b)) => a.contains(b),
            _ => false,
        },
        // Timestamps serialize as RFC 3339 in a fixed format, so string
        // ordering matches chronological ordering.
        FilterOp::Gt => compare_values(&actual, &filter.value).map(|o| o.is_gt()).unwrap_or(false),
        FilterOp::Lt => compare_values(&actual, &filter.value).map(|o| o.is_lt()).unwrap_or(false),
    })
}

fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (serde_json::Value::String(a), serde_json::Value::String(b)) => Some(a.cmp(b)),
        _ => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
    }
}

fn is_projected_field(field: &str) -> bool {
    matches!(
        field,
        "id" | "title" | "status" | "phase" | "created_at" | "updated_at" | "content_hash"
    )
}

fn projected_field(entry: &IndexEntry, field: &str) -> Option<serde_json::Value> {
    match field {
        "id" => Some(serde_json::Value::String(entry.id.clone())),
        "title" => Some(serde_json::Value::String(entry.title.clone())),
        "status" => Some(serde_json::Value::String(entry.status.as_str().to_string())),
        "phase" => Some(serde_json::Value::String(entry.phase.clone())),
        "created_at" => Some(serde_json::Value::String(entry.created_at.to_rfc3339())),
        "updated_at" => Some(serde_json::Value::String(entry.updated_at.to_rfc3339())),
        "content_hash" => Some(serde_json::Value::String(entry.content_hash.clone())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
