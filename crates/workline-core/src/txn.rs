use crate::error::{Result, WorklineError};
use crate::index::{IndexEntry, IndexManager};
use crate::lock::LockGuard;
use crate::store::Store;
use tracing::{debug, error};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TxnOp
// ---------------------------------------------------------------------------

/// One staged mutation. `prior` is captured at staging time and is what the
/// compensating rollback restores.
#[derive(Debug, Clone)]
pub enum TxnOp {
    WriteRecord {
        collection: String,
        id: String,
        value: serde_json::Value,
        prior: Option<serde_json::Value>,
    },
    DeleteRecord {
        collection: String,
        id: String,
        prior: Option<serde_json::Value>,
    },
    UpsertIndex {
        collection: String,
        entry: IndexEntry,
        prior: Option<IndexEntry>,
    },
    RemoveIndex {
        collection: String,
        id: String,
        prior: Option<IndexEntry>,
    },
}

impl TxnOp {
    fn apply(&self, store: &Store, index: &IndexManager) -> Result<()> {
        match self {
            TxnOp::WriteRecord {
                collection, id, value, ..
            } => store.write_raw(collection, id, value),
            TxnOp::DeleteRecord { collection, id, .. } => store.delete_record(collection, id),
            TxnOp::UpsertIndex {
                collection, entry, ..
            } => index.upsert(collection, entry.clone()),
            TxnOp::RemoveIndex { collection, id, .. } => index.remove(collection, id),
        }
    }

    fn apply_inverse(&self, store: &Store, index: &IndexManager) -> Result<()> {
        match self {
            TxnOp::WriteRecord {
                collection,
                id,
                prior,
                ..
            } => match prior {
                Some(prior) => store.write_raw(collection, id, prior),
                None => store.delete_if_exists(collection, id),
            },
            TxnOp::DeleteRecord {
                collection,
                id,
                prior,
            } => match prior {
                Some(prior) => store.write_raw(collection, id, prior),
                None => Ok(()),
            },
            TxnOp::UpsertIndex {
                collection,
                entry,
                prior,
            } => match prior {
                Some(prior) => index.upsert(collection, prior.clone()),
                None => index.remove(collection, &entry.id),
            },
            TxnOp::RemoveIndex {
                collection, prior, ..
            } => match prior {
                Some(prior) => index.upsert(collection, prior.clone()),
                None => Ok(()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    pub applied: usize,
}

/// In-memory staged batch of store mutations with compensating rollback.
/// Nothing touches disk until [`Transaction::commit`]; a transaction dropped
/// without committing leaves no persisted trace.
#[derive(Debug)]
pub struct Transaction {
    id: Uuid,
    ops: Vec<TxnOp>,
    savepoints: Vec<(String, usize)>,
}

impl Transaction {
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            ops: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn stage(&mut self, op: TxnOp) {
        self.ops.push(op);
    }

    /// Stage a record write, capturing the current on-disk state for undo.
    pub fn stage_write_record(
        &mut self,
        store: &Store,
        collection: &str,
        id: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let prior = store.read_raw_opt(collection, id)?;
        self.stage(TxnOp::WriteRecord {
            collection: collection.to_string(),
            id: id.to_string(),
            value,
            prior,
        });
        Ok(())
    }

    pub fn stage_delete_record(&mut self, store: &Store, collection: &str, id: &str) -> Result<()> {
        let prior = store.read_raw_opt(collection, id)?;
        self.stage(TxnOp::DeleteRecord {
            collection: collection.to_string(),
            id: id.to_string(),
            prior,
        });
        Ok(())
    }

    pub fn stage_upsert_index(
        &mut self,
        index: &IndexManager,
        collection: &str,
        entry: IndexEntry,
    ) -> Result<()> {
        let prior = index.get(collection, &entry.id)?;
        self.stage(TxnOp::UpsertIndex {
            collection: collection.to_string(),
            entry,
            prior,
        });
        Ok(())
    }

    pub fn stage_remove_index(
        &mut self,
        index: &IndexManager,
        collection: &str,
        id: &str,
    ) -> Result<()> {
        let prior = index.get(collection, id)?;
        self.stage(TxnOp::RemoveIndex {
            collection: collection.to_string(),
            id: id.to_string(),
            prior,
        });
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Savepoints
    // ---------------------------------------------------------------------------

    pub fn savepoint(&mut self, name: impl Into<String>) {
        self.savepoints.push((name.into(), self.ops.len()));
    }

    /// Truncate staged operations back to the named savepoint. Storage is
    /// untouched; nothing has been applied yet.
    pub fn rollback_to(&mut self, name: &str) -> Result<()> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| WorklineError::SavepointNotFound(name.to_string()))?;
        let (_, len) = self.savepoints[pos];
        self.ops.truncate(len);
        self.savepoints.truncate(pos + 1);
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Commit / rollback
    // ---------------------------------------------------------------------------

    /// Apply staged operations in order. The lock guard parameter ties the
    /// whole apply window to a held lock at the type level.
    ///
    /// If a forward operation fails, the inverses of the already-applied
    /// operations run in reverse order. This is compensating rollback, not
    /// WAL atomicity: partial state is briefly visible, bounded by the lock.
    pub fn commit(
        self,
        store: &Store,
        index: &IndexManager,
        _guard: &LockGuard,
    ) -> Result<CommitStats> {
        debug!(txn = %self.id, ops = self.ops.len(), "committing transaction");
        for (applied, op) in self.ops.iter().enumerate() {
            if let Err(e) = op.apply(store, index) {
                error!(txn = %self.id, error = %e, "forward op failed, compensating");
                for undo in self.ops[..applied].iter().rev() {
                    if let Err(undo_err) = undo.apply_inverse(store, index) {
                        error!(txn = %self.id, error = %undo_err, "compensating op failed");
                    }
                }
                return Err(e);
            }
        }
        Ok(CommitStats {
            applied: self.ops.len(),
        })
    }

    /// Discard all staged operations. Nothing was applied.
    pub fn rollback(self) {
        debug!(txn = %self.id, ops = self.ops.len(), "transaction rolled back");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
