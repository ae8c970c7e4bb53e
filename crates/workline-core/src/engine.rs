use crate::audit::{AuditEvent, AuditLog};
use crate::cache::ComplianceCache;
use crate::error::{Result, WorklineError};
use crate::gate::{
    ActorResolver, EnvActorResolver, GateBypass, GateEvaluator, GateRegistry, QualityGateResult,
};
use crate::index::{Filter, IndexEntry, IndexManager, IndexStats, Page, Pagination, Sort};
use crate::item::{seed_checklist, ComplianceSnapshot, PhaseTransition, WorkItem, WorkItemStatus};
use crate::lock::{LockGuard, LockManager};
use crate::paths;
use crate::store::{self, Store};
use crate::template::{ConditionEvaluator, DefaultConditionEvaluator, PhaseDef, TemplateRegistry, WorkflowTemplate};
use crate::txn::Transaction;
use chrono::Utc;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Blocker / TransitionOutcome
// ---------------------------------------------------------------------------

/// One reason a transition cannot proceed. The engine always returns the
/// complete set, never just the first failure.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Blocker {
    ChecklistIncomplete { item_id: String, label: String },
    GateNotPassed { gate_id: String, score: u32 },
    GateNotChecked { gate_id: String },
    GateCheckFailed { gate_id: String, reason: String },
    ComplianceBelowThreshold { score: u32, required: u32 },
    ComplianceNotEvaluated { required: u32 },
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::ChecklistIncomplete { item_id, label } => {
                write!(f, "checklist item '{item_id}' incomplete: {label}")
            }
            Blocker::GateNotPassed { gate_id, score } => {
                write!(f, "gate '{gate_id}' not passed (score {score})")
            }
            Blocker::GateNotChecked { gate_id } => write!(f, "gate '{gate_id}' not checked"),
            Blocker::GateCheckFailed { gate_id, reason } => {
                write!(f, "gate check '{gate_id}' failed to run: {reason}")
            }
            Blocker::ComplianceBelowThreshold { score, required } => {
                write!(f, "compliance score {score} below required {required}")
            }
            Blocker::ComplianceNotEvaluated { required } => {
                write!(f, "compliance not evaluated (required {required})")
            }
        }
    }
}

/// A blocked transition is an expected outcome, not an error.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Advanced(WorkItem),
    Blocked { blockers: Vec<Blocker> },
}

impl TransitionOutcome {
    pub fn is_advanced(&self) -> bool {
        matches!(self, TransitionOutcome::Advanced(_))
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lock_timeout: Duration,
    pub rule_set_version: u32,
    pub compliance_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            rule_set_version: 1,
            compliance_cache_ttl: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// OpContext
// ---------------------------------------------------------------------------

/// Per-operation context: the actor and the active transaction. Created at
/// the start of every mutating engine call, discarded at its end; there is
/// no engine-global mutable state.
struct OpContext {
    actor: String,
    txn: Transaction,
}

impl OpContext {
    fn new(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            txn: Transaction::begin(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    store: Store,
    index: IndexManager,
    cache: ComplianceCache,
    lock: LockManager,
    templates: TemplateRegistry,
    gates: GateRegistry,
    audit: AuditLog,
    conditions: Box<dyn ConditionEvaluator>,
    actors: Box<dyn ActorResolver>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn open(root: &Path) -> Result<Self> {
        Self::with_config(root, EngineConfig::default())
    }

    pub fn with_config(root: &Path, config: EngineConfig) -> Result<Self> {
        Ok(Self {
            store: Store::open(root)?,
            index: IndexManager::new(root),
            cache: ComplianceCache::new(root),
            lock: LockManager::new(root),
            templates: TemplateRegistry::load(root)?,
            gates: GateRegistry::new(),
            audit: AuditLog::new(root),
            conditions: Box::new(DefaultConditionEvaluator),
            actors: Box::new(EnvActorResolver),
            config,
        })
    }

    /// Register a gate evaluator for a gate type. Call at process start,
    /// before serving operations.
    pub fn register_gate(&mut self, gate_type: impl Into<String>, evaluator: Box<dyn GateEvaluator>) {
        self.gates.register(gate_type, evaluator);
    }

    pub fn set_condition_evaluator(&mut self, evaluator: Box<dyn ConditionEvaluator>) {
        self.conditions = evaluator;
    }

    /// Override how self-attributed operations (checklist updates, gate
    /// checks) resolve their audit actor.
    pub fn set_actor_resolver(&mut self, resolver: Box<dyn ActorResolver>) {
        self.actors = resolver;
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn acquire_lock(&self) -> Result<LockGuard> {
        self.lock.acquire(self.config.lock_timeout)
    }

    /// Stage the item write and its index entry, returning the content hash
    /// the record will have once committed.
    fn persist_item(&self, ctx: &mut OpContext, collection: &str, item: &WorkItem) -> Result<String> {
        let value = serde_json::to_value(item)?;
        let hash = store::hash_bytes(&store::serialize_record(&value)?);
        ctx.txn
            .stage_write_record(&self.store, collection, &item.id, value)?;
        ctx.txn.stage_upsert_index(
            &self.index,
            collection,
            IndexEntry::from_item(item, collection, hash.clone()),
        )?;
        Ok(hash)
    }

    /// Apply the staged transaction, then record the audit event for it.
    fn commit(
        &self,
        ctx: OpContext,
        guard: &LockGuard,
        action: &str,
        entity_id: &str,
        diff: serde_json::Value,
    ) -> Result<()> {
        let event = AuditEvent::new(action, "work_item", entity_id, ctx.actor.as_str(), diff);
        ctx.txn.commit(&self.store, &self.index, guard)?;
        // The mutation is durable at this point; a lost audit line must not
        // make the operation look failed.
        if let Err(err) = self.audit.append(&event) {
            warn!(action = %action, id = %entity_id, error = %err, "audit append failed");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // CRUD operations
    // ---------------------------------------------------------------------------

    /// Register a new work item in the first phase of `template_id`. The id
    /// is allocated under the lock: one past the highest existing sequence
    /// for `prefix` in the collection.
    pub fn create_work_item(
        &self,
        collection: &str,
        prefix: &str,
        template_id: &str,
        title: &str,
        actor: &str,
    ) -> Result<WorkItem> {
        paths::validate_collection(collection)?;
        let template = self.templates.get(template_id)?;

        let guard = self.acquire_lock()?;
        let next = self
            .store
            .list_ids(collection)?
            .iter()
            .filter_map(|id| paths::id_sequence(id, prefix))
            .max()
            .unwrap_or(0)
            + 1;
        let id = paths::format_id(prefix, next);
        paths::validate_id(&id)?;
        if self.store.exists(collection, &id)? {
            return Err(WorklineError::ItemExists(id));
        }

        let item = WorkItem::new(&id, title, template);
        let mut ctx = OpContext::new(actor);
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(
            ctx,
            &guard,
            "create",
            &id,
            serde_json::json!({"title": title, "template": template_id}),
        )?;
        info!(id = %id, template = template_id, "work item created");
        Ok(item)
    }

    pub fn get_work_item(&self, collection: &str, id: &str) -> Result<WorkItem> {
        // Existence via the index, tolerating a stale index by falling back
        // to the record itself.
        if self.index.get_or_load(&self.store, collection, id)?.is_none() {
            return Err(WorklineError::ItemNotFound(id.to_string()));
        }
        self.store.read_item(collection, id)
    }

    pub fn list_work_items(
        &self,
        collection: &str,
        filters: &[Filter],
        sort: Option<Sort>,
        page: Pagination,
    ) -> Result<Page> {
        self.index.query(collection, filters, sort, page)
    }

    pub fn get_history(&self, collection: &str, id: &str) -> Result<Vec<PhaseTransition>> {
        Ok(self.store.read_item(collection, id)?.workflow.phase_history)
    }

    pub fn rebuild_index(&self, collection: &str) -> Result<IndexStats> {
        self.index.rebuild(&self.store, collection)
    }

    /// Administrative removal: record and index entry deleted, tombstone
    /// appended to the audit trail. The engine never deletes on its own.
    pub fn delete_work_item(&self, collection: &str, id: &str, actor: &str) -> Result<()> {
        let guard = self.acquire_lock()?;
        if self.store.read_raw_opt(collection, id)?.is_none() {
            return Err(WorklineError::ItemNotFound(id.to_string()));
        }
        let mut ctx = OpContext::new(actor);
        ctx.txn.stage_delete_record(&self.store, collection, id)?;
        ctx.txn.stage_remove_index(&self.index, collection, id)?;
        self.commit(ctx, &guard, "delete", id, serde_json::json!({"tombstone": true}))?;
        self.cache.invalidate(id)?;
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Checklist / custom fields
    // ---------------------------------------------------------------------------

    /// Attributed to the identity from the engine's [`ActorResolver`].
    pub fn update_checklist_item(
        &self,
        collection: &str,
        id: &str,
        item_id: &str,
        completed: bool,
    ) -> Result<WorkItem> {
        let actor = self.actors.current_actor();
        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        let entry = item
            .checklist_item_mut(item_id)
            .ok_or_else(|| WorklineError::ChecklistItemNotFound(item_id.to_string()))?;
        entry.completed = completed;
        entry.completed_at = completed.then(Utc::now);
        item.touch();

        let mut ctx = OpContext::new(&actor);
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(
            ctx,
            &guard,
            "checklist_update",
            id,
            serde_json::json!({"item": item_id, "completed": completed}),
        )?;
        Ok(item)
    }

    pub fn set_custom_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: serde_json::Value,
        actor: &str,
    ) -> Result<WorkItem> {
        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        item.custom_fields.insert(field.to_string(), value.clone());
        item.touch();

        let mut ctx = OpContext::new(actor);
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(
            ctx,
            &guard,
            "field_update",
            id,
            serde_json::json!({"field": field, "value": value}),
        )?;
        Ok(item)
    }

    // ---------------------------------------------------------------------------
    // Blockers / status
    // ---------------------------------------------------------------------------

    /// Record a freeform, resolvable blocker note. A non-terminal item with
    /// active blockers is marked `blocked`.
    pub fn add_blocker(
        &self,
        collection: &str,
        id: &str,
        note: &str,
        actor: &str,
    ) -> Result<WorkItem> {
        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        if item.workflow.blockers.iter().any(|b| b == note) {
            return Err(WorklineError::Validation(format!(
                "blocker '{note}' is already active"
            )));
        }
        item.workflow.blockers.push(note.to_string());
        if !item.status.is_terminal() {
            item.status = WorkItemStatus::Blocked;
        }
        item.touch();

        let mut ctx = OpContext::new(actor);
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(ctx, &guard, "blocker_add", id, serde_json::json!({"note": note}))?;
        Ok(item)
    }

    /// Resolve an active blocker note. Clearing the last one returns a
    /// blocked item to `active`.
    pub fn resolve_blocker(
        &self,
        collection: &str,
        id: &str,
        note: &str,
        actor: &str,
    ) -> Result<WorkItem> {
        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        let before = item.workflow.blockers.len();
        item.workflow.blockers.retain(|b| b != note);
        if item.workflow.blockers.len() == before {
            return Err(WorklineError::Validation(format!(
                "no active blocker '{note}'"
            )));
        }
        if item.workflow.blockers.is_empty() && item.status == WorkItemStatus::Blocked {
            item.status = WorkItemStatus::Active;
        }
        item.touch();

        let mut ctx = OpContext::new(actor);
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(
            ctx,
            &guard,
            "blocker_resolve",
            id,
            serde_json::json!({"note": note}),
        )?;
        Ok(item)
    }

    /// Terminal stop: the item keeps its phase and history but accepts no
    /// further transitions.
    pub fn cancel_work_item(
        &self,
        collection: &str,
        id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<WorkItem> {
        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        if item.status == WorkItemStatus::Cancelled {
            return Err(WorklineError::Validation(format!("'{id}' is already cancelled")));
        }
        item.status = WorkItemStatus::Cancelled;
        item.touch();

        let mut ctx = OpContext::new(actor);
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(ctx, &guard, "cancel", id, serde_json::json!({"reason": reason}))?;
        Ok(item)
    }

    // ---------------------------------------------------------------------------
    // Gates
    // ---------------------------------------------------------------------------

    /// Run the registered evaluator for a declared gate and record the
    /// result on the item's current phase instance. The evaluator runs
    /// before the lock is taken; it may be slow (shell, network, LLM) and
    /// the lock must only cover the bounded write.
    pub fn check_gate(&self, collection: &str, id: &str, gate_id: &str) -> Result<QualityGateResult> {
        let item = self.store.read_item(collection, id)?;
        let template = self.templates.get(&item.workflow.workflow_id)?;
        let gate = template
            .gate(gate_id)
            .ok_or_else(|| WorklineError::GateNotFound(gate_id.to_string()))?;

        let outcome = self.gates.run(gate, &item)?;
        let result = QualityGateResult {
            gate_id: gate_id.to_string(),
            passed: outcome.passed,
            score: outcome.score,
            checked_at: Utc::now(),
            details: outcome.details,
            bypass: None,
        };

        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        item.set_gate_result(result.clone());

        let mut ctx = OpContext::new(&self.actors.current_actor());
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(
            ctx,
            &guard,
            "gate_check",
            id,
            serde_json::json!({"gate": gate_id, "passed": result.passed, "score": result.score}),
        )?;
        Ok(result)
    }

    /// Record an audited bypass for a gate. Exactly one bypass per gate
    /// instance; it satisfies the gate for transition purposes and is
    /// retained permanently in history.
    pub fn bypass_gate(
        &self,
        collection: &str,
        id: &str,
        gate_id: &str,
        reason: &str,
        by: &str,
    ) -> Result<QualityGateResult> {
        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        let template = self.templates.get(&item.workflow.workflow_id)?;
        if template.gate(gate_id).is_none() {
            return Err(WorklineError::GateNotFound(gate_id.to_string()));
        }

        let bypass = GateBypass {
            reason: reason.to_string(),
            by: by.to_string(),
            at: Utc::now(),
        };
        let result = match item
            .workflow
            .gate_results
            .iter_mut()
            .find(|r| r.gate_id == gate_id)
        {
            Some(existing) => {
                if existing.bypass.is_some() {
                    return Err(WorklineError::Validation(format!(
                        "gate '{gate_id}' is already bypassed"
                    )));
                }
                existing.bypass = Some(bypass);
                existing.clone()
            }
            None => {
                let fresh = QualityGateResult {
                    gate_id: gate_id.to_string(),
                    passed: false,
                    score: 0,
                    checked_at: Utc::now(),
                    details: "bypassed without a recorded check".to_string(),
                    bypass: Some(bypass),
                };
                item.workflow.gate_results.push(fresh.clone());
                fresh
            }
        };
        item.touch();

        let mut ctx = OpContext::new(by);
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(
            ctx,
            &guard,
            "gate_bypass",
            id,
            serde_json::json!({"gate": gate_id, "reason": reason}),
        )?;
        Ok(result)
    }

    // ---------------------------------------------------------------------------
    // Compliance
    // ---------------------------------------------------------------------------

    /// Record a compliance evaluation on the item and write through to the
    /// compliance cache, keyed by the item's post-write content hash.
    pub fn record_compliance(
        &self,
        collection: &str,
        id: &str,
        score: u32,
        actor: &str,
    ) -> Result<WorkItem> {
        if score > 100 {
            return Err(WorklineError::Validation(format!(
                "compliance score {score} exceeds 100"
            )));
        }
        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        let snapshot = ComplianceSnapshot {
            score,
            rule_set_version: self.config.rule_set_version,
            evaluated_at: Utc::now(),
        };
        item.compliance = Some(snapshot.clone());
        item.touch();

        let mut ctx = OpContext::new(actor);
        let hash = self.persist_item(&mut ctx, collection, &item)?;
        self.commit(ctx, &guard, "compliance", id, serde_json::json!({"score": score}))?;
        self.cache.put(
            id,
            &hash,
            self.config.rule_set_version,
            snapshot,
            self.config.compliance_cache_ttl,
        )?;
        Ok(item)
    }

    // ---------------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------------

    /// Attempt to move a work item to `target_phase`.
    ///
    /// Forward transitions are restricted to the immediate next phase and
    /// gated on the current phase's exit conditions; a reopen to any earlier
    /// phase is always allowed and marked `automatic: false`.
    pub fn transition_to(
        &self,
        collection: &str,
        id: &str,
        target_phase: &str,
        actor: &str,
    ) -> Result<TransitionOutcome> {
        let guard = self.acquire_lock()?;
        let mut item = self.store.read_item(collection, id)?;
        if item.status == WorkItemStatus::Cancelled {
            return Err(WorklineError::InvalidTransition {
                from: item.workflow.current_phase_id.clone(),
                to: target_phase.to_string(),
                reason: "item is cancelled".to_string(),
            });
        }
        if item.status == WorkItemStatus::Blocked {
            return Err(WorklineError::InvalidTransition {
                from: item.workflow.current_phase_id.clone(),
                to: target_phase.to_string(),
                reason: "item has unresolved blockers".to_string(),
            });
        }
        let template = self.templates.get(&item.workflow.workflow_id)?;

        let current_idx = template
            .phase_index(&item.workflow.current_phase_id)
            .ok_or_else(|| WorklineError::PhaseNotFound {
                phase: item.workflow.current_phase_id.clone(),
                template: template.id.clone(),
            })?;
        let target_idx =
            template
                .phase_index(target_phase)
                .ok_or_else(|| WorklineError::PhaseNotFound {
                    phase: target_phase.to_string(),
                    template: template.id.clone(),
                })?;

        let from_phase = item.workflow.current_phase_id.clone();
        let reopen = target_idx < current_idx;
        if target_idx == current_idx {
            return Err(WorklineError::InvalidTransition {
                from: from_phase,
                to: target_phase.to_string(),
                reason: "already in this phase".to_string(),
            });
        }
        if !reopen && target_idx != current_idx + 1 {
            return Err(WorklineError::InvalidTransition {
                from: from_phase,
                to: target_phase.to_string(),
                reason: "only the immediate next phase or a reopen is allowed".to_string(),
            });
        }

        if !reopen {
            let current_phase = &template.phases[current_idx];
            let (blockers, auto_results) =
                self.evaluate_exit_conditions(collection, &item, current_phase, template)?;
            if !blockers.is_empty() {
                return Ok(TransitionOutcome::Blocked { blockers });
            }
            for result in auto_results {
                item.set_gate_result(result);
            }
        }

        // Archive the outgoing phase instance's gate results for audit, then
        // reseed for the incoming phase.
        let drained: Vec<_> = item.workflow.gate_results.drain(..).collect();
        item.gate_history.extend(drained);
        item.workflow.phase_history.push(PhaseTransition {
            from_phase: from_phase.clone(),
            to_phase: target_phase.to_string(),
            at: Utc::now(),
            actor: actor.to_string(),
            automatic: !reopen,
        });
        item.workflow.current_phase_id = target_phase.to_string();
        item.workflow.checklist = seed_checklist(&template.phases[target_idx]);
        item.status = if !reopen && target_idx == template.phases.len() - 1 {
            WorkItemStatus::Completed
        } else {
            WorkItemStatus::Active
        };
        item.touch();

        let mut ctx = OpContext::new(actor);
        self.persist_item(&mut ctx, collection, &item)?;
        self.commit(
            ctx,
            &guard,
            "transition",
            id,
            serde_json::json!({
                "from": from_phase,
                "to": target_phase,
                "automatic": !reopen,
            }),
        )?;
        info!(id = %id, from = %from_phase, to = %target_phase, "phase transition");
        Ok(TransitionOutcome::Advanced(item))
    }

    /// Exit conditions of `phase`, evaluated in full: the caller gets every
    /// blocker at once. Alongside the blockers, any gate results produced by
    /// in-line checks are returned so a successful transition can persist
    /// them.
    fn evaluate_exit_conditions(
        &self,
        collection: &str,
        item: &WorkItem,
        phase: &PhaseDef,
        template: &WorkflowTemplate,
    ) -> Result<(Vec<Blocker>, Vec<QualityGateResult>)> {
        let mut blockers = Vec::new();
        let mut auto_results = Vec::new();

        for entry in &item.workflow.checklist {
            if !entry.required || entry.completed {
                continue;
            }
            // A conditional item whose condition is false is excluded from
            // the required set for this evaluation.
            if let Some(condition) = &entry.condition {
                if !self.conditions.evaluate(condition, item) {
                    continue;
                }
            }
            blockers.push(Blocker::ChecklistIncomplete {
                item_id: entry.id.clone(),
                label: entry.label.clone(),
            });
        }

        for gate_id in &phase.required_gates {
            match item.gate_result(gate_id) {
                Some(result) if result.is_satisfied() => {}
                Some(result) => blockers.push(Blocker::GateNotPassed {
                    gate_id: gate_id.clone(),
                    score: result.score,
                }),
                None => {
                    // validate() guarantees required gates are declared.
                    let gate = template
                        .gate(gate_id)
                        .ok_or_else(|| WorklineError::GateNotFound(gate_id.clone()))?;
                    if self.gates.get(&gate.gate_type).is_none() {
                        blockers.push(Blocker::GateNotChecked {
                            gate_id: gate_id.clone(),
                        });
                        continue;
                    }
                    match self.gates.run(gate, item) {
                        Ok(outcome) => {
                            let result = QualityGateResult {
                                gate_id: gate_id.clone(),
                                passed: outcome.passed,
                                score: outcome.score,
                                checked_at: Utc::now(),
                                details: outcome.details,
                                bypass: None,
                            };
                            if !result.passed {
                                blockers.push(Blocker::GateNotPassed {
                                    gate_id: gate_id.clone(),
                                    score: result.score,
                                });
                            }
                            auto_results.push(result);
                        }
                        // The check could not run; that is a distinct
                        // blocker from a failed gate, and nothing is
                        // recorded against the gate.
                        Err(WorklineError::GateCheckFailed { gate, reason }) => {
                            blockers.push(Blocker::GateCheckFailed {
                                gate_id: gate,
                                reason,
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let required = phase.minimum_compliance_score;
        if required > 0 {
            let hash = self.store.content_hash(collection, &item.id)?;
            let score = self
                .cache
                .get(&item.id, &hash, self.config.rule_set_version)?
                .map(|s| s.score)
                .or_else(|| item.compliance.as_ref().map(|s| s.score));
            match score {
                Some(score) if score < required => {
                    blockers.push(Blocker::ComplianceBelowThreshold { score, required });
                }
                Some(_) => {}
                None => blockers.push(Blocker::ComplianceNotEvaluated { required }),
            }
        }

        Ok((blockers, auto_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{GateDef, GateOutcome};
    use crate::index::{Filter, FilterOp, Pagination};
    use serde_json::json;
    use tempfile::TempDir;

    struct StaticGate {
        passed: bool,
        score: u32,
    }

    impl GateEvaluator for StaticGate {
        fn evaluate(&self, _gate: &GateDef, _item: &WorkItem) -> Result<GateOutcome> {
            Ok(GateOutcome {
                passed: self.passed,
                score: self.score,
                details: "static".to_string(),
            })
        }
    }

    struct BrokenGate;

    impl GateEvaluator for BrokenGate {
        fn evaluate(&self, _gate: &GateDef, _item: &WorkItem) -> Result<GateOutcome> {
            Err(WorklineError::Validation("sandbox unavailable".to_string()))
        }
    }

    fn engine(dir: &TempDir) -> WorkflowEngine {
        WorkflowEngine::open(dir.path()).unwrap()
    }

    fn create_feature(engine: &WorkflowEngine) -> WorkItem {
        engine
            .create_work_item("features", "FEA", "feature-workflow", "Search relevance", "alice")
            .unwrap()
    }

    fn complete_planning(engine: &WorkflowEngine, id: &str) {
        for item in ["define-scope", "acceptance-criteria"] {
            engine
                .update_checklist_item("features", id, item, true)
                .unwrap();
        }
    }

    #[test]
    fn create_allocates_sequential_ids() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let a = create_feature(&engine);
        let b = create_feature(&engine);
        assert_eq!(a.id, "FEA-001");
        assert_eq!(b.id, "FEA-002");
        assert_eq!(a.workflow.current_phase_id, "planning");
        assert_eq!(a.status, WorkItemStatus::Active);
        assert_eq!(a.workflow.checklist.len(), 4);
    }

    #[test]
    fn create_rejects_unknown_template() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let err = engine
            .create_work_item("features", "FEA", "no-such-workflow", "t", "alice")
            .unwrap_err();
        assert!(matches!(err, WorklineError::TemplateNotFound(_)));
    }

    #[test]
    fn get_missing_item_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let err = engine.get_work_item("features", "FEA-404").unwrap_err();
        assert!(matches!(err, WorklineError::ItemNotFound(_)));
    }

    #[test]
    fn blocked_transition_reports_every_blocker_and_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);

        let outcome = engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        let TransitionOutcome::Blocked { blockers } = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(blockers.len(), 2);
        assert!(blockers.iter().any(|b| matches!(
            b,
            Blocker::ChecklistIncomplete { item_id, .. } if item_id == "define-scope"
        )));
        assert!(blockers.iter().any(|b| matches!(
            b,
            Blocker::ChecklistIncomplete { item_id, .. } if item_id == "acceptance-criteria"
        )));

        let reloaded = engine.get_work_item("features", &item.id).unwrap();
        assert_eq!(reloaded.workflow.current_phase_id, "planning");
        assert!(reloaded.workflow.phase_history.is_empty());
    }

    #[test]
    fn transition_advances_once_checklist_is_complete() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);

        let outcome = engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        let TransitionOutcome::Advanced(advanced) = outcome else {
            panic!("expected advanced");
        };
        assert_eq!(advanced.workflow.current_phase_id, "design");
        assert_eq!(advanced.workflow.phase_history.len(), 1);
        assert!(advanced.workflow.phase_history[0].automatic);
        assert_eq!(advanced.workflow.checklist.len(), 1);
        assert!(!advanced.workflow.checklist[0].completed);

        let events = engine.audit().read_all().unwrap();
        assert!(events.iter().any(|e| e.action == "transition"));
    }

    #[test]
    fn conditional_checklist_item_only_blocks_when_condition_holds() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        engine
            .set_custom_field("features", &item.id, "needs_security_review", json!(true), "alice")
            .unwrap();

        let outcome = engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        let TransitionOutcome::Blocked { blockers } = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(blockers.len(), 3);
        assert!(blockers.iter().any(|b| matches!(
            b,
            Blocker::ChecklistIncomplete { item_id, .. } if item_id == "security-plan"
        )));
    }

    #[test]
    fn only_the_next_phase_is_reachable_forward() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);

        let err = engine
            .transition_to("features", &item.id, "implementation", "alice")
            .unwrap_err();
        assert!(matches!(err, WorklineError::InvalidTransition { .. }));

        let err = engine
            .transition_to("features", &item.id, "planning", "alice")
            .unwrap_err();
        assert!(matches!(err, WorklineError::InvalidTransition { .. }));
    }

    #[test]
    fn reopen_is_recorded_as_manual_and_reseeds_the_checklist() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);
        engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();

        let outcome = engine
            .transition_to("features", &item.id, "planning", "bob")
            .unwrap();
        let TransitionOutcome::Advanced(reopened) = outcome else {
            panic!("expected advanced");
        };
        assert_eq!(reopened.workflow.current_phase_id, "planning");
        assert_eq!(reopened.workflow.phase_history.len(), 2);
        assert!(!reopened.workflow.phase_history[1].automatic);
        assert!(reopened.workflow.checklist.iter().all(|i| !i.completed));
    }

    #[test]
    fn unchecked_gate_blocks_without_an_evaluator() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);
        engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        engine
            .update_checklist_item("features", &item.id, "design-doc", true)
            .unwrap();

        let outcome = engine
            .transition_to("features", &item.id, "implementation", "alice")
            .unwrap();
        let TransitionOutcome::Blocked { blockers } = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(
            blockers,
            vec![Blocker::GateNotChecked {
                gate_id: "design-review".to_string()
            }]
        );
    }

    #[test]
    fn registered_gate_runs_in_line_and_is_archived_on_transition() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);
        engine.register_gate("human", Box::new(StaticGate { passed: true, score: 100 }));
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);
        engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        engine
            .update_checklist_item("features", &item.id, "design-doc", true)
            .unwrap();

        let outcome = engine
            .transition_to("features", &item.id, "implementation", "alice")
            .unwrap();
        let TransitionOutcome::Advanced(advanced) = outcome else {
            panic!("expected advanced");
        };
        assert_eq!(advanced.workflow.current_phase_id, "implementation");
        assert!(advanced.workflow.gate_results.is_empty());
        assert!(advanced
            .gate_history
            .iter()
            .any(|r| r.gate_id == "design-review" && r.passed));
    }

    #[test]
    fn evaluator_error_surfaces_as_a_check_failed_blocker() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);
        engine.register_gate("human", Box::new(BrokenGate));
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);
        engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        engine
            .update_checklist_item("features", &item.id, "design-doc", true)
            .unwrap();

        let outcome = engine
            .transition_to("features", &item.id, "implementation", "alice")
            .unwrap();
        let TransitionOutcome::Blocked { blockers } = outcome else {
            panic!("expected blocked");
        };
        assert!(matches!(
            &blockers[..],
            [Blocker::GateCheckFailed { gate_id, .. }] if gate_id == "design-review"
        ));
        // Nothing recorded against the gate: the check never ran.
        let reloaded = engine.get_work_item("features", &item.id).unwrap();
        assert!(reloaded.gate_result("design-review").is_none());
    }

    #[test]
    fn failed_gate_blocks_until_bypassed() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);
        engine.register_gate("human", Box::new(StaticGate { passed: false, score: 40 }));
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);
        engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        engine
            .update_checklist_item("features", &item.id, "design-doc", true)
            .unwrap();

        let result = engine
            .check_gate("features", &item.id, "design-review")
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 40);

        let outcome = engine
            .transition_to("features", &item.id, "implementation", "alice")
            .unwrap();
        let TransitionOutcome::Blocked { blockers } = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(
            blockers,
            vec![Blocker::GateNotPassed {
                gate_id: "design-review".to_string(),
                score: 40
            }]
        );

        let bypassed = engine
            .bypass_gate("features", &item.id, "design-review", "deadline waiver", "carol")
            .unwrap();
        assert!(bypassed.bypass.is_some());
        assert!(engine
            .transition_to("features", &item.id, "implementation", "alice")
            .unwrap()
            .is_advanced());

        let events = engine.audit().read_all().unwrap();
        let bypass = events.iter().find(|e| e.action == "gate_bypass").unwrap();
        assert_eq!(bypass.actor, "carol");
        assert_eq!(bypass.diff["reason"], json!("deadline waiver"));
    }

    #[test]
    fn a_gate_can_only_be_bypassed_once() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        engine
            .bypass_gate("features", &item.id, "design-review", "first", "carol")
            .unwrap();
        let err = engine
            .bypass_gate("features", &item.id, "design-review", "second", "carol")
            .unwrap_err();
        assert!(matches!(err, WorklineError::Validation(_)));
    }

    #[test]
    fn bypass_of_an_undeclared_gate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        let err = engine
            .bypass_gate("features", &item.id, "ghost", "why not", "carol")
            .unwrap_err();
        assert!(matches!(err, WorklineError::GateNotFound(_)));
    }

    #[test]
    fn compliance_threshold_gates_the_implementation_exit() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);
        engine.register_gate("human", Box::new(StaticGate { passed: true, score: 100 }));
        engine.register_gate("shell", Box::new(StaticGate { passed: true, score: 100 }));
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);
        engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        engine
            .update_checklist_item("features", &item.id, "design-doc", true)
            .unwrap();
        engine
            .transition_to("features", &item.id, "implementation", "alice")
            .unwrap();
        for check in ["code-complete", "tests-added"] {
            engine
                .update_checklist_item("features", &item.id, check, true)
                .unwrap();
        }

        let outcome = engine
            .transition_to("features", &item.id, "complete", "alice")
            .unwrap();
        let TransitionOutcome::Blocked { blockers } = outcome else {
            panic!("expected blocked");
        };
        assert!(blockers.contains(&Blocker::ComplianceNotEvaluated { required: 70 }));

        engine.record_compliance("features", &item.id, 50, "bot").unwrap();
        let outcome = engine
            .transition_to("features", &item.id, "complete", "alice")
            .unwrap();
        let TransitionOutcome::Blocked { blockers } = outcome else {
            panic!("expected blocked");
        };
        assert!(blockers.contains(&Blocker::ComplianceBelowThreshold { score: 50, required: 70 }));

        engine.record_compliance("features", &item.id, 85, "bot").unwrap();
        let outcome = engine
            .transition_to("features", &item.id, "complete", "alice")
            .unwrap();
        let TransitionOutcome::Advanced(done) = outcome else {
            panic!("expected advanced");
        };
        assert_eq!(done.workflow.current_phase_id, "complete");
        assert_eq!(done.status, WorkItemStatus::Completed);
    }

    #[test]
    fn compliance_score_above_100_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        let err = engine
            .record_compliance("features", &item.id, 101, "bot")
            .unwrap_err();
        assert!(matches!(err, WorklineError::Validation(_)));
    }

    #[test]
    fn delete_leaves_a_tombstone_in_the_audit_trail() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        engine.delete_work_item("features", &item.id, "admin").unwrap();

        let err = engine.get_work_item("features", &item.id).unwrap_err();
        assert!(matches!(err, WorklineError::ItemNotFound(_)));
        let page = engine
            .list_work_items("features", &[], None, Pagination::default())
            .unwrap();
        assert_eq!(page.total, 0);

        let events = engine.audit().read_all().unwrap();
        let tombstone = events.last().unwrap();
        assert_eq!(tombstone.action, "delete");
        assert_eq!(tombstone.diff["tombstone"], json!(true));
    }

    #[test]
    fn a_committed_mutation_survives_an_audit_append_failure() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        // Occupy the log path so every append fails with EISDIR.
        std::fs::create_dir(dir.path().join(paths::AUDIT_LOG)).unwrap();

        let item = create_feature(&engine);
        let stored = engine.get_work_item("features", &item.id).unwrap();
        assert_eq!(stored.id, "FEA-001");
    }

    #[test]
    fn list_filters_on_projected_fields() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let a = create_feature(&engine);
        create_feature(&engine);
        complete_planning(&engine, &a.id);
        engine
            .transition_to("features", &a.id, "design", "alice")
            .unwrap();

        let page = engine
            .list_work_items(
                "features",
                &[Filter {
                    field: "phase".to_string(),
                    op: FilterOp::Eq,
                    value: json!("design"),
                }],
                None,
                Pagination::default(),
            )
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].id, a.id);
    }

    #[test]
    fn unknown_checklist_item_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        let err = engine
            .update_checklist_item("features", &item.id, "no-such-item", true)
            .unwrap_err();
        assert!(matches!(err, WorklineError::ChecklistItemNotFound(_)));
    }

    #[test]
    fn checklist_updates_are_attributed_through_the_actor_resolver() {
        struct FixedActor;

        impl ActorResolver for FixedActor {
            fn current_actor(&self) -> String {
                "reviewer-bot".to_string()
            }
        }

        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);
        engine.set_actor_resolver(Box::new(FixedActor));
        let item = create_feature(&engine);
        engine
            .update_checklist_item("features", &item.id, "define-scope", true)
            .unwrap();

        let events = engine.audit().read_all().unwrap();
        let event = events.last().unwrap();
        assert_eq!(event.action, "checklist_update");
        assert_eq!(event.actor, "reviewer-bot");
    }

    #[test]
    fn blockers_toggle_the_blocked_status() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);

        let blocked = engine
            .add_blocker("features", &item.id, "waiting on legal", "alice")
            .unwrap();
        assert_eq!(blocked.status, WorkItemStatus::Blocked);
        assert_eq!(blocked.workflow.blockers, vec!["waiting on legal"]);

        let err = engine
            .add_blocker("features", &item.id, "waiting on legal", "alice")
            .unwrap_err();
        assert!(matches!(err, WorklineError::Validation(_)));

        let resolved = engine
            .resolve_blocker("features", &item.id, "waiting on legal", "alice")
            .unwrap();
        assert_eq!(resolved.status, WorkItemStatus::Active);
        assert!(resolved.workflow.blockers.is_empty());

        let err = engine
            .resolve_blocker("features", &item.id, "waiting on legal", "alice")
            .unwrap_err();
        assert!(matches!(err, WorklineError::Validation(_)));
    }

    #[test]
    fn blocked_items_hold_their_phase_until_blockers_resolve() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        engine
            .add_blocker("features", &item.id, "waiting on legal", "alice")
            .unwrap();
        complete_planning(&engine, &item.id);

        let err = engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap_err();
        assert!(matches!(
            err,
            WorklineError::InvalidTransition { ref reason, .. } if reason.contains("blocker")
        ));
        let held = engine.get_work_item("features", &item.id).unwrap();
        assert_eq!(held.status, WorkItemStatus::Blocked);
        assert_eq!(held.workflow.current_phase_id, "planning");

        engine
            .resolve_blocker("features", &item.id, "waiting on legal", "alice")
            .unwrap();
        let outcome = engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        assert!(outcome.is_advanced());
    }

    #[test]
    fn cancelled_items_accept_no_transitions() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);

        let cancelled = engine
            .cancel_work_item("features", &item.id, "descoped", "alice")
            .unwrap();
        assert_eq!(cancelled.status, WorkItemStatus::Cancelled);

        let err = engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap_err();
        assert!(matches!(err, WorklineError::InvalidTransition { .. }));

        let err = engine
            .cancel_work_item("features", &item.id, "again", "alice")
            .unwrap_err();
        assert!(matches!(err, WorklineError::Validation(_)));
    }

    #[test]
    fn history_reflects_every_transition() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = create_feature(&engine);
        complete_planning(&engine, &item.id);
        engine
            .transition_to("features", &item.id, "design", "alice")
            .unwrap();
        engine
            .transition_to("features", &item.id, "planning", "bob")
            .unwrap();

        let history = engine.get_history("features", &item.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_phase, "planning");
        assert_eq!(history[0].to_phase, "design");
        assert_eq!(history[1].from_phase, "design");
        assert_eq!(history[1].to_phase, "planning");
    }
}
