use crate::gate::QualityGateResult;
use crate::migrations::CURRENT_SCHEMA_VERSION;
use crate::template::{ChecklistItemDef, Condition, PhaseDef, WorkflowTemplate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// WorkItemStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Active,
    Blocked,
    Cancelled,
    Completed,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemStatus::Active => "active",
            WorkItemStatus::Blocked => "blocked",
            WorkItemStatus::Cancelled => "cancelled",
            WorkItemStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemStatus::Cancelled | WorkItemStatus::Completed)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = crate::error::WorklineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkItemStatus::Active),
            "blocked" => Ok(WorkItemStatus::Blocked),
            "cancelled" => Ok(WorkItemStatus::Cancelled),
            "completed" => Ok(WorkItemStatus::Completed),
            _ => Err(crate::error::WorklineError::Validation(format!(
                "unknown work item status '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// PhaseTransition
// ---------------------------------------------------------------------------

/// One hop in the phase history. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from_phase: String,
    pub to_phase: String,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub automatic: bool,
}

// ---------------------------------------------------------------------------
// ChecklistItemState
// ---------------------------------------------------------------------------

/// A checklist item instance seeded from its template definition when the
/// owning phase is entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItemState {
    pub id: String,
    pub label: String,
    pub required: bool,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl ChecklistItemState {
    pub fn from_def(def: &ChecklistItemDef) -> Self {
        Self {
            id: def.id.clone(),
            label: def.label.clone(),
            required: def.required,
            completed: false,
            completed_at: None,
            condition: def.condition.clone(),
        }
    }
}

pub fn seed_checklist(phase: &PhaseDef) -> Vec<ChecklistItemState> {
    phase.checklist.iter().map(ChecklistItemState::from_def).collect()
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub current_phase_id: String,
    pub checklist: Vec<ChecklistItemState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_results: Vec<QualityGateResult>,
    pub phase_history: Vec<PhaseTransition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
}

// ---------------------------------------------------------------------------
// ComplianceSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSnapshot {
    /// Score from 0 to 100.
    pub score: u32,
    pub rule_set_version: u32,
    pub evaluated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub schema_version: u32,
    pub title: String,
    pub status: WorkItemStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workflow: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<ComplianceSnapshot>,
    /// Opaque extension data. Core logic never introspects it; only
    /// checklist conditions read from it via [`WorkItem::field_value`].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    /// Gate results of past phase instances, kept for audit. Append-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_history: Vec<QualityGateResult>,
}

impl WorkItem {
    /// New item in the first phase of `template`, checklist seeded.
    pub fn new(id: impl Into<String>, title: impl Into<String>, template: &WorkflowTemplate) -> Self {
        let now = Utc::now();
        let first = template.first_phase();
        Self {
            id: id.into(),
            schema_version: CURRENT_SCHEMA_VERSION,
            title: title.into(),
            status: WorkItemStatus::Active,
            created_at: now,
            updated_at: now,
            workflow: WorkflowState {
                workflow_id: template.id.clone(),
                current_phase_id: first.id.clone(),
                checklist: seed_checklist(first),
                gate_results: Vec::new(),
                phase_history: Vec::new(),
                blockers: Vec::new(),
            },
            compliance: None,
            custom_fields: BTreeMap::new(),
            gate_history: Vec::new(),
        }
    }

    /// Bump `updated_at`, keeping it monotonically non-decreasing even if the
    /// wall clock stepped backwards.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }

    pub fn checklist_item(&self, item_id: &str) -> Option<&ChecklistItemState> {
        self.workflow.checklist.iter().find(|i| i.id == item_id)
    }

    pub fn checklist_item_mut(&mut self, item_id: &str) -> Option<&mut ChecklistItemState> {
        self.workflow.checklist.iter_mut().find(|i| i.id == item_id)
    }

    pub fn gate_result(&self, gate_id: &str) -> Option<&QualityGateResult> {
        self.workflow.gate_results.iter().find(|r| r.gate_id == gate_id)
    }

    /// Add or replace the current-phase result for a gate.
    pub fn set_gate_result(&mut self, result: QualityGateResult) {
        self.workflow
            .gate_results
            .retain(|r| r.gate_id != result.gate_id);
        self.workflow.gate_results.push(result);
        self.touch();
    }

    /// Field lookup for condition evaluation: the few built-in projections,
    /// then `custom_fields` by name.
    pub fn field_value(&self, field: &str) -> Option<serde_json::Value> {
        match field {
            "id" => Some(serde_json::Value::String(self.id.clone())),
            "title" => Some(serde_json::Value::String(self.title.clone())),
            "status" => Some(serde_json::Value::String(self.status.as_str().to_string())),
            "phase" => Some(serde_json::Value::String(
                self.workflow.current_phase_id.clone(),
            )),
            _ => self.custom_fields.get(field).cloned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
