use crate::error::{Result, WorklineError};
use crate::item::WorkItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// GateDef
// ---------------------------------------------------------------------------

/// A quality gate declared by a workflow template. `gate_type` names an
/// evaluator in the [`GateRegistry`]; the engine never implements gate logic
/// itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateDef {
    pub id: String,
    pub gate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque evaluator parameters, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// GateBypass / QualityGateResult
// ---------------------------------------------------------------------------

/// Audited override of a gate. Immutable once recorded; satisfies the gate
/// for transition purposes for this gate instance only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateBypass {
    pub reason: String,
    pub by: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub gate_id: String,
    pub passed: bool,
    /// Score from 0 to 100.
    pub score: u32,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<GateBypass>,
}

impl QualityGateResult {
    pub fn is_satisfied(&self) -> bool {
        self.passed || self.bypass.is_some()
    }
}

// ---------------------------------------------------------------------------
// GateEvaluator / GateRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub passed: bool,
    pub score: u32,
    pub details: String,
}

/// External check implementation. The engine treats it as an opaque function;
/// an `Err` from `evaluate` means the check could not run, which is distinct
/// from a failed gate.
pub trait GateEvaluator: Send + Sync {
    fn evaluate(&self, gate: &GateDef, item: &WorkItem) -> Result<GateOutcome>;
}

/// Maps a stable gate-type identifier to its evaluator. Populated at process
/// start, read-only afterwards.
#[derive(Default)]
pub struct GateRegistry {
    evaluators: HashMap<String, Box<dyn GateEvaluator>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gate_type: impl Into<String>, evaluator: Box<dyn GateEvaluator>) {
        self.evaluators.insert(gate_type.into(), evaluator);
    }

    pub fn get(&self, gate_type: &str) -> Option<&dyn GateEvaluator> {
        self.evaluators.get(gate_type).map(|b| b.as_ref())
    }

    pub fn run(&self, gate: &GateDef, item: &WorkItem) -> Result<GateOutcome> {
        let evaluator =
            self.get(&gate.gate_type)
                .ok_or_else(|| WorklineError::GateCheckFailed {
                    gate: gate.id.clone(),
                    reason: format!("no evaluator registered for type '{}'", gate.gate_type),
                })?;
        evaluator
            .evaluate(gate, item)
            .map_err(|e| WorklineError::GateCheckFailed {
                gate: gate.id.clone(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// ActorResolver
// ---------------------------------------------------------------------------

/// Supplies the identity recorded in audit events for operations whose
/// callers do not attribute themselves.
pub trait ActorResolver: Send + Sync {
    fn current_actor(&self) -> String;
}

/// Default resolver: `$USER`, falling back to `unknown`.
pub struct EnvActorResolver;

impl ActorResolver for EnvActorResolver {
    fn current_actor(&self) -> String {
        std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
