use crate::error::{Result, WorklineError};
use crate::gate::GateDef;
use crate::item::WorkItem;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Condition / ConditionOp
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
}

/// Rule deciding whether a checklist item applies to a given work item.
/// Evaluated lazily at validation time, never persisted as applicable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
    pub value: serde_json::Value,
}

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &Condition, item: &WorkItem) -> bool;
}

/// Built-in evaluator dispatching on [`ConditionOp`]. A field missing from
/// the work item makes the condition false for every operator.
pub struct DefaultConditionEvaluator;

impl ConditionEvaluator for DefaultConditionEvaluator {
    fn evaluate(&self, condition: &Condition, item: &WorkItem) -> bool {
        let Some(actual) = item.field_value(&condition.field) else {
            return false;
        };
        match condition.op {
            ConditionOp::Eq => actual == condition.value,
            ConditionOp::Ne => actual != condition.value,
            ConditionOp::Gt => compare_numbers(&actual, &condition.value, |o| o.is_gt()),
            ConditionOp::Gte => compare_numbers(&actual, &condition.value, |o| o.is_ge()),
            ConditionOp::Lt => compare_numbers(&actual, &condition.value, |o| o.is_lt()),
            ConditionOp::Lte => compare_numbers(&actual, &condition.value, |o| o.is_le()),
            ConditionOp::Contains => contains(&actual, &condition.value),
            ConditionOp::In => condition
                .value
                .as_array()
                .map(|candidates| candidates.contains(&actual))
                .unwrap_or(false),
        }
    }
}

fn compare_numbers(
    actual: &serde_json::Value,
    expected: &serde_json::Value,
    check: fn(std::cmp::Ordering) -> bool,
) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).map(check).unwrap_or(false),
        _ => false,
    }
}

fn contains(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    match actual {
        serde_json::Value::String(s) => expected.as_str().map(|e| s.contains(e)).unwrap_or(false),
        serde_json::Value::Array(items) => items.contains(expected),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// ChecklistItemDef / PhaseDef / WorkflowTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChecklistItemDef {
    pub id: String,
    pub label: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub checklist: Vec<ChecklistItemDef>,
    #[serde(default)]
    pub required_gates: Vec<String>,
    #[serde(default)]
    pub minimum_compliance_score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    pub phases: Vec<PhaseDef>,
    #[serde(default)]
    pub gates: Vec<GateDef>,
}

impl WorkflowTemplate {
    pub fn phase(&self, phase_id: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == phase_id)
    }

    pub fn first_phase(&self) -> &PhaseDef {
        // validate() guarantees at least one phase.
        &self.phases[0]
    }

    pub fn gate(&self, gate_id: &str) -> Option<&GateDef> {
        self.gates.iter().find(|g| g.id == gate_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(WorklineError::Validation("template id is empty".into()));
        }
        if self.phases.is_empty() {
            return Err(WorklineError::Validation(format!(
                "template '{}' declares no phases",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.id.as_str()) {
                return Err(WorklineError::Validation(format!(
                    "template '{}' declares phase '{}' more than once",
                    self.id, phase.id
                )));
            }
            if phase.minimum_compliance_score > 100 {
                return Err(WorklineError::Validation(format!(
                    "phase '{}' minimum compliance score exceeds 100",
                    phase.id
                )));
            }
            for gate_id in &phase.required_gates {
                if self.gate(gate_id).is_none() {
                    return Err(WorklineError::Validation(format!(
                        "phase '{}' requires undefined gate '{}'",
                        phase.id, gate_id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TemplateRegistry
// ---------------------------------------------------------------------------

/// Read-only set of workflow templates, loaded once at startup. A custom
/// template on disk overrides a built-in of the same id.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, WorkflowTemplate>,
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        let mut templates = BTreeMap::new();
        for template in [builtin_feature_workflow(), builtin_bug_workflow()] {
            templates.insert(template.id.clone(), template);
        }
        Self { templates }
    }

    /// Built-ins plus custom YAML templates under `{root}/templates/`.
    pub fn load(root: &Path) -> Result<Self> {
        let mut registry = Self::builtin();
        let dir = paths::templates_dir(root);
        if !dir.exists() {
            return Ok(registry);
        }
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let data = std::fs::read_to_string(entry.path())?;
            let template: WorkflowTemplate = serde_yaml::from_str(&data)?;
            template.validate()?;
            registry.templates.insert(template.id.clone(), template);
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Result<&WorkflowTemplate> {
        self.templates
            .get(id)
            .ok_or_else(|| WorklineError::TemplateNotFound(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(|k| k.as_str())
    }
}

// ---------------------------------------------------------------------------
// Built-in templates
// ---------------------------------------------------------------------------

fn builtin_feature_workflow() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "feature-workflow".to_string(),
        name: "Feature".to_string(),
        phases: vec![
            PhaseDef {
                id: "planning".to_string(),
                name: "Planning".to_string(),
                checklist: vec![
                    ChecklistItemDef {
                        id: "define-scope".to_string(),
                        label: "Define scope and goals".to_string(),
                        required: true,
                        condition: None,
                    },
                    ChecklistItemDef {
                        id: "acceptance-criteria".to_string(),
                        label: "Write acceptance criteria".to_string(),
                        required: true,
                        condition: None,
                    },
                    ChecklistItemDef {
                        id: "stakeholder-review".to_string(),
                        label: "Stakeholder review".to_string(),
                        required: false,
                        condition: None,
                    },
                    ChecklistItemDef {
                        id: "security-plan".to_string(),
                        label: "Security review plan".to_string(),
                        required: true,
                        condition: Some(Condition {
                            field: "needs_security_review".to_string(),
                            op: ConditionOp::Eq,
                            value: serde_json::Value::Bool(true),
                        }),
                    },
                ],
                required_gates: Vec::new(),
                minimum_compliance_score: 0,
            },
            PhaseDef {
                id: "design".to_string(),
                name: "Design".to_string(),
                checklist: vec![ChecklistItemDef {
                    id: "design-doc".to_string(),
                    label: "Design document written".to_string(),
                    required: true,
                    condition: None,
                }],
                required_gates: vec!["design-review".to_string()],
                minimum_compliance_score: 0,
            },
            PhaseDef {
                id: "implementation".to_string(),
                name: "Implementation".to_string(),
                checklist: vec![
                    ChecklistItemDef {
                        id: "code-complete".to_string(),
                        label: "Code complete".to_string(),
                        required: true,
                        condition: None,
                    },
                    ChecklistItemDef {
                        id: "tests-added".to_string(),
                        label: "Tests added".to_string(),
                        required: true,
                        condition: None,
                    },
                ],
                required_gates: vec!["build".to_string(), "tests".to_string()],
                minimum_compliance_score: 70,
            },
            PhaseDef {
                id: "complete".to_string(),
                name: "Complete".to_string(),
                checklist: Vec::new(),
                required_gates: Vec::new(),
                minimum_compliance_score: 0,
            },
        ],
        gates: vec![
            GateDef {
                id: "design-review".to_string(),
                gate_type: "human".to_string(),
                description: Some("Design approved by a reviewer".to_string()),
                config: None,
            },
            GateDef {
                id: "build".to_string(),
                gate_type: "shell".to_string(),
                description: Some("Build succeeds".to_string()),
                config: None,
            },
            GateDef {
                id: "tests".to_string(),
                gate_type: "shell".to_string(),
                description: Some("Test suite passes".to_string()),
                config: None,
            },
        ],
    }
}

fn builtin_bug_workflow() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "bug-workflow".to_string(),
        name: "Bug".to_string(),
        phases: vec![
            PhaseDef {
                id: "triage".to_string(),
                name: "Triage".to_string(),
                checklist: vec![
                    ChecklistItemDef {
                        id: "reproduce".to_string(),
                        label: "Reproduction confirmed".to_string(),
                        required: true,
                        condition: None,
                    },
                    ChecklistItemDef {
                        id: "severity".to_string(),
                        label: "Severity assigned".to_string(),
                        required: true,
                        condition: None,
                    },
                ],
                required_gates: Vec::new(),
                minimum_compliance_score: 0,
            },
            PhaseDef {
                id: "fix".to_string(),
                name: "Fix".to_string(),
                checklist: vec![
                    ChecklistItemDef {
                        id: "fix-implemented".to_string(),
                        label: "Fix implemented".to_string(),
                        required: true,
                        condition: None,
                    },
                    ChecklistItemDef {
                        id: "regression-test".to_string(),
                        label: "Regression test added".to_string(),
                        required: true,
                        condition: None,
                    },
                ],
                required_gates: vec!["tests".to_string()],
                minimum_compliance_score: 0,
            },
            PhaseDef {
                id: "verify".to_string(),
                name: "Verify".to_string(),
                checklist: vec![ChecklistItemDef {
                    id: "verified".to_string(),
                    label: "Fix verified on a clean build".to_string(),
                    required: true,
                    condition: None,
                }],
                required_gates: Vec::new(),
                minimum_compliance_score: 0,
            },
            PhaseDef {
                id: "complete".to_string(),
                name: "Complete".to_string(),
                checklist: Vec::new(),
                required_gates: Vec::new(),
                minimum_compliance_score: 0,
            },
        ],
        gates: vec![GateDef {
            id: "tests".to_string(),
            gate_type: "shell".to_string(),
            description: Some("Test suite passes".to_string()),
            config: None,
        }],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn builtin_templates_are_valid() {
        let registry = TemplateRegistry::builtin();
        for id in ["feature-workflow", "bug-workflow"] {
            registry.get(id).unwrap().validate().unwrap();
        }
    }

    #[test]
    fn feature_workflow_phase_order() {
        let registry = TemplateRegistry::builtin();
        let template = registry.get("feature-workflow").unwrap();
        let ids: Vec<_> = template.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["planning", "design", "implementation", "complete"]);
        assert_eq!(template.phase_index("design"), Some(1));
        assert_eq!(template.phase_index("missing"), None);
    }

    #[test]
    fn unknown_template_id_errors() {
        let registry = TemplateRegistry::builtin();
        assert!(matches!(
            registry.get("nope"),
            Err(WorklineError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn custom_template_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let templates_dir = paths::templates_dir(dir.path());
        std::fs::create_dir_all(&templates_dir).unwrap();
        std::fs::write(
            templates_dir.join("feature.yaml"),
            r#"
id: feature-workflow
name: Custom Feature
phases:
  - id: only
    name: Only
"#,
        )
        .unwrap();

        let registry = TemplateRegistry::load(dir.path()).unwrap();
        let template = registry.get("feature-workflow").unwrap();
        assert_eq!(template.name, "Custom Feature");
        assert_eq!(template.phases.len(), 1);
        // Built-ins not overridden survive.
        assert!(registry.get("bug-workflow").is_ok());
    }

    #[test]
    fn invalid_custom_template_is_rejected() {
        let dir = TempDir::new().unwrap();
        let templates_dir = paths::templates_dir(dir.path());
        std::fs::create_dir_all(&templates_dir).unwrap();
        std::fs::write(
            templates_dir.join("broken.yaml"),
            "id: broken\nname: Broken\nphases: []\n",
        )
        .unwrap();
        assert!(TemplateRegistry::load(dir.path()).is_err());
    }

    #[test]
    fn validate_rejects_undefined_required_gate() {
        let template = WorkflowTemplate {
            id: "t".to_string(),
            name: "T".to_string(),
            phases: vec![PhaseDef {
                id: "a".to_string(),
                name: "A".to_string(),
                checklist: Vec::new(),
                required_gates: vec!["ghost".to_string()],
                minimum_compliance_score: 0,
            }],
            gates: Vec::new(),
        };
        assert!(template.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_phase_ids() {
        let phase = PhaseDef {
            id: "a".to_string(),
            name: "A".to_string(),
            checklist: Vec::new(),
            required_gates: Vec::new(),
            minimum_compliance_score: 0,
        };
        let template = WorkflowTemplate {
            id: "t".to_string(),
            name: "T".to_string(),
            phases: vec![phase.clone(), phase],
            gates: Vec::new(),
        };
        assert!(template.validate().is_err());
    }

    mod conditions {
        use super::*;
        use crate::item::WorkItem;

        fn item_with_field(name: &str, value: serde_json::Value) -> WorkItem {
            let registry = TemplateRegistry::builtin();
            let template = registry.get("feature-workflow").unwrap();
            let mut item = WorkItem::new("FEA-001", "Sample", template);
            item.custom_fields.insert(name.to_string(), value);
            item
        }

        fn check(field: &str, op: ConditionOp, value: serde_json::Value, item: &WorkItem) -> bool {
            DefaultConditionEvaluator.evaluate(
                &Condition {
                    field: field.to_string(),
                    op,
                    value,
                },
                item,
            )
        }

        #[test]
        fn eq_and_ne() {
            let item = item_with_field("priority", serde_json::json!("high"));
            assert!(check("priority", ConditionOp::Eq, serde_json::json!("high"), &item));
            assert!(!check("priority", ConditionOp::Eq, serde_json::json!("low"), &item));
            assert!(check("priority", ConditionOp::Ne, serde_json::json!("low"), &item));
        }

        #[test]
        fn numeric_comparisons() {
            let item = item_with_field("estimate", serde_json::json!(8));
            assert!(check("estimate", ConditionOp::Gt, serde_json::json!(5), &item));
            assert!(check("estimate", ConditionOp::Gte, serde_json::json!(8), &item));
            assert!(check("estimate", ConditionOp::Lt, serde_json::json!(13), &item));
            assert!(!check("estimate", ConditionOp::Lte, serde_json::json!(7), &item));
        }

        #[test]
        fn contains_on_strings_and_arrays() {
            let item = item_with_field("tags", serde_json::json!(["backend", "auth"]));
            assert!(check("tags", ConditionOp::Contains, serde_json::json!("auth"), &item));
            assert!(!check("tags", ConditionOp::Contains, serde_json::json!("ui"), &item));

            let item = item_with_field("summary", serde_json::json!("oauth token refresh"));
            assert!(check("summary", ConditionOp::Contains, serde_json::json!("token"), &item));
        }

        #[test]
        fn in_operator() {
            let item = item_with_field("priority", serde_json::json!("high"));
            assert!(check(
                "priority",
                ConditionOp::In,
                serde_json::json!(["high", "critical"]),
                &item
            ));
            assert!(!check(
                "priority",
                ConditionOp::In,
                serde_json::json!(["low"]),
                &item
            ));
        }

        #[test]
        fn missing_field_is_false() {
            let registry = TemplateRegistry::builtin();
            let template = registry.get("feature-workflow").unwrap();
            let item = WorkItem::new("FEA-001", "Sample", template);
            assert!(!check("ghost", ConditionOp::Eq, serde_json::json!(1), &item));
            assert!(!check("ghost", ConditionOp::Ne, serde_json::json!(1), &item));
        }

        #[test]
        fn builtin_fields_visible_to_conditions() {
            let registry = TemplateRegistry::builtin();
            let template = registry.get("feature-workflow").unwrap();
            let item = WorkItem::new("FEA-001", "Sample", template);
            assert!(check("phase", ConditionOp::Eq, serde_json::json!("planning"), &item));
            assert!(check("status", ConditionOp::Eq, serde_json::json!("active"), &item));
        }
    }
}
