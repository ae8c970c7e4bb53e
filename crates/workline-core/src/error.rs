use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorklineError {
    #[error("work item not found: {0}")]
    ItemNotFound(String),

    #[error("work item already exists: {0}")]
    ItemExists(String),

    #[error("workflow template not found: {0}")]
    TemplateNotFound(String),

    #[error("phase '{phase}' not defined in template '{template}'")]
    PhaseNotFound { phase: String, template: String },

    #[error("quality gate not found: {0}")]
    GateNotFound(String),

    #[error("checklist item not found: {0}")]
    ChecklistItemNotFound(String),

    #[error("invalid work item id '{0}': expected PREFIX-NNN")]
    InvalidId(String),

    #[error("invalid collection name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidCollection(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("could not acquire store lock within {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("path escapes store root: {0}")]
    PathTraversal(String),

    #[error("schema migration failed for '{id}' at version {version}: {reason}")]
    SchemaMigration {
        id: String,
        version: u32,
        reason: String,
    },

    #[error("filter on '{0}' is not supported by the index projection")]
    UnsupportedFilter(String),

    #[error("savepoint not found: {0}")]
    SavepointNotFound(String),

    #[error("gate check '{gate}' failed to run: {reason}")]
    GateCheckFailed { gate: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, WorklineError>;
