use crate::error::{Result, WorklineError};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Run the migration chain on a raw work item record, from `from` up to
/// [`CURRENT_SCHEMA_VERSION`]. A record newer than this build understands is
/// an error for that record only; other records stay usable.
///
/// When the schema changes, add a match arm:
///
/// ```rust,ignore
/// 1 => migrate_v1_to_v2(value)?,
/// ```
pub fn migrate_item(mut value: serde_json::Value, from: u32, id: &str) -> Result<serde_json::Value> {
    if from > CURRENT_SCHEMA_VERSION {
        return Err(WorklineError::SchemaMigration {
            id: id.to_string(),
            version: from,
            reason: format!("newer than supported schema {CURRENT_SCHEMA_VERSION}"),
        });
    }
    let mut version = from;
    while version < CURRENT_SCHEMA_VERSION {
        value = match version {
            0 => migrate_v0_to_v1(value, id)?,
            _ => unreachable!("no migration from version {version}"),
        };
        version += 1;
    }
    Ok(value)
}

/// v0 records predate the `status` field and the explicit version marker.
fn migrate_v0_to_v1(mut value: serde_json::Value, id: &str) -> Result<serde_json::Value> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| WorklineError::SchemaMigration {
            id: id.to_string(),
            version: 0,
            reason: "record is not a JSON object".to_string(),
        })?;
    obj.entry("status")
        .or_insert(serde_json::Value::String("active".to_string()));
    obj.insert("schema_version".to_string(), serde_json::json!(1));
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_version_is_a_no_op() {
        let value = serde_json::json!({"id": "FEA-001", "schema_version": 1});
        let migrated = migrate_item(value.clone(), 1, "FEA-001").unwrap();
        assert_eq!(migrated, value);
    }

    #[test]
    fn v0_gains_status_and_version() {
        let value = serde_json::json!({"id": "FEA-001", "title": "Old"});
        let migrated = migrate_item(value, 0, "FEA-001").unwrap();
        assert_eq!(migrated["status"], "active");
        assert_eq!(migrated["schema_version"], 1);
        assert_eq!(migrated["title"], "Old");
    }

    #[test]
    fn v0_existing_status_untouched() {
        let value = serde_json::json!({"id": "BUG-002", "status": "blocked"});
        let migrated = migrate_item(value, 0, "BUG-002").unwrap();
        assert_eq!(migrated["status"], "blocked");
    }

    #[test]
    fn future_version_is_rejected() {
        let value = serde_json::json!({"id": "FEA-001"});
        let err = migrate_item(value, CURRENT_SCHEMA_VERSION + 1, "FEA-001").unwrap_err();
        assert!(matches!(err, WorklineError::SchemaMigration { .. }));
    }

    #[test]
    fn non_object_record_fails_migration() {
        let err = migrate_item(serde_json::json!([1, 2]), 0, "FEA-001").unwrap_err();
        assert!(matches!(err, WorklineError::SchemaMigration { .. }));
    }
}
