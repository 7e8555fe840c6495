//! Entity and operation kinds shared by the store and the sync engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// The kinds of domain records kept offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Task,
    Project,
    Bug,
    Requirement,
}

impl EntityKind {
    /// Every entity kind, in table creation order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Task,
        EntityKind::Project,
        EntityKind::Bug,
        EntityKind::Requirement,
    ];

    /// Local table name. Also the envelope key of the remote collection listing.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Project => "projects",
            EntityKind::Bug => "bugs",
            EntityKind::Requirement => "requirements",
        }
    }

    /// JSON field holding the record's natural identifier.
    pub fn key_field(&self) -> &'static str {
        match self {
            EntityKind::Task => "taskId",
            EntityKind::Project => "projectCode",
            EntityKind::Bug => "bugId",
            EntityKind::Requirement => "requirementId",
        }
    }

    /// JSON field holding the parent/grouping identifier, if the kind has one.
    pub fn parent_field(&self) -> Option<&'static str> {
        match self {
            EntityKind::Task => Some("projectCode"),
            EntityKind::Project => None,
            EntityKind::Bug | EntityKind::Requirement => Some("projectId"),
        }
    }

    /// Remote collection path.
    pub fn collection_path(&self) -> &'static str {
        match self {
            EntityKind::Task => "/api/tasks",
            EntityKind::Project => "/api/projects",
            EntityKind::Bug => "/api/backlog/bugs",
            EntityKind::Requirement => "/api/backlog/requirements",
        }
    }

    /// Remote path of a single record.
    pub fn item_path(&self, id: &str) -> String {
        format!("{}/{}", self.collection_path(), id)
    }

    /// Extract the record identifier from a JSON record or delete payload.
    ///
    /// Identifiers may be strings or integers on the wire; both are keyed by
    /// their canonical string form.
    pub fn record_id(&self, record: &Value) -> Result<String> {
        let field = self.key_field();
        match record.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(other) => Err(Error::InvalidInput(format!(
                "{} must be a non-empty string or integer, got {}",
                field, other
            ))),
            None => Err(Error::InvalidInput(format!(
                "{} record is missing {}",
                self, field
            ))),
        }
    }

    fn operation_suffix(&self) -> &'static str {
        match self {
            EntityKind::Task => "TASK",
            EntityKind::Project => "PROJECT",
            EntityKind::Bug => "BUG",
            EntityKind::Requirement => "REQUIREMENT",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Task => "task",
            EntityKind::Project => "project",
            EntityKind::Bug => "bug",
            EntityKind::Requirement => "requirement",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "task" | "tasks" => Ok(EntityKind::Task),
            "project" | "projects" => Ok(EntityKind::Project),
            "bug" | "bugs" => Ok(EntityKind::Bug),
            "requirement" | "requirements" => Ok(EntityKind::Requirement),
            _ => Err(Error::InvalidInput(format!("Unknown entity kind: {}", s))),
        }
    }
}

/// Mutation recorded in the pending-operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    fn prefix(&self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }
}

/// An operation kind such as `CREATE_TASK` or `DELETE_BUG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationKind {
    pub action: Action,
    pub entity: EntityKind,
}

impl OperationKind {
    pub fn new(action: Action, entity: EntityKind) -> Self {
        Self { action, entity }
    }

    pub fn create(entity: EntityKind) -> Self {
        Self::new(Action::Create, entity)
    }

    pub fn update(entity: EntityKind) -> Self {
        Self::new(Action::Update, entity)
    }

    pub fn delete(entity: EntityKind) -> Self {
        Self::new(Action::Delete, entity)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.action.prefix(), self.entity.operation_suffix())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || Error::UnknownOperation(s.to_string());
        let (prefix, suffix) = s.split_once('_').ok_or_else(unknown)?;

        let action = match prefix {
            "CREATE" => Action::Create,
            "UPDATE" => Action::Update,
            "DELETE" => Action::Delete,
            _ => return Err(unknown()),
        };

        let entity = EntityKind::ALL
            .into_iter()
            .find(|kind| kind.operation_suffix() == suffix)
            .ok_or_else(unknown)?;

        Ok(Self { action, entity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_operation_kind_parse() {
        let op: OperationKind = "DELETE_BUG".parse().unwrap();
        assert_eq!(op, OperationKind::delete(EntityKind::Bug));
        assert_eq!(op.to_string(), "DELETE_BUG");
    }

    #[test]
    fn test_unknown_operation_rejected() {
        for raw in ["ARCHIVE_TASK", "CREATE_EPIC", "create_task", "CREATE", ""] {
            let err = raw.parse::<OperationKind>().unwrap_err();
            assert!(matches!(err, Error::UnknownOperation(_)), "{raw}");
        }
    }

    #[test]
    fn test_record_id_accepts_strings_and_integers() {
        assert_eq!(
            EntityKind::Task.record_id(&json!({"taskId": 42})).unwrap(),
            "42"
        );
        assert_eq!(
            EntityKind::Project.record_id(&json!({"projectCode": "MPM"})).unwrap(),
            "MPM"
        );
        assert!(EntityKind::Bug.record_id(&json!({"title": "x"})).is_err());
        assert!(EntityKind::Bug.record_id(&json!({"bugId": ""})).is_err());
        assert!(EntityKind::Bug.record_id(&json!({"bugId": null})).is_err());
    }

    #[test]
    fn test_item_paths() {
        assert_eq!(EntityKind::Task.item_path("7"), "/api/tasks/7");
        assert_eq!(
            EntityKind::Requirement.item_path("REQ-1"),
            "/api/backlog/requirements/REQ-1"
        );
    }

    proptest! {
        #[test]
        fn prop_parse_accepts_only_canonical_names(raw in "[A-Z_]{0,24}") {
            match raw.parse::<OperationKind>() {
                Ok(op) => prop_assert_eq!(op.to_string(), raw),
                Err(e) => prop_assert!(matches!(e, Error::UnknownOperation(_))),
            }
        }
    }
}
