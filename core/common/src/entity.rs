//! Typed views of the domain records kept offline.
//!
//! Records are full-record upserts: every field the remote service returns
//! is retained in `extra` so that a local save never drops server data.
//! Conflicts between writes are resolved last-write-wins at whole-record
//! granularity; there is no version field.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::types::EntityKind;

/// A domain record with a stable, caller-assigned identifier.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The table this record lives in.
    const KIND: EntityKind;

    /// Natural identifier (primary key).
    fn id(&self) -> &str;

    /// Timestamp stamped by the local store on the last local write.
    fn local_updated_at(&self) -> Option<DateTime<Utc>>;
}

/// Identifier as it appears on the wire: a JSON string or integer.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Int(n) => n.to_string(),
        }
    }
}

/// Accepts identifiers sent as JSON strings or integers.
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_updated_at: Option<DateTime<Utc>>,
    /// Every other field, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            status: "NEW".to_string(),
            project_code: None,
            local_updated_at: None,
            extra: Map::new(),
        }
    }
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> &str {
        &self.task_id
    }

    fn local_updated_at(&self) -> Option<DateTime<Utc>> {
        self.local_updated_at
    }
}

/// A project, keyed by its short code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_code: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Project {
    pub fn new(project_code: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            project_code: project_code.into(),
            project_name: project_name.into(),
            status: "ACTIVE".to_string(),
            local_updated_at: None,
            extra: Map::new(),
        }
    }
}

impl Entity for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn id(&self) -> &str {
        &self.project_code
    }

    fn local_updated_at(&self) -> Option<DateTime<Utc>> {
        self.local_updated_at
    }
}

/// A backlog bug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bug {
    #[serde(deserialize_with = "deserialize_id")]
    pub bug_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Bug {
    pub fn new(bug_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            bug_id: bug_id.into(),
            title: title.into(),
            status: "open".to_string(),
            project_id: None,
            local_updated_at: None,
            extra: Map::new(),
        }
    }
}

impl Entity for Bug {
    const KIND: EntityKind = EntityKind::Bug;

    fn id(&self) -> &str {
        &self.bug_id
    }

    fn local_updated_at(&self) -> Option<DateTime<Utc>> {
        self.local_updated_at
    }
}

/// A backlog requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    #[serde(deserialize_with = "deserialize_id")]
    pub requirement_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Requirement {
    pub fn new(requirement_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            requirement_id: requirement_id.into(),
            title: title.into(),
            status: "backlog".to_string(),
            project_id: None,
            local_updated_at: None,
            extra: Map::new(),
        }
    }
}

impl Entity for Requirement {
    const KIND: EntityKind = EntityKind::Requirement;

    fn id(&self) -> &str {
        &self.requirement_id
    }

    fn local_updated_at(&self) -> Option<DateTime<Utc>> {
        self.local_updated_at
    }
}
