//! Wire shapes of the backend API. Field names follow the backend
//! (snake_case); ids on this side of the boundary are always remote ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::{Project, Session, SessionEvent, Task};

/// Hard backend limit on events per append call.
pub const MAX_EVENT_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub focused_seconds: u64,
    pub distraction_count: u32,
    pub is_complete: bool,
}

impl From<&Session> for SessionPayload {
    fn from(session: &Session) -> Self {
        Self {
            start_time: session.start_time,
            end_time: session.end_time,
            duration_seconds: session.duration_seconds,
            focused_seconds: session.focused_seconds.min(session.duration_seconds),
            distraction_count: session.distraction_count,
            is_complete: session.is_complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub focused_seconds: u64,
    pub distraction_count: u32,
    pub is_complete: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub app_name: Option<String>,
    pub duration_seconds: Option<u64>,
    pub metadata_json: Option<Value>,
}

impl From<&SessionEvent> for EventPayload {
    /// The local id and sequence ride along in the metadata so the backend
    /// can drop replays of a batch it already stored.
    fn from(event: &SessionEvent) -> Self {
        let mut metadata = match &event.metadata {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".into(), other.clone());
                map
            }
            None => Map::new(),
        };
        metadata.insert("localId".into(), Value::from(event.id.clone()));
        metadata.insert("sequence".into(), Value::from(event.sequence));

        Self {
            event_type: event.event_type.as_str().to_string(),
            timestamp: event.timestamp,
            app_name: event.app_name.clone(),
            duration_seconds: event.duration_seconds,
            metadata_json: Some(Value::Object(metadata)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<EventPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub id: String,
    pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectPayload {
    pub name: String,
}

impl From<&Project> for ProjectPayload {
    fn from(project: &Project) -> Self {
        Self {
            name: project.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProject {
    pub id: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Remote id of the project.
    pub project_id: Option<String>,
    pub title: String,
    pub estimate_minutes: Option<u32>,
    pub priority: u8,
    pub status: u8,
    pub due_date: Option<DateTime<Utc>>,
    pub sort_order: i64,
}

impl TaskPayload {
    pub fn from_task(task: &Task, remote_project_id: Option<String>) -> Self {
        Self {
            project_id: remote_project_id,
            title: task.title.clone(),
            estimate_minutes: task.estimate_minutes,
            priority: task.priority,
            status: task.status,
            due_date: task.due_date,
            sort_order: task.sort_order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub estimate_minutes: Option<u32>,
    pub priority: u8,
    pub status: u8,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sort_order: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub summary: String,
    #[serde(default)]
    pub is_ai_generated: bool,
}
