//! Append-only session event log entries.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sync::SyncStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Start,
    Pause,
    Resume,
    Stop,
    Distraction,
    Idle,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::Pause => "PAUSE",
            EventType::Resume => "RESUME",
            EventType::Stop => "STOP",
            EventType::Distraction => "DISTRACTION",
            EventType::Idle => "IDLE",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "START" => Ok(EventType::Start),
            "PAUSE" => Ok(EventType::Pause),
            "RESUME" => Ok(EventType::Resume),
            "STOP" => Ok(EventType::Stop),
            "DISTRACTION" => Ok(EventType::Distraction),
            "IDLE" => Ok(EventType::Idle),
            other => Err(anyhow!("unknown session event type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: String,
    pub session_id: String,
    /// 1-based position in the session's log.
    pub sequence: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub app_name: Option<String>,
    pub duration_seconds: Option<u64>,
    pub metadata: Option<Value>,
    pub sync_status: SyncStatus,
}

/// An event that has not been written yet; the log assigns id and sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub app_name: Option<String>,
    pub duration_seconds: Option<u64>,
    pub metadata: Option<Value>,
}

impl NewEvent {
    pub fn lifecycle(event_type: EventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            timestamp,
            app_name: None,
            duration_seconds: None,
            metadata: None,
        }
    }

    pub fn distraction(
        timestamp: DateTime<Utc>,
        app_name: impl Into<String>,
        duration_seconds: u64,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            event_type: EventType::Distraction,
            timestamp,
            app_name: Some(app_name.into()),
            duration_seconds: Some(duration_seconds),
            metadata,
        }
    }

    pub fn idle(timestamp: DateTime<Utc>, duration_seconds: u64) -> Self {
        Self {
            event_type: EventType::Idle,
            timestamp,
            app_name: None,
            duration_seconds: Some(duration_seconds),
            metadata: None,
        }
    }
}
