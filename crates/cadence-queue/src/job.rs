//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job Identifier (assigned by the store, monotonically increasing)
pub type JobId = i64;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be leased (possibly not yet visible)
    Pending,
    /// Held by a worker until `lease_expires_at`
    Leased,
    /// Successfully processed
    Done,
    /// Retry budget exhausted; only reachable through the DLQ
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Done => "done",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Terminal jobs no longer participate in idempotent enqueue or leasing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::DeadLetter)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "done" => Ok(Self::Done),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A persisted job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    pub priority: i32,
    pub visible_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether `owner` currently holds an unexpired lease on this job.
    pub fn is_leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased
            && self.lease_owner.as_deref() == Some(owner)
            && self.lease_expires_at.map(|t| t > now).unwrap_or(false)
    }
}

/// Producer-side description of a job to insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Defaults to the enqueue time when absent
    #[serde(default)]
    pub visible_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: 0,
            idempotency_key: None,
            visible_at: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn visible_at(mut self, at: DateTime<Utc>) -> Self {
        self.visible_at = Some(at);
        self
    }
}
