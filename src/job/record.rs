//! Job record definitions.
//!
//! - `JobStatus`: lifecycle status of a job
//! - `CallableRef`: opaque reference to the unit of work
//! - `JobRecord`: the durable representation stored as a hash

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{retention_from_secs, retention_to_secs};
use crate::error::JobError;

const FIELD_STATUS: &str = "status";
const FIELD_ORIGIN: &str = "origin";
const FIELD_DATA: &str = "data";
const FIELD_DESCRIPTION: &str = "description";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_SCHEDULED_ON: &str = "scheduled_on";
const FIELD_ENQUEUED_AT: &str = "enqueued_at";
const FIELD_STARTED_AT: &str = "started_at";
const FIELD_ENDED_AT: &str = "ended_at";
const FIELD_TIMEOUT: &str = "timeout";
const FIELD_RESULT_TTL: &str = "result_ttl";
const FIELD_FAILURE_TTL: &str = "failure_ttl";
const FIELD_META: &str = "meta";

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the registry for its due time.
    Scheduled,
    /// Pushed onto its execution queue.
    Queued,
    /// Picked up by a worker.
    Started,
    Finished,
    Failed,
    /// Interrupted on request while running.
    Stopped,
    /// Withdrawn before execution started.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Scheduled,
        JobStatus::Queued,
        JobStatus::Started,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Stopped,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped | JobStatus::Cancelled
        )
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
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Reference to the unit of work: a function path plus its arguments.
///
/// The scheduler never evaluates it; it is stored and handed to workers as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableRef {
    /// Import path of the function, e.g. `app.jobs.sleep`.
    pub func: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl CallableRef {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// Renders `func(arg, ..., key=value)`.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        parts.extend(self.kwargs.iter().map(|(k, v)| format!("{}={}", k, v)));
        format!("{}({})", self.func, parts.join(", "))
    }
}

/// Timing defaults applied to jobs that do not override them.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    pub queue: String,
    pub timeout: Duration,
    pub result_ttl: Option<Duration>,
    pub failure_ttl: Option<Duration>,
}

impl From<&crate::config::SchedulerConfig> for JobDefaults {
    fn from(config: &crate::config::SchedulerConfig) -> Self {
        Self {
            queue: config.default_queue.clone(),
            timeout: config.default_timeout,
            result_ttl: config.default_result_ttl,
            failure_ttl: config.default_failure_ttl,
        }
    }
}

/// Durable representation of a single job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Immutable identifier.
    pub id: String,
    pub callable: CallableRef,
    /// Execution queue the job is promoted into.
    pub origin: String,
    pub status: JobStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// When the job was registered for deferred execution.
    pub scheduled_on: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub timeout: Duration,
    /// Retention after success. `None` keeps the record forever.
    pub result_ttl: Option<Duration>,
    /// Retention after failure. `None` keeps the record forever.
    pub failure_ttl: Option<Duration>,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl JobRecord {
    /// Creates a queued job with a fresh id and the given defaults.
    pub fn new(callable: CallableRef, defaults: &JobDefaults) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: callable.describe(),
            callable,
            origin: defaults.queue.clone(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            scheduled_on: None,
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            timeout: defaults.timeout,
            result_ttl: defaults.result_ttl,
            failure_ttl: defaults.failure_ttl,
            meta: serde_json::Map::new(),
        }
    }

    /// Retention that applies once the job reaches `status`.
    pub fn retention_for(&self, status: JobStatus) -> Option<Duration> {
        match retention_field(status) {
            Some(FIELD_RESULT_TTL) => self.result_ttl,
            Some(FIELD_FAILURE_TTL) => self.failure_ttl,
            _ => None,
        }
    }

    /// Flattens the record into hash fields.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>, JobError> {
        let mut fields = vec![
            (FIELD_STATUS.to_string(), self.status.to_string()),
            (FIELD_ORIGIN.to_string(), self.origin.clone()),
            (FIELD_DATA.to_string(), serde_json::to_string(&self.callable)?),
            (FIELD_DESCRIPTION.to_string(), self.description.clone()),
            (FIELD_CREATED_AT.to_string(), format_time(&self.created_at)),
            (FIELD_TIMEOUT.to_string(), self.timeout.as_secs().to_string()),
            (
                FIELD_RESULT_TTL.to_string(),
                retention_to_secs(self.result_ttl).to_string(),
            ),
            (
                FIELD_FAILURE_TTL.to_string(),
                retention_to_secs(self.failure_ttl).to_string(),
            ),
            (FIELD_META.to_string(), serde_json::to_string(&self.meta)?),
        ];

        let optional = [
            (FIELD_SCHEDULED_ON, &self.scheduled_on),
            (FIELD_ENQUEUED_AT, &self.enqueued_at),
            (FIELD_STARTED_AT, &self.started_at),
            (FIELD_ENDED_AT, &self.ended_at),
        ];
        for (name, value) in optional {
            if let Some(ts) = value {
                fields.push((name.to_string(), format_time(ts)));
            }
        }

        Ok(fields)
    }

    /// Rebuilds a record from hash fields.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Deserialization` if any field is missing or malformed.
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self, JobError> {
        let corrupt = |reason: String| JobError::Deserialization {
            job_id: id.to_string(),
            reason,
        };
        let required = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| corrupt(format!("missing field '{}'", name)))
        };
        let time = |name: &str| -> Result<Option<DateTime<Utc>>, JobError> {
            match fields.get(name) {
                None => Ok(None),
                Some(raw) => parse_time(raw)
                    .map(Some)
                    .map_err(|e| corrupt(format!("field '{}': {}", name, e))),
            }
        };
        let seconds = |name: &str| -> Result<i64, JobError> {
            let raw = required(name)?;
            raw.parse()
                .map_err(|_| corrupt(format!("field '{}' is not an integer: '{}'", name, raw)))
        };

        let status: JobStatus = required(FIELD_STATUS)?.parse().map_err(corrupt)?;
        let callable: CallableRef = serde_json::from_str(required(FIELD_DATA)?)
            .map_err(|e| corrupt(format!("callable reference: {}", e)))?;
        let meta = match fields.get(FIELD_META) {
            Some(raw) => serde_json::from_str(raw).map_err(|e| corrupt(format!("meta: {}", e)))?,
            None => serde_json::Map::new(),
        };
        let created_at = time(FIELD_CREATED_AT)?
            .ok_or_else(|| corrupt(format!("missing field '{}'", FIELD_CREATED_AT)))?;
        let timeout = u64::try_from(seconds(FIELD_TIMEOUT)?)
            .map_err(|_| corrupt("negative timeout".to_string()))?;

        Ok(Self {
            id: id.to_string(),
            description: fields
                .get(FIELD_DESCRIPTION)
                .cloned()
                .unwrap_or_else(|| callable.describe()),
            callable,
            origin: required(FIELD_ORIGIN)?.clone(),
            status,
            created_at,
            scheduled_on: time(FIELD_SCHEDULED_ON)?,
            enqueued_at: time(FIELD_ENQUEUED_AT)?,
            started_at: time(FIELD_STARTED_AT)?,
            ended_at: time(FIELD_ENDED_AT)?,
            timeout: Duration::from_secs(timeout),
            result_ttl: retention_from_secs(seconds(FIELD_RESULT_TTL)?),
            failure_ttl: retention_from_secs(seconds(FIELD_FAILURE_TTL)?),
            meta,
        })
    }

    /// JSON view used by the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status,
            "origin": self.origin,
            "description": self.description,
            "callable": self.callable,
            "created_at": format_time(&self.created_at),
            "scheduled_on": self.scheduled_on.as_ref().map(format_time),
            "enqueued_at": self.enqueued_at.as_ref().map(format_time),
            "started_at": self.started_at.as_ref().map(format_time),
            "ended_at": self.ended_at.as_ref().map(format_time),
            "timeout": self.timeout.as_secs(),
            "result_ttl": retention_to_secs(self.result_ttl),
            "failure_ttl": retention_to_secs(self.failure_ttl),
            "meta": self.meta,
        })
    }
}

/// Name of the hash field holding the status.
pub(crate) fn status_field() -> &'static str {
    FIELD_STATUS
}

/// Name of the timestamp field stamped when a job enters `status`.
pub(crate) fn timestamp_field(status: JobStatus) -> Option<&'static str> {
    match status {
        JobStatus::Scheduled => None,
        JobStatus::Queued => Some(FIELD_ENQUEUED_AT),
        JobStatus::Started => Some(FIELD_STARTED_AT),
        _ => Some(FIELD_ENDED_AT),
    }
}

/// Name of the retention field that governs expiry once a job enters `status`.
pub(crate) fn retention_field(status: JobStatus) -> Option<&'static str> {
    match status {
        JobStatus::Finished | JobStatus::Cancelled => Some(FIELD_RESULT_TTL),
        JobStatus::Failed | JobStatus::Stopped => Some(FIELD_FAILURE_TTL),
        _ => None,
    }
}

pub(crate) fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}
