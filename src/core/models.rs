use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Format of a record label: the UTC start time with second resolution.
pub const LABEL_FORMAT: &str = "%Y%m%d%H%M%S";

/// Returncode recorded when the backup process could not be run at all.
pub const SPAWN_FAILURE_RETURNCODE: i32 = -1;

const SUPPORTED_COMMAND: &str = "backup";
const DEFAULT_BACKUP_TYPE: &str = "full";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid command ({0}), supported commands: backup")]
    InvalidCommand(String),
    #[error("Backup {label} cannot move from {from} to {to}")]
    InvalidTransition {
        label: String,
        from: BackupStatus,
        to: BackupStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Requested,
    Running,
    Finished,
    Error,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
        }
    }

    /// Case-insensitive parse, used for the `status` query filter.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "REQUESTED" => Some(Self::Requested),
            "RUNNING" => Some(Self::Running),
            "FINISHED" => Some(Self::Finished),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /backups`. Both fields are optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, rename = "type")]
    pub backup_type: Option<String>,
}

/// A validated backup request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRequest {
    pub command: String,
    #[serde(rename = "type")]
    pub backup_type: String,
}

impl BackupRequest {
    pub fn from_body(body: Option<RequestBody>) -> Result<Self, RecordError> {
        let body = body.unwrap_or_default();
        let command = body.command.unwrap_or_else(|| SUPPORTED_COMMAND.to_string());
        if command != SUPPORTED_COMMAND {
            return Err(RecordError::InvalidCommand(command));
        }

        Ok(Self {
            command,
            backup_type: body
                .backup_type
                .unwrap_or_else(|| DEFAULT_BACKUP_TYPE.to_string()),
        })
    }
}

impl Default for BackupRequest {
    fn default() -> Self {
        Self {
            command: SUPPORTED_COMMAND.to_string(),
            backup_type: DEFAULT_BACKUP_TYPE.to_string(),
        }
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub fn label_for(started: DateTime<Utc>) -> String {
    started.format(LABEL_FORMAT).to_string()
}

/// One backup attempt, either requested through the API or discovered
/// through reconciliation.
#[derive(Debug, Clone)]
pub struct JobRecord {
    label: String,
    pub request: Option<BackupRequest>,
    status: BackupStatus,
    pub started: DateTime<Utc>,
    finished: Option<DateTime<Utc>>,
    returncode: Option<i32>,
    pub process_id: Option<u32>,
    pub external_metadata: Map<String, Value>,
}

impl JobRecord {
    pub fn requested(request: BackupRequest, started: DateTime<Utc>) -> Self {
        Self {
            label: label_for(started),
            request: Some(request),
            status: BackupStatus::Requested,
            started,
            finished: None,
            returncode: None,
            process_id: None,
            external_metadata: Map::new(),
        }
    }

    /// A backup known only from the external history listing.
    pub fn discovered(started: DateTime<Utc>, finished: DateTime<Utc>) -> Self {
        Self {
            label: label_for(started),
            request: None,
            status: BackupStatus::Finished,
            started,
            finished: Some(finished),
            returncode: None,
            process_id: None,
            external_metadata: Map::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> BackupStatus {
        self.status
    }

    pub fn finished(&self) -> Option<DateTime<Utc>> {
        self.finished
    }

    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    /// The identifier the external tool uses for this backup, if reconciled.
    pub fn external_label(&self) -> Option<&str> {
        self.external_metadata.get("label").and_then(Value::as_str)
    }

    pub fn mark_running(&mut self, process_id: Option<u32>) -> Result<(), RecordError> {
        self.transition(BackupStatus::Requested, BackupStatus::Running)?;
        self.process_id = process_id;
        Ok(())
    }

    /// Move a running record to its terminal state based on `returncode`.
    pub fn complete(&mut self, returncode: i32) -> Result<(), RecordError> {
        let to = if returncode == 0 {
            BackupStatus::Finished
        } else {
            BackupStatus::Error
        };
        self.transition(BackupStatus::Running, to)?;
        self.returncode = Some(returncode);
        self.finished = Some(now());
        Ok(())
    }

    /// Terminal failure for a backup whose process never started. Allowed
    /// from REQUESTED and RUNNING; the record passes through RUNNING.
    pub fn fail_to_start(&mut self) -> Result<(), RecordError> {
        if self.status == BackupStatus::Requested {
            self.mark_running(None)?;
        }
        self.complete(SPAWN_FAILURE_RETURNCODE)
    }

    fn transition(&mut self, from: BackupStatus, to: BackupStatus) -> Result<(), RecordError> {
        if self.status != from {
            return Err(RecordError::InvalidTransition {
                label: self.label.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            label: self.label.clone(),
            status: self.status,
            started: self.started,
            finished: self.finished,
            external_label: self.external_label().map(str::to_string),
        }
    }

    pub fn details(&self) -> BackupDetails {
        let now = now();
        BackupDetails {
            summary: self.summary(),
            request: self.request.clone(),
            returncode: self.returncode,
            process_id: self.process_id,
            duration: seconds(self.finished.unwrap_or(now) - self.started),
            age: seconds(now - self.started),
            external_metadata: self.external_metadata.clone(),
        }
    }
}

fn seconds(delta: chrono::TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSummary {
    pub label: String,
    pub status: BackupStatus,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub external_label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupDetails {
    #[serde(flatten)]
    pub summary: BackupSummary,
    pub request: Option<BackupRequest>,
    pub returncode: Option<i32>,
    pub process_id: Option<u32>,
    /// Seconds between start and finish, or start and now while running.
    pub duration: f64,
    /// Seconds since the backup started.
    pub age: f64,
    pub external_metadata: Map<String, Value>,
}
