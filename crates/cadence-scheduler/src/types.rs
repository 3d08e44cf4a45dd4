use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// How a job's work is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Shell command run through `sh -c`.
    #[default]
    Local,
    /// HTTP request described by [`RemoteProperties`].
    Remote,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobType::Local => "local",
            JobType::Remote => "remote",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(JobType::Local),
            "remote" => Ok(JobType::Remote),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// Request description for a remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProperties {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body: String,
    /// Header name to values. `Content-Type` defaults to `application/json`.
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    /// Response timeout; 0 means the configured default.
    #[serde(default)]
    pub timeout_secs: u64,
    /// Status codes counted as success; empty means `[200]`.
    #[serde(default)]
    pub expected_response_codes: Vec<u16>,
}

impl Default for RemoteProperties {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_method(),
            body: String::new(),
            headers: BTreeMap::new(),
            timeout_secs: 0,
            expected_response_codes: Vec::new(),
        }
    }
}

impl RemoteProperties {
    pub fn is_expected(&self, status: u16) -> bool {
        if self.expected_response_codes.is_empty() {
            status == 200
        } else {
            self.expected_response_codes.contains(&status)
        }
    }
}

/// Run counters and timestamps. Only ever move forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub success_count: u64,
    pub error_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_attempted_run: Option<DateTime<Utc>>,
    /// Runs that reached a terminal outcome, successful or not.
    pub number_of_finished_runs: u64,
}

/// Outcome of one run (retries included).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStat {
    pub job_id: String,
    pub ran_at: DateTime<Utc>,
    pub number_of_retries: u32,
    pub success: bool,
    pub execution_duration_ms: u64,
}

/// Creation payload accepted by [`crate::JobCache::add_job`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewJob {
    pub name: String,
    pub command: String,
    pub owner: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub remote_properties: Option<RemoteProperties>,
    /// `R<n>/<start>/<delay>`; empty for a one-off job.
    pub schedule: String,
    /// ISO-8601 duration bounding how late a retry may start.
    pub epsilon: String,
    pub retries: u32,
    pub parent_jobs: Vec<String>,
    pub on_failure_job: Option<String>,
    pub resume_at_next_scheduled_time: bool,
    /// `"<left> <right>"`; empty disables templating.
    pub template_delimiters: String,
    pub disabled: bool,
}

impl NewJob {
    /// Local jobs need a name and a command, remote jobs a name and a URL.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("name is required".to_string()));
        }
        match self.job_type {
            JobType::Local if self.command.trim().is_empty() => Err(SchedulerError::InvalidJob(
                "local jobs require a command".to_string(),
            )),
            JobType::Remote
                if self
                    .remote_properties
                    .as_ref()
                    .map_or(true, |r| r.url.trim().is_empty()) =>
            {
                Err(SchedulerError::InvalidJob(
                    "remote jobs require remote_properties.url".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Persisted and API-visible form of a job.
///
/// Raw `schedule` and `epsilon` strings are authoritative; the parsed
/// recurrence is rebuilt from them on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub owner: String,
    #[serde(rename = "type", default)]
    pub job_type: JobType,
    #[serde(default)]
    pub remote_properties: Option<RemoteProperties>,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub epsilon: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub parent_jobs: Vec<String>,
    #[serde(default)]
    pub dependent_jobs: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub on_failure_job: Option<String>,
    #[serde(default)]
    pub resume_at_next_scheduled_time: bool,
    #[serde(default)]
    pub template_delimiters: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub stats: Vec<JobStat>,
    pub created_at: DateTime<Utc>,
}
