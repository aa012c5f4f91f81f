//! Job model: submissions, queued records, and the status state machine.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Wire format for job timestamps, UTC.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A UTC instant with nanosecond resolution.
///
/// Serializes as `"YYYY-MM-DD HH:MM:SS.mmm"`; the string form truncates to
/// milliseconds and sorts lexicographically in chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        // timestamp_nanos_opt is Some for any date before the year 2262
        Timestamp(Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    fn as_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_datetime().format(TIME_FORMAT))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.as_datetime().format(TIME_FORMAT))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let parsed = NaiveDateTime::parse_from_str(&raw, TIME_FORMAT)
            .map_err(serde::de::Error::custom)?;
        let nanos = parsed
            .and_utc()
            .timestamp_nanos_opt()
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))?;
        Ok(Timestamp(nanos))
    }
}

/// base64 wire encoding for byte-string fields.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Submitted but not yet entered into the queue.
    Waiting,
    /// Placed into the execution queue.
    Queued,
    /// Claimed by an executor and running.
    Processing,
    /// Completed with a zero exit code.
    Done,
    /// Failed, or returned a non-zero exit code without a kill request.
    Error,
    /// Terminated at the user's request.
    Killed,
    /// Stuck, usually while fetching dependencies.
    Stalled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Done | Status::Error | Status::Killed | Status::Stalled
        )
    }

    /// Whether a transition from this state to `target` is a valid edge.
    pub fn can_transition_to(&self, target: Status) -> bool {
        match (self, target) {
            (Status::Waiting, Status::Queued) => true,
            (Status::Queued, Status::Processing) => true,
            (Status::Queued, Status::Killed) => true,
            (Status::Processing, Status::Done) => true,
            (Status::Processing, Status::Error) => true,
            (Status::Processing, Status::Killed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Waiting => "waiting",
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Done => "done",
            Status::Error => "error",
            Status::Killed => "killed",
            Status::Stalled => "stalled",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Status::Waiting),
            "queued" => Ok(Status::Queued),
            "processing" => Ok(Status::Processing),
            "done" => Ok(Status::Done),
            "error" => Ok(Status::Error),
            "killed" => Ok(Status::Killed),
            "stalled" => Ok(Status::Stalled),
            other => Err(format!("unknown status [{}]", other)),
        }
    }
}

/// Where a job's result bytes are read from once it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSource {
    /// The captured standard output stream.
    Stdout,
    /// A file path inside the container.
    File(String),
}

impl ResultSource {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "stdout" {
            return Some(ResultSource::Stdout);
        }
        raw.strip_prefix("file:")
            .map(|path| ResultSource::File(path.to_string()))
    }
}

impl std::fmt::Display for ResultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultSource::Stdout => f.write_str("stdout"),
            ResultSource::File(path) => write!(f, "file:{}", path),
        }
    }
}

impl Serialize for ResultSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResultSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ResultSource::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid result source [{}]", raw)))
    }
}

/// How the client should interpret the result payload. A hint only; the
/// server never inspects result bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// Raw bytes, not to be interpreted.
    Binary,
    /// Pickled Python objects.
    Pickle,
}

/// Associates a named layer with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLayer {
    pub name: String,
}

/// Associates a named volume with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVolume {
    pub name: String,
}

/// Resource counters collected from a finished container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collected {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cputime_user: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cputime_system: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_failcnt: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_max_usage: Option<u64>,
}

impl Collected {
    pub fn is_empty(&self) -> bool {
        *self == Collected::default()
    }
}

/// A job submission exactly as received on the wire, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub core: String,
    #[serde(default)]
    pub multicore: i32,
    #[serde(default)]
    pub restartable: bool,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default, rename = "layer")]
    pub layers: Vec<JobLayer>,
    #[serde(default, rename = "vol")]
    pub volumes: Vec<JobVolume>,
    #[serde(default, rename = "env")]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub result_source: String,
    #[serde(default)]
    pub result_type: String,
    #[serde(default)]
    pub max_runtime: i32,
    #[serde(default, with = "base64_bytes")]
    pub stdin: Vec<u8>,
    #[serde(default)]
    pub profile: Option<bool>,
    #[serde(default)]
    pub depends_on: Option<String>,
}

impl JobSpec {
    /// Check required fields and enum-like values, producing a validated
    /// [`Job`] or the specific rejection to report to the submitter.
    pub fn validate(self) -> Result<Job, ApiError> {
        if self.cmd.is_empty() {
            return Err(ApiError::missing_command());
        }

        let result_source = ResultSource::parse(&self.result_source)
            .ok_or_else(|| ApiError::invalid_result_source(&self.result_source))?;

        let result_type = match self.result_type.as_str() {
            "binary" => ResultType::Binary,
            "pickle" => ResultType::Pickle,
            other => return Err(ApiError::invalid_result_type(other)),
        };

        Ok(Job {
            command: self.cmd,
            name: self.name,
            core: self.core,
            multicore: self.multicore,
            restartable: self.restartable,
            tags: self.tags,
            layers: self.layers,
            volumes: self.volumes,
            environment: self.environment,
            result_source,
            result_type,
            max_runtime: self.max_runtime,
            stdin: self.stdin,
            profile: self.profile,
            depends_on: self.depends_on,
        })
    }
}

/// A validated compute task to be executed in a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub core: String,
    #[serde(default)]
    pub multicore: i32,
    #[serde(default)]
    pub restartable: bool,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default, rename = "layer")]
    pub layers: Vec<JobLayer>,
    #[serde(default, rename = "vol")]
    pub volumes: Vec<JobVolume>,
    #[serde(default, rename = "env")]
    pub environment: HashMap<String, String>,
    pub result_source: ResultSource,
    pub result_type: ResultType,
    #[serde(default)]
    pub max_runtime: i32,
    #[serde(default, with = "base64_bytes")]
    pub stdin: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
}

impl Job {
    /// Defensive re-check applied when a job is claimed from the queue.
    /// Typed fields are valid by construction; the command may not be.
    pub fn verify(&self) -> Result<(), ApiError> {
        if self.command.is_empty() {
            return Err(ApiError::missing_command());
        }
        Ok(())
    }
}

/// A job that has been accepted into the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedJob {
    #[serde(flatten)]
    pub job: Job,

    pub jid: u64,
    pub account: String,
    pub status: Status,

    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,

    #[serde(default)]
    pub runtime: i64,
    #[serde(default)]
    pub queue_delay: i64,
    #[serde(default)]
    pub overhead_delay: i64,

    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, with = "base64_bytes")]
    pub result: Vec<u8>,
    #[serde(default)]
    pub return_code: String,

    #[serde(default, skip_serializing_if = "Collected::is_empty")]
    pub collected: Collected,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub kill_requested: bool,
}

impl SubmittedJob {
    /// Wrap a validated job for insertion into the queue.
    pub fn new(job: Job, account: String) -> Self {
        SubmittedJob {
            job,
            jid: 0,
            account,
            status: Status::Queued,
            created_at: Timestamp::now(),
            started_at: None,
            finished_at: None,
            runtime: 0,
            queue_delay: 0,
            overhead_delay: 0,
            stdout: String::new(),
            stderr: String::new(),
            result: Vec::new(),
            return_code: String::new(),
            collected: Collected::default(),
            container_id: None,
            kill_requested: false,
        }
    }

    /// Derive the name of the container used to execute this job.
    pub fn container_name(&self) -> String {
        let fragment = self.job.name.as_deref().unwrap_or("unnamed");
        format!("job_{}_{}", self.jid, fragment)
    }

    /// Apply a status transition if it is a valid edge of the state machine.
    /// Returns false (leaving the status untouched) otherwise.
    pub fn transition(&mut self, next: Status) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}
