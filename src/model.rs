use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::now_utc_string;

pub type Fields = Map<String, Value>;

/// The entries of a JSON object; anything else yields no entries.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Success,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Terminal state a running stage may be finalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    /// Failed iff at least one error is not a warning.
    pub fn from_errors(errors: &[StageError]) -> Self {
        if errors.iter().any(|error| !error.is_warning()) {
            Self::Failed
        } else {
            Self::Success
        }
    }
}

impl From<Outcome> for StageStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Success,
            Outcome::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(flatten)]
    pub detail: Fields,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: None,
            detail: Fields::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Some(Severity::Warning),
            ..Self::new(message)
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            severity: Some(Severity::Fatal),
            ..Self::new(message)
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    pub fn with_serialized<T: Serialize>(self, key: &str, value: &T) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.with(key, value)
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Some(Severity::Warning)
    }
}

/// On-disk record of one pipeline stage.
///
/// Records are only created through [`StageRun::start`] and become
/// read-only once [`StageRun::finalize`] hands them out; the single
/// sanctioned later edit is [`StageResult::annotated`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    stage: String,
    #[serde(alias = "profile")]
    mode: String,
    started_at: String,
    #[serde(default)]
    ended_at: String,
    status: StageStatus,
    #[serde(default)]
    inputs: Fields,
    #[serde(default)]
    outputs: Fields,
    #[serde(default)]
    errors: Vec<StageError>,
}

impl StageResult {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn ended_at(&self) -> &str {
        &self.ended_at
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn outputs(&self) -> &Fields {
        &self.outputs
    }

    pub fn errors(&self) -> &[StageError] {
        &self.errors
    }

    /// Cross-reference written by a later stage onto an earlier stage's record.
    ///
    /// Merges `outputs` into the record; when `failure` is given the record is
    /// marked failed and the error is appended unless an error with the same
    /// message is already present.
    pub fn annotated(mut self, outputs: Fields, failure: Option<StageError>) -> Self {
        self.outputs.extend(outputs);
        if let Some(failure) = failure {
            self.status = StageStatus::Failed;
            if !self
                .errors
                .iter()
                .any(|error| error.message == failure.message)
            {
                self.errors.push(failure);
            }
        }
        self
    }
}

/// A stage that has started but not finished.
#[derive(Debug, Clone)]
pub struct StageRun {
    record: StageResult,
}

impl StageRun {
    pub fn start(stage: &str, mode: &str, inputs: Fields) -> Self {
        Self {
            record: StageResult {
                stage: stage.to_string(),
                mode: mode.to_string(),
                started_at: now_utc_string(),
                ended_at: String::new(),
                status: StageStatus::Running,
                inputs,
                outputs: Fields::new(),
                errors: Vec::new(),
            },
        }
    }

    /// The in-flight record, `status = running`.
    pub fn record(&self) -> &StageResult {
        &self.record
    }

    pub fn finalize(self, outcome: Outcome, outputs: Fields, errors: Vec<StageError>) -> StageResult {
        StageResult {
            ended_at: now_utc_string(),
            status: outcome.into(),
            outputs,
            errors,
            ..self.record
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    None,
    Timeout,
    NoActivity,
    RepeatedError,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Timeout => "timeout",
            Self::NoActivity => "no_activity",
            Self::RepeatedError => "repeated_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatedErrorSignature {
    pub line: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRunResult {
    pub exit_code: i32,
    pub duration_sec: f64,
    pub abort_reason: AbortReason,
    pub repeated_error: Option<RepeatedErrorSignature>,
    pub stdout_path: String,
    pub stderr_path: String,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

impl ProcessRunResult {
    pub fn exited_cleanly(&self) -> bool {
        self.abort_reason == AbortReason::None && self.exit_code == 0
    }

    pub fn tails(&self) -> impl Iterator<Item = &str> {
        self.stdout_tail
            .iter()
            .chain(self.stderr_tail.iter())
            .map(String::as_str)
    }

    /// Stage error describing why this run did not exit cleanly.
    pub fn failure(&self, message: &str) -> StageError {
        StageError::new(message)
            .with("abort_reason", self.abort_reason.as_str())
            .with("exit_code", self.exit_code)
            .with(
                "repeated_error_line",
                self.repeated_error
                    .as_ref()
                    .map(|signature| signature.line.clone())
                    .unwrap_or_default(),
            )
            .with("stdout_tail", self.stdout_tail.clone())
            .with("stderr_tail", self.stderr_tail.clone())
    }
}
