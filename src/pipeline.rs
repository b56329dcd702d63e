use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{Fields, StageError, StageResult, StageStatus};
use crate::policy::{ThresholdDecision, ThresholdSet, unexpected_mismatch_errors};

pub const REFERENCE_SETUP_DUMP_STAGE: &str = "reference_setup_dump";
pub const SETUP_DIFF_STAGE: &str = "setup_diff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStageStatus {
    Running,
    Success,
    Failed,
    SkippedByPolicy,
    Missing,
}

impl PipelineStageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::SkippedByPolicy => "skipped_by_policy",
            Self::Missing => "missing",
        }
    }
}

impl From<StageStatus> for PipelineStageStatus {
    fn from(status: StageStatus) -> Self {
        match status {
            StageStatus::Running => Self::Running,
            StageStatus::Success => Self::Success,
            StageStatus::Failed => Self::Failed,
        }
    }
}

/// A stage error lifted into the pipeline's consolidated list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub stage: String,
    #[serde(flatten)]
    pub error: StageError,
}

impl PipelineError {
    pub fn new(stage: &str, error: StageError) -> Self {
        Self {
            stage: stage.to_string(),
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub stage_status: BTreeMap<String, PipelineStageStatus>,
    pub errors: Vec<PipelineError>,
}

impl Aggregation {
    pub fn status(&self) -> StageStatus {
        verdict_status(&self.errors)
    }
}

pub fn verdict_status(errors: &[PipelineError]) -> StageStatus {
    if errors.is_empty() {
        StageStatus::Success
    } else {
        StageStatus::Failed
    }
}

/// Folds stage records into per-stage statuses and one error list.
///
/// A missing record is tolerated only for stages in `skip_set`. A failed
/// record contributes each of its errors tagged with the stage name; a
/// record still marked running counts as a failure.
pub fn aggregate(
    stages: &[String],
    skip_set: &BTreeSet<String>,
    reports: &BTreeMap<String, StageResult>,
) -> Aggregation {
    let mut stage_status = BTreeMap::new();
    let mut errors = Vec::new();

    for stage in stages {
        let Some(report) = reports.get(stage) else {
            if skip_set.contains(stage) {
                stage_status.insert(stage.clone(), PipelineStageStatus::SkippedByPolicy);
            } else {
                warn!(stage = %stage, "stage report missing");
                stage_status.insert(stage.clone(), PipelineStageStatus::Missing);
                errors.push(PipelineError::new(stage, StageError::new("missing stage report")));
            }
            continue;
        };

        stage_status.insert(stage.clone(), report.status().into());
        match report.status() {
            StageStatus::Success => {}
            StageStatus::Running => errors.push(PipelineError::new(
                stage,
                StageError::new("stage report still marked running"),
            )),
            StageStatus::Failed => {
                if report.errors().is_empty() {
                    errors.push(PipelineError::new(stage, StageError::new("stage failed")));
                }
                errors.extend(
                    report
                        .errors()
                        .iter()
                        .cloned()
                        .map(|error| PipelineError::new(stage, error)),
                );
            }
        }
    }

    for (stage, status) in &stage_status {
        debug!(stage = %stage, status = status.as_str(), "stage status");
    }
    let aggregation = Aggregation {
        stage_status,
        errors,
    };
    info!(
        stages = stages.len(),
        errors = aggregation.errors.len(),
        status = %aggregation.status().as_str(),
        "stage reports aggregated"
    );
    aggregation
}

/// Threshold policy violations, attributed to the comparison stage.
pub fn threshold_errors(decision: &ThresholdDecision) -> Vec<PipelineError> {
    decision
        .violation()
        .map(|error| PipelineError::new("gt_compare", error))
        .into_iter()
        .collect()
}

/// Checks applied when the run must reproduce the reference setup exactly.
pub fn strict_clone_errors(
    reference_dump: Option<&StageResult>,
    setup_diff: Option<&StageResult>,
    skip_train: bool,
    allowed: &BTreeSet<&str>,
) -> Vec<PipelineError> {
    let mut errors = Vec::new();

    match reference_dump {
        None => errors.push(PipelineError::new(
            REFERENCE_SETUP_DUMP_STAGE,
            StageError::new("missing reference setup dump report while strict clone is enabled"),
        )),
        Some(report) if report.status() != StageStatus::Success => errors.push(PipelineError::new(
            REFERENCE_SETUP_DUMP_STAGE,
            StageError::new("reference setup dump failed")
                .with_serialized("errors", &report.errors()),
        )),
        Some(_) => {}
    }

    match setup_diff {
        None if !skip_train => errors.push(PipelineError::new(
            SETUP_DIFF_STAGE,
            StageError::new("missing setup diff report while strict clone is enabled"),
        )),
        Some(report) if report.status() != StageStatus::Success => {
            let unexpected = unexpected_mismatch_errors(report.errors(), allowed);
            let unexplained = report.errors().is_empty();
            if !unexpected.is_empty() || unexplained {
                errors.push(PipelineError::new(
                    SETUP_DIFF_STAGE,
                    StageError::new("setup diff reported unexpected mismatches")
                        .with_serialized("errors", &unexpected),
                ));
            }
        }
        _ => {}
    }

    errors
}

/// Threshold audit block of the pipeline report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdAudit {
    pub training_data_source: String,
    pub debug_mode: bool,
    pub strict_thresholds: ThresholdSet,
    pub strict_thresholds_hash: String,
    pub pipeline_thresholds: ThresholdSet,
    pub pipeline_thresholds_hash: String,
    pub required_thresholds: ThresholdSet,
    pub required_thresholds_hash: String,
    pub configured_thresholds: Option<ThresholdSet>,
    pub configured_thresholds_hash: Option<String>,
}

impl ThresholdAudit {
    pub fn new(decision: &ThresholdDecision, debug_mode: bool) -> Self {
        Self {
            training_data_source: decision.mode.as_str().to_string(),
            debug_mode,
            strict_thresholds: ThresholdSet::STRICT,
            strict_thresholds_hash: ThresholdSet::STRICT.hash(),
            pipeline_thresholds: ThresholdSet::PIPELINE,
            pipeline_thresholds_hash: ThresholdSet::PIPELINE.hash(),
            required_thresholds: decision.required,
            required_thresholds_hash: decision.required.hash(),
            configured_thresholds: decision.configured,
            configured_thresholds_hash: decision.configured.map(|set| set.hash()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictOutputs {
    pub stage_reports: BTreeMap<String, String>,
    pub stage_status: BTreeMap<String, PipelineStageStatus>,
    pub skip_set: BTreeSet<String>,
    pub strict_clone_enabled: bool,
    #[serde(flatten)]
    pub thresholds: ThresholdAudit,
    #[serde(flatten)]
    pub extra: Fields,
}

/// The run-level report written next to the stage records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineVerdict {
    pub stage: String,
    pub profile: String,
    pub started_at: String,
    pub ended_at: String,
    pub status: StageStatus,
    pub inputs: Fields,
    pub outputs: VerdictOutputs,
    pub errors: Vec<PipelineError>,
}

impl PipelineVerdict {
    /// First recorded start time among `stages`, in order.
    pub fn first_start(stages: &[String], reports: &BTreeMap<String, StageResult>) -> String {
        stages
            .iter()
            .filter_map(|stage| reports.get(stage))
            .map(|report| report.started_at().to_string())
            .find(|started| !started.is_empty())
            .unwrap_or_default()
    }
}
