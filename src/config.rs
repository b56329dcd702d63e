use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::policy::ExecutionMode;
use crate::supervisor::GuardSettings;
use crate::util::strip_bom;

/// Stages produced before the training step; bypassed when a run reuses
/// previously produced training data.
pub const SKIP_TRAIN_STAGES: [&str; 4] = ["preflight", "houdini", "convert", "ue_import"];

pub const DEFAULT_STAGES: [&str; 11] = [
    "baseline_sync",
    "preflight",
    "houdini",
    "convert",
    "ue_import",
    "ue_setup",
    "train",
    "infer",
    "gt_reference_capture",
    "gt_source_capture",
    "gt_compare",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config does not exist: {0}")]
    Missing(PathBuf),
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config root must be an object: {0}")]
    NotAnObject(PathBuf),
    #[error("malformed config {path}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing required config key: {0}")]
    MissingKey(String),
    #[error("unknown execution mode '{0}' (expected 'reference' or 'pipeline')")]
    UnknownMode(String),
    #[error("unknown skip set '{0}'")]
    UnknownSkipSet(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub debug_mode: bool,
    pub pipeline: PipelineSection,
    pub training: TrainingSection,
    pub ground_truth: GroundTruthSection,
    pub reference_baseline: ReferenceBaselineSection,
    pub guard: GuardSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSection {
    pub stages: Option<Vec<String>>,
    pub skip_sets: BTreeMap<String, Vec<String>>,
    pub active_skip_sets: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TrainingSection {
    pub training_data_source: Option<String>,
    pub skip_train: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GroundTruthSection {
    pub enabled: bool,
    pub compare: CompareSection,
    pub capture: CaptureSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompareSection {
    pub thresholds: Option<Map<String, Value>>,
    pub metrics_profile: String,
    pub fail_on_frame_count_mismatch: bool,
    pub debug_mode: Option<bool>,
    pub worst_frame_count: usize,
    pub heatmap_count: usize,
    pub window_size: usize,
}

impl Default for CompareSection {
    fn default() -> Self {
        Self {
            thresholds: None,
            metrics_profile: "strict".to_string(),
            fail_on_frame_count_mismatch: true,
            debug_mode: None,
            worst_frame_count: 10,
            heatmap_count: 5,
            window_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSection {
    pub editor: Option<String>,
    pub reference_project: Option<String>,
    pub source_project: Option<String>,
    pub map: Option<String>,
    pub level_sequence: Option<String>,
    pub width: u32,
    pub height: u32,
    pub warmup_frames: u32,
    pub extra_args: Vec<String>,
    pub missing_module_markers: Vec<String>,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            editor: None,
            reference_project: None,
            source_project: None,
            map: None,
            level_sequence: None,
            width: 1280,
            height: 720,
            warmup_frames: 0,
            extra_args: Vec::new(),
            missing_module_markers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReferenceBaselineSection {
    pub strict_clone: StrictCloneSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StrictCloneSection {
    pub enabled: bool,
}

/// Guard limits; every field is optional so per-stage overrides can be partial.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardLimits {
    pub timeout_minutes: Option<u64>,
    pub no_activity_minutes: Option<u64>,
    pub repeated_error_threshold: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub kill_grace_secs: Option<u64>,
    pub tail_lines: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardSection {
    #[serde(flatten)]
    pub defaults: GuardLimits,
    pub stages: BTreeMap<String, GuardLimits>,
}

pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(strip_bom(&raw), path)
}

pub fn parse_config(raw: &str, path: &Path) -> Result<PipelineConfig, ConfigError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    if !value.is_object() {
        return Err(ConfigError::NotAnObject(path.to_path_buf()));
    }
    serde_json::from_value(value).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

impl PipelineConfig {
    pub fn execution_mode(&self) -> Result<ExecutionMode, ConfigError> {
        let raw = self
            .training
            .training_data_source
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("reference");
        ExecutionMode::parse(raw)
    }

    /// The compare section's flag wins over the root flag when present.
    pub fn debug_override(&self) -> bool {
        self.ground_truth
            .compare
            .debug_mode
            .unwrap_or(self.debug_mode)
    }

    pub fn stages(&self) -> Vec<String> {
        match &self.pipeline.stages {
            Some(stages) => stages.clone(),
            None => DEFAULT_STAGES.iter().map(|stage| stage.to_string()).collect(),
        }
    }

    pub fn skip_set(&self) -> Result<BTreeSet<String>, ConfigError> {
        let mut skipped = BTreeSet::new();
        if self.training.skip_train {
            skipped.extend(SKIP_TRAIN_STAGES.iter().map(|stage| stage.to_string()));
        }
        for name in &self.pipeline.active_skip_sets {
            let stages = self
                .pipeline
                .skip_sets
                .get(name)
                .ok_or_else(|| ConfigError::UnknownSkipSet(name.clone()))?;
            skipped.extend(stages.iter().cloned());
        }
        Ok(skipped)
    }

    pub fn guard_settings(&self, stage: &str) -> GuardSettings {
        let defaults = GuardSettings::default();
        let root = &self.guard.defaults;
        let scoped = self.guard.stages.get(stage);
        let pick = |select: fn(&GuardLimits) -> Option<u64>| {
            scoped.and_then(select).or_else(|| select(root))
        };
        let pick_count = |select: fn(&GuardLimits) -> Option<usize>| {
            scoped.and_then(select).or_else(|| select(root))
        };

        GuardSettings {
            timeout: pick(|limits| limits.timeout_minutes)
                .map(minutes)
                .unwrap_or(defaults.timeout),
            inactivity_timeout: pick(|limits| limits.no_activity_minutes)
                .map(minutes)
                .unwrap_or(defaults.inactivity_timeout),
            repeated_error_threshold: pick_count(|limits| limits.repeated_error_threshold)
                .unwrap_or(defaults.repeated_error_threshold),
            poll_interval: pick(|limits| limits.poll_interval_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            kill_grace: pick(|limits| limits.kill_grace_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.kill_grace),
            tail_lines: pick_count(|limits| limits.tail_lines).unwrap_or(defaults.tail_lines),
            ..defaults
        }
    }
}

pub fn require_value(value: Option<&str>, key: &str) -> Result<String, ConfigError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> PipelineConfig {
        parse_config(raw, Path::new("test.json")).unwrap()
    }

    #[test]
    fn empty_object_uses_defaults() {
        let config = parse("{}");
        assert_eq!(config.execution_mode().unwrap(), ExecutionMode::ReferenceSourced);
        assert!(!config.debug_override());
        assert_eq!(config.stages().len(), DEFAULT_STAGES.len());
        assert!(config.skip_set().unwrap().is_empty());
        assert!(config.ground_truth.compare.fail_on_frame_count_mismatch);
        assert_eq!(config.ground_truth.capture.width, 1280);
    }

    #[test]
    fn non_object_root_is_rejected() {
        let result = parse_config("[1, 2]", Path::new("test.json"));
        assert!(matches!(result, Err(ConfigError::NotAnObject(_))));
    }

    #[test]
    fn unknown_training_source_is_a_config_error() {
        let config = parse(r#"{"training": {"training_data_source": "synthetic"}}"#);
        assert!(matches!(
            config.execution_mode(),
            Err(ConfigError::UnknownMode(mode)) if mode == "synthetic"
        ));
    }

    #[test]
    fn compare_debug_flag_overrides_root() {
        let config = parse(r#"{"debug_mode": true, "ground_truth": {"compare": {"debug_mode": false}}}"#);
        assert!(!config.debug_override());

        let config = parse(r#"{"debug_mode": true}"#);
        assert!(config.debug_override());
    }

    #[test]
    fn skip_train_and_declared_skip_sets_merge() {
        let config = parse(
            r#"{
                "training": {"skip_train": true},
                "pipeline": {
                    "skip_sets": {"no_baseline": ["baseline_sync"]},
                    "active_skip_sets": ["no_baseline"]
                }
            }"#,
        );
        let skipped = config.skip_set().unwrap();
        assert!(skipped.contains("houdini"));
        assert!(skipped.contains("baseline_sync"));
        assert!(!skipped.contains("train"));

        let config = parse(r#"{"pipeline": {"active_skip_sets": ["nope"]}}"#);
        assert!(matches!(config.skip_set(), Err(ConfigError::UnknownSkipSet(_))));
    }

    #[test]
    fn guard_settings_prefer_stage_overrides() {
        let config = parse(
            r#"{
                "guard": {
                    "timeout_minutes": 30,
                    "repeated_error_threshold": 4,
                    "stages": {"train": {"timeout_minutes": 240}}
                }
            }"#,
        );
        let train = config.guard_settings("train");
        assert_eq!(train.timeout, Duration::from_secs(240 * 60));
        assert_eq!(train.repeated_error_threshold, 4);

        let capture = config.guard_settings("gt_source_capture");
        assert_eq!(capture.timeout, Duration::from_secs(30 * 60));
        assert_eq!(capture.inactivity_timeout, Duration::from_secs(20 * 60));
    }
}
