use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::config::{PipelineConfig, load_config};
use crate::model::Fields;
use crate::policy::ExecutionMode;

/// Everything a stage needs to know about the run it belongs to.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config_path: PathBuf,
    pub config: PipelineConfig,
    pub run_dir: PathBuf,
    pub profile: String,
}

impl RunContext {
    /// Loads the config and checks the execution mode up front so a bad
    /// config aborts before any stage record is written.
    pub fn load(config_path: &Path, run_dir: &Path, profile: &str) -> Result<Self> {
        let config = load_config(config_path)
            .with_context(|| format!("failed to load config {}", config_path.display()))?;
        config.execution_mode()?;
        config.skip_set()?;
        Ok(Self::new(config_path, config, run_dir, profile))
    }

    pub fn new(config_path: &Path, config: PipelineConfig, run_dir: &Path, profile: &str) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            config,
            run_dir: run_dir.to_path_buf(),
            profile: profile.to_string(),
        }
    }

    pub fn execution_mode(&self) -> Result<ExecutionMode> {
        Ok(self.config.execution_mode()?)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.run_dir.join("reports")
    }

    pub fn stage_report_path(&self, stage: &str) -> PathBuf {
        crate::stage::stage_report_path(&self.run_dir, stage)
    }

    pub fn log_paths(&self, stage: &str) -> (PathBuf, PathBuf) {
        let logs = self.reports_dir().join("logs");
        (
            logs.join(format!("{stage}.stdout.log")),
            logs.join(format!("{stage}.stderr.log")),
        )
    }

    pub fn ground_truth_dir(&self) -> PathBuf {
        self.run_dir
            .join("workspace")
            .join("staging")
            .join(&self.profile)
            .join("gt")
    }

    pub fn frames_dir(&self, kind: &str) -> PathBuf {
        self.ground_truth_dir().join(kind).join("frames")
    }

    pub fn heatmap_dir(&self) -> PathBuf {
        self.ground_truth_dir().join("compare").join("heatmaps")
    }

    /// Inputs every stage record starts with.
    pub fn base_inputs(&self) -> Fields {
        let mut inputs = Fields::new();
        inputs.insert(
            "config".to_string(),
            Value::from(self.config_path.display().to_string()),
        );
        inputs.insert(
            "run_dir".to_string(),
            Value::from(self.run_dir.display().to_string()),
        );
        inputs.insert("profile".to_string(), Value::from(self.profile.clone()));
        inputs
    }
}
