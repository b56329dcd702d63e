use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info};

use crate::cli::ReportArgs;
use crate::context::RunContext;
use crate::model::{Fields, StageError, StageResult, StageStatus, fields};
use crate::pipeline::{
    PipelineVerdict, REFERENCE_SETUP_DUMP_STAGE, SETUP_DIFF_STAGE, ThresholdAudit, VerdictOutputs,
    aggregate, strict_clone_errors, threshold_errors, verdict_status,
};
use crate::policy::{allowed_mismatch_fields, decide_thresholds};
use crate::stage::{self, StageCompletion, load_stage_report};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

pub const STAGE: &str = "report";
pub const LATEST_REPORT: &str = "pipeline_report_latest.json";
pub const RESOLVED_CONFIG: &str = "resolved_config.json";

pub fn run(args: ReportArgs) -> Result<bool> {
    let ctx = RunContext::load(&args.run.config, &args.run.run_dir, &args.run.profile)?;
    let (result, verdict) = execute(&ctx)?;
    let passed = result.status() == StageStatus::Success
        && verdict.is_some_and(|verdict| verdict.status == StageStatus::Success);
    Ok(passed)
}

/// Aggregates every stage record into the pipeline verdict and writes it
/// to the reports directory.
pub fn execute(ctx: &RunContext) -> Result<(StageResult, Option<PipelineVerdict>)> {
    let mut verdict = None;
    let result = stage::run_guarded(ctx, STAGE, ctx.base_inputs(), |ctx| {
        let built = build_verdict(ctx)?;
        let (timestamped, latest) = write_verdict(ctx, &built)?;
        let resolved_config = write_resolved_config(ctx)?;

        let mut errors = Vec::new();
        if built.status != StageStatus::Success {
            errors.push(
                StageError::new("pipeline verdict failed")
                    .with("error_count", built.errors.len()),
            );
        }
        let outputs = fields(json!({
            "pipeline_report": timestamped.display().to_string(),
            "pipeline_report_latest": latest.display().to_string(),
            "resolved_config": resolved_config.display().to_string(),
            "status": built.status.as_str(),
            "error_count": built.errors.len(),
        }));
        verdict = Some(built);
        Ok(StageCompletion::new(outputs, errors))
    })?;
    Ok((result, verdict))
}

fn build_verdict(ctx: &RunContext) -> Result<PipelineVerdict> {
    let config = &ctx.config;
    let stages = config.stages();
    let skip_set = config.skip_set()?;
    let mode = ctx.execution_mode()?;
    let debug_mode = config.debug_override();

    let reports = stages
        .iter()
        .filter_map(|stage| {
            load_stage_report(&ctx.stage_report_path(stage)).map(|report| (stage.clone(), report))
        })
        .collect::<BTreeMap<_, _>>();

    let aggregation = aggregate(&stages, &skip_set, &reports);
    let mut errors = aggregation.errors;

    let decision = decide_thresholds(mode, config.ground_truth.compare.thresholds.as_ref(), debug_mode);
    for violation in threshold_errors(&decision) {
        let already_recorded = errors.iter().any(|error| {
            error.stage == violation.stage && error.error.message == violation.error.message
        });
        if !already_recorded {
            errors.push(violation);
        }
    }

    let strict_clone_enabled = config.reference_baseline.strict_clone.enabled;
    let mut extra = Fields::new();
    if strict_clone_enabled {
        let reference_dump = load_stage_report(&ctx.stage_report_path(REFERENCE_SETUP_DUMP_STAGE));
        let setup_diff = load_stage_report(&ctx.stage_report_path(SETUP_DIFF_STAGE));
        errors.extend(strict_clone_errors(
            reference_dump.as_ref(),
            setup_diff.as_ref(),
            config.training.skip_train,
            &allowed_mismatch_fields(mode),
        ));
        extra.insert(
            "reference_setup_dump_report".to_string(),
            Value::from(ctx.stage_report_path(REFERENCE_SETUP_DUMP_STAGE).display().to_string()),
        );
        extra.insert(
            "setup_diff_report".to_string(),
            Value::from(ctx.stage_report_path(SETUP_DIFF_STAGE).display().to_string()),
        );
    }

    let stage_reports = stages
        .iter()
        .map(|stage| (stage.clone(), ctx.stage_report_path(stage).display().to_string()))
        .collect();

    let status = verdict_status(&errors);
    let verdict = PipelineVerdict {
        stage: "full_pipeline".to_string(),
        profile: ctx.profile.clone(),
        started_at: PipelineVerdict::first_start(&stages, &reports),
        ended_at: now_utc_string(),
        status,
        inputs: ctx.base_inputs(),
        outputs: VerdictOutputs {
            stage_reports,
            stage_status: aggregation.stage_status,
            skip_set,
            strict_clone_enabled,
            thresholds: ThresholdAudit::new(&decision, debug_mode),
            extra,
        },
        errors,
    };

    if status == StageStatus::Success {
        info!(stages = stages.len(), "pipeline verdict: success");
    } else {
        error!(
            stages = stages.len(),
            errors = verdict.errors.len(),
            "pipeline verdict: failed"
        );
    }
    Ok(verdict)
}

fn write_verdict(ctx: &RunContext, verdict: &PipelineVerdict) -> Result<(PathBuf, PathBuf)> {
    let reports_dir = ctx.reports_dir();
    let timestamped = unique_report_path(&reports_dir, &utc_compact_string(Utc::now()));
    let latest = reports_dir.join(LATEST_REPORT);
    write_json_pretty(&timestamped, verdict)?;
    write_json_pretty(&latest, verdict)?;
    info!(path = %latest.display(), "pipeline report written");
    Ok((timestamped, latest))
}

/// Timestamped report path that does not clobber an earlier report written
/// within the same second.
fn unique_report_path(reports_dir: &Path, stamp: &str) -> PathBuf {
    let first = reports_dir.join(format!("pipeline_report_{stamp}.json"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| reports_dir.join(format!("pipeline_report_{stamp}_{n}.json")))
        .find(|path| !path.exists())
        .unwrap_or(first)
}

/// Snapshot of the config as this run resolved it, defaults included.
fn write_resolved_config(ctx: &RunContext) -> Result<PathBuf> {
    let path = ctx.reports_dir().join(RESOLVED_CONFIG);
    let snapshot = json!({
        "profile": ctx.profile,
        "run_dir": ctx.run_dir.display().to_string(),
        "config_path": ctx.config_path.display().to_string(),
        "config": ctx.config,
    });
    write_json_pretty(&path, &snapshot)?;
    debug!(path = %path.display(), "resolved config written");
    Ok(path)
}
