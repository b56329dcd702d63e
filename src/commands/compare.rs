use anyhow::Result;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::cli::CompareArgs;
use crate::comparator::{CompareOptions, PngSequence, compare};
use crate::context::RunContext;
use crate::metrics::{ROI_X_RATIOS, ROI_Y_RATIOS};
use crate::model::{StageError, StageResult, StageStatus, fields};
use crate::policy::decide_thresholds;
use crate::stage::{self, StageCompletion, load_stage_report, persist};

pub const STAGE: &str = "gt_compare";
const INFER_STAGE: &str = "infer";

pub fn run(args: CompareArgs) -> Result<bool> {
    let ctx = RunContext::load(&args.run.config, &args.run.run_dir, &args.run.profile)?;
    let result = execute(&ctx)?;
    Ok(result.status() == StageStatus::Success)
}

/// Runs the comparison stage, then cross-references the result on the
/// inference record.
pub fn execute(ctx: &RunContext) -> Result<StageResult> {
    let result = stage::run_guarded(ctx, STAGE, ctx.base_inputs(), compare_frames)?;
    annotate_inference(ctx, &result)?;
    Ok(result)
}

fn compare_frames(ctx: &RunContext) -> Result<StageCompletion> {
    let ground_truth = &ctx.config.ground_truth;
    if !ground_truth.enabled {
        info!("ground truth disabled, comparison skipped");
        return Ok(StageCompletion::new(
            fields(json!({
                "enabled": false,
                "skipped": true,
                "reason": "ground_truth.enabled is false",
            })),
            Vec::new(),
        ));
    }

    let settings = &ground_truth.compare;
    let mode = ctx.execution_mode()?;
    let decision = decide_thresholds(mode, settings.thresholds.as_ref(), ctx.config.debug_override());
    let mut errors = Vec::new();
    if let Some(violation) = decision.violation() {
        warn!(
            training_data_source = %mode.as_str(),
            "configured thresholds rejected, gating with required set"
        );
        errors.push(violation);
    }

    let reference_dir = ctx.frames_dir("reference");
    let source_dir = ctx.frames_dir("source");
    let reference = PngSequence::collect(&reference_dir)?;
    let source = PngSequence::collect(&source_dir)?;

    let options = CompareOptions {
        fail_on_count_mismatch: settings.fail_on_frame_count_mismatch,
        worst_frame_count: settings.worst_frame_count,
        heatmap_count: settings.heatmap_count,
        window_size: settings.window_size,
        heatmap_dir: Some(ctx.heatmap_dir()),
        ..CompareOptions::new(decision.effective)
    };
    let outcome = compare(&reference, &source, &options);
    let summary = &outcome.summary;

    let outputs = fields(json!({
        "enabled": true,
        "reference_frames_dir": reference_dir.display().to_string(),
        "source_frames_dir": source_dir.display().to_string(),
        "reference_frame_count": summary.reference_count,
        "source_frame_count": summary.source_count,
        "fail_on_frame_count_mismatch": options.fail_on_count_mismatch,
        "profile_name": settings.metrics_profile,
        "threshold_profile": decision.profile_name,
        "training_data_source": mode.as_str(),
        "thresholds": decision.effective,
        "thresholds_hash": decision.effective.hash(),
        "threshold_validation": decision.validation,
        "metrics": summary.metrics,
        "window_size": options.window_size,
        "window_metrics": summary.window_metrics,
        "body_roi": {
            "x_ratio": [ROI_X_RATIOS.0, ROI_X_RATIOS.1],
            "y_ratio": [ROI_Y_RATIOS.0, ROI_Y_RATIOS.1],
        },
        "worst_frames": summary.worst_frames,
        "heatmaps": summary.heatmaps,
        "pass": outcome.pass,
    }));

    errors.extend(outcome.errors);
    Ok(StageCompletion::new(outputs, errors).fail_if(!outcome.pass))
}

/// Writes the comparison verdict onto the inference record, if one exists.
fn annotate_inference(ctx: &RunContext, compare: &StageResult) -> Result<()> {
    let path = ctx.stage_report_path(INFER_STAGE);
    let Some(infer) = load_stage_report(&path) else {
        return Ok(());
    };

    let enabled = compare
        .outputs()
        .get("enabled")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let status = if enabled {
        compare.status().as_str()
    } else {
        "disabled"
    };
    let report_path = ctx.stage_report_path(STAGE).display().to_string();

    let mut outputs = Map::new();
    outputs.insert("ground_truth_compare_enabled".to_string(), Value::from(enabled));
    outputs.insert("ground_truth_compare_report".to_string(), Value::from(report_path.clone()));
    outputs.insert("ground_truth_compare_status".to_string(), Value::from(status));
    outputs.insert(
        "ground_truth_compare_metrics".to_string(),
        compare
            .outputs()
            .get("metrics")
            .filter(|metrics| !metrics.is_null())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    );

    let failure = (enabled && compare.status() != StageStatus::Success).then(|| {
        StageError::new("ground truth compare stage failed")
            .with("gt_compare_report", report_path)
            .with("ground_truth_compare_status", status)
    });

    persist(&path, &infer.annotated(outputs, failure))?;
    info!(path = %path.display(), status = %status, "inference report annotated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use image::{GrayImage, Luma};

    use super::*;
    use crate::config::parse_config;
    use crate::model::{Fields, Outcome, StageRun};

    fn context(run_dir: &Path, config: Value) -> RunContext {
        let config = parse_config(&config.to_string(), Path::new("pipeline.json")).unwrap();
        RunContext::new(Path::new("pipeline.json"), config, run_dir, "smoke")
    }

    fn gradient(offset: u8) -> GrayImage {
        GrayImage::from_fn(48, 32, |x, y| Luma([((x * 4 + y * 2) as u8).saturating_add(offset)]))
    }

    fn write_frames(dir: &Path, frames: &[GrayImage]) {
        fs::create_dir_all(dir).unwrap();
        for (index, frame) in frames.iter().enumerate() {
            frame.save(dir.join(format!("frame_{index:04}.png"))).unwrap();
        }
    }

    fn seed_infer_report(ctx: &RunContext) {
        let record = StageRun::start(INFER_STAGE, "smoke", Fields::new()).finalize(
            Outcome::Success,
            Fields::new(),
            Vec::new(),
        );
        persist(&ctx.stage_report_path(INFER_STAGE), &record).unwrap();
    }

    fn loose_thresholds() -> Value {
        json!({
            "ssim_mean_min": 0.1,
            "ssim_p05_min": 0.1,
            "psnr_mean_min": 1.0,
            "psnr_min_min": 1.0,
            "edge_iou_mean_min": 0.1
        })
    }

    fn enabled() -> Value {
        json!({"ground_truth": {"enabled": true}})
    }

    #[test]
    fn identical_sequences_pass_and_annotate_inference() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), enabled());
        let frames = vec![gradient(0), gradient(0), gradient(0)];
        write_frames(&ctx.frames_dir("reference"), &frames);
        write_frames(&ctx.frames_dir("source"), &frames);
        seed_infer_report(&ctx);

        let result = execute(&ctx).unwrap();
        assert_eq!(result.status(), StageStatus::Success, "{:?}", result.errors());
        assert_eq!(result.outputs()["reference_frame_count"], 3);
        assert_eq!(result.outputs()["threshold_profile"], "strict");
        assert_eq!(result.outputs()["metrics"]["psnr_min"], 99.0);

        let infer = load_stage_report(&ctx.stage_report_path(INFER_STAGE)).unwrap();
        assert_eq!(infer.status(), StageStatus::Success);
        assert_eq!(infer.outputs()["ground_truth_compare_status"], "success");
        assert_eq!(infer.outputs()["ground_truth_compare_enabled"], true);
    }

    #[test]
    fn failing_comparison_fails_inference_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), enabled());
        write_frames(&ctx.frames_dir("reference"), &[gradient(0), gradient(0)]);
        let noisy = GrayImage::from_fn(48, 32, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        write_frames(&ctx.frames_dir("source"), &[noisy.clone(), noisy]);
        seed_infer_report(&ctx);

        let result = execute(&ctx).unwrap();
        assert_eq!(result.status(), StageStatus::Failed);
        assert!(!result.outputs()["heatmaps"].as_array().unwrap().is_empty());

        execute(&ctx).unwrap();
        let infer = load_stage_report(&ctx.stage_report_path(INFER_STAGE)).unwrap();
        assert_eq!(infer.status(), StageStatus::Failed);
        let marks = infer
            .errors()
            .iter()
            .filter(|error| error.message == "ground truth compare stage failed")
            .count();
        assert_eq!(marks, 1);
    }

    #[test]
    fn loosened_thresholds_fail_the_stage_even_when_frames_match() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            json!({
                "training": {"training_data_source": "pipeline"},
                "ground_truth": {"enabled": true, "compare": {"thresholds": loose_thresholds()}}
            }),
        );
        let frames = vec![gradient(0), gradient(0)];
        write_frames(&ctx.frames_dir("reference"), &frames);
        write_frames(&ctx.frames_dir("source"), &frames);
        seed_infer_report(&ctx);

        let result = execute(&ctx).unwrap();
        assert_eq!(result.status(), StageStatus::Failed);
        assert_eq!(result.outputs()["pass"], true);
        assert_eq!(result.outputs()["threshold_validation"]["ok"], false);
        let violation = &result.errors()[0];
        assert!(violation.message.contains("not pipeline"));
        assert_eq!(violation.detail["training_data_source"], "pipeline");
        assert!(violation.detail.contains_key("configured_thresholds_hash"));

        let infer = load_stage_report(&ctx.stage_report_path(INFER_STAGE)).unwrap();
        assert_eq!(infer.status(), StageStatus::Failed);
    }

    #[test]
    fn debug_mode_accepts_loosened_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            json!({
                "debug_mode": true,
                "ground_truth": {"enabled": true, "compare": {"thresholds": loose_thresholds()}}
            }),
        );
        let frames = vec![gradient(0)];
        write_frames(&ctx.frames_dir("reference"), &frames);
        write_frames(&ctx.frames_dir("source"), &frames);

        let result = execute(&ctx).unwrap();
        assert_eq!(result.status(), StageStatus::Success, "{:?}", result.errors());
        assert_eq!(result.outputs()["thresholds"]["ssim_mean_min"], 0.1);
    }

    #[test]
    fn count_mismatch_fails_unless_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), enabled());
        write_frames(&ctx.frames_dir("reference"), &[gradient(0), gradient(0)]);
        write_frames(&ctx.frames_dir("source"), &[gradient(0)]);
        assert_eq!(execute(&ctx).unwrap().status(), StageStatus::Failed);

        let tolerant = context(
            dir.path(),
            json!({"ground_truth": {"enabled": true, "compare": {"fail_on_frame_count_mismatch": false}}}),
        );
        let result = execute(&tolerant).unwrap();
        assert_eq!(result.status(), StageStatus::Success);
        assert!(result.errors()[0].is_warning());
    }

    #[test]
    fn disabled_ground_truth_marks_inference_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), json!({"ground_truth": {"enabled": false}}));
        seed_infer_report(&ctx);

        let result = execute(&ctx).unwrap();
        assert_eq!(result.status(), StageStatus::Success);
        assert_eq!(result.outputs()["skipped"], true);

        let infer = load_stage_report(&ctx.stage_report_path(INFER_STAGE)).unwrap();
        assert_eq!(infer.status(), StageStatus::Success);
        assert_eq!(infer.outputs()["ground_truth_compare_status"], "disabled");
        assert_eq!(infer.outputs()["ground_truth_compare_enabled"], false);
    }

    #[test]
    fn missing_frames_fail_without_an_inference_record() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), enabled());

        let result = execute(&ctx).unwrap();
        assert_eq!(result.status(), StageStatus::Failed);
        assert!(!ctx.stage_report_path(INFER_STAGE).exists());
    }
}
