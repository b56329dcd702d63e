use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::capture::{FallbackStep, run_chain};
use crate::cli::{CaptureArgs, CaptureKind};
use crate::config::{CaptureSection, require_value};
use crate::context::RunContext;
use crate::model::{ProcessRunResult, StageResult, StageStatus, fields};
use crate::stage::{self, StageCompletion};
use crate::supervisor::run_command;
use crate::util::{ensure_directory, read_json_lenient};

const EXECUTOR_CLASS: &str =
    "-MoviePipelineLocalExecutorClass=/Script/MovieRenderPipelineCore.MoviePipelinePythonHostExecutor";
const EXECUTOR_PYTHON_CLASS: &str = "-ExecutorPythonClass=/Engine/PythonTypes.Hou2UeDemoRuntimeExecutor";
const UNATTENDED_FLAGS: [&str; 8] = [
    "-NoLoadingScreen",
    "-NoSound",
    "-unattended",
    "-nop4",
    "-nosplash",
    "-stdout",
    "-FullStdOutLogOutput",
    "-log",
];
const GAME_FLAG: &str = "-game";

pub const SOURCE_PROJECT_FALLBACK: &str = "reference_project_missing_module_fallback_to_source_project";
pub const DROP_GAME_FALLBACK: &str = "retry_without_game_flag";

pub fn run(args: CaptureArgs) -> Result<bool> {
    let ctx = RunContext::load(&args.run.config, &args.run.run_dir, &args.run.profile)?;
    let result = execute(&ctx, args.kind)?;
    Ok(result.status() == StageStatus::Success)
}

pub fn execute(ctx: &RunContext, kind: CaptureKind) -> Result<StageResult> {
    let stage = kind.stage_name();
    let mut inputs = ctx.base_inputs();
    inputs.insert("capture_kind".to_string(), Value::from(kind.as_str()));

    stage::run_guarded(ctx, stage, inputs, |ctx| capture(ctx, kind))
}

/// Everything that goes into one editor invocation.
#[derive(Debug, Clone)]
struct Invocation {
    editor: String,
    project: String,
    map: String,
    level_sequence: String,
    output_dir: PathBuf,
    job_report: PathBuf,
    width: u32,
    height: u32,
    warmup_frames: u32,
    extra_args: Vec<String>,
}

impl Invocation {
    fn command(&self) -> Vec<String> {
        let mut command = vec![
            self.editor.clone(),
            self.project.clone(),
            self.map.clone(),
            GAME_FLAG.to_string(),
            EXECUTOR_CLASS.to_string(),
            EXECUTOR_PYTHON_CLASS.to_string(),
            format!("-DemoSequence={}", self.level_sequence),
            format!("-DemoMap={}", self.map),
            format!("-DemoOutputDir={}", self.output_dir.display()),
            format!("-DemoResX={}", self.width),
            format!("-DemoResY={}", self.height),
            format!("-DemoWarmupFrames={}", self.warmup_frames),
            format!("-DemoReportJson={}", self.job_report.display()),
        ];
        command.extend(UNATTENDED_FLAGS.iter().map(|flag| flag.to_string()));
        command.extend(self.extra_args.iter().cloned());
        command
    }
}

/// What one capture attempt left behind.
#[derive(Debug, Clone, Serialize)]
struct CaptureAttempt {
    process: ProcessRunResult,
    executor_report: Option<Value>,
    frame_count: usize,
    first_frame: Option<String>,
    last_frame: Option<String>,
}

impl CaptureAttempt {
    fn executor_status(&self) -> Option<&str> {
        self.executor_report
            .as_ref()
            .and_then(|report| report.get("status"))
            .and_then(Value::as_str)
    }

    fn succeeded(&self) -> bool {
        self.process.exited_cleanly()
            && self
                .executor_status()
                .is_some_and(|status| status.eq_ignore_ascii_case("success"))
            && self.frame_count > 0
    }
}

fn capture(ctx: &RunContext, kind: CaptureKind) -> Result<StageCompletion> {
    let ground_truth = &ctx.config.ground_truth;
    if !ground_truth.enabled {
        info!(kind = %kind.as_str(), "ground truth disabled, capture skipped");
        return Ok(StageCompletion::new(
            fields(json!({
                "enabled": false,
                "skipped": true,
                "reason": "ground_truth.enabled is false",
            })),
            Vec::new(),
        ));
    }

    let settings = &ground_truth.capture;
    let source_project = require_value(
        settings.source_project.as_deref(),
        "ground_truth.capture.source_project",
    )?;
    let project = match kind {
        CaptureKind::Reference => require_value(
            settings.reference_project.as_deref(),
            "ground_truth.capture.reference_project",
        )?,
        CaptureKind::Source => source_project.clone(),
    };

    let stage = kind.stage_name();
    let invocation = Invocation {
        editor: require_value(settings.editor.as_deref(), "ground_truth.capture.editor")?,
        project,
        map: require_value(settings.map.as_deref(), "ground_truth.capture.map")?,
        level_sequence: require_value(
            settings.level_sequence.as_deref(),
            "ground_truth.capture.level_sequence",
        )?,
        output_dir: ctx.frames_dir(kind.as_str()),
        job_report: ctx.reports_dir().join(format!("{stage}_job.json")),
        width: settings.width,
        height: settings.height,
        warmup_frames: settings.warmup_frames,
        extra_args: settings.extra_args.clone(),
    };
    ensure_directory(&invocation.output_dir)?;

    let guard = ctx.config.guard_settings(stage);
    let (stdout_path, stderr_path) = ctx.log_paths(stage);
    let steps = fallback_steps(kind, &invocation.project, &source_project);

    let chain = run_chain(
        invocation.command(),
        &steps,
        |command| -> Result<CaptureAttempt> {
            clear_outputs(&invocation.output_dir, &invocation.job_report)?;
            let process = run_command(command, &stdout_path, &stderr_path, &guard)?;
            let frames = list_frames(&invocation.output_dir)?;
            Ok(CaptureAttempt {
                process,
                executor_report: read_json_lenient(&invocation.job_report),
                frame_count: frames.len(),
                first_frame: frames.first().cloned(),
                last_frame: frames.last().cloned(),
            })
        },
        CaptureAttempt::succeeded,
        |attempt| missing_module_reported(&attempt.process, settings),
    )?;

    let last = chain.last().context("capture chain ran no attempts")?;
    let chosen_project = last.command.get(1).cloned().unwrap_or_default();
    info!(
        kind = %kind.as_str(),
        attempts = chain.attempts.len(),
        frames = last.result.frame_count,
        succeeded = chain.succeeded,
        "capture finished"
    );

    let mut errors = Vec::new();
    if !chain.succeeded {
        errors.push(
            last.result
                .process
                .failure("ground-truth capture failed")
                .with("executor_report", last.result.executor_report.clone().unwrap_or(Value::Null))
                .with("frame_count", last.result.frame_count),
        );
    }

    let attempts = chain
        .attempts
        .iter()
        .map(|attempt| {
            json!({
                "command": attempt.command,
                "fallback": attempt.fallback,
                "process": attempt.result.process,
                "frame_count": attempt.result.frame_count,
            })
        })
        .collect::<Vec<_>>();

    let outputs = fields(json!({
        "enabled": true,
        "capture_kind": kind.as_str(),
        "project": chosen_project,
        "map": invocation.map,
        "level_sequence": invocation.level_sequence,
        "width": invocation.width,
        "height": invocation.height,
        "warmup_frames": invocation.warmup_frames,
        "frame_count": last.result.frame_count,
        "first_frame": last.result.first_frame,
        "last_frame": last.result.last_frame,
        "output_dir": invocation.output_dir.display().to_string(),
        "executor_report_json": invocation.job_report.display().to_string(),
        "executor_report": last.result.executor_report,
        "fallback_used": chain.fallback_used(),
        "fallback_reason": chain.fallback_reason(),
        "command": last.command,
        "process": last.result.process,
        "attempts": attempts,
    }));

    Ok(StageCompletion::new(outputs, errors))
}

fn fallback_steps(kind: CaptureKind, project: &str, source_project: &str) -> Vec<FallbackStep> {
    let mut steps = Vec::new();
    if kind == CaptureKind::Reference && project != source_project {
        steps.push(FallbackStep::SubstituteArg {
            index: 1,
            value: source_project.to_string(),
            reason: SOURCE_PROJECT_FALLBACK.to_string(),
        });
    }
    steps.push(FallbackStep::DropFlag {
        flag: GAME_FLAG.to_string(),
        reason: DROP_GAME_FALLBACK.to_string(),
    });
    steps
}

/// Whether the editor gave up because a game module could not be loaded.
///
/// Configured markers are matched case-insensitively in addition to the
/// built-in phrases.
fn missing_module_reported(process: &ProcessRunResult, settings: &CaptureSection) -> bool {
    let blob = process.tails().collect::<Vec<_>>().join("\n").to_lowercase();
    let builtin = (blob.contains("game module") && blob.contains("could not be found"))
        || blob.contains("module 'mldeformersample'");
    if builtin {
        return true;
    }
    settings
        .missing_module_markers
        .iter()
        .map(|marker| marker.trim().to_lowercase())
        .any(|marker| !marker.is_empty() && blob.contains(&marker))
}

fn clear_outputs(frame_dir: &Path, job_report: &Path) -> Result<()> {
    for name in list_frames(frame_dir)? {
        let path = frame_dir.join(&name);
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove stale frame {}", path.display()))?;
    }
    if job_report.exists() {
        fs::remove_file(job_report)
            .with_context(|| format!("failed to remove stale job report {}", job_report.display()))?;
    }
    Ok(())
}

/// Sorted paths, relative to `frame_dir`, of every `*.png` frame beneath it.
fn list_frames(frame_dir: &Path) -> Result<Vec<String>> {
    if !frame_dir.is_dir() {
        warn!(path = %frame_dir.display(), "frame directory missing");
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    collect_frames(frame_dir, &mut found)?;

    let mut frames = found
        .iter()
        .filter_map(|path| path.strip_prefix(frame_dir).ok())
        .map(|relative| relative.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    frames.sort();
    Ok(frames)
}

fn collect_frames(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read frame directory {}", dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_frames(&path, out)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
        {
            out.push(path);
        }
    }
    Ok(())
}
