use anyhow::Result;
use serde_json::{Value, json};
use tracing::info;

use crate::cli::ExecArgs;
use crate::context::RunContext;
use crate::model::{StageResult, StageStatus, fields};
use crate::stage::{self, StageCompletion};
use crate::supervisor::run_command;

pub fn run(args: ExecArgs) -> Result<bool> {
    let ctx = RunContext::load(&args.run.config, &args.run.run_dir, &args.run.profile)?;
    let result = execute(&ctx, &args.stage, &args.command)?;
    Ok(result.status() == StageStatus::Success)
}

/// Runs `command` as stage `stage` under the process guard.
pub fn execute(ctx: &RunContext, stage: &str, command: &[String]) -> Result<StageResult> {
    let mut inputs = ctx.base_inputs();
    inputs.insert("command".to_string(), json!(command));

    stage::run_guarded(ctx, stage, inputs, |ctx| {
        let settings = ctx.config.guard_settings(stage);
        let (stdout_path, stderr_path) = ctx.log_paths(stage);
        info!(stage = %stage, program = %command.first().map(String::as_str).unwrap_or_default(), "launching guarded command");

        let process = run_command(command, &stdout_path, &stderr_path, &settings)?;
        let errors = if process.exited_cleanly() {
            Vec::new()
        } else {
            vec![process.failure("guarded command failed")]
        };

        let outputs = fields(json!({
            "command": command,
            "stdout_log": stdout_path.display().to_string(),
            "stderr_log": stderr_path.display().to_string(),
            "process": serde_json::to_value(&process).unwrap_or(Value::Null),
        }));
        Ok(StageCompletion::new(outputs, errors))
    })
}
