use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::report::LATEST_REPORT;
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<bool> {
    let latest_path = args.run_dir.join("reports").join(LATEST_REPORT);

    info!(run_dir = %args.run_dir.display(), "status requested");

    if !latest_path.exists() {
        warn!(path = %latest_path.display(), "pipeline report missing");
        return Ok(true);
    }

    let report: Value = read_json(&latest_path)
        .with_context(|| format!("failed to load pipeline report {}", latest_path.display()))?;
    let text = |key: &str| report.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

    let error_count = report.get("errors").and_then(Value::as_array).map_or(0, Vec::len);
    info!(
        profile = %text("profile"),
        status = %text("status"),
        started_at = %text("started_at"),
        ended_at = %text("ended_at"),
        errors = error_count,
        "loaded pipeline report"
    );

    if let Some(stages) = report
        .pointer("/outputs/stage_status")
        .and_then(Value::as_object)
    {
        for (stage, status) in stages {
            let status = status.as_str().unwrap_or_default();
            if status == "success" || status == "skipped_by_policy" {
                info!(stage = %stage, status = %status, "stage status");
            } else {
                warn!(stage = %stage, status = %status, "stage status");
            }
        }
    }

    if let Some(errors) = report.get("errors").and_then(Value::as_array) {
        for entry in errors {
            let stage = entry.get("stage").and_then(Value::as_str).unwrap_or_default();
            let message = entry.get("message").and_then(Value::as_str).unwrap_or_default();
            warn!(stage = %stage, message = %message, "pipeline error");
        }
    }

    Ok(true)
}
