use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, info};

use crate::context::RunContext;
use crate::model::{Fields, Outcome, StageError, StageResult, StageRun};
use crate::util::{read_json_lenient, write_json_pretty};

pub fn stage_report_path(run_dir: &Path, stage: &str) -> PathBuf {
    run_dir.join("reports").join(format!("{stage}_report.json"))
}

/// Writes the record, replacing any earlier record for the same stage.
pub fn persist(path: &Path, result: &StageResult) -> Result<()> {
    write_json_pretty(path, result)
}

/// Unreadable or unparseable reports count as absent.
pub fn load_stage_report(path: &Path) -> Option<StageResult> {
    read_json_lenient(path)
}

/// What a stage body hands back on a normal return.
#[derive(Debug, Clone, Default)]
pub struct StageCompletion {
    pub outputs: Fields,
    pub errors: Vec<StageError>,
    forced_failure: bool,
}

impl StageCompletion {
    pub fn new(outputs: Fields, errors: Vec<StageError>) -> Self {
        Self {
            outputs,
            errors,
            forced_failure: false,
        }
    }

    /// Fails the stage even if every recorded error is a warning.
    pub fn fail_if(mut self, condition: bool) -> Self {
        self.forced_failure |= condition;
        self
    }

    pub fn outcome(&self) -> Outcome {
        if self.forced_failure {
            Outcome::Failed
        } else {
            Outcome::from_errors(&self.errors)
        }
    }
}

/// Recovery boundary for one stage.
///
/// Persists a `running` record, runs `body`, and always persists a finalized
/// record: an `Err` or a panic inside `body` becomes a `failed` record with
/// the message and a `trace`. Only a failure to write the record itself is
/// returned as an error.
pub fn run_guarded<F>(ctx: &RunContext, stage: &str, inputs: Fields, body: F) -> Result<StageResult>
where
    F: FnOnce(&RunContext) -> Result<StageCompletion>,
{
    let path = ctx.stage_report_path(stage);
    let run = StageRun::start(stage, &ctx.profile, inputs);
    persist(&path, run.record())?;
    info!(stage = %stage, path = %path.display(), "stage started");

    let result = match panic::catch_unwind(AssertUnwindSafe(|| body(ctx))) {
        Ok(Ok(completion)) => {
            let outcome = completion.outcome();
            run.finalize(outcome, completion.outputs, completion.errors)
        }
        Ok(Err(err)) => {
            error!(stage = %stage, error = %err, "stage failed");
            let failure = StageError::new(err.to_string()).with("trace", format!("{err:?}"));
            run.finalize(Outcome::Failed, Fields::new(), vec![failure])
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(stage = %stage, panic = %message, "stage panicked");
            let failure = StageError::new(format!("stage panicked: {message}"))
                .with("trace", format!("panic in stage {stage}: {message}"));
            run.finalize(Outcome::Failed, Fields::new(), vec![failure])
        }
    };

    persist(&path, &result)?;
    info!(
        stage = %result.stage(),
        mode = %result.mode(),
        status = %result.status().as_str(),
        ended_at = %result.ended_at(),
        errors = result.errors().len(),
        "stage finished"
    );
    Ok(result)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
