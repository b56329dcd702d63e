use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Result, bail};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::cli::SetupDiffArgs;
use crate::context::RunContext;
use crate::model::{StageError, StageResult, StageStatus, fields};
use crate::pipeline::SETUP_DIFF_STAGE;
use crate::policy::{allowed_mismatch_fields, structural_diff};
use crate::stage::{self, StageCompletion};
use crate::util::read_json;

/// Key used when a dump describes a single asset rather than a list.
const SINGLE_ASSET_KEY: &str = "default";

pub fn run(args: SetupDiffArgs) -> Result<bool> {
    let ctx = RunContext::load(&args.run.config, &args.run.run_dir, &args.run.profile)?;
    let result = execute(&ctx, &args.reference, &args.current)?;
    Ok(result.status() == StageStatus::Success)
}

pub fn execute(ctx: &RunContext, reference: &Path, current: &Path) -> Result<StageResult> {
    let mut inputs = ctx.base_inputs();
    inputs.insert("reference_dump".to_string(), Value::from(reference.display().to_string()));
    inputs.insert("current_dump".to_string(), Value::from(current.display().to_string()));

    stage::run_guarded(ctx, SETUP_DIFF_STAGE, inputs, |ctx| {
        diff_dumps(ctx, reference, current)
    })
}

fn diff_dumps(ctx: &RunContext, reference: &Path, current: &Path) -> Result<StageCompletion> {
    let mode = ctx.execution_mode()?;
    let allowed = allowed_mismatch_fields(mode);
    let reference_rows = load_dump(reference)?;
    let current_rows = load_dump(current)?;

    let keys = reference_rows
        .keys()
        .chain(current_rows.keys())
        .cloned()
        .collect::<BTreeSet<_>>();

    let mut errors = Vec::new();
    let mut assets = Map::new();
    for key in keys {
        let (Some(expected), Some(actual)) = (reference_rows.get(&key), current_rows.get(&key)) else {
            let side = if reference_rows.contains_key(&key) {
                "current"
            } else {
                "reference"
            };
            warn!(key = %key, side, "asset missing from setup dump");
            errors.push(
                StageError::new(format!("asset missing from {side} setup dump")).with("key", key),
            );
            continue;
        };

        let diff = structural_diff(expected, actual, &allowed);
        if !diff.all_match {
            warn!(key = %key, fields = ?diff.mismatch_fields, "structural mismatch");
            errors.push(
                StageError::new(format!("setup mismatch for {key}"))
                    .with("key", key.clone())
                    .with("mismatch_fields", diff.mismatch_fields.clone()),
            );
        }
        assets.insert(key, serde_json::to_value(&diff)?);
    }

    info!(
        assets = assets.len(),
        mismatches = errors.len(),
        training_data_source = %mode.as_str(),
        "setup diff finished"
    );

    let outputs = fields(json!({
        "training_data_source": mode.as_str(),
        "allowed_mismatch_fields": allowed,
        "all_match": errors.is_empty(),
        "assets": assets,
    }));
    Ok(StageCompletion::new(outputs, errors))
}

/// Asset rows of a structural dump keyed by asset key.
///
/// A dump is either one object of fields or `{"assets": [{"key": ..}, ..]}`.
fn load_dump(path: &Path) -> Result<BTreeMap<String, Map<String, Value>>> {
    let value: Value = read_json(path)?;
    let Value::Object(root) = value else {
        bail!("setup dump root must be an object: {}", path.display());
    };

    let Some(assets) = root.get("assets") else {
        return Ok(BTreeMap::from([(SINGLE_ASSET_KEY.to_string(), root)]));
    };
    let Value::Array(items) = assets else {
        bail!("setup dump assets must be a list: {}", path.display());
    };

    let mut rows = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        let Value::Object(row) = item else {
            bail!("setup dump asset {index} is not an object: {}", path.display());
        };
        let key = row
            .get("key")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("asset_{index}"));
        rows.insert(key, row.clone());
    }
    Ok(rows)
}
