use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::config::ConfigError;
use crate::model::StageError;
use crate::util::sha256_hex;

pub const TRAINING_INPUTS_FIELD: &str = "training_input_anims";
pub const NEIGHBOR_MESH_FIELD: &str = "nnm_sections";

/// Fields compared by the structural equivalence check, in report order.
pub const STRUCTURAL_FIELDS: [&str; 7] = [
    "model_type",
    "skeletal_mesh",
    "deformer_graph",
    "test_anim",
    TRAINING_INPUTS_FIELD,
    NEIGHBOR_MESH_FIELD,
    "model_overrides",
];

const FLOAT_PRECISION: f64 = 1e8;

/// Where the training data for a run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    ReferenceSourced,
    PipelineProduced,
}

impl ExecutionMode {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reference" | "reference-sourced" | "reference_sourced" => Ok(Self::ReferenceSourced),
            "pipeline" | "pipeline-produced" | "pipeline_produced" => Ok(Self::PipelineProduced),
            _ => Err(ConfigError::UnknownMode(raw.trim().to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReferenceSourced => "reference",
            Self::PipelineProduced => "pipeline",
        }
    }

    pub fn threshold_label(self) -> &'static str {
        match self {
            Self::ReferenceSourced => "strict",
            Self::PipelineProduced => "pipeline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub ssim_mean_min: f64,
    pub ssim_p05_min: f64,
    pub psnr_mean_min: f64,
    pub psnr_min_min: f64,
    pub edge_iou_mean_min: f64,
}

impl ThresholdSet {
    pub const STRICT: Self = Self {
        ssim_mean_min: 0.995,
        ssim_p05_min: 0.985,
        psnr_mean_min: 35.0,
        psnr_min_min: 30.0,
        edge_iou_mean_min: 0.97,
    };

    /// Retrained models see different source animations than the reference
    /// project, so their output is only expected to be close, not identical.
    pub const PIPELINE: Self = Self {
        ssim_mean_min: 0.60,
        ssim_p05_min: 0.40,
        psnr_mean_min: 15.0,
        psnr_min_min: 12.0,
        edge_iou_mean_min: 0.40,
    };

    pub fn entries(&self) -> [(&'static str, f64); 5] {
        [
            ("ssim_mean_min", self.ssim_mean_min),
            ("ssim_p05_min", self.ssim_p05_min),
            ("psnr_mean_min", self.psnr_mean_min),
            ("psnr_min_min", self.psnr_min_min),
            ("edge_iou_mean_min", self.edge_iou_mean_min),
        ]
    }

    /// Reads the five known keys from a configured mapping. Missing or
    /// non-numeric values read as 0.0 so an incomplete mapping never equals a
    /// canonical set; unknown keys are ignored.
    pub fn from_map(raw: &Map<String, Value>) -> Self {
        let read = |key: &str| -> f64 {
            match raw.get(key) {
                Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
                Some(Value::String(text)) => text.trim().parse::<f64>().unwrap_or(0.0),
                _ => 0.0,
            }
        };
        Self {
            ssim_mean_min: read("ssim_mean_min"),
            ssim_p05_min: read("ssim_p05_min"),
            psnr_mean_min: read("psnr_mean_min"),
            psnr_min_min: read("psnr_min_min"),
            edge_iou_mean_min: read("edge_iou_mean_min"),
        }
    }

    /// Compact JSON with sorted keys; the hashing input.
    pub fn canonical_json(&self) -> String {
        let sorted = self
            .entries()
            .into_iter()
            .collect::<BTreeMap<&str, f64>>();
        serde_json::to_string(&sorted).unwrap_or_default()
    }

    pub fn hash(&self) -> String {
        sha256_hex(self.canonical_json().as_bytes())
    }
}

pub fn required_thresholds(mode: ExecutionMode) -> ThresholdSet {
    match mode {
        ExecutionMode::ReferenceSourced => ThresholdSet::STRICT,
        ExecutionMode::PipelineProduced => ThresholdSet::PIPELINE,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdValidation {
    pub ok: bool,
    pub matches_required: bool,
    pub debug_override: bool,
    pub configured_hash: String,
    pub required_hash: String,
    pub diagnostic: Option<String>,
}

pub fn validate_thresholds(
    configured: &ThresholdSet,
    required: &ThresholdSet,
    debug_override: bool,
) -> ThresholdValidation {
    let matches_required = configured
        .entries()
        .iter()
        .zip(required.entries().iter())
        .all(|((_, lhs), (_, rhs))| lhs == rhs);
    let configured_hash = configured.hash();
    let required_hash = required.hash();

    let diagnostic = if matches_required {
        None
    } else if debug_override {
        Some(format!(
            "configured thresholds hash {configured_hash} differs from required hash {required_hash}; accepted because debug override is enabled"
        ))
    } else {
        Some(format!(
            "configured thresholds hash {configured_hash} differs from required hash {required_hash}"
        ))
    };

    ThresholdValidation {
        ok: matches_required || debug_override,
        matches_required,
        debug_override,
        configured_hash,
        required_hash,
        diagnostic,
    }
}

/// Thresholds a comparison must be gated with, plus the audit trail of how
/// they were chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdDecision {
    pub mode: ExecutionMode,
    pub profile_name: String,
    pub configured: Option<ThresholdSet>,
    pub required: ThresholdSet,
    pub effective: ThresholdSet,
    pub validation: Option<ThresholdValidation>,
}

impl ThresholdDecision {
    pub fn violation(&self) -> Option<StageError> {
        let validation = self.validation.as_ref()?;
        if validation.ok {
            return None;
        }
        let configured = self.configured.unwrap_or(self.required);
        Some(
            StageError::new(format!(
                "ground-truth thresholds are not {} while debug mode is disabled",
                self.mode.threshold_label()
            ))
            .with_serialized("configured_thresholds", &configured)
            .with_serialized("required_thresholds", &self.required)
            .with("training_data_source", self.mode.as_str())
            .with("configured_thresholds_hash", validation.configured_hash.clone())
            .with("required_thresholds_hash", validation.required_hash.clone()),
        )
    }
}

/// Picks the gate thresholds: configured values are used only when they pass
/// validation, otherwise the canonical set for the mode applies.
pub fn decide_thresholds(
    mode: ExecutionMode,
    configured: Option<&Map<String, Value>>,
    debug_override: bool,
) -> ThresholdDecision {
    let required = required_thresholds(mode);
    let configured = configured.map(ThresholdSet::from_map);
    let validation = configured
        .as_ref()
        .map(|set| validate_thresholds(set, &required, debug_override));
    let effective = match (&configured, &validation) {
        (Some(set), Some(check)) if check.ok => *set,
        _ => required,
    };

    ThresholdDecision {
        mode,
        profile_name: mode.threshold_label().to_string(),
        configured,
        required,
        effective,
        validation,
    }
}

pub fn allowed_mismatch_fields(mode: ExecutionMode) -> BTreeSet<&'static str> {
    match mode {
        ExecutionMode::ReferenceSourced => BTreeSet::new(),
        ExecutionMode::PipelineProduced => [TRAINING_INPUTS_FIELD, NEIGHBOR_MESH_FIELD]
            .into_iter()
            .collect(),
    }
}

/// Sorts mapping keys and rounds floats so two dumps of the same setup compare equal.
pub fn normalize_for_compare(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted = map
                .iter()
                .map(|(key, value)| (key.clone(), normalize_for_compare(value)))
                .collect::<BTreeMap<String, Value>>();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_for_compare).collect()),
        Value::Number(number) if number.is_f64() => number
            .as_f64()
            .map(|raw| (raw * FLOAT_PRECISION).round() / FLOAT_PRECISION)
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldComparison {
    pub same: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allowed_mismatch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuralDiff {
    pub all_match: bool,
    pub mismatch_fields: Vec<String>,
    pub expected_mismatch_fields: Vec<String>,
    pub fields: BTreeMap<String, FieldComparison>,
}

pub fn structural_diff(
    reference: &Map<String, Value>,
    current: &Map<String, Value>,
    allowed: &BTreeSet<&str>,
) -> StructuralDiff {
    let mut fields = BTreeMap::new();
    let mut mismatch_fields = Vec::new();
    let mut expected_mismatch_fields = Vec::new();

    for field in STRUCTURAL_FIELDS {
        let expected = normalize_for_compare(&structural_value(reference, field));
        let actual = normalize_for_compare(&structural_value(current, field));
        if expected == actual {
            fields.insert(
                field.to_string(),
                FieldComparison {
                    same: true,
                    allowed_mismatch: false,
                    expected: None,
                    actual: None,
                },
            );
            continue;
        }

        let allowed_mismatch = allowed.contains(field);
        if allowed_mismatch {
            expected_mismatch_fields.push(field.to_string());
        } else {
            mismatch_fields.push(field.to_string());
        }
        fields.insert(
            field.to_string(),
            FieldComparison {
                same: false,
                allowed_mismatch,
                expected: Some(expected),
                actual: Some(actual),
            },
        );
    }

    StructuralDiff {
        all_match: mismatch_fields.is_empty(),
        mismatch_fields,
        expected_mismatch_fields,
        fields,
    }
}

/// Errors from a structural check whose `mismatch_fields` are not all allow-listed.
/// Errors without a `mismatch_fields` list are always kept.
pub fn unexpected_mismatch_errors(
    errors: &[StageError],
    allowed: &BTreeSet<&str>,
) -> Vec<StageError> {
    errors
        .iter()
        .filter(|error| {
            let Some(Value::Array(fields)) = error.detail.get("mismatch_fields") else {
                return true;
            };
            !fields
                .iter()
                .all(|field| field.as_str().is_some_and(|name| allowed.contains(name)))
        })
        .cloned()
        .collect()
}

/// A structural field's value: the field itself, or its `<field>_json`
/// string-encoded twin, falling back to the field's empty shape.
fn structural_value(row: &Map<String, Value>, field: &str) -> Value {
    let fallback = match field {
        TRAINING_INPUTS_FIELD | NEIGHBOR_MESH_FIELD => Value::Array(Vec::new()),
        "model_overrides" => Value::Object(Map::new()),
        _ => Value::String(String::new()),
    };

    if let Some(value) = row.get(field).filter(|value| !value.is_null()) {
        return value.clone();
    }
    match row.get(&format!("{field}_json")) {
        Some(Value::String(encoded)) if !encoded.trim().is_empty() => {
            serde_json::from_str(encoded).unwrap_or(fallback)
        }
        Some(value) if !value.is_null() && !value.is_string() => value.clone(),
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn reference_row() -> Map<String, Value> {
        object(json!({
            "model_type": "NeuralMorphModel",
            "skeletal_mesh": "/Game/Characters/Body.Body",
            "deformer_graph": "/Game/Deformers/DG_Default",
            "test_anim": "/Game/Anims/Test",
            "training_input_anims_json": "[{\"anim\": \"/Game/Anims/A\", \"geom_cache\": \"/Game/GC/A\"}]",
            "nnm_sections_json": "[{\"section\": 0, \"neighbor_mesh\": \"/Game/N0\"}]",
            "model_overrides_json": "{\"num_iterations\": 1000, \"learning_rate\": 0.0010000000001}"
        }))
    }

    #[test]
    fn required_thresholds_differ_per_mode() {
        let strict = required_thresholds(ExecutionMode::parse("reference-sourced").unwrap());
        let pipeline = required_thresholds(ExecutionMode::parse("pipeline-produced").unwrap());
        assert_eq!(strict, ThresholdSet::STRICT);
        assert_eq!(pipeline, ThresholdSet::PIPELINE);
        assert_ne!(strict, pipeline);
        assert!(matches!(
            ExecutionMode::parse("hybrid"),
            Err(ConfigError::UnknownMode(_))
        ));
    }

    #[test]
    fn canonical_json_sorts_keys_without_whitespace() {
        assert_eq!(
            ThresholdSet::STRICT.canonical_json(),
            "{\"edge_iou_mean_min\":0.97,\"psnr_mean_min\":35.0,\"psnr_min_min\":30.0,\"ssim_mean_min\":0.995,\"ssim_p05_min\":0.985}"
        );
        assert_eq!(ThresholdSet::STRICT.hash().len(), 64);
        assert_ne!(ThresholdSet::STRICT.hash(), ThresholdSet::PIPELINE.hash());
    }

    #[test]
    fn weaker_thresholds_fail_without_debug_override() {
        let mut loose = ThresholdSet::STRICT;
        loose.psnr_min_min = 20.0;

        let denied = validate_thresholds(&loose, &ThresholdSet::STRICT, false);
        assert!(!denied.ok);
        assert!(!denied.matches_required);
        let diagnostic = denied.diagnostic.unwrap();
        assert!(diagnostic.contains(&denied.configured_hash));
        assert!(diagnostic.contains(&denied.required_hash));

        let allowed = validate_thresholds(&loose, &ThresholdSet::STRICT, true);
        assert!(allowed.ok);

        let exact = validate_thresholds(&ThresholdSet::STRICT, &ThresholdSet::STRICT, false);
        assert!(exact.ok);
        assert!(exact.diagnostic.is_none());
    }

    #[test]
    fn incomplete_configured_map_never_validates() {
        let raw = object(json!({"ssim_mean_min": 0.995, "extra": 1}));
        let decision = decide_thresholds(ExecutionMode::ReferenceSourced, Some(&raw), false);
        assert_eq!(decision.effective, ThresholdSet::STRICT);
        assert!(decision.violation().is_some());
    }

    #[test]
    fn debug_override_uses_configured_thresholds() {
        let raw = object(json!({
            "ssim_mean_min": 0.5,
            "ssim_p05_min": 0.5,
            "psnr_mean_min": "10",
            "psnr_min_min": 10,
            "edge_iou_mean_min": 0.5
        }));
        let decision = decide_thresholds(ExecutionMode::ReferenceSourced, Some(&raw), true);
        assert_eq!(decision.effective.psnr_mean_min, 10.0);
        assert!(decision.violation().is_none());

        let absent = decide_thresholds(ExecutionMode::PipelineProduced, None, false);
        assert_eq!(absent.effective, ThresholdSet::PIPELINE);
        assert!(absent.violation().is_none());
    }

    #[test]
    fn pipeline_mode_allows_exactly_two_fields() {
        let allowed = allowed_mismatch_fields(ExecutionMode::PipelineProduced);
        assert_eq!(
            allowed.into_iter().collect::<Vec<_>>(),
            vec![NEIGHBOR_MESH_FIELD, TRAINING_INPUTS_FIELD]
        );
        assert!(allowed_mismatch_fields(ExecutionMode::ReferenceSourced).is_empty());
    }

    #[test]
    fn normalization_rounds_floats_and_sorts_keys() {
        let lhs = json!({"b": 0.1234567891, "a": [1, 2.000000001]});
        let rhs = json!({"a": [1, 2.0], "b": 0.12345679});
        assert_eq!(normalize_for_compare(&lhs), normalize_for_compare(&rhs));
    }

    #[test]
    fn identical_rows_match() {
        let diff = structural_diff(&reference_row(), &reference_row(), &BTreeSet::new());
        assert!(diff.all_match);
        assert!(diff.fields.values().all(|field| field.same));
    }

    #[test]
    fn decoded_json_fields_compare_against_plain_values() {
        let mut current = reference_row();
        current.remove("model_overrides_json");
        current.insert(
            "model_overrides".to_string(),
            json!({"learning_rate": 0.001, "num_iterations": 1000}),
        );
        let diff = structural_diff(&reference_row(), &current, &BTreeSet::new());
        assert!(diff.all_match, "{:?}", diff.mismatch_fields);
    }

    #[test]
    fn pipeline_mode_tolerates_training_source_changes_only() {
        let allowed = allowed_mismatch_fields(ExecutionMode::PipelineProduced);
        let mut current = reference_row();
        current.insert(
            "training_input_anims_json".to_string(),
            json!("[{\"anim\": \"/Game/Anims/B\"}]"),
        );
        current.insert("nnm_sections_json".to_string(), json!("[]"));

        let diff = structural_diff(&reference_row(), &current, &allowed);
        assert!(diff.all_match);
        assert_eq!(diff.expected_mismatch_fields.len(), 2);
        assert!(diff.fields[TRAINING_INPUTS_FIELD].allowed_mismatch);

        current.insert("deformer_graph".to_string(), json!("/Game/Deformers/Other"));
        let diff = structural_diff(&reference_row(), &current, &allowed);
        assert!(!diff.all_match);
        assert_eq!(diff.mismatch_fields, vec!["deformer_graph".to_string()]);
        assert_eq!(
            diff.fields["deformer_graph"].expected,
            Some(json!("/Game/Deformers/DG_Default"))
        );
    }

    #[test]
    fn unexpected_errors_filter_allow_listed_mismatches() {
        let allowed = allowed_mismatch_fields(ExecutionMode::PipelineProduced);
        let errors = vec![
            StageError::new("strict_clone mismatch: body")
                .with("mismatch_fields", vec!["training_input_anims", "nnm_sections"]),
            StageError::new("strict_clone mismatch: cloth")
                .with("mismatch_fields", vec!["nnm_sections", "model_type"]),
            StageError::new("dump failed"),
        ];
        let unexpected = unexpected_mismatch_errors(&errors, &allowed);
        assert_eq!(unexpected.len(), 2);
        assert_eq!(unexpected[0].message, "strict_clone mismatch: cloth");
    }
}
