use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics::stats::{mean, min, percentile};
use crate::metrics::{FrameMetrics, GrayFrame, MetricsError, frame_metrics, write_heatmap};
use crate::model::StageError;
use crate::policy::ThresholdSet;

/// An ordered, indexable run of frames.
pub trait FrameSequence {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where the sequence lives, for diagnostics.
    fn origin(&self) -> String;

    fn label(&self, index: usize) -> String;

    fn load(&self, index: usize) -> Result<GrayFrame, MetricsError>;
}

/// PNG files under a directory tree, ordered by path.
#[derive(Debug, Clone)]
pub struct PngSequence {
    root: PathBuf,
    frames: Vec<PathBuf>,
}

impl PngSequence {
    /// A missing directory yields an empty sequence.
    pub fn collect(root: &Path) -> Result<Self> {
        let mut frames = Vec::new();
        if root.is_dir() {
            collect_pngs(root, &mut frames)?;
        }
        frames.sort();
        Ok(Self {
            root: root.to_path_buf(),
            frames,
        })
    }
}

fn collect_pngs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list frames in {}", dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_pngs(&path, out)?;
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

impl FrameSequence for PngSequence {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn origin(&self) -> String {
        self.root.display().to_string()
    }

    fn label(&self, index: usize) -> String {
        self.frames[index].display().to_string()
    }

    fn load(&self, index: usize) -> Result<GrayFrame, MetricsError> {
        GrayFrame::load(&self.frames[index])
    }
}

impl FrameSequence for Vec<GrayFrame> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn origin(&self) -> String {
        "memory".to_string()
    }

    fn label(&self, index: usize) -> String {
        format!("memory:{index}")
    }

    fn load(&self, index: usize) -> Result<GrayFrame, MetricsError> {
        Ok(self[index].clone())
    }
}

#[derive(Debug, Clone)]
pub struct CompareOptions {
    pub thresholds: ThresholdSet,
    pub fail_on_count_mismatch: bool,
    pub worst_frame_count: usize,
    pub heatmap_count: usize,
    pub window_size: usize,
    /// Heatmaps are skipped when unset.
    pub heatmap_dir: Option<PathBuf>,
}

impl CompareOptions {
    pub fn new(thresholds: ThresholdSet) -> Self {
        Self {
            thresholds,
            fail_on_count_mismatch: true,
            worst_frame_count: 10,
            heatmap_count: 5,
            window_size: 100,
            heatmap_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameComparisonRow {
    pub frame_index: usize,
    pub reference: String,
    pub source: String,
    #[serde(flatten)]
    pub metrics: FrameMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregates {
    pub frame_count_compared: usize,
    pub ssim_mean: f64,
    pub ssim_p05: f64,
    pub psnr_mean: f64,
    pub psnr_min: f64,
    pub edge_iou_mean: f64,
    pub body_roi_ssim_mean: f64,
    pub body_roi_ssim_p05: f64,
    pub body_roi_psnr_mean: f64,
    pub body_roi_psnr_min: f64,
}

impl MetricAggregates {
    pub fn from_rows(rows: &[FrameComparisonRow]) -> Option<Self> {
        let column = |pick: fn(&FrameMetrics) -> f64| {
            rows.iter().map(|row| pick(&row.metrics)).collect::<Vec<_>>()
        };
        let ssim = column(|m| m.ssim);
        let psnr = column(|m| m.psnr);
        let edge = column(|m| m.edge_iou);
        let roi_ssim = column(|m| m.body_roi_ssim);
        let roi_psnr = column(|m| m.body_roi_psnr);

        Some(Self {
            frame_count_compared: rows.len(),
            ssim_mean: mean(&ssim)?,
            ssim_p05: percentile(&ssim, 5.0)?,
            psnr_mean: mean(&psnr)?,
            psnr_min: min(&psnr)?,
            edge_iou_mean: mean(&edge)?,
            body_roi_ssim_mean: mean(&roi_ssim)?,
            body_roi_ssim_p05: percentile(&roi_ssim, 5.0)?,
            body_roi_psnr_mean: mean(&roi_psnr)?,
            body_roi_psnr_min: min(&roi_psnr)?,
        })
    }

    pub fn meets(&self, thresholds: &ThresholdSet) -> bool {
        self.ssim_mean >= thresholds.ssim_mean_min
            && self.ssim_p05 >= thresholds.ssim_p05_min
            && self.psnr_mean >= thresholds.psnr_mean_min
            && self.psnr_min >= thresholds.psnr_min_min
            && self.edge_iou_mean >= thresholds.edge_iou_mean_min
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub start_frame: usize,
    pub end_frame: usize,
    #[serde(flatten)]
    pub metrics: MetricAggregates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub reference_count: usize,
    pub source_count: usize,
    pub metrics: Option<MetricAggregates>,
    pub window_metrics: Vec<WindowMetrics>,
    pub worst_frames: Vec<FrameComparisonRow>,
    pub heatmaps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonOutcome {
    pub summary: ComparisonSummary,
    pub pass: bool,
    pub errors: Vec<StageError>,
}

pub fn compare<R, S>(reference: &R, source: &S, options: &CompareOptions) -> ComparisonOutcome
where
    R: FrameSequence + ?Sized,
    S: FrameSequence + ?Sized,
{
    let mut errors = Vec::new();
    let mut summary = ComparisonSummary {
        reference_count: reference.len(),
        source_count: source.len(),
        metrics: None,
        window_metrics: Vec::new(),
        worst_frames: Vec::new(),
        heatmaps: Vec::new(),
    };

    if reference.is_empty() {
        errors.push(
            StageError::new("reference frame sequence is empty").with("path", reference.origin()),
        );
    }
    if source.is_empty() {
        errors.push(StageError::new("source frame sequence is empty").with("path", source.origin()));
    }
    if !errors.is_empty() {
        return ComparisonOutcome {
            summary,
            pass: false,
            errors,
        };
    }

    let counts_differ = reference.len() != source.len();
    if counts_differ {
        let mismatch = if options.fail_on_count_mismatch {
            StageError::fatal("frame count mismatch")
        } else {
            StageError::warning("frame count mismatch")
        };
        warn!(
            reference_count = reference.len(),
            source_count = source.len(),
            "frame count mismatch"
        );
        errors.push(
            mismatch
                .with("reference_count", reference.len())
                .with("source_count", source.len()),
        );
    }

    let compare_count = reference.len().min(source.len());
    let mut rows = Vec::with_capacity(compare_count);
    for index in 0..compare_count {
        match compare_frame(reference, source, index) {
            Ok(row) => rows.push(row),
            Err(error) => errors.push(error),
        }
    }

    let Some(aggregates) = MetricAggregates::from_rows(&rows) else {
        return ComparisonOutcome {
            summary,
            pass: false,
            errors,
        };
    };

    let metrics_pass = aggregates.meets(&options.thresholds);
    let pass = metrics_pass && !(options.fail_on_count_mismatch && counts_differ);

    let mut ranked = rows.clone();
    ranked.sort_by(|lhs, rhs| {
        lhs.metrics
            .ssim
            .total_cmp(&rhs.metrics.ssim)
            .then_with(|| lhs.metrics.psnr.total_cmp(&rhs.metrics.psnr))
    });
    ranked.truncate(options.worst_frame_count);

    summary.window_metrics = rows
        .chunks(options.window_size.max(1))
        .filter_map(|chunk| {
            Some(WindowMetrics {
                start_frame: chunk.first()?.frame_index,
                end_frame: chunk.last()?.frame_index,
                metrics: MetricAggregates::from_rows(chunk)?,
            })
        })
        .collect();

    if let Some(dir) = &options.heatmap_dir {
        for row in ranked.iter().take(options.heatmap_count) {
            match render_heatmap(reference, source, row.frame_index, dir) {
                Ok(path) => summary.heatmaps.push(path.display().to_string()),
                Err(err) => {
                    warn!(frame_index = row.frame_index, error = %err, "heatmap not written");
                    errors.push(
                        StageError::warning("failed to write heatmap")
                            .with("frame_index", row.frame_index)
                            .with("detail", format!("{err:#}")),
                    );
                }
            }
        }
    }

    if !metrics_pass {
        errors.push(
            StageError::new("ground-truth metrics did not meet thresholds")
                .with_serialized("thresholds", &options.thresholds)
                .with("thresholds_hash", options.thresholds.hash())
                .with_serialized("metrics", &aggregates),
        );
    }

    info!(
        compared = aggregates.frame_count_compared,
        ssim_mean = aggregates.ssim_mean,
        ssim_p05 = aggregates.ssim_p05,
        psnr_mean = aggregates.psnr_mean,
        psnr_min = aggregates.psnr_min,
        edge_iou_mean = aggregates.edge_iou_mean,
        pass,
        "frame comparison finished"
    );

    summary.metrics = Some(aggregates);
    summary.worst_frames = ranked;
    ComparisonOutcome {
        summary,
        pass,
        errors,
    }
}

fn compare_frame<R, S>(reference: &R, source: &S, index: usize) -> Result<FrameComparisonRow, StageError>
where
    R: FrameSequence + ?Sized,
    S: FrameSequence + ?Sized,
{
    let load_error = |err: MetricsError| {
        StageError::new("failed to load frame")
            .with("frame_index", index)
            .with("detail", format!("{err}"))
    };
    let reference_frame = reference.load(index).map_err(load_error)?;
    let source_frame = source.load(index).map_err(load_error)?;

    if reference_frame.shape() != source_frame.shape() {
        let (ref_h, ref_w) = reference_frame.shape();
        let (src_h, src_w) = source_frame.shape();
        return Err(StageError::fatal("frame resolution mismatch")
            .with("frame_index", index)
            .with("reference_shape", vec![ref_h, ref_w])
            .with("source_shape", vec![src_h, src_w])
            .with("reference", reference.label(index))
            .with("source", source.label(index)));
    }

    let metrics = frame_metrics(&reference_frame, &source_frame).map_err(|err| {
        StageError::new("frame metrics failed")
            .with("frame_index", index)
            .with("detail", format!("{err}"))
    })?;

    Ok(FrameComparisonRow {
        frame_index: index,
        reference: reference.label(index),
        source: source.label(index),
        metrics,
    })
}

fn render_heatmap<R, S>(reference: &R, source: &S, index: usize, dir: &Path) -> Result<PathBuf>
where
    R: FrameSequence + ?Sized,
    S: FrameSequence + ?Sized,
{
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("frame_{index:04}.png"));
    write_heatmap(&reference.load(index)?, &source.load(index)?, &path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PSNR_CEILING;

    fn textured(seed: usize) -> GrayFrame {
        GrayFrame::from_fn(24, 24, move |x, y| ((x * 31 + y * 17 + seed) % 200) as f64 + 20.0)
    }

    fn noisy(frame: &GrayFrame, amplitude: f64) -> GrayFrame {
        GrayFrame::from_fn(frame.width(), frame.height(), |x, y| {
            frame.at(x, y) + if (x + y) % 2 == 0 { amplitude } else { -amplitude }
        })
    }

    fn sequence(count: usize) -> Vec<GrayFrame> {
        (0..count).map(textured).collect()
    }

    #[test]
    fn identical_sequences_pass_strict_thresholds() {
        let frames = sequence(3);
        let outcome = compare(&frames, &frames, &CompareOptions::new(ThresholdSet::STRICT));

        assert!(outcome.pass);
        assert!(outcome.errors.is_empty());
        for row in &outcome.summary.worst_frames {
            assert!((row.metrics.ssim - 1.0).abs() < 1e-9);
            assert_eq!(row.metrics.psnr, PSNR_CEILING);
            assert_eq!(row.metrics.edge_iou, 1.0);
        }
        let metrics = outcome.summary.metrics.unwrap();
        assert_eq!(metrics.frame_count_compared, 3);
        assert_eq!(metrics.psnr_min, PSNR_CEILING);
    }

    #[test]
    fn tiny_frames_do_not_produce_nan() {
        let reference = vec![GrayFrame::from_fn(2, 2, |_, _| 100.0)];
        let source = vec![GrayFrame::from_fn(2, 2, |x, y| if (x, y) == (0, 0) { 101.0 } else { 100.0 })];
        let outcome = compare(&reference, &source, &CompareOptions::new(ThresholdSet::PIPELINE));

        let metrics = outcome.summary.metrics.unwrap();
        assert!(metrics.ssim_mean.is_finite());
        assert!(metrics.psnr_mean.is_finite());
        assert!(metrics.edge_iou_mean.is_finite());
    }

    #[test]
    fn count_mismatch_fails_gate_when_flagged() {
        let reference = sequence(3);
        let source = sequence(2);
        let outcome = compare(&reference, &source, &CompareOptions::new(ThresholdSet::STRICT));

        assert!(!outcome.pass);
        assert_eq!(outcome.summary.metrics.unwrap().frame_count_compared, 2);
        let mismatch = &outcome.errors[0];
        assert_eq!(mismatch.message, "frame count mismatch");
        assert!(!mismatch.is_warning());
        assert_eq!(mismatch.detail["reference_count"], 3);
    }

    #[test]
    fn count_mismatch_is_a_warning_when_not_flagged() {
        let reference = sequence(3);
        let source = sequence(2);
        let options = CompareOptions {
            fail_on_count_mismatch: false,
            ..CompareOptions::new(ThresholdSet::STRICT)
        };
        let outcome = compare(&reference, &source, &options);

        assert!(outcome.pass);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].is_warning());
    }

    #[test]
    fn empty_sequence_fails_without_metrics() {
        let outcome = compare(&Vec::<GrayFrame>::new(), &sequence(2), &CompareOptions::new(ThresholdSet::STRICT));
        assert!(!outcome.pass);
        assert!(outcome.summary.metrics.is_none());
        assert_eq!(outcome.errors[0].message, "reference frame sequence is empty");
    }

    #[test]
    fn resolution_mismatch_excludes_only_that_frame() {
        let reference = sequence(3);
        let mut source = sequence(3);
        source[1] = GrayFrame::from_fn(20, 24, |_, _| 0.0);
        let outcome = compare(&reference, &source, &CompareOptions::new(ThresholdSet::STRICT));

        assert_eq!(outcome.summary.metrics.unwrap().frame_count_compared, 2);
        let error = outcome
            .errors
            .iter()
            .find(|error| error.message == "frame resolution mismatch")
            .unwrap();
        assert_eq!(error.detail["frame_index"], 1);
        assert_eq!(error.detail["source_shape"], serde_json::json!([24, 20]));
        assert!(outcome.pass);
    }

    #[test]
    fn worst_frames_rank_by_similarity_and_windows_chunk() {
        let reference = sequence(5);
        let source = reference
            .iter()
            .enumerate()
            .map(|(index, frame)| match index {
                1 => noisy(frame, 40.0),
                3 => noisy(frame, 15.0),
                _ => frame.clone(),
            })
            .collect::<Vec<_>>();
        let options = CompareOptions {
            worst_frame_count: 2,
            window_size: 2,
            ..CompareOptions::new(ThresholdSet::STRICT)
        };
        let outcome = compare(&reference, &source, &options);

        let worst = outcome
            .summary
            .worst_frames
            .iter()
            .map(|row| row.frame_index)
            .collect::<Vec<_>>();
        assert_eq!(worst, vec![1, 3]);
        assert!(!outcome.pass);
        assert_eq!(
            outcome.errors.last().unwrap().message,
            "ground-truth metrics did not meet thresholds"
        );

        let windows = &outcome.summary.window_metrics;
        assert_eq!(windows.len(), 3);
        assert_eq!((windows[0].start_frame, windows[0].end_frame), (0, 1));
        assert_eq!((windows[2].start_frame, windows[2].end_frame), (4, 4));
        assert_eq!(windows[2].metrics.frame_count_compared, 1);
    }

    #[test]
    fn heatmaps_are_written_for_the_worst_frames() {
        let dir = tempfile::tempdir().unwrap();
        let reference = sequence(4);
        let source = reference.iter().map(|frame| noisy(frame, 10.0)).collect::<Vec<_>>();
        let options = CompareOptions {
            heatmap_count: 2,
            heatmap_dir: Some(dir.path().join("heatmaps")),
            ..CompareOptions::new(ThresholdSet::PIPELINE)
        };
        let outcome = compare(&reference, &source, &options);

        assert_eq!(outcome.summary.heatmaps.len(), 2);
        for path in &outcome.summary.heatmaps {
            assert!(Path::new(path).exists());
            assert!(path.contains("frame_000"));
        }
    }

    #[test]
    fn png_sequence_collects_recursively_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("b");
        fs::create_dir_all(&nested).unwrap();
        let pixel = image::GrayImage::from_pixel(2, 2, image::Luma([9]));
        pixel.save(dir.path().join("c.png")).unwrap();
        pixel.save(nested.join("a.png")).unwrap();
        pixel.save(dir.path().join("a.png")).unwrap();
        fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let frames = PngSequence::collect(dir.path()).unwrap();
        let names = frames
            .frames
            .iter()
            .map(|path| path.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.png"),
                PathBuf::from("b").join("a.png"),
                PathBuf::from("c.png")
            ]
        );
        assert_eq!(frames.load(0).unwrap().at(1, 1), 9.0);

        let missing = PngSequence::collect(&dir.path().join("missing")).unwrap();
        assert!(missing.is_empty());
    }
}
