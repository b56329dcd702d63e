//! Edge overlap between two frames.
//!
//! Gradient magnitudes use central differences (one-sided at the borders).
//! A single cutoff at the 85th percentile of both magnitude maps together
//! turns them into edge masks, and each mask is dilated before matching so
//! sub-pixel jitter between renders does not count as a miss.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;

use super::stats::percentile;
use super::{GrayFrame, MetricsError, ensure_same_shape};

const EDGE_PERCENTILE: f64 = 85.0;
const MIN_EDGE_MAGNITUDE: f64 = 1e-6;
const DILATION_RADIUS: u8 = 3;

pub fn edge_overlap(reference: &GrayFrame, source: &GrayFrame) -> Result<f64, MetricsError> {
    ensure_same_shape(reference, source)?;
    let magnitude_x = gradient_magnitude(reference);
    let magnitude_y = gradient_magnitude(source);

    let mut combined = magnitude_x.clone();
    combined.extend_from_slice(&magnitude_y);
    let cutoff = percentile(&combined, EDGE_PERCENTILE)
        .unwrap_or(0.0)
        .max(MIN_EDGE_MAGNITUDE);

    let (width, height) = (reference.width(), reference.height());
    let edges_x = edge_mask(&magnitude_x, width, height, cutoff);
    let edges_y = edge_mask(&magnitude_y, width, height, cutoff);
    let dilated_x = dilate(&edges_x, Norm::LInf, DILATION_RADIUS);
    let dilated_y = dilate(&edges_y, Norm::LInf, DILATION_RADIUS);

    let mut union = 0usize;
    let mut matched = 0usize;
    let masks = edges_x
        .as_raw()
        .iter()
        .zip(edges_y.as_raw())
        .zip(dilated_x.as_raw().iter().zip(dilated_y.as_raw()));
    for ((&edge_x, &edge_y), (&near_x, &near_y)) in masks {
        let (edge_x, edge_y) = (edge_x > 0, edge_y > 0);
        if edge_x || edge_y {
            union += 1;
        }
        if (edge_x && near_y > 0) || (edge_y && near_x > 0) {
            matched += 1;
        }
    }

    if union == 0 {
        return Ok(1.0);
    }
    Ok(matched as f64 / union as f64)
}

fn gradient_magnitude(frame: &GrayFrame) -> Vec<f64> {
    let (width, height) = (frame.width(), frame.height());
    let mut out = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let along_rows = difference(height, y, |row| frame.at(x, row));
            let along_cols = difference(width, x, |col| frame.at(col, y));
            out.push(along_rows.hypot(along_cols));
        }
    }
    out
}

/// Central difference at `i`, one-sided at either end, zero on a single sample.
fn difference(len: usize, i: usize, sample: impl Fn(usize) -> f64) -> f64 {
    if len < 2 {
        0.0
    } else if i == 0 {
        sample(1) - sample(0)
    } else if i == len - 1 {
        sample(i) - sample(i - 1)
    } else {
        (sample(i + 1) - sample(i - 1)) / 2.0
    }
}

/// Foreground (255) wherever the magnitude reaches `cutoff`.
fn edge_mask(magnitude: &[f64], width: usize, height: usize, cutoff: f64) -> GrayImage {
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let value = magnitude[y as usize * width + x as usize];
        Luma([if value >= cutoff { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertical_edge(width: usize, height: usize, at: usize) -> GrayFrame {
        GrayFrame::from_fn(width, height, |x, _| if x < at { 0.0 } else { 255.0 })
    }

    #[test]
    fn blank_frames_overlap_fully() {
        let blank = GrayFrame::from_fn(8, 8, |_, _| 128.0);
        assert_eq!(edge_overlap(&blank, &blank).unwrap(), 1.0);
    }

    #[test]
    fn small_shift_is_absorbed_by_dilation() {
        let reference = vertical_edge(40, 20, 20);
        let shifted = vertical_edge(40, 20, 22);
        assert_eq!(edge_overlap(&reference, &shifted).unwrap(), 1.0);
    }

    #[test]
    fn distant_edges_do_not_overlap() {
        let reference = vertical_edge(60, 20, 10);
        let moved = vertical_edge(60, 20, 45);
        assert_eq!(edge_overlap(&reference, &moved).unwrap(), 0.0);
    }

    #[test]
    fn gradient_uses_one_sided_borders() {
        let ramp = GrayFrame::from_fn(4, 1, |x, _| (x * x) as f64);
        let magnitude = gradient_magnitude(&ramp);
        assert_eq!(magnitude, vec![1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn dilation_stops_at_frame_border() {
        let magnitude = (0..25).map(|i| if i == 0 { 9.0 } else { 0.0 }).collect::<Vec<_>>();
        let mask = edge_mask(&magnitude, 5, 5, 1.0);
        let grown = dilate(&mask, Norm::LInf, 1);
        let count = grown.as_raw().iter().filter(|&&value| value > 0).count();
        assert_eq!(count, 4);
        assert_eq!(grown.get_pixel(1, 1)[0], 255);
    }
}
