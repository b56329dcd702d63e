//! Windowed structural similarity (Wang et al.) with a uniform square window.
//!
//! Local means and second moments are box-filtered with half-sample
//! symmetric ("reflect") borders, so every pixel contributes one window
//! score and the result is the mean of that map. Frames narrower or shorter
//! than the window use a single global-statistics score instead; the two
//! formulas are not meant to agree at the size boundary.

use super::{GrayFrame, MetricsError, ensure_same_shape};

pub const SIMILARITY_WINDOW: usize = 11;

const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);
const DENOMINATOR_EPSILON: f64 = 1e-12;

pub fn similarity(reference: &GrayFrame, source: &GrayFrame) -> Result<f64, MetricsError> {
    ensure_same_shape(reference, source)?;
    if reference.pixels().is_empty() {
        return Ok(1.0);
    }
    if reference.width() < SIMILARITY_WINDOW || reference.height() < SIMILARITY_WINDOW {
        return Ok(global_similarity(reference.pixels(), source.pixels()));
    }
    Ok(windowed_similarity(reference, source))
}

fn score(mu_x: f64, mu_y: f64, var_x: f64, var_y: f64, cov: f64) -> f64 {
    let numerator = (2.0 * mu_x * mu_y + C1) * (2.0 * cov + C2);
    let denominator = (mu_x * mu_x + mu_y * mu_y + C1) * (var_x + var_y + C2);
    if denominator > DENOMINATOR_EPSILON {
        numerator / denominator
    } else {
        1.0
    }
}

fn global_similarity(x: &[f64], y: &[f64]) -> f64 {
    let count = x.len() as f64;
    let mu_x = x.iter().sum::<f64>() / count;
    let mu_y = y.iter().sum::<f64>() / count;
    let var_x = x.iter().map(|value| (value - mu_x).powi(2)).sum::<f64>() / count;
    let var_y = y.iter().map(|value| (value - mu_y).powi(2)).sum::<f64>() / count;
    let cov = x
        .iter()
        .zip(y)
        .map(|(a, b)| (a - mu_x) * (b - mu_y))
        .sum::<f64>()
        / count;
    score(mu_x, mu_y, var_x, var_y, cov)
}

fn windowed_similarity(reference: &GrayFrame, source: &GrayFrame) -> f64 {
    let (width, height) = (reference.width(), reference.height());
    let x = reference.pixels();
    let y = source.pixels();
    let product = |f: fn(f64, f64) -> f64| x.iter().zip(y).map(|(a, b)| f(*a, *b)).collect::<Vec<_>>();

    let ux = box_filter(x, width, height, SIMILARITY_WINDOW);
    let uy = box_filter(y, width, height, SIMILARITY_WINDOW);
    let uxx = box_filter(&product(|a, _| a * a), width, height, SIMILARITY_WINDOW);
    let uyy = box_filter(&product(|_, b| b * b), width, height, SIMILARITY_WINDOW);
    let uxy = box_filter(&product(|a, b| a * b), width, height, SIMILARITY_WINDOW);

    let total = (0..x.len())
        .map(|i| {
            let var_x = (uxx[i] - ux[i] * ux[i]).max(0.0);
            let var_y = (uyy[i] - uy[i] * uy[i]).max(0.0);
            let cov = uxy[i] - ux[i] * uy[i];
            score(ux[i], uy[i], var_x, var_y, cov)
        })
        .sum::<f64>();
    total / x.len() as f64
}

/// Separable mean filter over `size` samples per axis, reflected at the borders.
fn box_filter(data: &[f64], width: usize, height: usize, size: usize) -> Vec<f64> {
    let mut rows = vec![0.0; data.len()];
    for y in 0..height {
        let row = &data[y * width..(y + 1) * width];
        filter_line(row, size, &mut rows[y * width..(y + 1) * width]);
    }

    let mut out = vec![0.0; data.len()];
    let mut column = vec![0.0; height];
    let mut filtered = vec![0.0; height];
    for x in 0..width {
        for y in 0..height {
            column[y] = rows[y * width + x];
        }
        filter_line(&column, size, &mut filtered);
        for y in 0..height {
            out[y * width + x] = filtered[y];
        }
    }
    out
}

fn filter_line(line: &[f64], size: usize, out: &mut [f64]) {
    let len = line.len() as isize;
    let before = (size / 2) as isize;
    let after = size as isize - before - 1;
    for (i, slot) in out.iter_mut().enumerate() {
        let center = i as isize;
        let sum = (center - before..=center + after)
            .map(|index| line[reflect(index, len)])
            .sum::<f64>();
        *slot = sum / size as f64;
    }
}

/// Half-sample symmetric index: `d c b a | a b c d | d c b a`.
fn reflect(mut index: isize, len: isize) -> usize {
    loop {
        if index < 0 {
            index = -index - 1;
        } else if index >= len {
            index = 2 * len - index - 1;
        } else {
            return index as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(width: usize, height: usize) -> GrayFrame {
        GrayFrame::from_fn(width, height, |x, y| ((x * 31 + y * 17) % 200) as f64 + 20.0)
    }

    #[test]
    fn reflect_mirrors_including_the_edge_sample() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        assert_eq!(reflect(2, 5), 2);
    }

    #[test]
    fn box_filter_of_constant_is_constant() {
        let data = vec![42.0; 13 * 12];
        let filtered = box_filter(&data, 13, 12, SIMILARITY_WINDOW);
        assert!(filtered.iter().all(|value| (value - 42.0).abs() < 1e-9));
    }

    #[test]
    fn identical_frames_score_one() {
        let frame = textured(24, 16);
        assert!((similarity(&frame, &frame).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn noise_lowers_the_score() {
        let reference = textured(32, 32);
        let source = GrayFrame::from_fn(32, 32, |x, y| {
            reference.at(x, y) + if (x + y) % 2 == 0 { 25.0 } else { -25.0 }
        });
        let value = similarity(&reference, &source).unwrap();
        assert!(value < 0.97, "{value}");
        assert!(value > 0.0);
    }

    #[test]
    fn small_frames_use_global_statistics() {
        let reference = GrayFrame::from_fn(4, 4, |x, y| (x * 10 + y) as f64);
        let source = GrayFrame::from_fn(4, 4, |x, y| if (x, y) == (1, 1) { 200.0 } else { reference.at(x, y) });
        let value = similarity(&reference, &source).unwrap();
        assert!(value.is_finite());
        assert!(value > 0.0 && value < 1.0);

        let one = GrayFrame::from_fn(1, 1, |_, _| 10.0);
        let other = GrayFrame::from_fn(1, 1, |_, _| 11.0);
        let single = similarity(&one, &other).unwrap();
        assert!(single.is_finite());
        assert!((0.0..=1.0).contains(&single));
    }

    #[test]
    fn flat_black_frames_are_identical() {
        let black = GrayFrame::from_fn(12, 12, |_, _| 0.0);
        assert!((similarity(&black, &black).unwrap() - 1.0).abs() < 1e-12);
    }
}
