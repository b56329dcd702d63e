use super::{GrayFrame, MetricsError, ensure_same_shape};

/// Reported instead of infinity for (near-)identical frames.
pub const PSNR_CEILING: f64 = 99.0;

const MSE_EPSILON: f64 = 1e-12;

pub fn psnr(reference: &GrayFrame, source: &GrayFrame) -> Result<f64, MetricsError> {
    ensure_same_shape(reference, source)?;
    let count = reference.pixels().len().max(1) as f64;
    let mse = reference
        .pixels()
        .iter()
        .zip(source.pixels())
        .map(|(lhs, rhs)| (lhs - rhs).powi(2))
        .sum::<f64>()
        / count;

    if mse <= MSE_EPSILON {
        return Ok(PSNR_CEILING);
    }
    Ok(20.0 * (255.0 / mse.sqrt()).log10())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_offset_matches_closed_form() {
        let reference = GrayFrame::from_fn(8, 8, |_, _| 100.0);
        let source = GrayFrame::from_fn(8, 8, |_, _| 110.0);
        let value = psnr(&reference, &source).unwrap();
        let expected = 20.0 * (255.0_f64 / 10.0).log10();
        assert!((value - expected).abs() < 1e-9);
    }

    #[test]
    fn identical_frames_report_the_ceiling() {
        let frame = GrayFrame::from_fn(3, 2, |x, y| (x + y) as f64);
        assert_eq!(psnr(&frame, &frame).unwrap(), PSNR_CEILING);
    }
}
