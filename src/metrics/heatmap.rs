use std::path::Path;

use image::{ImageFormat, Rgb, RgbImage};

use super::{GrayFrame, MetricsError, ensure_same_shape};

/// Writes a false-color PNG of the absolute difference: red grows with the
/// difference, blue with agreement.
pub fn write_heatmap(reference: &GrayFrame, source: &GrayFrame, path: &Path) -> Result<(), MetricsError> {
    ensure_same_shape(reference, source)?;
    let width = reference.width();
    let heat = RgbImage::from_fn(reference.width() as u32, reference.height() as u32, |x, y| {
        let i = y as usize * width + x as usize;
        let diff = (reference.pixels()[i] - source.pixels()[i]).abs().clamp(0.0, 255.0) as u8;
        heat_color(diff)
    });
    heat.save_with_format(path, ImageFormat::Png)
        .map_err(|source| MetricsError::Encode {
            path: path.to_path_buf(),
            source,
        })
}

fn heat_color(diff: u8) -> Rgb<u8> {
    Rgb([diff, diff / 4, 255 - diff])
}
