//! Per-frame image quality metrics.
//!
//! Every metric works on [`GrayFrame`], an 8-bit luminance image widened to
//! `f64`. Two frames must share a shape before any metric is computed; the
//! caller gets [`MetricsError::ShapeMismatch`] otherwise.

mod edges;
mod heatmap;
mod psnr;
mod roi;
mod similarity;
pub mod stats;

use std::path::{Path, PathBuf};

use image::GrayImage;
use serde::{Deserialize, Serialize};

pub use edges::edge_overlap;
pub use heatmap::write_heatmap;
pub use psnr::{PSNR_CEILING, psnr};
pub use roi::{ROI_X_RATIOS, ROI_Y_RATIOS, RoiBox};
pub use similarity::similarity;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("frame shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    #[error("failed to decode frame {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write heatmap {path}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Row-major grayscale frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayFrame {
    width: usize,
    height: usize,
    pixels: Vec<f64>,
}

impl GrayFrame {
    pub fn from_luma(image: &GrayImage) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            pixels: image.as_raw().iter().map(|&value| f64::from(value)).collect(),
        }
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Decodes an image file and converts it to luminance.
    pub fn load(path: &Path) -> Result<Self, MetricsError> {
        let decoded = image::open(path).map_err(|source| MetricsError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_luma(&decoded.to_luma8()))
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// `(height, width)`, the order frame shapes are reported in.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixels(&self) -> &[f64] {
        &self.pixels
    }

    pub fn at(&self, x: usize, y: usize) -> f64 {
        self.pixels[y * self.width + x]
    }

    pub fn crop(&self, roi: RoiBox) -> Self {
        Self::from_fn(roi.x1 - roi.x0, roi.y1 - roi.y0, |x, y| {
            self.at(roi.x0 + x, roi.y0 + y)
        })
    }
}

pub fn ensure_same_shape(left: &GrayFrame, right: &GrayFrame) -> Result<(), MetricsError> {
    if left.shape() == right.shape() {
        Ok(())
    } else {
        Err(MetricsError::ShapeMismatch {
            left: left.shape(),
            right: right.shape(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub ssim: f64,
    pub psnr: f64,
    pub edge_iou: f64,
    pub body_roi_ssim: f64,
    pub body_roi_psnr: f64,
}

/// All metrics for one matched frame pair, including the central ROI variants.
pub fn frame_metrics(reference: &GrayFrame, source: &GrayFrame) -> Result<FrameMetrics, MetricsError> {
    ensure_same_shape(reference, source)?;
    let roi = RoiBox::central(reference.width(), reference.height());
    let reference_roi = reference.crop(roi);
    let source_roi = source.crop(roi);

    Ok(FrameMetrics {
        ssim: similarity(reference, source)?,
        psnr: psnr(reference, source)?,
        edge_iou: edge_overlap(reference, source)?,
        body_roi_ssim: similarity(&reference_roi, &source_roi)?,
        body_roi_psnr: psnr(&reference_roi, &source_roi)?,
    })
}
