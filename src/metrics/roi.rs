use serde::{Deserialize, Serialize};

/// Fractions of width/height bounding the body region of a capture.
pub const ROI_X_RATIOS: (f64, f64) = (0.2, 0.8);
pub const ROI_Y_RATIOS: (f64, f64) = (0.15, 0.9);

/// Half-open pixel box `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiBox {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl RoiBox {
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: width,
            y1: height,
        }
    }

    /// The central body crop, or the whole frame when the crop would be empty.
    pub fn central(width: usize, height: usize) -> Self {
        let scale = |extent: usize, ratio: f64| (extent as f64 * ratio) as usize;
        let roi = Self {
            x0: scale(width, ROI_X_RATIOS.0),
            y0: scale(height, ROI_Y_RATIOS.0),
            x1: scale(width, ROI_X_RATIOS.1),
            y1: scale(height, ROI_Y_RATIOS.1),
        };
        if roi.x1 <= roi.x0 || roi.y1 <= roi.y0 {
            return Self::full(width, height);
        }
        roi
    }
}
