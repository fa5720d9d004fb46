//! Mapping of crop regions from the model's coordinate space onto the pixel
//! grid of the stored source image.
//!
//! The model only ever sees a down-sampled (or normalized) view of the image,
//! so every region it asks for has to be scaled per axis before cropping and
//! then clamped so the crop can never leave the source or collapse to nothing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A region as the model expressed it, in its own coordinate space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelRegion {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// A region in source pixels. Always inside the image and at least 1x1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Error, PartialEq)]
pub enum RegionError {
    #[error("region field `{0}` is not a finite number")]
    NotFinite(&'static str),
}

impl ModelRegion {
    /// Build a region from the `(ymin, xmin, ymax, xmax)` box form the model is
    /// prompted with.
    pub fn from_box(ymin: f64, xmin: f64, ymax: f64, xmax: f64) -> Self {
        Self { x: xmin, y: ymin, w: xmax - xmin, h: ymax - ymin }
    }

    pub fn validate(&self) -> Result<(), RegionError> {
        for (name, v) in [("x", self.x), ("y", self.y), ("w", self.w), ("h", self.h)] {
            if !v.is_finite() {
                return Err(RegionError::NotFinite(name));
            }
        }
        Ok(())
    }
}

/// Scale `region` from `shown` to `actual` dimensions and clamp it to the
/// source bounds.
pub fn rescale(region: &ModelRegion, shown: Dimensions, actual: Dimensions) -> PixelRegion {
    let sx = actual.width as f64 / shown.width.max(1) as f64;
    let sy = actual.height as f64 / shown.height.max(1) as f64;
    let (x, w) = map_axis(region.x, region.w, sx, actual.width);
    let (y, h) = map_axis(region.y, region.h, sy, actual.height);
    PixelRegion { x, y, w, h }
}

fn map_axis(origin: f64, extent: f64, scale: f64, limit: u32) -> (u32, u32) {
    let limit = limit.max(1);
    let start = (origin * scale).floor().clamp(0.0, f64::from(limit - 1)) as u32;
    let end = ((origin + extent) * scale).floor().clamp(0.0, f64::from(limit)) as u32;
    let end = end.max(start + 1);
    (start, end - start)
}
