//! Per-frame filter verdict: decides whether a processed frame qualifies.
//!
//! The checks run in a fixed order. The single-inner-contour requirement can
//! reject a frame before anything else is computed; the border check rejects
//! objects cut off by the ROI edge; metrics are computed on the primary
//! contour (the single inner contour when present, otherwise the largest
//! outer); finally the area window decides validity.

use crate::config::ProcessingConfig;
use crate::frame::Roi;
use crate::processing::contours::{
    self, brightness_quantiles, hull_area, polygon_area, ring_ratio, shape_metrics,
    BrightnessQuantiles, ContourSet,
};
use image::GrayImage;
use imageproc::point::Point;

/// Contour points closer than this (in pixels) to the ROI edge count as
/// touching the border.
pub const BORDER_MARGIN: i32 = 2;

/// Per-frame verdict. Transient; lives within one processor iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterResult {
    pub is_valid: bool,
    pub touches_border: bool,
    pub has_single_inner_contour: bool,
    pub in_range: bool,
    pub inner_contour_count: usize,
    pub deformability: f64,
    pub area: f64,
    pub area_ratio: f64,
    pub ring_ratio: f64,
    pub brightness: BrightnessQuantiles,
}

fn point_near_roi_border(point: &Point<i32>, roi: Roi) -> bool {
    // Convert to ROI coordinates; anything outside the ROI counts as touching.
    let x = point.x - roi.x;
    let y = point.y - roi.y;
    if x < 0 || x >= roi.width || y < 0 || y >= roi.height {
        return true;
    }
    x < BORDER_MARGIN
        || x >= roi.width - BORDER_MARGIN
        || y < BORDER_MARGIN
        || y >= roi.height - BORDER_MARGIN
}

fn contour_touches_border(points: &[Point<i32>], roi: Roi) -> bool {
    points.iter().any(|p| point_near_roi_border(p, roi))
}

/// Evaluate the filter state machine over an extracted contour set.
///
/// `mask` and `original` are full-resolution; `roi` is the clipped ROI the
/// mask was produced from.
pub fn evaluate(mask: &GrayImage, original: &[u8], roi: Roi, cfg: &ProcessingConfig) -> FilterResult {
    let set = contours::extract(mask);
    evaluate_set(&set, mask, original, roi, cfg)
}

pub(crate) fn evaluate_set(
    set: &ContourSet,
    mask: &GrayImage,
    original: &[u8],
    roi: Roi,
    cfg: &ProcessingConfig,
) -> FilterResult {
    let mut result = FilterResult {
        inner_contour_count: set.inner.len(),
        has_single_inner_contour: set.inner.len() == 1,
        brightness: brightness_quantiles(original, mask.as_raw()),
        ..FilterResult::default()
    };

    if cfg.require_single_inner_contour && !result.has_single_inner_contour {
        return result;
    }

    // Primary contour: the single inner when present, else the largest outer.
    let primary = if result.has_single_inner_contour {
        Some(set.inner[0])
    } else {
        set.largest_outer()
    };

    if cfg.enable_border_check {
        if let Some(primary) = primary {
            result.touches_border = contour_touches_border(&set.contours[primary].points, roi);
        }
        if result.touches_border {
            return result;
        }
    }

    let Some(primary) = primary else {
        return result;
    };

    let points = &set.contours[primary].points;
    let contour_area = polygon_area(points);
    if contour_area > 0.0 {
        result.area_ratio = hull_area(points) / contour_area;
    }
    let (deformability, area) = shape_metrics(points);
    result.deformability = deformability;
    result.area = area;

    if result.has_single_inner_contour {
        if let Some(parent) = set.parent_of(primary) {
            result.ring_ratio = ring_ratio(points, &parent.points);
        }
    }

    if !cfg.enable_area_range_check
        || (area >= cfg.area_threshold_min && area <= cfg.area_threshold_max)
    {
        result.in_range = true;
        result.is_valid = true;
    }
    result
}
