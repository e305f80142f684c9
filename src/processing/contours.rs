//! Contour extraction and shape metrics on the processed mask.
//!
//! Contours are extracted with full hierarchy; a contour whose hierarchy
//! parent is present is an *inner* contour (the border of a hole). Contours
//! below a small area floor are discarded as noise before any further
//! analysis.
//!
//! Metrics follow the moment/arc-length definitions the thresholds were tuned
//! against: `area` is the polygon (shoelace) area of the contour, `perimeter`
//! the closed polyline length, and
//! `deformability = 1 − sqrt(4π·area)/perimeter`.

use image::GrayImage;
use imageproc::contours::{find_contours, Contour};
use imageproc::geometry::convex_hull;
use imageproc::point::Point;

/// Contours with less polygon area than this are treated as noise.
pub const MIN_CONTOUR_AREA: f64 = 10.0;

/// Extraction result: all retained contours plus index lists by role.
pub struct ContourSet {
    pub contours: Vec<Contour<i32>>,
    /// Indices of retained contours, in discovery order.
    pub kept: Vec<usize>,
    /// Indices of retained inner contours (hierarchy parent present).
    pub inner: Vec<usize>,
}

impl ContourSet {
    /// Index of the largest retained outer contour, ties resolved by
    /// first-seen order.
    pub fn largest_outer(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for &i in &self.kept {
            if self.contours[i].parent.is_some() {
                continue;
            }
            let area = polygon_area(&self.contours[i].points);
            match best {
                Some((_, best_area)) if area <= best_area => {}
                _ => best = Some((i, area)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// The parent contour of `child`, when the parent was itself retained.
    pub fn parent_of(&self, child: usize) -> Option<&Contour<i32>> {
        let parent = self.contours[child].parent?;
        if self.kept.contains(&parent) {
            Some(&self.contours[parent])
        } else {
            None
        }
    }
}

/// Extract contours with hierarchy and drop sub-noise ones.
pub fn extract(mask: &GrayImage) -> ContourSet {
    let contours = find_contours::<i32>(mask);
    let mut kept = Vec::with_capacity(contours.len());
    let mut inner = Vec::new();
    for (i, contour) in contours.iter().enumerate() {
        if polygon_area(&contour.points) < MIN_CONTOUR_AREA {
            continue;
        }
        kept.push(i);
        if contour.parent.is_some() {
            inner.push(i);
        }
    }
    ContourSet {
        contours,
        kept,
        inner,
    }
}

/// Shoelace area of a closed contour polygon.
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        acc += i64::from(p.x) * i64::from(q.y) - i64::from(q.x) * i64::from(p.y);
    }
    (acc.abs() as f64) / 2.0
}

/// Length of the closed polyline through the contour points.
pub fn perimeter(points: &[Point<i32>]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut acc = 0.0;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        let dx = f64::from(p.x - q.x);
        let dy = f64::from(p.y - q.y);
        acc += (dx * dx + dy * dy).sqrt();
    }
    acc
}

/// `(deformability, area)` of a contour.
pub fn shape_metrics(points: &[Point<i32>]) -> (f64, f64) {
    let area = polygon_area(points);
    let perim = perimeter(points);
    let circularity = if perim > 0.0 {
        (4.0 * std::f64::consts::PI * area).sqrt() / perim
    } else {
        0.0
    };
    (1.0 - circularity, area)
}

/// Area of the convex hull of the contour points.
pub fn hull_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let hull = convex_hull(points.to_vec());
    polygon_area(&hull)
}

/// Ring measure for a nested contour pair: `sqrt(outer_area − inner_area)`.
pub fn ring_ratio(inner: &[Point<i32>], outer: &[Point<i32>]) -> f64 {
    let inner_area = polygon_area(inner);
    let outer_area = polygon_area(outer);
    if outer_area <= 0.0 {
        return 0.0;
    }
    (outer_area - inner_area).max(0.0).sqrt()
}

/// Quartiles of original-image brightness under the mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrightnessQuantiles {
    pub q1: u8,
    pub q2: u8,
    pub q3: u8,
    pub q4: u8,
}

/// Compute brightness quartiles of `original` over the foreground of `mask`.
/// Both buffers are full-resolution grayscale of equal length.
pub fn brightness_quantiles(original: &[u8], mask: &[u8]) -> BrightnessQuantiles {
    let mut values: Vec<u8> = original
        .iter()
        .zip(mask)
        .filter(|(_, &m)| m > 0)
        .map(|(&v, _)| v)
        .collect();
    if values.is_empty() {
        return BrightnessQuantiles::default();
    }
    values.sort_unstable();
    let n = values.len();
    BrightnessQuantiles {
        q1: values[n / 4],
        q2: values[n / 2],
        q3: values[3 * n / 4],
        q4: values[n - 1],
    }
}
