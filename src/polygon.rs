//! Binary mask → polygon extraction.
//!
//! External contours become `outer` rings, their immediate children become
//! `holes`. Rings are simplified with a Douglas-Peucker tolerance in
//! pixels, filtered by pixel area, then normalised to `[0,1]` by the mask
//! dimensions.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::approximate_polygon_dp;
use imageproc::point::Point;
use serde::Serialize;

/// Rings with a pixel area below this are discarded as noise.
pub const MIN_AREA_PX: f64 = 64.0;
/// Polyline simplification tolerance, in pixels.
pub const EPSILON_PX: f64 = 2.0;

/// One connected water region: an outer ring plus enclosed holes,
/// all coordinates normalised to `[0,1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polygon {
    pub outer: Vec<[f32; 2]>,
    pub holes: Vec<Vec<[f32; 2]>>,
}

/// Extract polygons from a 0/255 binary mask.
pub fn mask_to_polygons(mask: &GrayImage) -> Vec<Polygon> {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }

    let contours = find_contours::<i32>(mask);
    let mut polys = Vec::new();

    for (i, contour) in contours.iter().enumerate() {
        if contour.border_type != BorderType::Outer {
            continue;
        }
        if ring_area_px(&contour.points) < MIN_AREA_PX {
            continue;
        }
        let Some(outer) = simplify_and_normalise(&contour.points, w, h) else {
            continue;
        };

        let mut holes = Vec::new();
        for hole in contours
            .iter()
            .filter(|c| c.border_type == BorderType::Hole && c.parent == Some(i))
        {
            if ring_area_px(&hole.points) < MIN_AREA_PX {
                continue;
            }
            if let Some(ring) = simplify_and_normalise(&hole.points, w, h) {
                holes.push(ring);
            }
        }

        polys.push(Polygon { outer, holes });
    }

    polys
}

/// Shoelace area of a closed pixel ring.
fn ring_area_px(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc: i64 = 0;
    for (a, b) in points.iter().zip(points.iter().cycle().skip(1)).take(points.len()) {
        acc += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (acc.abs() as f64) / 2.0
}

/// Simplify a ring and normalise it; rings degenerating below 3 points
/// are dropped.
fn simplify_and_normalise(points: &[Point<i32>], w: u32, h: u32) -> Option<Vec<[f32; 2]>> {
    let simplified = approximate_polygon_dp(points, EPSILON_PX, true);
    if simplified.len() < 3 {
        return None;
    }
    Some(
        simplified
            .iter()
            .map(|p| [p.x as f32 / w as f32, p.y as f32 / h as f32])
            .collect(),
    )
}
