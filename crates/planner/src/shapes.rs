//! Paths for some simple shapes.

use rotoplot_geom::Angle;

use crate::{PathPoint, Point};

/// The distance of the Bézier control points from the ends of a quarter
/// circle, as a fraction of the radius.
pub const CIRCLE_K: f64 = 0.5522847498;

pub fn line(a: Point, b: Point) -> Vec<PathPoint> {
    vec![PathPoint::Line(a), PathPoint::Line(b)]
}

/// A closed polygon through `corners`.
pub fn polygon(corners: &[Point]) -> Vec<PathPoint> {
    let mut ret: Vec<_> = corners.iter().copied().map(PathPoint::Line).collect();
    if let Some(&first) = corners.first() {
        if corners.len() > 1 {
            ret.push(PathPoint::Line(first));
        }
    }
    ret
}

/// A `width` by `height` rectangle centered at `center`, rotated
/// counter-clockwise by `rotation`.
pub fn rectangle(center: Point, width: f64, height: f64, rotation: Angle) -> Vec<PathPoint> {
    let (sin, cos) = rotation.sin_cos();
    let (w, h) = (width / 2.0, height / 2.0);
    let corners = [(-w, -h), (w, -h), (w, h), (-w, h)].map(|(dx, dy)| {
        Point::new(
            center.x + dx * cos - dy * sin,
            center.y + dx * sin + dy * cos,
        )
    });
    polygon(&corners)
}

/// A circle, made of four cubic Bézier quarters.
pub fn circle(center: Point, radius: f64) -> Vec<PathPoint> {
    // Unit vectors towards the start of each quarter.
    let dirs = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)];
    let at = |(ux, uy): (f64, f64), scale: f64| (ux * radius * scale, uy * radius * scale);
    let offset =
        |a: (f64, f64), b: (f64, f64)| Point::new(center.x + a.0 + b.0, center.y + a.1 + b.1);

    let mut ret = vec![PathPoint::Line(offset(at(dirs[0], 1.0), (0.0, 0.0)))];
    for i in 0..4 {
        let u = dirs[i];
        let v = dirs[(i + 1) % 4];
        ret.push(PathPoint::CurveControl(offset(at(u, 1.0), at(v, CIRCLE_K))));
        ret.push(PathPoint::CurveControl(offset(at(v, 1.0), at(u, CIRCLE_K))));
        ret.push(PathPoint::Line(offset(at(v, 1.0), (0.0, 0.0))));
    }
    ret
}

/// A smooth curve through `waypoints`, made of one cubic Bézier per pair of
/// neighbouring waypoints.
///
/// The curve's direction at each interior waypoint is parallel to the line
/// joining its two neighbours, so the pieces join without corners. `tension`
/// runs from 0 (the loosest curve) to 1 (straight lines between the
/// waypoints). Repeated waypoints are dropped, and two waypoints give a
/// straight line.
pub fn smooth(waypoints: &[Point], tension: f64) -> Vec<PathPoint> {
    let mut pts: Vec<Point> = waypoints.to_vec();
    pts.dedup();
    if pts.len() <= 2 {
        return pts.into_iter().map(PathPoint::Line).collect();
    }

    let scale = (1.0 - tension.clamp(0.0, 1.0)) / 2.0;
    let last = pts.len() - 1;
    let tangent = |i: usize| {
        let prev = pts[i.saturating_sub(1)];
        let next = pts[(i + 1).min(last)];
        // The end points only have one neighbour, so they get twice the
        // weight to keep the same scale as the interior points.
        let weight = if i == 0 || i == last { 2.0 } else { 1.0 };
        (next - prev) * (scale * weight)
    };

    let mut ret = vec![PathPoint::Line(pts[0])];
    for i in 0..last {
        ret.push(PathPoint::CurveControl(pts[i] + tangent(i) / 3.0));
        ret.push(PathPoint::CurveControl(pts[i + 1] - tangent(i + 1) / 3.0));
        ret.push(PathPoint::Line(pts[i + 1]));
    }
    ret
}
