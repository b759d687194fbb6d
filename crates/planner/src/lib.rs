//! Turning paths into the sequence of points that the plotter visits.
//!
//! A path is a list of [`PathPoint`]s: plain anchor points joined by
//! straight lines, with an optional pair of Bézier control points between
//! two anchors. [`interpolate`] breaks every segment into pieces no longer
//! than a given step, so that the straight moves the plotter makes between
//! consecutive points stay close to the intended path.

use std::fmt;

use kurbo::{CubicBez, ParamCurve, ParamCurveArclen, PathSeg};
use rotoplot_geom::{to_kurbo, FromKurbo};

pub use rotoplot_geom::Point;

pub mod shapes;

/// Accuracy for computing the arc length of curves, in mm.
const ARCLEN_ACCURACY: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PathPoint {
    /// An anchor, reached by a straight line from the previous one (or by a
    /// curve, if it was preceded by control points).
    Line(Point),
    /// A Bézier control point. These come in pairs, between two anchors.
    CurveControl(Point),
}

impl PathPoint {
    pub fn point(&self) -> Point {
        match self {
            PathPoint::Line(p) | PathPoint::CurveControl(p) => *p,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Segment {
    Line(Point, Point),
    Cubic(Point, Point, Point, Point),
}

impl Segment {
    pub fn start(&self) -> Point {
        match self {
            Segment::Line(p, _) | Segment::Cubic(p, ..) => *p,
        }
    }

    pub fn end(&self) -> Point {
        match self {
            Segment::Line(_, p) | Segment::Cubic(.., p) => *p,
        }
    }

    pub fn to_kurbo(&self) -> PathSeg {
        match *self {
            Segment::Line(p0, p1) => PathSeg::Line(kurbo::Line::new(to_kurbo(p0), to_kurbo(p1))),
            Segment::Cubic(p0, p1, p2, p3) => PathSeg::Cubic(CubicBez::new(
                to_kurbo(p0),
                to_kurbo(p1),
                to_kurbo(p2),
                to_kurbo(p3),
            )),
        }
    }

    pub fn arclen(&self) -> f64 {
        match self {
            Segment::Line(p0, p1) => (*p1 - *p0).length(),
            Segment::Cubic(..) => self.to_kurbo().arclen(ARCLEN_ACCURACY),
        }
    }

    /// The points that interpolate this segment, not counting its start.
    ///
    /// Lines are split evenly. Curves are split at equal arc length, and
    /// split more finely if the inaccuracy of the arc length computation
    /// left any chord longer than `step`. The end point is always exact.
    fn pieces(&self, step: f64) -> Pieces {
        let len = self.arclen();
        let n = ((len / step).ceil() as usize).max(1);
        match *self {
            Segment::Line(p0, p1) => Pieces::Even { p0, p1, i: 0, n },
            Segment::Cubic(p0, p1, p2, p3) => {
                let bez = CubicBez::new(to_kurbo(p0), to_kurbo(p1), to_kurbo(p2), to_kurbo(p3));
                let mut n = n;
                let mut points = cubic_samples(&bez, len, n, self.end());
                for _ in 0..MAX_REFINEMENTS {
                    if max_chord(p0, &points) <= step {
                        break;
                    }
                    n += 1;
                    points = cubic_samples(&bez, len, n, self.end());
                }
                Pieces::Buffered(points.into_iter())
            }
        }
    }
}

/// How many extra pieces a curve may be split into to make up for arc
/// length error.
const MAX_REFINEMENTS: usize = 64;

fn cubic_samples(bez: &CubicBez, len: f64, n: usize, end: Point) -> Vec<Point> {
    (1..=n)
        .map(|i| {
            if i == n {
                end
            } else {
                let t = bez.inv_arclen(len * i as f64 / n as f64, ARCLEN_ACCURACY);
                Point::from_kurbo(bez.eval(t))
            }
        })
        .collect()
}

fn max_chord(start: Point, points: &[Point]) -> f64 {
    let mut prev = start;
    let mut max = 0.0f64;
    for &p in points {
        max = max.max((p - prev).length());
        prev = p;
    }
    max
}

/// The remaining points of the segment being interpolated.
#[derive(Clone, Debug)]
enum Pieces {
    Even { p0: Point, p1: Point, i: usize, n: usize },
    Buffered(std::vec::IntoIter<Point>),
}

impl Iterator for Pieces {
    type Item = Point;

    fn next(&mut self) -> Option<Point> {
        match self {
            Pieces::Even { p0, p1, i, n } => {
                if *i >= *n {
                    return None;
                }
                *i += 1;
                if *i == *n {
                    Some(*p1)
                } else {
                    Some(p0.lerp(*p1, *i as f64 / *n as f64))
                }
            }
            Pieces::Buffered(points) => points.next(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanError {
    InvalidInterpolation(&'static str),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::InvalidInterpolation(why) => write!(f, "invalid interpolation: {why}"),
        }
    }
}

impl std::error::Error for PlanError {}

fn invalid(why: &'static str) -> PlanError {
    PlanError::InvalidInterpolation(why)
}

/// Splits a path into its segments, checking that it is well-formed.
pub fn segments(path: &[PathPoint]) -> Result<Vec<Segment>, PlanError> {
    let mut iter = path.iter();
    let mut last = match iter.next() {
        None => return Err(invalid("empty path")),
        Some(PathPoint::CurveControl(_)) => return Err(invalid("path starts with a control point")),
        Some(PathPoint::Line(p)) => *p,
    };

    let mut ret = Vec::new();
    while let Some(pt) = iter.next() {
        let seg = match *pt {
            PathPoint::Line(p) => {
                if p == last {
                    return Err(invalid("zero-length line segment"));
                }
                Segment::Line(last, p)
            }
            PathPoint::CurveControl(c1) => match (iter.next(), iter.next()) {
                (Some(PathPoint::CurveControl(c2)), Some(PathPoint::Line(p))) => {
                    if [c1, *c2, *p].iter().all(|&q| q == last) {
                        return Err(invalid("zero-length curve segment"));
                    }
                    Segment::Cubic(last, c1, *c2, *p)
                }
                _ => {
                    return Err(invalid(
                        "control points must come in pairs, followed by an anchor",
                    ))
                }
            },
        };
        last = seg.end();
        ret.push(seg);
    }
    Ok(ret)
}

/// Interpolates `path` so that no two consecutive points are more than
/// `step` apart along the path.
///
/// Every segment is split into the smallest number of pieces of equal arc
/// length that are no longer than `step`. Both end points of every segment
/// are included exactly, and shared end points are only produced once.
pub fn interpolate(path: &[PathPoint], step: f64) -> Result<Interpolated, PlanError> {
    if !step.is_finite() || step <= 0.0 {
        return Err(invalid("step size must be positive"));
    }
    let segments = segments(path)?;
    Ok(Interpolated {
        start: Some(path[0].point()),
        segments,
        step,
        seg_idx: 0,
        current: None,
    })
}

/// The points of an interpolated path, computed as they are needed.
///
/// Lines are produced lazily, curves one segment at a time. A clone carries
/// on independently from wherever the original was.
#[derive(Clone, Debug)]
pub struct Interpolated {
    start: Option<Point>,
    segments: Vec<Segment>,
    step: f64,
    seg_idx: usize,
    // None if we haven't started on the current segment.
    current: Option<Pieces>,
}

impl Iterator for Interpolated {
    type Item = Point;

    fn next(&mut self) -> Option<Point> {
        if let Some(p) = self.start.take() {
            return Some(p);
        }

        loop {
            let seg = self.segments.get(self.seg_idx)?;
            let step = self.step;
            let pieces = self.current.get_or_insert_with(|| seg.pieces(step));
            if let Some(p) = pieces.next() {
                return Some(p);
            }
            self.seg_idx += 1;
            self.current = None;
        }
    }
}

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    fn of_point(p: Point) -> Self {
        Bounds {
            min_x: p.x,
            min_y: p.y,
            max_x: p.x,
            max_y: p.y,
        }
    }

    fn include(&mut self, p: Point) {
        self.min_x = self.min_x.min(p.x);
        self.min_y = self.min_y.min(p.y);
        self.max_x = self.max_x.max(p.x);
        self.max_y = self.max_y.max(p.y);
    }
}

/// Summary statistics of a sequence of points.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PathStats {
    pub points: usize,
    /// Total length of the polyline through the points, in mm.
    pub length_mm: f64,
    pub bounds: Option<Bounds>,
}

impl PathStats {
    pub fn of(points: impl IntoIterator<Item = Point>) -> Self {
        let mut stats = PathStats::default();
        let mut prev: Option<Point> = None;
        for p in points {
            stats.points += 1;
            if let Some(q) = prev {
                stats.length_mm += (p - q).length();
            }
            stats.bounds.get_or_insert(Bounds::of_point(p)).include(p);
            prev = Some(p);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pt(x: f64, y: f64) -> Point {
        Point::new(x, y)
    }

    #[test]
    fn line_point_count() {
        let path = [PathPoint::Line(pt(0.0, 100.0)), PathPoint::Line(pt(50.0, 200.0))];
        let points: Vec<_> = interpolate(&path, 1.0).unwrap().collect();
        assert_eq!(points.len(), 12500f64.sqrt().ceil() as usize + 1);
        assert_eq!(points[0], pt(0.0, 100.0));
        assert_eq!(*points.last().unwrap(), pt(50.0, 200.0));
        for w in points.windows(2) {
            assert!((w[1] - w[0]).length() <= 1.0);
        }
    }

    #[test]
    fn shared_endpoints_appear_once() {
        let path = [
            PathPoint::Line(pt(0.0, 0.0)),
            PathPoint::Line(pt(10.0, 0.0)),
            PathPoint::Line(pt(10.0, 10.0)),
        ];
        let points: Vec<_> = interpolate(&path, 5.0).unwrap().collect();
        assert_eq!(
            points,
            vec![
                pt(0.0, 0.0),
                pt(5.0, 0.0),
                pt(10.0, 0.0),
                pt(10.0, 5.0),
                pt(10.0, 10.0)
            ]
        );
    }

    #[test]
    fn single_point() {
        let path = [PathPoint::Line(pt(3.0, 4.0))];
        let points: Vec<_> = interpolate(&path, 1.0).unwrap().collect();
        assert_eq!(points, vec![pt(3.0, 4.0)]);
    }

    #[test]
    fn curve() {
        let path = [
            PathPoint::Line(pt(0.0, 0.0)),
            PathPoint::CurveControl(pt(0.0, 10.0)),
            PathPoint::CurveControl(pt(10.0, 10.0)),
            PathPoint::Line(pt(10.0, 0.0)),
        ];
        let segs = segments(&path).unwrap();
        let len = segs[0].arclen();
        assert!((len - 20.0).abs() < 1e-4);

        let points: Vec<_> = interpolate(&path, 0.5).unwrap().collect();
        assert!(points.len() >= 41);
        assert!(points.len() <= 41 + MAX_REFINEMENTS);
        assert_eq!(points[0], pt(0.0, 0.0));
        assert_eq!(*points.last().unwrap(), pt(10.0, 0.0));
        for w in points.windows(2) {
            assert!((w[1] - w[0]).length() <= 0.5);
        }
    }

    #[test]
    fn restartable() {
        let path = shapes::rectangle(pt(0.0, 300.0), 40.0, 20.0, rotoplot_geom::Angle::zero());
        let mut iter = interpolate(&path, 3.0).unwrap();
        iter.next();
        let fresh = iter.clone();
        assert_eq!(iter.collect::<Vec<_>>(), fresh.collect::<Vec<_>>());
    }

    #[test]
    fn errors() {
        let a = PathPoint::Line(pt(0.0, 0.0));
        let b = PathPoint::Line(pt(1.0, 0.0));
        let c = PathPoint::CurveControl(pt(0.5, 1.0));

        fn err(path: &[PathPoint], step: f64) -> PlanError {
            interpolate(path, step).unwrap_err()
        }
        assert!(matches!(err(&[a, b], 0.0), PlanError::InvalidInterpolation(_)));
        assert!(matches!(err(&[a, b], -1.0), PlanError::InvalidInterpolation(_)));
        assert!(matches!(err(&[a, b], f64::NAN), PlanError::InvalidInterpolation(_)));
        assert!(matches!(err(&[], 1.0), PlanError::InvalidInterpolation(_)));
        assert!(matches!(err(&[c, b], 1.0), PlanError::InvalidInterpolation(_)));
        assert!(matches!(err(&[a, c, b], 1.0), PlanError::InvalidInterpolation(_)));
        assert!(matches!(err(&[a, c, c], 1.0), PlanError::InvalidInterpolation(_)));
        assert!(matches!(err(&[a, c, c, c, b], 1.0), PlanError::InvalidInterpolation(_)));
        assert!(matches!(err(&[a, b, b], 1.0), PlanError::InvalidInterpolation(_)));

        let still = PathPoint::CurveControl(pt(0.0, 0.0));
        assert!(matches!(err(&[a, still, still, a], 1.0), PlanError::InvalidInterpolation(_)));
        // A closed loop has a length even though it ends where it starts.
        let loop_path = [a, c, PathPoint::CurveControl(pt(1.0, 1.0)), a];
        assert!(interpolate(&loop_path, 1.0).is_ok());
    }

    #[test]
    fn stats() {
        let path = shapes::rectangle(pt(0.0, 300.0), 40.0, 20.0, rotoplot_geom::Angle::zero());
        let stats = PathStats::of(interpolate(&path, 1.0).unwrap());
        assert_eq!(stats.points, 121);
        assert!((stats.length_mm - 120.0).abs() < 1e-9);
        assert_eq!(
            stats.bounds,
            Some(Bounds {
                min_x: -20.0,
                min_y: 290.0,
                max_x: 20.0,
                max_y: 310.0
            })
        );
        assert_eq!(PathStats::of(std::iter::empty()), PathStats::default());
    }

    proptest! {
        #[test]
        fn test_line_spacing(
            x0 in -100.0..100.0f64,
            y0 in -100.0..100.0f64,
            x1 in -100.0..100.0f64,
            y1 in -100.0..100.0f64,
            step in 0.1..20.0f64,
        ) {
            let (a, b) = (pt(x0, y0), pt(x1, y1));
            prop_assume!(a != b);
            let points: Vec<_> = interpolate(&[PathPoint::Line(a), PathPoint::Line(b)], step)
                .unwrap()
                .collect();
            let n = ((b - a).length() / step).ceil() as usize;
            assert_eq!(points.len(), n.max(1) + 1);
            assert_eq!(points[0], a);
            assert_eq!(*points.last().unwrap(), b);
            for w in points.windows(2) {
                assert!((w[1] - w[0]).length() <= step + 1e-9);
            }
        }
    }
}
