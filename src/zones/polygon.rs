//! Polygon geometry for zones.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tolerance for treating a point as lying on an edge.
const EDGE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// A closed simple polygon. Construction validates the vertex list, so every
/// `Polygon` value has at least three vertices and no two cyclically
/// consecutive vertices coincide. Points on an edge or vertex are outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Point>", into = "Vec<Point>")]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Result<Self> {
        if points.len() < 3 {
            return Err(Error::validation(format!(
                "polygon needs at least 3 points, got {}",
                points.len()
            )));
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(Error::validation("polygon has non-finite coordinates"));
        }
        for i in 0..points.len() {
            let next = (i + 1) % points.len();
            if points[i] == points[next] {
                return Err(Error::validation(format!(
                    "polygon vertices {i} and {next} coincide"
                )));
            }
        }
        Ok(Self { points })
    }

    /// Axis-aligned rectangle with corners `(x, y)` and `(x + w, y + h)`.
    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Result<Self> {
        Self::new(vec![
            Point::new(x, y),
            Point::new(x + width, y),
            Point::new(x + width, y + height),
            Point::new(x, y + height),
        ])
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    fn edges(&self) -> impl Iterator<Item = (&Point, &Point)> {
        self.points
            .iter()
            .zip(self.points.iter().cycle().skip(1))
    }

    /// Ray-casting membership test; edge and vertex points count as outside.
    pub fn contains(&self, point: Point) -> bool {
        if self.edges().any(|(a, b)| on_segment(point, *a, *b)) {
            return false;
        }

        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > point.y) != (b.y > point.y) {
                let x_cross = a.x + (point.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if point.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Shoelace area; positive for counter-clockwise vertex order in a y-up frame.
    pub fn signed_area(&self) -> f64 {
        self.edges()
            .map(|(a, b)| a.x * b.y - b.x * a.y)
            .sum::<f64>()
            / 2.0
    }

    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    /// Area centroid; falls back to the vertex mean for degenerate polygons.
    pub fn centroid(&self) -> Point {
        let area = self.signed_area();
        if area.abs() < EDGE_EPSILON {
            let n = self.points.len() as f64;
            let (sx, sy) = self
                .points
                .iter()
                .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
            return Point::new(sx / n, sy / n);
        }

        let (cx, cy) = self.edges().fold((0.0, 0.0), |(cx, cy), (a, b)| {
            let cross = a.x * b.y - b.x * a.y;
            (cx + (a.x + b.x) * cross, cy + (a.y + b.y) * cross)
        });
        Point::new(cx / (6.0 * area), cy / (6.0 * area))
    }

    /// Returns `(min, max)` corners.
    pub fn bounding_box(&self) -> (Point, Point) {
        let first = self.points[0];
        self.points
            .iter()
            .skip(1)
            .fold((first, first), |(min, max), p| {
                (
                    Point::new(min.x.min(p.x), min.y.min(p.y)),
                    Point::new(max.x.max(p.x), max.y.max(p.y)),
                )
            })
    }
}

impl TryFrom<Vec<Point>> for Polygon {
    type Error = Error;

    fn try_from(points: Vec<Point>) -> Result<Self> {
        Self::new(points)
    }
}

impl From<Polygon> for Vec<Point> {
    fn from(polygon: Polygon) -> Self {
        polygon.points
    }
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > EDGE_EPSILON * (1.0 + a.distance_to(&b)) {
        return false;
    }
    p.x >= a.x.min(b.x) - EDGE_EPSILON
        && p.x <= a.x.max(b.x) + EDGE_EPSILON
        && p.y >= a.y.min(b.y) - EDGE_EPSILON
        && p.y <= a.y.max(b.y) + EDGE_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::rectangle(0.0, 0.0, 10.0, 10.0).unwrap()
    }

    #[test]
    fn test_triangle_validates() {
        let tri = vec![
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(0.0, 3.0),
        ];
        assert!(Polygon::new(tri).is_ok());
    }

    #[test]
    fn test_too_few_points_fail() {
        let line = vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)];
        assert!(matches!(Polygon::new(line), Err(Error::Validation(_))));
    }

    #[test]
    fn test_consecutive_duplicates_fail() {
        let dup = vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(1.0, 0.0),
        ];
        assert!(Polygon::new(dup).is_err());

        let closed = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 0.0),
        ];
        assert!(Polygon::new(closed).is_err());
    }

    #[test]
    fn test_contains_interior_and_exterior() {
        let sq = square();
        assert!(sq.contains(Point::new(5.0, 5.0)));
        assert!(!sq.contains(Point::new(50.0, 50.0)));
        assert!(!sq.contains(Point::new(-0.1, 5.0)));
    }

    #[test]
    fn test_edges_and_vertices_are_outside() {
        let sq = square();
        assert!(!sq.contains(Point::new(0.0, 5.0)));
        assert!(!sq.contains(Point::new(10.0, 5.0)));
        assert!(!sq.contains(Point::new(5.0, 10.0)));
        assert!(!sq.contains(Point::new(0.0, 0.0)));
        assert!(!sq.contains(Point::new(10.0, 10.0)));
    }

    #[test]
    fn test_concave_polygon() {
        // U shape opening upwards
        let u = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(30.0, 0.0),
            Point::new(30.0, 30.0),
            Point::new(20.0, 30.0),
            Point::new(20.0, 10.0),
            Point::new(10.0, 10.0),
            Point::new(10.0, 30.0),
            Point::new(0.0, 30.0),
        ])
        .unwrap();
        assert!(u.contains(Point::new(5.0, 20.0)));
        assert!(!u.contains(Point::new(15.0, 20.0)));
        assert!(u.contains(Point::new(15.0, 5.0)));
    }

    #[test]
    fn test_area_and_centroid() {
        let sq = square();
        assert_eq!(sq.signed_area(), 100.0);
        assert_eq!(sq.centroid(), Point::new(5.0, 5.0));

        let mut reversed: Vec<Point> = sq.points().to_vec();
        reversed.reverse();
        let rev = Polygon::new(reversed).unwrap();
        assert_eq!(rev.signed_area(), -100.0);
        assert_eq!(rev.centroid(), Point::new(5.0, 5.0));
    }

    #[test]
    fn test_area_and_centroid_stable_under_rotation() {
        let pts = vec![
            Point::new(0.0, 0.0),
            Point::new(6.0, 0.0),
            Point::new(6.0, 2.0),
            Point::new(2.0, 4.0),
        ];
        let base = Polygon::new(pts.clone()).unwrap();
        for shift in 1..pts.len() {
            let mut rotated = pts.clone();
            rotated.rotate_left(shift);
            let poly = Polygon::new(rotated).unwrap();
            assert!((poly.signed_area() - base.signed_area()).abs() < 1e-9);
            let (a, b) = (poly.centroid(), base.centroid());
            assert!((a.x - b.x).abs() < 1e-9 && (a.y - b.y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_bounding_box() {
        let (min, max) = square().bounding_box();
        assert_eq!(min, Point::new(0.0, 0.0));
        assert_eq!(max, Point::new(10.0, 10.0));
    }

    #[test]
    fn test_deserialize_validates() {
        let bad: std::result::Result<Polygon, _> =
            serde_json::from_str(r#"[{"x":0,"y":0},{"x":1,"y":1}]"#);
        assert!(bad.is_err());
        let good: Polygon =
            serde_json::from_str(r#"[{"x":0,"y":0},{"x":1,"y":0},{"x":1,"y":1}]"#).unwrap();
        assert_eq!(good.points().len(), 3);
    }
}
