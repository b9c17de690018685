use nalgebra::{Point2, Vector2};

use crate::zone::config::{CoordinateType, LineDirection, ZoneShape};

/// Side of a directed line a point lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Positive,
    Negative,
}

/// Zone shape in pixel coordinates of the current stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedShape {
    Polygon(Vec<Point2<f32>>),
    Line {
        start: Point2<f32>,
        end: Point2<f32>,
        /// Side reached by moving in the configured enter direction
        enter_side: Side,
    },
}

impl ResolvedShape {
    pub fn resolve(
        shape: &ZoneShape,
        coordinate_type: CoordinateType,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        let to_pixels = |p: &Point2<f32>| match coordinate_type {
            CoordinateType::Absolute => *p,
            CoordinateType::Percentage => Point2::new(
                p.x / 100.0 * frame_width as f32,
                p.y / 100.0 * frame_height as f32,
            ),
        };
        match shape {
            ZoneShape::Polygon(points) => Self::Polygon(points.iter().map(to_pixels).collect()),
            ZoneShape::Line {
                start,
                end,
                direction,
            } => {
                let (start, end) = (to_pixels(start), to_pixels(end));
                Self::Line {
                    start,
                    end,
                    enter_side: enter_side(start, end, *direction),
                }
            }
        }
    }

    pub fn outline(&self) -> Vec<(f32, f32)> {
        match self {
            Self::Polygon(points) => points.iter().map(|p| (p.x, p.y)).collect(),
            Self::Line { start, end, .. } => vec![(start.x, start.y), (end.x, end.y)],
        }
    }
}

fn cross(a: Point2<f32>, b: Point2<f32>, p: Point2<f32>) -> f32 {
    let ab = b - a;
    let ap = p - a;
    ab.x * ap.y - ab.y * ap.x
}

/// Which side of the infinite line through `a`→`b` the point lies on;
/// `None` when it is on the line.
pub fn side_of(a: Point2<f32>, b: Point2<f32>, p: Point2<f32>) -> Option<Side> {
    let c = cross(a, b, p);
    if c > 0.0 {
        Some(Side::Positive)
    } else if c < 0.0 {
        Some(Side::Negative)
    } else {
        None
    }
}

/// The cross product grows along the normal `(-dy, dx)`, so moving with
/// the direction vector lands on the side its projection onto that normal
/// points to.
fn enter_side(start: Point2<f32>, end: Point2<f32>, direction: LineDirection) -> Side {
    let along = end - start;
    let normal = Vector2::new(-along.y, along.x);
    if normal.dot(&direction.vector()) > 0.0 {
        Side::Positive
    } else {
        Side::Negative
    }
}

/// Even-odd ray casting. Points exactly on an edge may fall either way.
pub fn point_in_polygon(p: Point2<f32>, polygon: &[Point2<f32>]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (polygon[i], polygon[j]);
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(a: Point2<f32>, b: Point2<f32>, p: Point2<f32>) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Whether segments `p1p2` and `q1q2` share a point, endpoints included.
pub fn segments_intersect(
    p1: Point2<f32>,
    p2: Point2<f32>,
    q1: Point2<f32>,
    q2: Point2<f32>,
) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f32, y: f32) -> Point2<f32> {
        Point2::new(x, y)
    }

    #[test]
    fn test_point_in_polygon() {
        let square = [pt(0.0, 0.0), pt(10.0, 0.0), pt(10.0, 10.0), pt(0.0, 10.0)];
        assert!(point_in_polygon(pt(5.0, 5.0), &square));
        assert!(!point_in_polygon(pt(15.0, 5.0), &square));
        assert!(!point_in_polygon(pt(5.0, -1.0), &square));

        // Concave "L" shape
        let l_shape = [
            pt(0.0, 0.0),
            pt(10.0, 0.0),
            pt(10.0, 4.0),
            pt(4.0, 4.0),
            pt(4.0, 10.0),
            pt(0.0, 10.0),
        ];
        assert!(point_in_polygon(pt(2.0, 8.0), &l_shape));
        assert!(!point_in_polygon(pt(8.0, 8.0), &l_shape));
    }

    #[test]
    fn test_side_of_line() {
        let (a, b) = (pt(0.0, 100.0), pt(200.0, 100.0));
        assert_eq!(side_of(a, b, pt(50.0, 150.0)), Some(Side::Positive));
        assert_eq!(side_of(a, b, pt(50.0, 50.0)), Some(Side::Negative));
        assert_eq!(side_of(a, b, pt(50.0, 100.0)), None);
    }

    #[test]
    fn test_enter_side_follows_direction() {
        // Horizontal line, image y grows downwards.
        let (a, b) = (pt(0.0, 100.0), pt(200.0, 100.0));
        assert_eq!(enter_side(a, b, LineDirection::TopToBottom), Side::Positive);
        assert_eq!(enter_side(a, b, LineDirection::BottomToTop), Side::Negative);
        // Reversing the endpoints flips the sign but not the physical side.
        assert_eq!(enter_side(b, a, LineDirection::TopToBottom), Side::Negative);
        assert_eq!(side_of(b, a, pt(50.0, 150.0)), Some(Side::Negative));
    }

    #[test]
    fn test_segments_intersect() {
        let (q1, q2) = (pt(0.0, 100.0), pt(200.0, 100.0));
        assert!(segments_intersect(pt(50.0, 90.0), pt(50.0, 110.0), q1, q2));
        // Crosses the infinite line beyond the segment end.
        assert!(!segments_intersect(pt(250.0, 90.0), pt(250.0, 110.0), q1, q2));
        // Touching an endpoint counts.
        assert!(segments_intersect(pt(50.0, 100.0), pt(50.0, 110.0), q1, q2));
    }

    #[test]
    fn test_resolve_percentage() {
        let shape = ZoneShape::Polygon(vec![pt(0.0, 0.0), pt(50.0, 0.0), pt(50.0, 100.0)]);
        let resolved = ResolvedShape::resolve(&shape, CoordinateType::Percentage, 640, 480);
        assert_eq!(resolved.outline(), vec![(0.0, 0.0), (320.0, 0.0), (320.0, 480.0)]);
    }
}
