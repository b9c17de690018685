//! Zone definitions: JSON loading and validation.

use std::collections::HashSet;

use nalgebra::{Point2, Vector2};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    Polygon,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateType {
    /// Pixels
    #[default]
    Absolute,
    /// 0–100 of the frame width/height, resolved on the first frame
    Percentage,
}

/// Which direction of travel across a line counts as an enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineDirection {
    #[default]
    LeftToRight,
    RightToLeft,
    TopToBottom,
    BottomToTop,
}

impl LineDirection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "left_to_right" | "ltr" => Some(Self::LeftToRight),
            "right_to_left" | "rtl" => Some(Self::RightToLeft),
            "top_to_bottom" | "ttb" => Some(Self::TopToBottom),
            "bottom_to_top" | "btt" => Some(Self::BottomToTop),
            _ => None,
        }
    }

    /// Unit vector of the entering motion in image coordinates (y down).
    pub fn vector(self) -> Vector2<f32> {
        match self {
            Self::LeftToRight => Vector2::new(1.0, 0.0),
            Self::RightToLeft => Vector2::new(-1.0, 0.0),
            Self::TopToBottom => Vector2::new(0.0, 1.0),
            Self::BottomToTop => Vector2::new(0.0, -1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ZoneShape {
    Polygon(Vec<Point2<f32>>),
    Line {
        start: Point2<f32>,
        end: Point2<f32>,
        direction: LineDirection,
    },
}

/// Validated, immutable zone definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDefinition {
    pub zone_id: String,
    pub name: String,
    pub coordinate_type: CoordinateType,
    pub shape: ZoneShape,
    /// Consecutive frames on the inside before an enter is confirmed
    pub enter_threshold: u32,
    /// Consecutive frames on the outside before an exit is confirmed
    pub exit_threshold: u32,
}

impl ZoneDefinition {
    pub fn polygon(zone_id: impl Into<String>, points: &[(f32, f32)]) -> Self {
        Self {
            zone_id: zone_id.into(),
            name: String::new(),
            coordinate_type: CoordinateType::Absolute,
            shape: ZoneShape::Polygon(points.iter().map(|&(x, y)| Point2::new(x, y)).collect()),
            enter_threshold: 1,
            exit_threshold: 1,
        }
    }

    pub fn line(
        zone_id: impl Into<String>,
        start: (f32, f32),
        end: (f32, f32),
        direction: LineDirection,
    ) -> Self {
        Self {
            zone_id: zone_id.into(),
            name: String::new(),
            coordinate_type: CoordinateType::Absolute,
            shape: ZoneShape::Line {
                start: Point2::new(start.0, start.1),
                end: Point2::new(end.0, end.1),
                direction,
            },
            enter_threshold: 1,
            exit_threshold: 1,
        }
    }

    pub fn with_thresholds(mut self, enter: u32, exit: u32) -> Self {
        self.enter_threshold = enter;
        self.exit_threshold = exit;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn in_percent(mut self) -> Self {
        self.coordinate_type = CoordinateType::Percentage;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.zone_id
        } else {
            &self.name
        }
    }

    /// Reject geometry or thresholds that cannot be counted against.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| Err(Error::invalid_zone(&self.zone_id, reason));

        if self.zone_id.trim().is_empty() {
            return Err(Error::invalid_zone("<empty>", "zone_id must not be empty"));
        }
        if self.enter_threshold == 0 || self.exit_threshold == 0 {
            return fail("enter_threshold and exit_threshold must be at least 1");
        }

        let points: Vec<Point2<f32>> = match &self.shape {
            ZoneShape::Polygon(points) => points.clone(),
            ZoneShape::Line { start, end, .. } => vec![*start, *end],
        };
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return fail("coordinates must be finite numbers");
        }
        if self.coordinate_type == CoordinateType::Percentage
            && points
                .iter()
                .any(|p| !(0.0..=100.0).contains(&p.x) || !(0.0..=100.0).contains(&p.y))
        {
            return fail("percentage coordinates must lie within 0..=100");
        }

        match &self.shape {
            ZoneShape::Polygon(points) => {
                if points.len() < 3 {
                    return fail("a polygon needs at least 3 points");
                }
                if polygon_area(points).abs() <= f32::EPSILON {
                    return fail("polygon has zero area");
                }
            }
            ZoneShape::Line {
                start,
                end,
                direction,
            } => {
                let along = end - start;
                if along.norm() <= f32::EPSILON {
                    return fail("line start and end points coincide");
                }
                let normal = Vector2::new(-along.y, along.x);
                if normal.dot(&direction.vector()).abs() <= f32::EPSILON {
                    return fail("direction runs parallel to the line and can never cross it");
                }
            }
        }
        Ok(())
    }
}

fn polygon_area(points: &[Point2<f32>]) -> f32 {
    let n = points.len();
    (0..n)
        .map(|i| {
            let (a, b) = (points[i], points[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum::<f32>()
        / 2.0
}

fn default_threshold() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

/// One zone object as it appears in the JSON configuration.
#[derive(Debug, Clone, Deserialize)]
struct ZoneSpec {
    zone_id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: ZoneKind,
    #[serde(default)]
    coordinate_type: CoordinateType,
    #[serde(default)]
    points: Option<Vec<[f32; 2]>>,
    #[serde(default)]
    start_point: Option<[f32; 2]>,
    #[serde(default)]
    end_point: Option<[f32; 2]>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default = "default_threshold")]
    enter_threshold: u32,
    #[serde(default = "default_threshold")]
    exit_threshold: u32,
    #[serde(default = "default_active")]
    active: bool,
}

impl TryFrom<ZoneSpec> for ZoneDefinition {
    type Error = Error;

    fn try_from(spec: ZoneSpec) -> Result<Self> {
        let point = |[x, y]: [f32; 2]| Point2::new(x, y);
        let shape = match spec.kind {
            ZoneKind::Polygon => {
                let points = spec.points.ok_or_else(|| {
                    Error::invalid_zone(&spec.zone_id, "polygon zone requires `points`")
                })?;
                ZoneShape::Polygon(points.into_iter().map(point).collect())
            }
            ZoneKind::Line => {
                // Lines may also be written as a two-element `points` list.
                let (start, end) = match (spec.start_point, spec.end_point, &spec.points) {
                    (Some(s), Some(e), _) => (s, e),
                    (_, _, Some(p)) if p.len() == 2 => (p[0], p[1]),
                    _ => {
                        return Err(Error::invalid_zone(
                            &spec.zone_id,
                            "line zone requires `start_point` and `end_point`",
                        ));
                    }
                };
                let direction = match spec.direction.as_deref() {
                    None => LineDirection::default(),
                    Some(raw) => LineDirection::parse(raw).ok_or_else(|| {
                        Error::invalid_zone(&spec.zone_id, format!("unknown direction `{raw}`"))
                    })?,
                };
                ZoneShape::Line {
                    start: point(start),
                    end: point(end),
                    direction,
                }
            }
        };

        let definition = ZoneDefinition {
            zone_id: spec.zone_id,
            name: spec.name,
            coordinate_type: spec.coordinate_type,
            shape,
            enter_threshold: spec.enter_threshold,
            exit_threshold: spec.exit_threshold,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Parse and validate a JSON array of zone objects. Inactive zones are
/// skipped; any invalid active zone rejects the whole configuration.
pub fn load_zones(json: &str) -> Result<Vec<ZoneDefinition>> {
    let specs: Vec<ZoneSpec> = serde_json::from_str(json)?;
    let mut seen = HashSet::new();
    let mut zones = Vec::with_capacity(specs.len());

    for spec in specs {
        if !spec.active {
            debug!(zone_id = %spec.zone_id, "skipping inactive zone");
            continue;
        }
        let zone = ZoneDefinition::try_from(spec)?;
        if !seen.insert(zone.zone_id.clone()) {
            return Err(Error::invalid_zone(&zone.zone_id, "duplicate zone_id"));
        }
        zones.push(zone);
    }
    Ok(zones)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_mixed_zones() {
        let json = r#"[
            {"zone_id": "door", "name": "Door", "type": "line",
             "start_point": [0, 100], "end_point": [200, 100],
             "direction": "top_to_bottom", "enter_threshold": 2},
            {"zone_id": "shop", "type": "polygon", "coordinate_type": "percentage",
             "points": [[10, 10], [90, 10], [90, 90], [10, 90]]},
            {"zone_id": "old", "type": "polygon", "points": [[0, 0]], "active": false}
        ]"#;
        let zones = load_zones(json).unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].enter_threshold, 2);
        assert_eq!(zones[0].exit_threshold, 1);
        assert_eq!(zones[1].coordinate_type, CoordinateType::Percentage);
        assert_eq!(zones[0].display_name(), "Door");
        assert_eq!(zones[1].display_name(), "shop");
    }

    #[test]
    fn test_rejects_degenerate_polygon() {
        let json = r#"[{"zone_id": "z", "type": "polygon", "points": [[0,0],[10,10],[20,20]]}]"#;
        let err = load_zones(json).unwrap_err();
        assert!(matches!(err, Error::InvalidZone { ref zone_id, .. } if zone_id == "z"));
    }

    #[test]
    fn test_rejects_out_of_range_percentage() {
        let zone = ZoneDefinition::polygon("z", &[(0.0, 0.0), (150.0, 0.0), (0.0, 50.0)]).in_percent();
        assert!(zone.validate().is_err());
    }

    #[test]
    fn test_rejects_direction_parallel_to_line() {
        let zone = ZoneDefinition::line("z", (0.0, 0.0), (100.0, 0.0), LineDirection::LeftToRight);
        assert!(zone.validate().is_err());
        let zone = ZoneDefinition::line("z", (0.0, 0.0), (100.0, 0.0), LineDirection::TopToBottom);
        assert!(zone.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_direction_and_duplicates() {
        let json = r#"[{"zone_id": "l", "type": "line", "start_point": [0,0], "end_point": [0,10], "direction": "sideways"}]"#;
        assert!(load_zones(json).is_err());

        let json = r#"[
            {"zone_id": "a", "type": "polygon", "points": [[0,0],[10,0],[0,10]]},
            {"zone_id": "a", "type": "polygon", "points": [[0,0],[10,0],[0,10]]}
        ]"#;
        assert!(load_zones(json).is_err());
    }

    #[test]
    fn test_rejects_zero_threshold_and_bad_json() {
        let json = r#"[{"zone_id": "a", "type": "polygon", "points": [[0,0],[10,0],[0,10]], "exit_threshold": 0}]"#;
        assert!(load_zones(json).is_err());
        assert!(matches!(load_zones("{not json"), Err(Error::ZoneConfig(_))));
    }
}
