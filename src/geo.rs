//! Geofence geometry: great-circle distance and containment tests.
//!
//! Pure functions only; loading geofences from the branch tables lives in
//! `branches`. Coordinates are decimal degrees, distances kilometers.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Tolerance for "point lies on an edge" in degree units.
const EDGE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Stored fence type code on a branch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceType {
    Circle,
    Rectangle,
    Polygon,
    None,
}

impl FenceType {
    /// `C`, `R`, `P`; anything else (including `N`) has no geometry.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "C" | "c" => FenceType::Circle,
            "R" | "r" => FenceType::Rectangle,
            "P" | "p" => FenceType::Polygon,
            _ => FenceType::None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            FenceType::Circle => "C",
            FenceType::Rectangle => "R",
            FenceType::Polygon => "P",
            FenceType::None => "N",
        }
    }
}

/// Which side of the fence counts as a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertMode {
    /// Match when the point is inside (`aviso = "E"`).
    Enter,
    /// Match when the point is outside.
    Exit,
}

impl AlertMode {
    pub fn from_code(code: &str) -> Self {
        if code == "E" {
            AlertMode::Enter
        } else {
            AlertMode::Exit
        }
    }
}

/// A branch service area.
#[derive(Debug, Clone, PartialEq)]
pub enum Geofence {
    Circle { center: GeoPoint, radius_km: f64 },
    Rectangle { corner_a: GeoPoint, corner_b: GeoPoint },
    Polygon { vertices: Vec<GeoPoint> },
    None,
}

/// Result of evaluating one fence against one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FenceCheck {
    pub matched: bool,
    /// Representative distance; `None` for fences without geometry.
    pub distance_km: Option<f64>,
}

impl Geofence {
    /// Build a fence from its stored type, radius and ordered points.
    ///
    /// Circles use the first point as center, rectangles the first two as
    /// opposite corners, polygons the whole sequence.
    pub fn from_stored(
        fence_type: FenceType,
        radius_km: f64,
        points: &[GeoPoint],
    ) -> Result<Self, String> {
        match fence_type {
            FenceType::None => Ok(Geofence::None),
            FenceType::Circle => {
                let center = *points.first().ok_or("circle has no center point")?;
                if !radius_km.is_finite() || radius_km < 0.0 {
                    return Err(format!("circle radius {radius_km} is invalid"));
                }
                Ok(Geofence::Circle { center, radius_km })
            }
            FenceType::Rectangle => match points {
                [a, b, ..] => Ok(Geofence::Rectangle {
                    corner_a: *a,
                    corner_b: *b,
                }),
                _ => Err(format!(
                    "rectangle needs 2 points, found {}",
                    points.len()
                )),
            },
            FenceType::Polygon => {
                if points.is_empty() {
                    return Err("polygon has no points".into());
                }
                let mut vertices = points.to_vec();
                if vertices.len() > 1 && vertices.first() == vertices.last() {
                    vertices.pop();
                }
                if vertices.len() < 3 {
                    return Err(format!(
                        "polygon needs 3 distinct points, found {}",
                        vertices.len()
                    ));
                }
                Ok(Geofence::Polygon { vertices })
            }
        }
    }

    pub fn fence_type(&self) -> FenceType {
        match self {
            Geofence::Circle { .. } => FenceType::Circle,
            Geofence::Rectangle { .. } => FenceType::Rectangle,
            Geofence::Polygon { .. } => FenceType::Polygon,
            Geofence::None => FenceType::None,
        }
    }

    /// Boundary-inclusive containment.
    pub fn contains(&self, point: GeoPoint) -> bool {
        match self {
            Geofence::Circle { center, radius_km } => haversine_km(*center, point) <= *radius_km,
            Geofence::Rectangle { corner_a, corner_b } => {
                point_in_ring(point, &rectangle_ring(*corner_a, *corner_b))
            }
            Geofence::Polygon { vertices } => point_in_ring(point, &close_ring(vertices)),
            Geofence::None => false,
        }
    }

    /// Distance from the fence's reference point: the center of a circle,
    /// the first stored corner or vertex otherwise.
    pub fn reference_distance_km(&self, point: GeoPoint) -> Option<f64> {
        match self {
            Geofence::Circle { center, .. } => Some(haversine_km(*center, point)),
            Geofence::Rectangle { corner_a, .. } => Some(haversine_km(*corner_a, point)),
            Geofence::Polygon { vertices } => vertices.first().map(|v| haversine_km(*v, point)),
            Geofence::None => None,
        }
    }

    pub fn check(&self, point: GeoPoint, mode: AlertMode) -> FenceCheck {
        let distance_km = self.reference_distance_km(point);
        if distance_km.is_none() {
            return FenceCheck {
                matched: false,
                distance_km: None,
            };
        }
        let inside = self.contains(point);
        FenceCheck {
            matched: match mode {
                AlertMode::Enter => inside,
                AlertMode::Exit => !inside,
            },
            distance_km,
        }
    }
}

/// Great-circle distance in kilometers.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push h past 1 near antipodes.
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// The four corners spanned by two opposite corners, closed.
fn rectangle_ring(a: GeoPoint, b: GeoPoint) -> Vec<GeoPoint> {
    vec![
        GeoPoint::new(a.lat, a.lng),
        GeoPoint::new(a.lat, b.lng),
        GeoPoint::new(b.lat, b.lng),
        GeoPoint::new(b.lat, a.lng),
        GeoPoint::new(a.lat, a.lng),
    ]
}

fn close_ring(vertices: &[GeoPoint]) -> Vec<GeoPoint> {
    let mut ring = vertices.to_vec();
    if let Some(first) = vertices.first() {
        if vertices.last() != Some(first) {
            ring.push(*first);
        }
    }
    ring
}

fn on_segment(p: GeoPoint, a: GeoPoint, b: GeoPoint) -> bool {
    let cross = (b.lng - a.lng) * (p.lat - a.lat) - (b.lat - a.lat) * (p.lng - a.lng);
    if cross.abs() > EDGE_EPSILON {
        return false;
    }
    p.lng >= a.lng.min(b.lng) - EDGE_EPSILON
        && p.lng <= a.lng.max(b.lng) + EDGE_EPSILON
        && p.lat >= a.lat.min(b.lat) - EDGE_EPSILON
        && p.lat <= a.lat.max(b.lat) + EDGE_EPSILON
}

/// Even-odd test over a closed ring (first point repeated at the end).
/// Points on an edge or vertex count as inside.
pub fn point_in_ring(point: GeoPoint, ring: &[GeoPoint]) -> bool {
    if ring.len() < 4 {
        return false;
    }
    if ring.windows(2).any(|edge| on_segment(point, edge[0], edge[1])) {
        return true;
    }

    let x = point.lng;
    let y = point.lat;
    let mut inside = false;
    for edge in ring.windows(2) {
        let (xi, yi) = (edge[0].lng, edge[0].lat);
        let (xj, yj) = (edge[1].lng, edge[1].lat);
        let intersects = (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi;
        if intersects {
            inside = !inside;
        }
    }
    inside
}
