//! Geometries on the unit sphere

use serde::{Deserialize, Serialize};
use std::slice;

/// A point on the unit sphere, stored as a unit vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointOnSphere {
    x: f64,
    y: f64,
    z: f64,
}

impl PointOnSphere {
    /// Normalise `(x, y, z)` onto the sphere; `None` for the zero vector.
    pub fn from_vector(x: f64, y: f64, z: f64) -> Option<Self> {
        let len = (x * x + y * y + z * z).sqrt();
        if len < 1e-12 {
            return None;
        }
        Some(PointOnSphere {
            x: x / len,
            y: y / len,
            z: z / len,
        })
    }

    /// From latitude and longitude in degrees.
    pub fn from_lat_lon(lat: f64, lon: f64) -> Self {
        let (lat, lon) = (lat.to_radians(), lon.to_radians());
        PointOnSphere {
            x: lat.cos() * lon.cos(),
            y: lat.cos() * lon.sin(),
            z: lat.sin(),
        }
    }

    /// Latitude and longitude in degrees.
    pub fn lat_lon(&self) -> (f64, f64) {
        let lat = self.z.clamp(-1.0, 1.0).asin().to_degrees();
        let lon = self.y.atan2(self.x).to_degrees();
        (lat, lon)
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn z(&self) -> f64 {
        self.z
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn dot(&self, other: &PointOnSphere) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &PointOnSphere) -> [f64; 3] {
        cross(self.as_array(), other.as_array())
    }

    /// Great-circle distance in radians.
    pub fn angular_distance(&self, other: &PointOnSphere) -> f64 {
        let c = self.cross(other);
        let sin = (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt();
        sin.atan2(self.dot(other))
    }

    /// Whether two points are within `tolerance` radians of each other.
    pub fn is_close(&self, other: &PointOnSphere, tolerance: f64) -> bool {
        self.angular_distance(other) <= tolerance
    }
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// The shape of a geometry, without its points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryKind {
    Point,
    MultiPoint,
    Polyline,
    Polygon,
}

/// A (non-topological) geometry on the sphere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GeometryOnSphere {
    Point(PointOnSphere),
    MultiPoint(Vec<PointOnSphere>),
    Polyline(Vec<PointOnSphere>),
    /// Exterior ring; the closing edge back to the first point is implicit.
    Polygon(Vec<PointOnSphere>),
}

impl GeometryOnSphere {
    pub fn kind(&self) -> GeometryKind {
        match self {
            GeometryOnSphere::Point(_) => GeometryKind::Point,
            GeometryOnSphere::MultiPoint(_) => GeometryKind::MultiPoint,
            GeometryOnSphere::Polyline(_) => GeometryKind::Polyline,
            GeometryOnSphere::Polygon(_) => GeometryKind::Polygon,
        }
    }

    pub fn points(&self) -> &[PointOnSphere] {
        match self {
            GeometryOnSphere::Point(point) => slice::from_ref(point),
            GeometryOnSphere::MultiPoint(points)
            | GeometryOnSphere::Polyline(points)
            | GeometryOnSphere::Polygon(points) => points,
        }
    }

    pub fn num_points(&self) -> usize {
        self.points().len()
    }

    /// A geometry of the same kind with every point transformed.
    pub fn map_points(&self, mut f: impl FnMut(&PointOnSphere) -> PointOnSphere) -> Self {
        match self {
            GeometryOnSphere::Point(point) => GeometryOnSphere::Point(f(point)),
            GeometryOnSphere::MultiPoint(points) => {
                GeometryOnSphere::MultiPoint(points.iter().map(f).collect())
            }
            GeometryOnSphere::Polyline(points) => {
                GeometryOnSphere::Polyline(points.iter().map(f).collect())
            }
            GeometryOnSphere::Polygon(points) => {
                GeometryOnSphere::Polygon(points.iter().map(f).collect())
            }
        }
    }

    /// Normalised mean of the points; `None` if they cancel out.
    pub fn centroid(&self) -> Option<PointOnSphere> {
        let sum = self.points().iter().fold([0.0; 3], |acc, p| {
            [acc[0] + p.x(), acc[1] + p.y(), acc[2] + p.z()]
        });
        PointOnSphere::from_vector(sum[0], sum[1], sum[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lat_lon_round_trip_for_a_single_point() {
        let point = PointOnSphere::from_lat_lon(-33.5, 151.25);
        let (lat, lon) = point.lat_lon();
        assert!((lat + 33.5).abs() < 1e-9);
        assert!((lon - 151.25).abs() < 1e-9);
    }

    #[test]
    fn test_angular_distance() {
        let a = PointOnSphere::from_lat_lon(0.0, 0.0);
        let b = PointOnSphere::from_lat_lon(0.0, 90.0);
        assert!((a.angular_distance(&b) - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_zero_vector_is_rejected() {
        assert!(PointOnSphere::from_vector(0.0, 0.0, 0.0).is_none());
    }

    #[test]
    fn test_point_geometry_exposes_single_point() {
        let geometry = GeometryOnSphere::Point(PointOnSphere::from_lat_lon(10.0, 20.0));
        assert_eq!(geometry.num_points(), 1);
        assert_eq!(geometry.kind(), GeometryKind::Point);
    }

    #[test]
    fn test_centroid_of_antipodal_points_is_undefined() {
        let geometry = GeometryOnSphere::MultiPoint(vec![
            PointOnSphere::from_lat_lon(0.0, 0.0),
            PointOnSphere::from_lat_lon(0.0, 180.0),
        ]);
        assert!(geometry.centroid().is_none());
    }
}
