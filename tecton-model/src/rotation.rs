//! Finite rotations and total reconstruction sequences

use crate::geometry::{cross, GeometryOnSphere, PointOnSphere};
use serde::{Deserialize, Serialize};
use tecton_types::{PlateId, ReconstructionTime};

/// A rotation of the sphere about its centre, stored as a unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiniteRotation {
    w: f64,
    x: f64,
    y: f64,
    z: f64,
}

impl FiniteRotation {
    pub fn identity() -> Self {
        FiniteRotation {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    /// Rotation by `angle_degrees` about the Euler pole `pole`.
    pub fn from_euler_pole(pole: &PointOnSphere, angle_degrees: f64) -> Self {
        let half = angle_degrees.to_radians() / 2.0;
        let s = half.sin();
        FiniteRotation {
            w: half.cos(),
            x: pole.x() * s,
            y: pole.y() * s,
            z: pole.z() * s,
        }
    }

    /// Rotation about the pole at (`lat`, `lon`) degrees.
    pub fn from_pole_lat_lon(lat: f64, lon: f64, angle_degrees: f64) -> Self {
        Self::from_euler_pole(&PointOnSphere::from_lat_lon(lat, lon), angle_degrees)
    }

    /// `self ∘ other`: applies `other` first, then `self`.
    pub fn compose(&self, other: &FiniteRotation) -> FiniteRotation {
        let (a, b) = (self, other);
        FiniteRotation {
            w: a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
            x: a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
            y: a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
            z: a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
        }
        .normalised()
    }

    /// The inverse rotation.
    pub fn reverse(&self) -> FiniteRotation {
        FiniteRotation {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    pub fn rotate_point(&self, point: &PointOnSphere) -> PointOnSphere {
        let q = [self.x, self.y, self.z];
        let v = point.as_array();
        let t = cross(q, v).map(|c| 2.0 * c);
        let u = cross(q, t);
        let rotated = [
            v[0] + self.w * t[0] + u[0],
            v[1] + self.w * t[1] + u[1],
            v[2] + self.w * t[2] + u[2],
        ];
        // A unit quaternion preserves length, so this cannot be the zero vector.
        PointOnSphere::from_vector(rotated[0], rotated[1], rotated[2]).unwrap_or(*point)
    }

    pub fn rotate_geometry(&self, geometry: &GeometryOnSphere) -> GeometryOnSphere {
        geometry.map_points(|p| self.rotate_point(p))
    }

    /// Rotation angle in degrees, in `[0, 180]`.
    pub fn angle_degrees(&self) -> f64 {
        let w = self.w.abs().min(1.0);
        (2.0 * w.acos()).to_degrees()
    }

    pub fn is_identity(&self) -> bool {
        self.angle_degrees() < 1e-9
    }

    /// Spherical linear interpolation: `t = 0` gives `from`, `t = 1` gives `to`.
    pub fn interpolate(from: &FiniteRotation, to: &FiniteRotation, t: f64) -> FiniteRotation {
        let mut to = *to;
        let mut cos = from.w * to.w + from.x * to.x + from.y * to.y + from.z * to.z;
        if cos < 0.0 {
            to = FiniteRotation {
                w: -to.w,
                x: -to.x,
                y: -to.y,
                z: -to.z,
            };
            cos = -cos;
        }

        let (s0, s1) = if cos > 0.9995 {
            (1.0 - t, t)
        } else {
            let theta = cos.acos();
            let sin = theta.sin();
            (((1.0 - t) * theta).sin() / sin, (t * theta).sin() / sin)
        };

        FiniteRotation {
            w: s0 * from.w + s1 * to.w,
            x: s0 * from.x + s1 * to.x,
            y: s0 * from.y + s1 * to.y,
            z: s0 * from.z + s1 * to.z,
        }
        .normalised()
    }

    fn normalised(self) -> FiniteRotation {
        let len = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if len < 1e-15 {
            return FiniteRotation::identity();
        }
        FiniteRotation {
            w: self.w / len,
            x: self.x / len,
            y: self.y / len,
            z: self.z / len,
        }
    }
}

impl Default for FiniteRotation {
    fn default() -> Self {
        Self::identity()
    }
}

/// One sample of a total reconstruction sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TotalReconstructionPole {
    pub time: f64,
    pub rotation: FiniteRotation,
}

/// Rotation of a moving plate relative to a fixed plate through time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalReconstructionSequence {
    pub fixed_plate: PlateId,
    pub moving_plate: PlateId,
    poles: Vec<TotalReconstructionPole>,
}

impl TotalReconstructionSequence {
    pub fn new(
        fixed_plate: PlateId,
        moving_plate: PlateId,
        mut poles: Vec<TotalReconstructionPole>,
    ) -> Self {
        poles.sort_by(|a, b| a.time.total_cmp(&b.time));
        TotalReconstructionSequence {
            fixed_plate,
            moving_plate,
            poles,
        }
    }

    pub fn poles(&self) -> &[TotalReconstructionPole] {
        &self.poles
    }

    /// The interpolated rotation at `time`, or `None` outside the sampled range.
    pub fn rotation_at(&self, time: ReconstructionTime) -> Option<FiniteRotation> {
        let t = time.value();
        let first = self.poles.first()?;
        let last = self.poles.last()?;
        if t < first.time - 1e-9 || t > last.time + 1e-9 {
            return None;
        }

        for window in self.poles.windows(2) {
            let (young, old) = (&window[0], &window[1]);
            if t <= old.time + 1e-9 {
                let span = old.time - young.time;
                if span <= 0.0 {
                    return Some(old.rotation);
                }
                let fraction = ((t - young.time) / span).clamp(0.0, 1.0);
                return Some(FiniteRotation::interpolate(
                    &young.rotation,
                    &old.rotation,
                    fraction,
                ));
            }
        }

        Some(first.rotation)
    }
}
