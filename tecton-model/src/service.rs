//! Geometry service
//!
//! Assembly of topological geometries (intersection, cookie-cutting,
//! triangulation) is delegated to a [`GeometryService`]. The engine only ever
//! calls it as a pure function. [`DefaultGeometryService`] is a simple
//! stand-in that joins sections end to end and fan-triangulates.

use crate::geometry::{cross, dot, PointOnSphere};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coincident points closer than this (radians) are merged when joining.
const JOIN_TOLERANCE: f64 = 1e-9;

/// Result of joining the sections of a topological line or boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledTopology {
    pub points: Vec<PointOnSphere>,
    /// The part of each input section that ended up in `points`, in order.
    pub sub_segments: Vec<Vec<PointOnSphere>>,
}

/// Options controlling network triangulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MeshingOptions {
    /// Use interior sections as triangulation constraints.
    pub constrained: bool,
    /// Refine the triangulation.
    pub refine: bool,
}

/// A triangulated deforming network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMesh {
    pub boundary: Vec<PointOnSphere>,
    pub vertices: Vec<PointOnSphere>,
    pub triangles: Vec<[usize; 3]>,
}

/// A triangulation of a present-day polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonMesh {
    pub vertices: Vec<PointOnSphere>,
    pub triangles: Vec<[usize; 3]>,
}

/// Geometric assembly invoked by topological resolution.
pub trait GeometryService: Send + Sync + fmt::Debug {
    /// Join line sections, in order, into a polyline.
    fn assemble_line(&self, sections: &[Vec<PointOnSphere>]) -> Option<AssembledTopology>;

    /// Join boundary sections, in order, into a closed polygon.
    fn assemble_boundary(&self, sections: &[Vec<PointOnSphere>]) -> Option<AssembledTopology>;

    /// Build a network from its boundary sections and interior constraints.
    fn assemble_network(
        &self,
        boundary: &[Vec<PointOnSphere>],
        interior: &[Vec<PointOnSphere>],
        options: &MeshingOptions,
    ) -> Option<NetworkMesh>;

    fn polygon_contains(&self, polygon: &[PointOnSphere], point: &PointOnSphere) -> bool;

    /// Triangulate a polygon, or `None` when it is degenerate.
    fn build_polygon_mesh(&self, polygon: &[PointOnSphere]) -> Option<PolygonMesh>;

    /// Dilatation strain rate of the network at `point`, if inside it.
    fn network_dilatation_strain_rate(
        &self,
        mesh: &NetworkMesh,
        point: &PointOnSphere,
    ) -> Option<f64>;
}

/// Joins sections end to end and fan-triangulates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultGeometryService;

impl DefaultGeometryService {
    fn join(sections: &[Vec<PointOnSphere>]) -> AssembledTopology {
        let mut points: Vec<PointOnSphere> = Vec::new();
        for section in sections {
            for point in section {
                let duplicate = points
                    .last()
                    .is_some_and(|last| last.is_close(point, JOIN_TOLERANCE));
                if !duplicate {
                    points.push(*point);
                }
            }
        }
        AssembledTopology {
            points,
            sub_segments: sections.to_vec(),
        }
    }

    fn fan(count: usize) -> Vec<[usize; 3]> {
        (1..count.saturating_sub(1)).map(|i| [0, i, i + 1]).collect()
    }
}

impl GeometryService for DefaultGeometryService {
    fn assemble_line(&self, sections: &[Vec<PointOnSphere>]) -> Option<AssembledTopology> {
        let assembled = Self::join(sections);
        (assembled.points.len() >= 2).then_some(assembled)
    }

    fn assemble_boundary(&self, sections: &[Vec<PointOnSphere>]) -> Option<AssembledTopology> {
        let mut assembled = Self::join(sections);
        let closes = match (assembled.points.first(), assembled.points.last()) {
            (Some(first), Some(last)) if assembled.points.len() > 1 => {
                first.is_close(last, JOIN_TOLERANCE)
            }
            _ => false,
        };
        if closes {
            assembled.points.pop();
        }
        (assembled.points.len() >= 3).then_some(assembled)
    }

    fn assemble_network(
        &self,
        boundary: &[Vec<PointOnSphere>],
        interior: &[Vec<PointOnSphere>],
        options: &MeshingOptions,
    ) -> Option<NetworkMesh> {
        let boundary = self.assemble_boundary(boundary)?.points;
        let mut vertices = boundary.clone();
        let triangles = Self::fan(boundary.len());
        if options.constrained {
            vertices.extend(interior.iter().flatten().copied());
        }
        Some(NetworkMesh {
            boundary,
            vertices,
            triangles,
        })
    }

    fn polygon_contains(&self, polygon: &[PointOnSphere], point: &PointOnSphere) -> bool {
        if polygon.len() < 3 {
            return false;
        }
        let p = point.as_array();
        let tangent = |v: &PointOnSphere| {
            let v = v.as_array();
            let d = dot(v, p);
            [v[0] - d * p[0], v[1] - d * p[1], v[2] - d * p[2]]
        };

        // Winding angle of the polygon as seen from the point.
        let mut winding = 0.0;
        for (i, a) in polygon.iter().enumerate() {
            let b = &polygon[(i + 1) % polygon.len()];
            let (ta, tb) = (tangent(a), tangent(b));
            winding += dot(cross(ta, tb), p).atan2(dot(ta, tb));
        }
        winding.abs() > std::f64::consts::PI
    }

    fn build_polygon_mesh(&self, polygon: &[PointOnSphere]) -> Option<PolygonMesh> {
        if polygon.len() < 3 {
            return None;
        }
        // Polygons too large to project onto one hemisphere have no centroid.
        let sum = polygon.iter().fold([0.0; 3], |acc, p| {
            [acc[0] + p.x(), acc[1] + p.y(), acc[2] + p.z()]
        });
        let centre = PointOnSphere::from_vector(sum[0], sum[1], sum[2])?;
        if polygon.iter().any(|p| p.dot(&centre) <= 0.0) {
            return None;
        }
        Some(PolygonMesh {
            vertices: polygon.to_vec(),
            triangles: Self::fan(polygon.len()),
        })
    }

    fn network_dilatation_strain_rate(
        &self,
        mesh: &NetworkMesh,
        point: &PointOnSphere,
    ) -> Option<f64> {
        self.polygon_contains(&mesh.boundary, point).then_some(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<PointOnSphere> {
        vec![
            PointOnSphere::from_lat_lon(-10.0, -10.0),
            PointOnSphere::from_lat_lon(-10.0, 10.0),
            PointOnSphere::from_lat_lon(10.0, 10.0),
            PointOnSphere::from_lat_lon(10.0, -10.0),
        ]
    }

    #[test]
    fn test_polygon_contains() {
        let service = DefaultGeometryService;
        assert!(service.polygon_contains(&square(), &PointOnSphere::from_lat_lon(0.0, 0.0)));
        assert!(!service.polygon_contains(&square(), &PointOnSphere::from_lat_lon(0.0, 40.0)));
    }

    #[test]
    fn test_boundary_joins_shared_endpoints() {
        let service = DefaultGeometryService;
        let corners = square();
        let sections = vec![
            vec![corners[0], corners[1], corners[2]],
            vec![corners[2], corners[3], corners[0]],
        ];
        let assembled = service.assemble_boundary(&sections).unwrap();
        assert_eq!(assembled.points.len(), 4);
        assert_eq!(assembled.sub_segments.len(), 2);
    }

    #[test]
    fn test_degenerate_geometries_are_absent() {
        let service = DefaultGeometryService;
        let point = vec![PointOnSphere::from_lat_lon(0.0, 0.0)];
        assert!(service.assemble_line(&[point.clone()]).is_none());
        assert!(service.assemble_boundary(&[point.clone()]).is_none());
        assert!(service.build_polygon_mesh(&point).is_none());
    }

    #[test]
    fn test_polygon_mesh_fans() {
        let mesh = DefaultGeometryService.build_polygon_mesh(&square()).unwrap();
        assert_eq!(mesh.triangles, vec![[0, 1, 2], [0, 2, 3]]);
    }

    #[test]
    fn test_constrained_network_includes_interior() {
        let service = DefaultGeometryService;
        let interior = vec![vec![PointOnSphere::from_lat_lon(0.0, 0.0)]];
        let unconstrained = service
            .assemble_network(&[square()], &interior, &MeshingOptions::default())
            .unwrap();
        let constrained = service
            .assemble_network(
                &[square()],
                &interior,
                &MeshingOptions {
                    constrained: true,
                    refine: false,
                },
            )
            .unwrap();
        assert_eq!(unconstrained.vertices.len(), 4);
        assert_eq!(constrained.vertices.len(), 5);
    }
}
