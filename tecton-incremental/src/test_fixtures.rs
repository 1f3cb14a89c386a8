//! Shared builders for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use tecton_model::{
    AssembledTopology, DefaultGeometryService, Feature, FeatureType, FiniteRotation,
    GeometryOnSphere, GeometryService, MeshingOptions, NetworkMesh, PointOnSphere, PolygonMesh,
    TotalReconstructionPole, TotalReconstructionSequence,
};
use tecton_types::{FeatureId, PlateId};

/// Rotation of `moving` about the north pole, from zero at present day to
/// `angle_at_100` degrees at 100 Ma.
pub fn rotation_feature(fixed: u64, moving: u64, angle_at_100: f64) -> Feature {
    Feature::new(FeatureType::TotalReconstructionSequence).rotation_sequence(
        TotalReconstructionSequence::new(
            PlateId(fixed),
            PlateId(moving),
            vec![
                TotalReconstructionPole {
                    time: 0.0,
                    rotation: FiniteRotation::identity(),
                },
                TotalReconstructionPole {
                    time: 100.0,
                    rotation: FiniteRotation::from_pole_lat_lon(90.0, 0.0, angle_at_100),
                },
            ],
        ),
    )
}

pub fn point_feature(id: &str, plate: u64, lat: f64, lon: f64) -> Feature {
    Feature::with_id(FeatureId::new(id), FeatureType::Coastline)
        .plate_id(plate)
        .geometry(
            "position",
            GeometryOnSphere::Point(PointOnSphere::from_lat_lon(lat, lon)),
        )
}

pub fn polyline_feature(id: &str, plate: u64, lat_lons: &[(f64, f64)]) -> Feature {
    Feature::with_id(FeatureId::new(id), FeatureType::SubductionZone)
        .plate_id(plate)
        .geometry("centerline", GeometryOnSphere::Polyline(points(lat_lons)))
}

pub fn polygon_feature(id: &str, plate: u64, lat_lons: &[(f64, f64)]) -> Feature {
    Feature::with_id(FeatureId::new(id), FeatureType::StaticPolygon)
        .plate_id(plate)
        .geometry("outline", GeometryOnSphere::Polygon(points(lat_lons)))
}

pub fn points(lat_lons: &[(f64, f64)]) -> Vec<PointOnSphere> {
    lat_lons
        .iter()
        .map(|&(lat, lon)| PointOnSphere::from_lat_lon(lat, lon))
        .collect()
}

/// Counts assembly calls, delegating to [`DefaultGeometryService`].
#[derive(Debug, Default)]
pub struct CountingGeometryService {
    pub assemblies: AtomicUsize,
    pub meshes: AtomicUsize,
}

impl CountingGeometryService {
    pub fn assemblies(&self) -> usize {
        self.assemblies.load(Ordering::SeqCst)
    }

    pub fn meshes(&self) -> usize {
        self.meshes.load(Ordering::SeqCst)
    }
}

impl GeometryService for CountingGeometryService {
    fn assemble_line(&self, sections: &[Vec<PointOnSphere>]) -> Option<AssembledTopology> {
        self.assemblies.fetch_add(1, Ordering::SeqCst);
        DefaultGeometryService.assemble_line(sections)
    }

    fn assemble_boundary(&self, sections: &[Vec<PointOnSphere>]) -> Option<AssembledTopology> {
        self.assemblies.fetch_add(1, Ordering::SeqCst);
        DefaultGeometryService.assemble_boundary(sections)
    }

    fn assemble_network(
        &self,
        boundary: &[Vec<PointOnSphere>],
        interior: &[Vec<PointOnSphere>],
        options: &MeshingOptions,
    ) -> Option<NetworkMesh> {
        self.assemblies.fetch_add(1, Ordering::SeqCst);
        DefaultGeometryService.assemble_network(boundary, interior, options)
    }

    fn polygon_contains(&self, polygon: &[PointOnSphere], point: &PointOnSphere) -> bool {
        DefaultGeometryService.polygon_contains(polygon, point)
    }

    fn build_polygon_mesh(&self, polygon: &[PointOnSphere]) -> Option<PolygonMesh> {
        self.meshes.fetch_add(1, Ordering::SeqCst);
        DefaultGeometryService.build_polygon_mesh(polygon)
    }

    fn network_dilatation_strain_rate(
        &self,
        mesh: &NetworkMesh,
        point: &PointOnSphere,
    ) -> Option<f64> {
        DefaultGeometryService.network_dilatation_strain_rate(mesh, point)
    }
}
