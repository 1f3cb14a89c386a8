//! Plate-id assignment by partitioning
//!
//! Regular features are cookie-cut against partitioning polygons, either
//! resolved topological boundaries or reconstructed static polygons, and take
//! the plate id of the polygon containing most of their first geometry.

use crate::engine::EngineContext;
use crate::layer_proxy::reconstruct::ReconstructLayerProxy;
use crate::layer_proxy::topology_geometry::TopologyGeometryResolverLayerProxy;
use std::sync::Arc;
use tecton_model::{
    FeatureCollectionHandle, FeatureStore, FeatureType, GeometryKind, GeometryService,
    PointOnSphere,
};
use tecton_types::{FeatureId, PlateId, ReconstructionTime};

/// A layer whose polygons partition the globe into plates.
#[derive(Debug, Clone)]
pub enum PartitioningLayer {
    ResolvedBoundaries(Arc<TopologyGeometryResolverLayerProxy>),
    StaticPolygons(Arc<ReconstructLayerProxy>),
}

#[derive(Debug)]
struct PartitioningPolygon {
    points: Vec<PointOnSphere>,
    plate_id: PlateId,
}

/// Counts from one [`PlateIdAssigner::assign`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssignmentSummary {
    pub assigned: usize,
    /// Regular features no partitioning polygon contained.
    pub unpartitioned: usize,
}

#[derive(Debug)]
pub struct PlateIdAssigner {
    partitioning_layers: Vec<PartitioningLayer>,
    geometry_service: Arc<dyn GeometryService>,
    feature_store: Arc<FeatureStore>,
}

impl PlateIdAssigner {
    /// # Panics
    ///
    /// If `partitioning_layers` is empty.
    pub fn new(context: &EngineContext, partitioning_layers: Vec<PartitioningLayer>) -> Self {
        assert!(
            !partitioning_layers.is_empty(),
            "plate-id assignment needs at least one partitioning layer"
        );
        PlateIdAssigner {
            partitioning_layers,
            geometry_service: context.geometry_service.clone(),
            feature_store: context.feature_store.clone(),
        }
    }

    /// Assign plate ids to the regular features of `collections`, treating
    /// their geometries as positioned at `time`.
    ///
    /// Every modification happens under one notification guard, so each
    /// collection notifies its observers once.
    pub fn assign(
        &self,
        collections: &[FeatureCollectionHandle],
        time: ReconstructionTime,
    ) -> AssignmentSummary {
        let polygons = self.partitioning_polygons(time);
        let guard = self.feature_store.notification_guard();

        let mut summary = AssignmentSummary::default();
        for collection in collections {
            let assignments: Vec<(FeatureId, Option<PlateId>)> = collection
                .features()
                .iter()
                .filter_map(|handle| {
                    let feature = handle.read();
                    if !is_partitionable(feature.feature_type) {
                        return None;
                    }
                    let points = feature.geometries.first()?.geometry.points().to_vec();
                    Some((feature.id.clone(), self.partition(&polygons, &points)))
                })
                .collect();

            for (feature_id, plate_id) in assignments {
                let Some(plate_id) = plate_id else {
                    summary.unpartitioned += 1;
                    continue;
                };
                if collection.modify_feature(&feature_id, |feature| {
                    feature.reconstruction_plate_id = Some(plate_id);
                }) {
                    summary.assigned += 1;
                }
            }
        }

        guard.release();
        tracing::debug!(
            %time,
            assigned = summary.assigned,
            unpartitioned = summary.unpartitioned,
            "assigned plate ids"
        );
        summary
    }

    fn partitioning_polygons(&self, time: ReconstructionTime) -> Vec<PartitioningPolygon> {
        let mut polygons = Vec::new();
        for layer in &self.partitioning_layers {
            match layer {
                PartitioningLayer::ResolvedBoundaries(layer) => {
                    for boundary in &layer.get_resolved_topological_boundaries(time).items {
                        if let Some(plate_id) = boundary.plate_id() {
                            polygons.push(PartitioningPolygon {
                                points: boundary.geometry().0.clone(),
                                plate_id,
                            });
                        }
                    }
                }
                PartitioningLayer::StaticPolygons(layer) => {
                    for rfg in &layer.get_reconstructed_feature_geometries(time).items {
                        let geometry = rfg.reconstructed_geometry();
                        if geometry.kind() != GeometryKind::Polygon {
                            continue;
                        }
                        if let Some(plate_id) = rfg.reconstruction_plate_id() {
                            polygons.push(PartitioningPolygon {
                                points: geometry.points().to_vec(),
                                plate_id,
                            });
                        }
                    }
                }
            }
        }
        polygons
    }

    /// Plate id of the polygon containing the most points; the earliest
    /// polygon wins ties.
    fn partition(
        &self,
        polygons: &[PartitioningPolygon],
        points: &[PointOnSphere],
    ) -> Option<PlateId> {
        let mut best: Option<(usize, PlateId)> = None;
        for polygon in polygons {
            let inside = points
                .iter()
                .filter(|point| self.geometry_service.polygon_contains(&polygon.points, point))
                .count();
            if inside > 0 && best.map_or(true, |(count, _)| inside > count) {
                best = Some((inside, polygon.plate_id));
            }
        }
        best.map(|(_, plate_id)| plate_id)
    }
}

fn is_partitionable(feature_type: FeatureType) -> bool {
    !feature_type.is_topological()
        && !matches!(
            feature_type,
            FeatureType::TotalReconstructionSequence | FeatureType::Raster
        )
}
