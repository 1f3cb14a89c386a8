//! Topological resolution
//!
//! Topological lines, boundaries and networks reference their sections by
//! feature id. Resolution happens in two phases: lines are resolved from
//! reconstructed regular features only, then boundaries and networks are
//! resolved from reconstructed regular features plus fully resolved lines.
//!
//! The phases are only sound if references point "downwards", so they are
//! checked before a topology is resolved:
//!
//! - a line may not reference any topological feature
//! - a boundary or network may not reference a boundary or network
//!
//! A topology violating either rule is rejected with a
//! [`TopologyReferenceError`]. This makes reference cycles impossible.

use crate::error::TopologyReferenceError;
use crate::layer_proxy::reconstruction::ReconstructionTreeCreator;
use crate::reconstructed::{ReconstructHandle, ReconstructedFeatureGeometry};
use std::collections::HashMap;
use std::sync::Arc;
use tecton_model::{
    Feature, FeatureStore, GeometryOnSphere, GeometryService, MeshingOptions, NetworkMesh,
    PointOnSphere, TopologicalSectionRef, TopologyKind, WeakFeatureRef,
};
use tecton_types::{FeatureId, PlateId, ReconstructionTime};

/// Where a resolved section's geometry came from.
#[derive(Debug, Clone)]
pub enum SectionSource {
    Reconstructed(Arc<ReconstructedFeatureGeometry>),
    ResolvedLine(Arc<ResolvedTopologicalLine>),
}

impl SectionSource {
    pub fn feature_id(&self) -> &FeatureId {
        match self {
            SectionSource::Reconstructed(rfg) => rfg.feature_id(),
            SectionSource::ResolvedLine(line) => line.feature_id(),
        }
    }

    pub fn points(&self) -> &[PointOnSphere] {
        match self {
            SectionSource::Reconstructed(rfg) => rfg.reconstructed_geometry().points(),
            SectionSource::ResolvedLine(line) => line.geometry().points(),
        }
    }
}

/// One section of a resolved topology.
#[derive(Debug, Clone)]
pub struct ResolvedTopologicalSection {
    pub source: SectionSource,
    pub reverse_order: bool,
    /// The part of the section's geometry used by the topology.
    pub sub_segment: Vec<PointOnSphere>,
}

/// The assembled polyline of a resolved topological line.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologicalPolyline(pub Vec<PointOnSphere>);

/// The assembled polygon of a resolved topological boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologicalPolygon(pub Vec<PointOnSphere>);

/// Points of an assembled topology geometry.
pub trait ResolvedGeometry {
    fn points(&self) -> &[PointOnSphere];
}

impl ResolvedGeometry for TopologicalPolyline {
    fn points(&self) -> &[PointOnSphere] {
        &self.0
    }
}

impl ResolvedGeometry for TopologicalPolygon {
    fn points(&self) -> &[PointOnSphere] {
        &self.0
    }
}

impl ResolvedGeometry for NetworkMesh {
    fn points(&self) -> &[PointOnSphere] {
        &self.boundary
    }
}

/// A topological feature resolved at one time.
#[derive(Debug)]
pub struct ResolvedTopology<G> {
    feature: WeakFeatureRef,
    plate_id: Option<PlateId>,
    reconstruction_time: ReconstructionTime,
    reconstruct_handle: ReconstructHandle,
    reconstruction_tree_creator: ReconstructionTreeCreator,
    sections: Vec<ResolvedTopologicalSection>,
    interior_sections: Vec<ResolvedTopologicalSection>,
    geometry: G,
}

pub type ResolvedTopologicalLine = ResolvedTopology<TopologicalPolyline>;
pub type ResolvedTopologicalBoundary = ResolvedTopology<TopologicalPolygon>;
pub type ResolvedTopologicalNetwork = ResolvedTopology<NetworkMesh>;

impl<G> ResolvedTopology<G> {
    pub fn feature_ref(&self) -> &WeakFeatureRef {
        &self.feature
    }

    pub fn feature_id(&self) -> &FeatureId {
        self.feature.feature_id()
    }

    pub fn plate_id(&self) -> Option<PlateId> {
        self.plate_id
    }

    pub fn reconstruction_time(&self) -> ReconstructionTime {
        self.reconstruction_time
    }

    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    pub fn reconstruction_tree_creator(&self) -> &ReconstructionTreeCreator {
        &self.reconstruction_tree_creator
    }

    /// Boundary sections, in order.
    pub fn sections(&self) -> &[ResolvedTopologicalSection] {
        &self.sections
    }

    /// Interior constraint sections; only networks have any.
    pub fn interior_sections(&self) -> &[ResolvedTopologicalSection] {
        &self.interior_sections
    }

    pub fn geometry(&self) -> &G {
        &self.geometry
    }
}

impl ResolvedTopologicalBoundary {
    pub fn polygon(&self) -> GeometryOnSphere {
        GeometryOnSphere::Polygon(self.geometry.0.clone())
    }
}

impl ResolvedTopologicalLine {
    pub fn polyline(&self) -> GeometryOnSphere {
        GeometryOnSphere::Polyline(self.geometry.0.clone())
    }
}

/// Resolved topologies plus the references rejected while resolving them.
#[derive(Debug)]
pub struct TopologyResolution<T> {
    pub topologies: Vec<Arc<T>>,
    pub rejected: Vec<TopologyReferenceError>,
}

impl<T> Default for TopologyResolution<T> {
    fn default() -> Self {
        TopologyResolution {
            topologies: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// A topological feature as read for one resolution.
#[derive(Debug, Clone)]
pub struct TopologicalFeature {
    pub feature: WeakFeatureRef,
    pub snapshot: Arc<Feature>,
}

impl TopologicalFeature {
    pub fn kind(&self) -> Option<TopologyKind> {
        self.snapshot.feature_type.topology_kind()
    }
}

/// Everything one resolution pass reads.
#[derive(Debug)]
pub struct TopologyResolver<'a> {
    pub geometry_service: &'a dyn GeometryService,
    pub feature_store: &'a FeatureStore,
    pub reconstruction_time: ReconstructionTime,
    pub reconstruct_handle: ReconstructHandle,
    pub reconstruction_tree_creator: &'a ReconstructionTreeCreator,
    /// Reconstructed regular sections by feature id.
    pub sections: &'a HashMap<FeatureId, Arc<ReconstructedFeatureGeometry>>,
    /// Fully resolved lines by feature id.
    pub lines: &'a HashMap<FeatureId, Arc<ResolvedTopologicalLine>>,
}

impl TopologyResolver<'_> {
    /// Phase one: resolve lines from reconstructed sections.
    pub fn resolve_lines<'f>(
        &self,
        features: impl IntoIterator<Item = &'f TopologicalFeature>,
    ) -> TopologyResolution<ResolvedTopologicalLine> {
        self.resolve_each(features, TopologyKind::Line, |feature, sections, _| {
            let parts = section_parts(&sections);
            let assembled = self.geometry_service.assemble_line(&parts)?;
            Some(self.build(
                feature,
                attach_sub_segments(sections, assembled.sub_segments),
                Vec::new(),
                TopologicalPolyline(assembled.points),
            ))
        })
    }

    /// Phase two: resolve boundaries from sections and resolved lines.
    pub fn resolve_boundaries<'f>(
        &self,
        features: impl IntoIterator<Item = &'f TopologicalFeature>,
    ) -> TopologyResolution<ResolvedTopologicalBoundary> {
        self.resolve_each(features, TopologyKind::Boundary, |feature, sections, _| {
            let parts = section_parts(&sections);
            let assembled = self.geometry_service.assemble_boundary(&parts)?;
            Some(self.build(
                feature,
                attach_sub_segments(sections, assembled.sub_segments),
                Vec::new(),
                TopologicalPolygon(assembled.points),
            ))
        })
    }

    /// Phase two for networks, meshed with `options`.
    pub fn resolve_networks<'f>(
        &self,
        features: impl IntoIterator<Item = &'f TopologicalFeature>,
        options: &MeshingOptions,
    ) -> TopologyResolution<ResolvedTopologicalNetwork> {
        self.resolve_each(features, TopologyKind::Network, |feature, sections, interior| {
            let boundary = section_parts(&sections);
            let interior_parts = section_parts(&interior);
            let mesh = self
                .geometry_service
                .assemble_network(&boundary, &interior_parts, options)?;
            let sections = attach_sub_segments(sections, boundary);
            let interior = attach_sub_segments(interior, interior_parts);
            Some(self.build(feature, sections, interior, mesh))
        })
    }

    fn resolve_each<'f, T>(
        &self,
        features: impl IntoIterator<Item = &'f TopologicalFeature>,
        kind: TopologyKind,
        assemble: impl Fn(&TopologicalFeature, Vec<FoundSection>, Vec<FoundSection>) -> Option<T>,
    ) -> TopologyResolution<T> {
        let mut resolution = TopologyResolution::default();
        for feature in features {
            if feature.kind() != Some(kind) || !feature.feature.is_valid() {
                continue;
            }
            if !feature.snapshot.valid_time.contains(self.reconstruction_time) {
                continue;
            }
            let Some(definition) = &feature.snapshot.topology else {
                continue;
            };
            if let Err(error) = self.check_references(
                feature.feature.feature_id(),
                kind,
                definition.referenced_feature_ids(),
            ) {
                tracing::warn!(%error, "rejected topology");
                resolution.rejected.push(error);
                continue;
            }

            let sections = self.find_sections(feature, &definition.sections);
            if sections.is_empty() {
                tracing::debug!(topology = %feature.feature.feature_id(), "no sections found");
                continue;
            }
            let interior = self.find_sections(feature, &definition.interior);
            if let Some(resolved) = assemble(feature, sections, interior) {
                resolution.topologies.push(Arc::new(resolved));
            }
        }
        resolution
    }

    fn check_references<'i>(
        &self,
        topology: &FeatureId,
        kind: TopologyKind,
        referenced: impl Iterator<Item = &'i FeatureId>,
    ) -> Result<(), TopologyReferenceError> {
        for section in referenced {
            let Some(handle) = self.feature_store.find_feature(section) else {
                continue;
            };
            let Some(section_kind) = handle.read().feature_type.topology_kind() else {
                continue;
            };
            match (kind, section_kind) {
                (TopologyKind::Line, _) => {
                    return Err(TopologyReferenceError::LineReferencesTopology {
                        topology: topology.clone(),
                        section: section.clone(),
                    });
                }
                (_, TopologyKind::Boundary | TopologyKind::Network) => {
                    return Err(TopologyReferenceError::ReferencesBoundaryOrNetwork {
                        topology: topology.clone(),
                        kind,
                        section: section.clone(),
                        section_kind,
                    });
                }
                (_, TopologyKind::Line) => {}
            }
        }
        Ok(())
    }

    fn find_sections(
        &self,
        feature: &TopologicalFeature,
        references: &[TopologicalSectionRef],
    ) -> Vec<FoundSection> {
        references
            .iter()
            .filter_map(|reference| {
                let source = match self.sections.get(&reference.feature_id) {
                    Some(rfg) => SectionSource::Reconstructed(rfg.clone()),
                    None => match self.lines.get(&reference.feature_id) {
                        Some(line) => SectionSource::ResolvedLine(line.clone()),
                        None => {
                            tracing::trace!(
                                topology = %feature.feature.feature_id(),
                                section = %reference.feature_id,
                                "section not found at this time"
                            );
                            return None;
                        }
                    },
                };
                Some(FoundSection {
                    source,
                    reverse_order: reference.reverse_order,
                })
            })
            .collect()
    }

    fn build<G>(
        &self,
        feature: &TopologicalFeature,
        sections: Vec<ResolvedTopologicalSection>,
        interior_sections: Vec<ResolvedTopologicalSection>,
        geometry: G,
    ) -> ResolvedTopology<G> {
        ResolvedTopology {
            feature: feature.feature.clone(),
            plate_id: feature.snapshot.reconstruction_plate_id,
            reconstruction_time: self.reconstruction_time,
            reconstruct_handle: self.reconstruct_handle,
            reconstruction_tree_creator: self.reconstruction_tree_creator.clone(),
            sections,
            interior_sections,
            geometry,
        }
    }
}

#[derive(Debug)]
struct FoundSection {
    source: SectionSource,
    reverse_order: bool,
}

impl FoundSection {
    fn points(&self) -> Vec<PointOnSphere> {
        let mut points = self.source.points().to_vec();
        if self.reverse_order {
            points.reverse();
        }
        points
    }
}

fn section_parts(sections: &[FoundSection]) -> Vec<Vec<PointOnSphere>> {
    sections.iter().map(FoundSection::points).collect()
}

fn attach_sub_segments(
    sections: Vec<FoundSection>,
    sub_segments: Vec<Vec<PointOnSphere>>,
) -> Vec<ResolvedTopologicalSection> {
    sections
        .into_iter()
        .zip(sub_segments)
        .map(|(section, sub_segment)| ResolvedTopologicalSection {
            source: section.source,
            reverse_order: section.reverse_order,
            sub_segment,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineContext;
    use crate::layer_proxy::reconstruct::ReconstructLayerProxy;
    use crate::layer_proxy::reconstruction::ReconstructionLayerProxy;
    use crate::test_fixtures::polyline_feature;
    use std::collections::HashSet;
    use tecton_model::{FeatureType, TopologyDefinition};

    struct Fixture {
        context: EngineContext,
        reconstruction: Arc<ReconstructionLayerProxy>,
        sections: HashMap<FeatureId, Arc<ReconstructedFeatureGeometry>>,
    }

    fn fixture() -> Fixture {
        let context = EngineContext::default();
        let reconstruction = Arc::new(ReconstructionLayerProxy::new(&context));
        let regular = context.feature_store.create_feature_collection("regular");
        regular.add_feature(polyline_feature("west", 0, &[(0.0, 0.0), (10.0, 0.0)]));
        regular.add_feature(polyline_feature("north", 0, &[(10.0, 0.0), (10.0, 10.0)]));
        regular.add_feature(polyline_feature("east", 0, &[(10.0, 10.0), (0.0, 10.0)]));

        let layer = ReconstructLayerProxy::new(&context, reconstruction.clone());
        layer.add_reconstructable_feature_collection(regular);
        let sections = layer
            .get_reconstructed_feature_geometries(0.0.into())
            .items
            .iter()
            .map(|rfg| (rfg.feature_id().clone(), rfg.clone()))
            .collect();
        Fixture {
            context,
            reconstruction,
            sections,
        }
    }

    fn topology(id: &str, feature_type: FeatureType, sections: &[&str]) -> Feature {
        Feature::with_id(FeatureId::new(id), feature_type)
            .plate_id(0)
            .topology(TopologyDefinition {
                sections: sections
                    .iter()
                    .map(|id| TopologicalSectionRef::new(FeatureId::new(*id)))
                    .collect(),
                interior: Vec::new(),
            })
    }

    fn add_topologies(f: &Fixture, features: Vec<Feature>) -> Vec<TopologicalFeature> {
        let collection = f.context.feature_store.create_feature_collection("topologies");
        features
            .into_iter()
            .map(|feature| {
                let handle = collection.add_feature(feature);
                let snapshot = Arc::new(handle.read().clone());
                TopologicalFeature {
                    feature: handle.weak_ref(),
                    snapshot,
                }
            })
            .collect()
    }

    fn resolver<'a>(
        f: &'a Fixture,
        creator: &'a ReconstructionTreeCreator,
        lines: &'a HashMap<FeatureId, Arc<ResolvedTopologicalLine>>,
    ) -> TopologyResolver<'a> {
        TopologyResolver {
            geometry_service: f.context.geometry_service.as_ref(),
            feature_store: &f.context.feature_store,
            reconstruction_time: 0.0.into(),
            reconstruct_handle: ReconstructHandle::next(),
            reconstruction_tree_creator: creator,
            sections: &f.sections,
            lines,
        }
    }

    #[test]
    fn test_boundary_uses_resolved_line() {
        let f = fixture();
        let creator = f.reconstruction.reconstruction_tree_creator(None);
        let topologies = add_topologies(
            &f,
            vec![
                topology("line", FeatureType::TopologicalLine, &["north", "east"]),
                topology(
                    "plate",
                    FeatureType::TopologicalClosedPlateBoundary,
                    &["west", "line"],
                ),
            ],
        );

        let no_lines = HashMap::new();
        let lines = resolver(&f, &creator, &no_lines).resolve_lines(&topologies);
        assert_eq!(lines.topologies.len(), 1);
        let lines: HashMap<_, _> = lines
            .topologies
            .into_iter()
            .map(|line| (line.feature_id().clone(), line))
            .collect();

        let boundaries = resolver(&f, &creator, &lines).resolve_boundaries(&topologies);
        assert_eq!(boundaries.topologies.len(), 1);
        let boundary = &boundaries.topologies[0];
        assert_eq!(boundary.geometry().0.len(), 4);
        assert!(matches!(
            boundary.sections()[1].source,
            SectionSource::ResolvedLine(_)
        ));
        assert_eq!(boundary.sections().len(), 2);
    }

    #[test]
    fn test_dangling_sections_are_skipped() {
        let f = fixture();
        let creator = f.reconstruction.reconstruction_tree_creator(None);
        let topologies = add_topologies(
            &f,
            vec![
                topology("ghost", FeatureType::TopologicalLine, &["missing"]),
                topology("ok", FeatureType::TopologicalLine, &["west", "missing"]),
            ],
        );
        let no_lines = HashMap::new();
        let lines = resolver(&f, &creator, &no_lines).resolve_lines(&topologies);
        let ids: HashSet<_> = lines
            .topologies
            .iter()
            .map(|line| line.feature_id().as_str().to_string())
            .collect();
        assert_eq!(ids, HashSet::from(["ok".to_string()]));
        assert!(lines.rejected.is_empty());
    }

    #[test]
    fn test_backward_references_are_rejected() {
        let f = fixture();
        let creator = f.reconstruction.reconstruction_tree_creator(None);
        let topologies = add_topologies(
            &f,
            vec![
                topology("line", FeatureType::TopologicalLine, &["west", "plate"]),
                topology(
                    "plate",
                    FeatureType::TopologicalClosedPlateBoundary,
                    &["west", "north", "east"],
                ),
                topology(
                    "nested",
                    FeatureType::TopologicalClosedPlateBoundary,
                    &["plate"],
                ),
            ],
        );

        let no_lines = HashMap::new();
        let lines = resolver(&f, &creator, &no_lines).resolve_lines(&topologies);
        assert!(lines.topologies.is_empty());
        assert_eq!(
            lines.rejected,
            vec![TopologyReferenceError::LineReferencesTopology {
                topology: FeatureId::new("line"),
                section: FeatureId::new("plate"),
            }]
        );

        let boundaries = resolver(&f, &creator, &no_lines).resolve_boundaries(&topologies);
        assert_eq!(boundaries.topologies.len(), 1);
        assert_eq!(boundaries.topologies[0].feature_id().as_str(), "plate");
        assert_eq!(boundaries.rejected.len(), 1);
        assert_eq!(boundaries.rejected[0].topology().as_str(), "nested");
    }

    #[test]
    fn test_reversed_sections() {
        let f = fixture();
        let creator = f.reconstruction.reconstruction_tree_creator(None);
        let mut line = topology("line", FeatureType::TopologicalLine, &[]);
        line.topology = Some(TopologyDefinition {
            sections: vec![TopologicalSectionRef::reversed(FeatureId::new("west"))],
            interior: Vec::new(),
        });
        let topologies = add_topologies(&f, vec![line]);

        let no_lines = HashMap::new();
        let lines = resolver(&f, &creator, &no_lines).resolve_lines(&topologies);
        let points = &lines.topologies[0].geometry().0;
        assert!(points[0].is_close(&PointOnSphere::from_lat_lon(10.0, 0.0), 1e-9));
        assert!(lines.topologies[0].sections()[0].reverse_order);
    }

    #[test]
    fn test_network_meshes_interior() {
        let f = fixture();
        let creator = f.reconstruction.reconstruction_tree_creator(None);
        let mut network = topology(
            "network",
            FeatureType::TopologicalNetwork,
            &["west", "north", "east"],
        );
        if let Some(definition) = network.topology.as_mut() {
            definition.interior = vec![TopologicalSectionRef::new(FeatureId::new("west"))];
        }
        let topologies = add_topologies(&f, vec![network]);

        let no_lines = HashMap::new();
        let options = MeshingOptions {
            constrained: true,
            refine: false,
        };
        let networks = resolver(&f, &creator, &no_lines).resolve_networks(&topologies, &options);
        assert_eq!(networks.topologies.len(), 1);
        assert_eq!(networks.topologies[0].interior_sections().len(), 1);
        assert!(!networks.topologies[0].geometry().triangles.is_empty());
    }
}
