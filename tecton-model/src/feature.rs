//! Features and their properties
//!
//! The engine treats features as read-only inputs apart from plate-id
//! assignment, which goes through [`crate::store::FeatureCollectionHandle`].

use crate::geometry::GeometryOnSphere;
use crate::raster::RasterProperty;
use crate::rotation::TotalReconstructionSequence;
use serde::{Deserialize, Serialize};
use std::fmt;
use tecton_types::{FeatureId, PlateId, TimePeriod};

/// Classification of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureType {
    Coastline,
    Isochron,
    MidOceanRidge,
    SubductionZone,
    StaticPolygon,
    Unclassified,
    Flowline,
    MotionPath,
    VirtualGeomagneticPole,
    TotalReconstructionSequence,
    TopologicalLine,
    TopologicalClosedPlateBoundary,
    TopologicalNetwork,
    Raster,
}

impl FeatureType {
    pub fn is_topological(&self) -> bool {
        self.topology_kind().is_some()
    }

    pub fn topology_kind(&self) -> Option<TopologyKind> {
        match self {
            FeatureType::TopologicalLine => Some(TopologyKind::Line),
            FeatureType::TopologicalClosedPlateBoundary => Some(TopologyKind::Boundary),
            FeatureType::TopologicalNetwork => Some(TopologyKind::Network),
            _ => None,
        }
    }
}

/// The three kinds of topological feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyKind {
    Line,
    Boundary,
    Network,
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyKind::Line => write!(f, "line"),
            TopologyKind::Boundary => write!(f, "boundary"),
            TopologyKind::Network => write!(f, "network"),
        }
    }
}

/// How a plate-id reconstructed feature should be moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReconstructionMethodHint {
    #[default]
    ByPlateId,
    HalfStageRotation,
}

/// A named geometry-valued property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryProperty {
    pub name: String,
    pub geometry: GeometryOnSphere,
}

impl GeometryProperty {
    pub fn new(name: impl Into<String>, geometry: GeometryOnSphere) -> Self {
        GeometryProperty {
            name: name.into(),
            geometry,
        }
    }
}

/// Reference, by feature id, from a topology to one of its sections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologicalSectionRef {
    pub feature_id: FeatureId,
    #[serde(default)]
    pub reverse_order: bool,
}

impl TopologicalSectionRef {
    pub fn new(feature_id: FeatureId) -> Self {
        TopologicalSectionRef {
            feature_id,
            reverse_order: false,
        }
    }

    pub fn reversed(feature_id: FeatureId) -> Self {
        TopologicalSectionRef {
            feature_id,
            reverse_order: true,
        }
    }
}

/// Ordered sections of a topological line, boundary or network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyDefinition {
    pub sections: Vec<TopologicalSectionRef>,
    /// Interior constraints; only meaningful for networks.
    #[serde(default)]
    pub interior: Vec<TopologicalSectionRef>,
}

impl TopologyDefinition {
    pub fn referenced_feature_ids(&self) -> impl Iterator<Item = &FeatureId> {
        self.sections
            .iter()
            .chain(self.interior.iter())
            .map(|section| &section.feature_id)
    }
}

/// Name of a scalar quantity carried per point of a coverage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScalarType(pub String);

impl ScalarType {
    pub fn new(name: impl Into<String>) -> Self {
        ScalarType(name.into())
    }

    pub fn crustal_thickness() -> Self {
        ScalarType::new("CrustalThickness")
    }

    pub fn crustal_stretching_factor() -> Self {
        ScalarType::new("CrustalStretchingFactor")
    }

    pub fn crustal_thinning_factor() -> Self {
        ScalarType::new("CrustalThinningFactor")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-point scalar values attached to one geometry property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarCoverage {
    /// Index into [`Feature::geometries`].
    pub geometry_index: usize,
    pub scalar_type: ScalarType,
    pub values: Vec<f64>,
}

/// An opaque bag of properties identified by a [`FeatureId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub feature_type: FeatureType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub valid_time: TimePeriod,
    #[serde(default)]
    pub reconstruction_plate_id: Option<PlateId>,
    /// Right plate for half-stage rotations and flowlines.
    #[serde(default)]
    pub conjugate_plate_id: Option<PlateId>,
    /// Reference plate for motion paths.
    #[serde(default)]
    pub relative_plate_id: Option<PlateId>,
    #[serde(default)]
    pub reconstruction_method: ReconstructionMethodHint,
    #[serde(default)]
    pub geometries: Vec<GeometryProperty>,
    /// Sample times for flowlines and motion paths.
    #[serde(default)]
    pub times: Vec<f64>,
    #[serde(default)]
    pub topology: Option<TopologyDefinition>,
    #[serde(default)]
    pub rotation_sequence: Option<TotalReconstructionSequence>,
    #[serde(default)]
    pub scalar_coverages: Vec<ScalarCoverage>,
    #[serde(default)]
    pub raster: Option<RasterProperty>,
    /// Average age of the samples behind a virtual geomagnetic pole.
    #[serde(default)]
    pub average_sample_age: Option<f64>,
}

impl Feature {
    /// A feature with a freshly generated id.
    pub fn new(feature_type: FeatureType) -> Self {
        Self::with_id(FeatureId::generate(), feature_type)
    }

    pub fn with_id(id: FeatureId, feature_type: FeatureType) -> Self {
        Feature {
            id,
            feature_type,
            name: String::new(),
            valid_time: TimePeriod::always(),
            reconstruction_plate_id: None,
            conjugate_plate_id: None,
            relative_plate_id: None,
            reconstruction_method: ReconstructionMethodHint::ByPlateId,
            geometries: Vec::new(),
            times: Vec::new(),
            topology: None,
            rotation_sequence: None,
            scalar_coverages: Vec::new(),
            raster: None,
            average_sample_age: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn valid_between(mut self, begin: f64, end: f64) -> Self {
        self.valid_time = TimePeriod::new(begin, end);
        self
    }

    pub fn plate_id(mut self, plate_id: u64) -> Self {
        self.reconstruction_plate_id = Some(PlateId(plate_id));
        self
    }

    pub fn conjugate_plate_id(mut self, plate_id: u64) -> Self {
        self.conjugate_plate_id = Some(PlateId(plate_id));
        self
    }

    pub fn relative_plate_id(mut self, plate_id: u64) -> Self {
        self.relative_plate_id = Some(PlateId(plate_id));
        self
    }

    pub fn method(mut self, method: ReconstructionMethodHint) -> Self {
        self.reconstruction_method = method;
        self
    }

    pub fn geometry(mut self, name: impl Into<String>, geometry: GeometryOnSphere) -> Self {
        self.geometries.push(GeometryProperty::new(name, geometry));
        self
    }

    pub fn sample_times(mut self, times: Vec<f64>) -> Self {
        self.times = times;
        self
    }

    pub fn topology(mut self, definition: TopologyDefinition) -> Self {
        self.topology = Some(definition);
        self
    }

    pub fn rotation_sequence(mut self, sequence: TotalReconstructionSequence) -> Self {
        self.rotation_sequence = Some(sequence);
        self
    }

    pub fn scalar_coverage(
        mut self,
        geometry_index: usize,
        scalar_type: ScalarType,
        values: Vec<f64>,
    ) -> Self {
        self.scalar_coverages.push(ScalarCoverage {
            geometry_index,
            scalar_type,
            values,
        });
        self
    }

    pub fn raster(mut self, raster: RasterProperty) -> Self {
        self.raster = Some(raster);
        self
    }

    pub fn average_sample_age(mut self, age: f64) -> Self {
        self.average_sample_age = Some(age);
        self
    }

    pub fn is_topological(&self) -> bool {
        self.feature_type.is_topological()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PointOnSphere;

    #[test]
    fn test_builder_sets_properties() {
        let feature = Feature::new(FeatureType::Coastline)
            .named("Australia")
            .plate_id(801)
            .valid_between(600.0, 0.0)
            .geometry(
                "center",
                GeometryOnSphere::Point(PointOnSphere::from_lat_lon(-25.0, 135.0)),
            );

        assert_eq!(feature.reconstruction_plate_id, Some(PlateId(801)));
        assert_eq!(feature.geometries.len(), 1);
        assert!(feature.valid_time.contains(100.0.into()));
        assert!(!feature.is_topological());
    }

    #[test]
    fn test_topology_kinds() {
        assert_eq!(
            FeatureType::TopologicalLine.topology_kind(),
            Some(TopologyKind::Line)
        );
        assert!(FeatureType::TopologicalNetwork.is_topological());
        assert!(!FeatureType::Flowline.is_topological());
    }

    #[test]
    fn test_referenced_ids_include_interior() {
        let a = FeatureId::new("a");
        let b = FeatureId::new("b");
        let definition = TopologyDefinition {
            sections: vec![TopologicalSectionRef::new(a.clone())],
            interior: vec![TopologicalSectionRef::new(b.clone())],
        };
        let ids: Vec<_> = definition.referenced_feature_ids().cloned().collect();
        assert_eq!(ids, vec![a, b]);
    }
}
