//! Reconstruct methods
//!
//! Which method moves a feature through time is decided once per feature by
//! [`ReconstructMethodRegistry::reconstruct_method_type`]. The set of methods
//! is closed, so dispatch goes through a static table rather than trait
//! objects.

use crate::layer_proxy::reconstruction::ReconstructionTreeCreator;
use serde::{Deserialize, Serialize};
use std::fmt;
use tecton_model::{
    Feature, FeatureType, FiniteRotation, GeometryOnSphere, PointOnSphere, ReconstructionMethodHint,
    ReconstructionTree,
};
use tecton_types::{PlateId, ReconstructionTime};

/// The closed set of ways a feature can be reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReconstructMethod {
    ByPlateId,
    HalfStageRotation,
    Flowline,
    MotionPath,
    Vgp,
}

impl ReconstructMethod {
    pub fn name(self) -> &'static str {
        self.entry().name
    }

    fn entry(self) -> &'static MethodEntry {
        match self {
            ReconstructMethod::Flowline => &METHOD_TABLE[0],
            ReconstructMethod::MotionPath => &METHOD_TABLE[1],
            ReconstructMethod::Vgp => &METHOD_TABLE[2],
            ReconstructMethod::HalfStageRotation => &METHOD_TABLE[3],
            ReconstructMethod::ByPlateId => &METHOD_TABLE[4],
        }
    }

    /// Whether `feature` yields geometries at `time` under `params`.
    pub fn is_active(
        self,
        feature: &Feature,
        time: ReconstructionTime,
        params: &ReconstructParams,
    ) -> bool {
        (self.entry().is_active)(feature, time, params)
    }

    /// Reconstruct every geometry property of `feature` to `time`.
    pub fn reconstruct(
        self,
        feature: &Feature,
        time: ReconstructionTime,
        context: &ReconstructMethodContext,
    ) -> Vec<MethodOutput> {
        (self.entry().reconstruct)(feature, time, context)
    }
}

impl fmt::Display for ReconstructMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When virtual geomagnetic poles are visible.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VgpVisibility {
    All,
    /// Within `vgp_delta_time` of the pole's average sample age.
    #[default]
    DeltaTimeAroundAge,
    TimeWindow { begin: f64, end: f64 },
}

/// Parameters shared by every reconstruct method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructParams {
    #[serde(default)]
    pub reconstruct_by_plate_id_outside_active_time_period: bool,

    #[serde(default)]
    pub vgp_visibility: VgpVisibility,

    #[serde(default = "default_vgp_delta_time")]
    pub vgp_delta_time: f64,
}

fn default_vgp_delta_time() -> f64 {
    5.0
}

impl Default for ReconstructParams {
    fn default() -> Self {
        ReconstructParams {
            reconstruct_by_plate_id_outside_active_time_period: false,
            vgp_visibility: VgpVisibility::default(),
            vgp_delta_time: default_vgp_delta_time(),
        }
    }
}

/// What a method needs besides the feature: trees and parameters.
#[derive(Debug, Clone)]
pub struct ReconstructMethodContext {
    pub reconstruction_tree_creator: ReconstructionTreeCreator,
    pub reconstruct_params: ReconstructParams,
}

impl ReconstructMethodContext {
    pub fn new(
        reconstruction_tree_creator: ReconstructionTreeCreator,
        reconstruct_params: ReconstructParams,
    ) -> Self {
        ReconstructMethodContext {
            reconstruction_tree_creator,
            reconstruct_params,
        }
    }
}

/// One reconstructed geometry produced by a method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodOutput {
    /// Index of the source geometry property within the feature.
    pub property_index: usize,
    pub geometry: GeometryOnSphere,
    pub plate_id: Option<PlateId>,
    pub rotation: Option<FiniteRotation>,
}

struct MethodEntry {
    method: ReconstructMethod,
    name: &'static str,
    can_reconstruct: fn(&Feature) -> bool,
    is_active: fn(&Feature, ReconstructionTime, &ReconstructParams) -> bool,
    reconstruct: fn(&Feature, ReconstructionTime, &ReconstructMethodContext) -> Vec<MethodOutput>,
}

/// In order of precedence: the first method that can reconstruct a feature
/// is the one assigned to it.
static METHOD_TABLE: [MethodEntry; 5] = [
    MethodEntry {
        method: ReconstructMethod::Flowline,
        name: "flowline",
        can_reconstruct: can_reconstruct_flowline,
        is_active: is_active_in_valid_time,
        reconstruct: reconstruct_flowline,
    },
    MethodEntry {
        method: ReconstructMethod::MotionPath,
        name: "motion-path",
        can_reconstruct: can_reconstruct_motion_path,
        is_active: is_active_in_valid_time,
        reconstruct: reconstruct_motion_path,
    },
    MethodEntry {
        method: ReconstructMethod::Vgp,
        name: "virtual-geomagnetic-pole",
        can_reconstruct: can_reconstruct_vgp,
        is_active: is_vgp_visible,
        reconstruct: reconstruct_by_plate_id,
    },
    MethodEntry {
        method: ReconstructMethod::HalfStageRotation,
        name: "half-stage-rotation",
        can_reconstruct: can_reconstruct_half_stage,
        is_active: is_active_by_plate_id,
        reconstruct: reconstruct_half_stage,
    },
    MethodEntry {
        method: ReconstructMethod::ByPlateId,
        name: "by-plate-id",
        can_reconstruct: can_reconstruct_by_plate_id,
        is_active: is_active_by_plate_id,
        reconstruct: reconstruct_by_plate_id,
    },
];

/// Assigns reconstruct methods to features.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconstructMethodRegistry;

impl ReconstructMethodRegistry {
    pub fn new() -> Self {
        ReconstructMethodRegistry
    }

    /// The method that applies to `feature`, or `None` for features that are
    /// not reconstructed directly (topologies, rotations, rasters).
    pub fn reconstruct_method_type(&self, feature: &Feature) -> Option<ReconstructMethod> {
        METHOD_TABLE
            .iter()
            .find(|entry| (entry.can_reconstruct)(feature))
            .map(|entry| entry.method)
    }

    pub fn can_reconstruct(&self, feature: &Feature) -> bool {
        self.reconstruct_method_type(feature).is_some()
    }
}

fn is_regular(feature: &Feature) -> bool {
    !feature.is_topological()
        && !matches!(
            feature.feature_type,
            FeatureType::TotalReconstructionSequence | FeatureType::Raster
        )
        && !feature.geometries.is_empty()
}

fn can_reconstruct_by_plate_id(feature: &Feature) -> bool {
    is_regular(feature)
}

fn can_reconstruct_half_stage(feature: &Feature) -> bool {
    is_regular(feature)
        && feature.reconstruction_method == ReconstructionMethodHint::HalfStageRotation
        && feature.conjugate_plate_id.is_some()
}

fn can_reconstruct_flowline(feature: &Feature) -> bool {
    feature.feature_type == FeatureType::Flowline
        && is_regular(feature)
        && feature.conjugate_plate_id.is_some()
        && !feature.times.is_empty()
}

fn can_reconstruct_motion_path(feature: &Feature) -> bool {
    feature.feature_type == FeatureType::MotionPath
        && is_regular(feature)
        && !feature.times.is_empty()
}

fn can_reconstruct_vgp(feature: &Feature) -> bool {
    feature.feature_type == FeatureType::VirtualGeomagneticPole && is_regular(feature)
}

fn is_active_in_valid_time(
    feature: &Feature,
    time: ReconstructionTime,
    _params: &ReconstructParams,
) -> bool {
    feature.valid_time.contains(time)
}

fn is_active_by_plate_id(
    feature: &Feature,
    time: ReconstructionTime,
    params: &ReconstructParams,
) -> bool {
    params.reconstruct_by_plate_id_outside_active_time_period || feature.valid_time.contains(time)
}

fn is_vgp_visible(feature: &Feature, time: ReconstructionTime, params: &ReconstructParams) -> bool {
    let t = time.value();
    match params.vgp_visibility {
        VgpVisibility::All => true,
        VgpVisibility::TimeWindow { begin, end } => t <= begin && t >= end,
        VgpVisibility::DeltaTimeAroundAge => match feature.average_sample_age {
            Some(age) => (t - age).abs() <= params.vgp_delta_time,
            None => feature.valid_time.contains(time),
        },
    }
}

fn plate_or_anchor(plate: Option<PlateId>) -> PlateId {
    plate.unwrap_or_default()
}

fn reconstruct_by_plate_id(
    feature: &Feature,
    time: ReconstructionTime,
    context: &ReconstructMethodContext,
) -> Vec<MethodOutput> {
    let tree = context
        .reconstruction_tree_creator
        .get_reconstruction_tree(time);
    let plate = plate_or_anchor(feature.reconstruction_plate_id);
    let (rotation, _) = tree.composed_absolute_rotation(plate);

    feature
        .geometries
        .iter()
        .enumerate()
        .map(|(property_index, property)| MethodOutput {
            property_index,
            geometry: rotation.rotate_geometry(&property.geometry),
            plate_id: Some(plate),
            rotation: Some(rotation),
        })
        .collect()
}

/// Rotation halfway between the left and right plates, relative to the anchor.
fn half_stage_rotation(tree: &ReconstructionTree, left: PlateId, right: PlateId) -> FiniteRotation {
    let (left_rotation, _) = tree.composed_absolute_rotation(left);
    let (right_rotation, _) = tree.composed_absolute_rotation(right);
    let right_relative_to_left = left_rotation.reverse().compose(&right_rotation);
    let half = FiniteRotation::interpolate(
        &FiniteRotation::identity(),
        &right_relative_to_left,
        0.5,
    );
    left_rotation.compose(&half)
}

fn reconstruct_half_stage(
    feature: &Feature,
    time: ReconstructionTime,
    context: &ReconstructMethodContext,
) -> Vec<MethodOutput> {
    let tree = context
        .reconstruction_tree_creator
        .get_reconstruction_tree(time);
    let left = plate_or_anchor(feature.reconstruction_plate_id);
    let right = plate_or_anchor(feature.conjugate_plate_id);
    let rotation = half_stage_rotation(&tree, left, right);

    feature
        .geometries
        .iter()
        .enumerate()
        .map(|(property_index, property)| MethodOutput {
            property_index,
            geometry: rotation.rotate_geometry(&property.geometry),
            plate_id: Some(left),
            rotation: Some(rotation),
        })
        .collect()
}

/// Sample times at or older than `time`, youngest first.
fn older_sample_times(feature: &Feature, time: ReconstructionTime) -> Vec<ReconstructionTime> {
    let mut times: Vec<f64> = feature
        .times
        .iter()
        .copied()
        .filter(|&sample| ReconstructionTime::new(sample) > time)
        .collect();
    times.sort_by(f64::total_cmp);
    times.dedup_by(|a, b| ReconstructionTime::new(*a) == ReconstructionTime::new(*b));
    times.into_iter().map(ReconstructionTime::new).collect()
}

fn path_geometry(points: Vec<PointOnSphere>) -> GeometryOnSphere {
    match points.as_slice() {
        [single] => GeometryOnSphere::Point(*single),
        _ => GeometryOnSphere::Polyline(points),
    }
}

/// Seed points at the ridge, followed by where the material that was at the
/// ridge at each older sample time has been carried by the left plate.
fn reconstruct_flowline(
    feature: &Feature,
    time: ReconstructionTime,
    context: &ReconstructMethodContext,
) -> Vec<MethodOutput> {
    let creator = &context.reconstruction_tree_creator;
    let left = plate_or_anchor(feature.reconstruction_plate_id);
    let right = plate_or_anchor(feature.conjugate_plate_id);

    let tree = creator.get_reconstruction_tree(time);
    let seed_rotation = half_stage_rotation(&tree, left, right);
    let (left_now, _) = tree.composed_absolute_rotation(left);

    let older: Vec<(FiniteRotation, FiniteRotation)> = older_sample_times(feature, time)
        .into_iter()
        .map(|sample| {
            let sample_tree = creator.get_reconstruction_tree(sample);
            let ridge = half_stage_rotation(&sample_tree, left, right);
            let (left_then, _) = sample_tree.composed_absolute_rotation(left);
            (ridge, left_now.compose(&left_then.reverse()))
        })
        .collect();

    let mut outputs = Vec::new();
    for (property_index, property) in feature.geometries.iter().enumerate() {
        for seed in property.geometry.points() {
            let mut points = vec![seed_rotation.rotate_point(seed)];
            points.extend(
                older
                    .iter()
                    .map(|(ridge, carry)| carry.rotate_point(&ridge.rotate_point(seed))),
            );
            outputs.push(MethodOutput {
                property_index,
                geometry: path_geometry(points),
                plate_id: Some(left),
                rotation: None,
            });
        }
    }
    outputs
}

/// Positions of each seed point at `time` and at every older sample time,
/// relative to the reference plate positioned at `time`.
fn reconstruct_motion_path(
    feature: &Feature,
    time: ReconstructionTime,
    context: &ReconstructMethodContext,
) -> Vec<MethodOutput> {
    let creator = &context.reconstruction_tree_creator;
    let moving = plate_or_anchor(feature.reconstruction_plate_id);
    let relative = plate_or_anchor(feature.relative_plate_id);

    let tree = creator.get_reconstruction_tree(time);
    let (reference, _) = tree.composed_absolute_rotation(relative);

    let rotations: Vec<FiniteRotation> = std::iter::once(tree.relative_rotation(moving, relative))
        .chain(older_sample_times(feature, time).into_iter().map(|sample| {
            creator
                .get_reconstruction_tree(sample)
                .relative_rotation(moving, relative)
        }))
        .map(|motion| reference.compose(&motion))
        .collect();

    let mut outputs = Vec::new();
    for (property_index, property) in feature.geometries.iter().enumerate() {
        for seed in property.geometry.points() {
            let points = rotations
                .iter()
                .map(|rotation| rotation.rotate_point(seed))
                .collect();
            outputs.push(MethodOutput {
                property_index,
                geometry: path_geometry(points),
                plate_id: Some(moving),
                rotation: None,
            });
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tecton_model::{TopologyDefinition, TotalReconstructionSequence};

    fn point() -> GeometryOnSphere {
        GeometryOnSphere::Point(PointOnSphere::from_lat_lon(0.0, 0.0))
    }

    #[test]
    fn test_method_assignment() {
        let registry = ReconstructMethodRegistry::new();

        let coastline = Feature::new(FeatureType::Coastline)
            .plate_id(801)
            .geometry("center", point());
        assert_eq!(
            registry.reconstruct_method_type(&coastline),
            Some(ReconstructMethod::ByPlateId)
        );

        let isochron = Feature::new(FeatureType::Isochron)
            .plate_id(801)
            .conjugate_plate_id(501)
            .method(ReconstructionMethodHint::HalfStageRotation)
            .geometry("center", point());
        assert_eq!(
            registry.reconstruct_method_type(&isochron),
            Some(ReconstructMethod::HalfStageRotation)
        );

        let flowline = Feature::new(FeatureType::Flowline)
            .plate_id(801)
            .conjugate_plate_id(501)
            .sample_times(vec![0.0, 10.0])
            .geometry("seed", point());
        assert_eq!(
            registry.reconstruct_method_type(&flowline),
            Some(ReconstructMethod::Flowline)
        );

        let vgp = Feature::new(FeatureType::VirtualGeomagneticPole).geometry("pole", point());
        assert_eq!(
            registry.reconstruct_method_type(&vgp),
            Some(ReconstructMethod::Vgp)
        );
    }

    #[test]
    fn test_non_reconstructable_features() {
        let registry = ReconstructMethodRegistry::new();

        let topology = Feature::new(FeatureType::TopologicalClosedPlateBoundary)
            .topology(TopologyDefinition::default());
        let rotation = Feature::new(FeatureType::TotalReconstructionSequence).rotation_sequence(
            TotalReconstructionSequence::new(PlateId(0), PlateId(1), Vec::new()),
        );
        let empty = Feature::new(FeatureType::Coastline);

        assert!(!registry.can_reconstruct(&topology));
        assert!(!registry.can_reconstruct(&rotation));
        assert!(!registry.can_reconstruct(&empty));
    }

    #[test]
    fn test_flowline_without_conjugate_falls_back_to_plate_id() {
        let registry = ReconstructMethodRegistry::new();
        let flowline = Feature::new(FeatureType::Flowline)
            .plate_id(801)
            .sample_times(vec![10.0])
            .geometry("seed", point());
        assert_eq!(
            registry.reconstruct_method_type(&flowline),
            Some(ReconstructMethod::ByPlateId)
        );
    }

    #[test]
    fn test_activity() {
        let params = ReconstructParams::default();
        let feature = Feature::new(FeatureType::Coastline)
            .valid_between(100.0, 50.0)
            .geometry("center", point());

        assert!(ReconstructMethod::ByPlateId.is_active(&feature, 75.0.into(), &params));
        assert!(!ReconstructMethod::ByPlateId.is_active(&feature, 10.0.into(), &params));

        let outside = ReconstructParams {
            reconstruct_by_plate_id_outside_active_time_period: true,
            ..ReconstructParams::default()
        };
        assert!(ReconstructMethod::ByPlateId.is_active(&feature, 10.0.into(), &outside));
        assert!(!ReconstructMethod::Flowline.is_active(&feature, 10.0.into(), &outside));
    }

    #[test]
    fn test_vgp_visibility() {
        let vgp = Feature::new(FeatureType::VirtualGeomagneticPole)
            .average_sample_age(40.0)
            .geometry("pole", point());
        let params = ReconstructParams::default();

        assert!(ReconstructMethod::Vgp.is_active(&vgp, 43.0.into(), &params));
        assert!(!ReconstructMethod::Vgp.is_active(&vgp, 50.0.into(), &params));

        let window = ReconstructParams {
            vgp_visibility: VgpVisibility::TimeWindow {
                begin: 60.0,
                end: 45.0,
            },
            ..ReconstructParams::default()
        };
        assert!(ReconstructMethod::Vgp.is_active(&vgp, 50.0.into(), &window));
    }

    #[test]
    fn test_older_sample_times() {
        let feature =
            Feature::new(FeatureType::MotionPath).sample_times(vec![30.0, 0.0, 10.0, 10.0]);
        let times: Vec<f64> = older_sample_times(&feature, 5.0.into())
            .into_iter()
            .map(ReconstructionTime::value)
            .collect();
        assert_eq!(times, vec![10.0, 30.0]);
    }
}
