//! Reconstructed feature geometries and reconstruct handles

use crate::layer_proxy::reconstruction::ReconstructionTreeCreator;
use crate::reconstruct_context::GeometryPropertyHandle;
use crate::reconstruct_method::ReconstructMethod;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tecton_model::{FiniteRotation, GeometryOnSphere, WeakFeatureRef};
use tecton_types::{FeatureId, PlateId, ReconstructionTime};

static NEXT_RECONSTRUCT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies the batch of results produced by one top-level reconstruct call.
///
/// Handles strictly increase across calls, giving consumers a total order to
/// tell fresh results from stale ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconstructHandle(u64);

impl ReconstructHandle {
    /// Allocate the next handle.
    pub fn next() -> Self {
        ReconstructHandle(NEXT_RECONSTRUCT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReconstructHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One feature's geometry property at one time under one reconstruction.
#[derive(Debug)]
pub struct ReconstructedFeatureGeometry {
    pub(crate) feature: WeakFeatureRef,
    pub(crate) property_index: usize,
    pub(crate) property_handle: GeometryPropertyHandle,
    pub(crate) geometry: GeometryOnSphere,
    pub(crate) reconstruction_time: ReconstructionTime,
    pub(crate) reconstruct_handle: ReconstructHandle,
    pub(crate) reconstruct_method: ReconstructMethod,
    pub(crate) reconstruction_plate_id: Option<PlateId>,
    pub(crate) finite_rotation: Option<FiniteRotation>,
    pub(crate) reconstruction_tree_creator: ReconstructionTreeCreator,
}

impl ReconstructedFeatureGeometry {
    pub fn feature_ref(&self) -> &WeakFeatureRef {
        &self.feature
    }

    pub fn feature_id(&self) -> &FeatureId {
        self.feature.feature_id()
    }

    /// Index of the geometry property within its feature.
    pub fn property_index(&self) -> usize {
        self.property_index
    }

    pub fn geometry_property_handle(&self) -> GeometryPropertyHandle {
        self.property_handle
    }

    pub fn reconstructed_geometry(&self) -> &GeometryOnSphere {
        &self.geometry
    }

    pub fn reconstruction_time(&self) -> ReconstructionTime {
        self.reconstruction_time
    }

    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    pub fn reconstruct_method(&self) -> ReconstructMethod {
        self.reconstruct_method
    }

    pub fn reconstruction_plate_id(&self) -> Option<PlateId> {
        self.reconstruction_plate_id
    }

    /// The rotation applied to the present-day geometry, when a single
    /// rotation describes the reconstruction.
    pub fn finite_rotation(&self) -> Option<&FiniteRotation> {
        self.finite_rotation.as_ref()
    }

    pub fn reconstruction_tree_creator(&self) -> &ReconstructionTreeCreator {
        &self.reconstruction_tree_creator
    }
}

/// A reconstructed geometry paired with the handle of its present-day geometry.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub geometry_property_handle: GeometryPropertyHandle,
    pub rfg: Arc<ReconstructedFeatureGeometry>,
}

/// All reconstructions of one feature at one time.
#[derive(Debug, Clone)]
pub struct ReconstructedFeature {
    pub feature: WeakFeatureRef,
    pub reconstructions: Vec<Reconstruction>,
}

/// Results for one slot of a time span.
#[derive(Debug, Clone)]
pub struct TimeSlotReconstruction<T> {
    pub time: ReconstructionTime,
    pub items: Vec<T>,
}

/// Reconstructions of one feature at every slot of a time span.
#[derive(Debug, Clone)]
pub struct ReconstructedFeatureTimeSpan {
    pub feature: WeakFeatureRef,
    /// One entry per time slot, oldest first; empty where inactive.
    pub time_slots: Vec<TimeSlotReconstruction<Reconstruction>>,
}

/// The output of one top-level reconstruct call.
#[derive(Debug, Clone)]
pub struct ReconstructBatch<T> {
    pub reconstruct_handle: ReconstructHandle,
    pub items: Vec<T>,
}

impl<T> ReconstructBatch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
