//! External collaborators of the tecton engine
//!
//! The engine consumes features, rotations and geometric assembly through the
//! narrow interfaces in this crate:
//!
//! - [`store`]: the versioned feature store with weak references, a global
//!   feature-id index and batched change notification
//! - [`rotation`] and [`reconstruction_tree`]: finite rotations composed into
//!   per-(time, anchor) rotation hierarchies
//! - [`service`]: the black-box geometry service used to assemble resolved
//!   topologies

pub mod feature;
pub mod geometry;
pub mod raster;
pub mod reconstruction_tree;
pub mod rotation;
pub mod service;
pub mod store;

pub use feature::{
    Feature, FeatureType, GeometryProperty, ReconstructionMethodHint, ScalarCoverage, ScalarType,
    TopologicalSectionRef, TopologyDefinition, TopologyKind,
};
pub use geometry::{GeometryKind, GeometryOnSphere, PointOnSphere};
pub use raster::{Georeferencing, ProxiedRaster, RasterProperty, RasterTimeSample};
pub use reconstruction_tree::{ReconstructionTree, ReconstructionTreeEdge};
pub use rotation::{FiniteRotation, TotalReconstructionPole, TotalReconstructionSequence};
pub use service::{
    AssembledTopology, DefaultGeometryService, GeometryService, MeshingOptions, NetworkMesh,
    PolygonMesh,
};
pub use store::{
    FeatureCollectionHandle, FeatureCollectionId, FeatureHandle, FeatureStore, NotificationGuard,
    WeakFeatureRef,
};
