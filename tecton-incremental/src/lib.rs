//! Tecton Incremental Reconstruction Engine
//!
//! This crate provides the demand-driven layer-proxy graph that reconstructs
//! plate-tectonic features and resolves topological plate boundaries and
//! deforming networks at arbitrary reconstruction times.
//!
//! # Architecture
//!
//! The system is organized around **layer proxies** - cached nodes that
//! compute their output on request from their input proxies. Proxies never
//! push notifications. Each exposes subject tokens that downstream input
//! wrappers poll, so a stale input is discovered lazily on the next pull.
//!
//! ## Layer Pipeline
//!
//! The standard reconstruction pipeline:
//!
//! ```text
//! rotations → reconstruction trees → reconstructed geometries
//!           → resolved lines → resolved boundaries / networks
//!           → velocities, scalar coverages, rasters
//! ```
//!
//! Topological lines always resolve before the boundaries and networks that
//! reference them. Lines only ever use reconstructed regular features as
//! sections, which keeps the feature-id reference graph acyclic.
//!
//! ## Key Features
//!
//! - **Polling Invalidation**: subject/observer token pairs instead of callbacks
//! - **Bounded Caching**: per-time LRU caches in every proxy
//! - **Handle Ordering**: every reconstruct call stamps its output with a
//!   strictly increasing [`ReconstructHandle`]
//! - **Archive Records**: input wrappers save and load through [`scribe`]
//!
//! # Example
//!
//! ```rust,ignore
//! use tecton_incremental::ReconstructGraph;
//!
//! let mut graph = ReconstructGraph::default();
//! let rotations = graph.context().feature_store.create_feature_collection("rotations");
//! graph.default_reconstruction_layer().add_rotation_feature_collection(rotations);
//!
//! let coastlines = graph.add_reconstruct_layer(None);
//! graph.set_reconstruction_time(100.0.into());
//! let rfgs = coastlines.get_current_reconstructed_feature_geometries();
//! ```

#![warn(missing_debug_implementations)]

// Core modules
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;

// Reconstruction
pub mod reconstruct_context;
pub mod reconstruct_method;
pub mod reconstructed;
pub mod rfg_index;
pub mod topology;

// Layer graph
pub mod assign_plate_ids;
pub mod graph;
pub mod layer_proxy;
pub mod scribe;

#[cfg(test)]
mod test_fixtures;

// Re-export main types
pub use cache::{CacheStats, Insertion, KeyedCache};
pub use config::{ConfigError, EngineConfig};
pub use engine::EngineContext;
pub use error::{ScribeError, TopologyReferenceError};
pub use graph::ReconstructGraph;
pub use layer_proxy::{LayerProxy, LayerProxyHandle, LayerProxyVisitor};
pub use metrics::{MetricsSnapshot, ProxyEvent, ProxyMetrics};
pub use reconstructed::{ReconstructHandle, ReconstructedFeatureGeometry};
pub use scribe::{ScribeLoad, SCRIBE_VERSION};
pub use topology::{
    ResolvedTopologicalBoundary, ResolvedTopologicalLine, ResolvedTopologicalNetwork,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::EngineContext;
    pub use crate::graph::ReconstructGraph;
    pub use crate::layer_proxy::raster::RasterLayerProxy;
    pub use crate::layer_proxy::reconstruct::ReconstructLayerProxy;
    pub use crate::layer_proxy::reconstruction::ReconstructionLayerProxy;
    pub use crate::layer_proxy::scalar_coverage::ReconstructScalarCoverageLayerProxy;
    pub use crate::layer_proxy::topology_geometry::TopologyGeometryResolverLayerProxy;
    pub use crate::layer_proxy::topology_network::TopologyNetworkResolverLayerProxy;
    pub use crate::layer_proxy::velocity::VelocityFieldCalculatorLayerProxy;
    pub use crate::layer_proxy::LayerProxy;
    pub use tecton_types::{FeatureId, PlateId, ReconstructionTime};
}
