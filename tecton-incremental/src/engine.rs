//! Services shared by every layer proxy of one graph

use crate::config::EngineConfig;
use crate::rfg_index::ReconstructedGeometryIndex;
use std::sync::Arc;
use tecton_model::{DefaultGeometryService, FeatureStore, GeometryService};

/// Configuration and collaborators handed to each proxy at construction.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub feature_store: Arc<FeatureStore>,
    pub geometry_service: Arc<dyn GeometryService>,
    pub reconstructed_geometry_index: Arc<ReconstructedGeometryIndex>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        EngineContext {
            config: Arc::new(config),
            feature_store: Arc::new(FeatureStore::new()),
            geometry_service: Arc::new(DefaultGeometryService),
            reconstructed_geometry_index: Arc::new(ReconstructedGeometryIndex::new()),
        }
    }

    /// Replace the geometry service used for topological assembly.
    pub fn with_geometry_service(mut self, service: Arc<dyn GeometryService>) -> Self {
        self.geometry_service = service;
        self
    }

    pub fn with_feature_store(mut self, store: Arc<FeatureStore>) -> Self {
        self.feature_store = store;
        self
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
