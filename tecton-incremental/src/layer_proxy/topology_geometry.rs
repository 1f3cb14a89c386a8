//! Topology geometry resolver layer: topological lines and boundaries
//!
//! Lines are resolved from reconstructed sections alone, so the line path
//! only ever polls the reconstruction layer, the topological collections and
//! the section layers. Boundaries additionally pull resolved lines from other
//! geometry resolver layers through their `ResolvedLines` token, which never
//! polls another layer's resolved lines. That keeps pulls between mutually
//! connected resolver layers acyclic.

use super::input::InputLayerProxySequence;
use super::reconstruct::ReconstructLayerProxy;
use super::reconstruction::ReconstructionLayerProxy;
use super::topology_sections::TopologyLayerInputs;
use super::{
    subject_token_selector, ConstLayerProxyVisitor, InputLayer, LayerProxy, LayerProxyVisitor,
};
use crate::cache::{CacheStats, Insertion, KeyedCache};
use crate::engine::EngineContext;
use crate::error::TopologyReferenceError;
use crate::metrics::ProxyMetrics;
use crate::reconstructed::{ReconstructBatch, ReconstructHandle};
use crate::rfg_index::ReconstructedGeometryIndex;
use crate::topology::{
    ResolvedTopologicalBoundary, ResolvedTopologicalLine, TopologyResolution, TopologyResolver,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tecton_model::{FeatureCollectionHandle, FeatureStore, GeometryService, TopologyKind};
use tecton_types::{FeatureId, LayerProxyId, ReconstructionTime, SubjectToken};

subject_token_selector! {
    /// Subject tokens of a [`TopologyGeometryResolverLayerProxy`].
    pub enum TopologyGeometrySubjectToken {
        All => "TopologyGeometryResolverLayerProxy::get_subject_token",
        ResolvedLines =>
            "TopologyGeometryResolverLayerProxy::get_resolved_topological_lines_subject_token",
    }
}

const GEOMETRY_KINDS: &[TopologyKind] = &[TopologyKind::Line, TopologyKind::Boundary];

pub type ResolvedLineBatch = Arc<ReconstructBatch<Arc<ResolvedTopologicalLine>>>;
pub type ResolvedBoundaryBatch = Arc<ReconstructBatch<Arc<ResolvedTopologicalBoundary>>>;

#[derive(Debug)]
struct TopologyGeometryState {
    inputs: TopologyLayerInputs,
    resolved_line_layers: InputLayerProxySequence<TopologyGeometryResolverLayerProxy>,
    current_reconstruction_time: ReconstructionTime,
    lines: KeyedCache<ReconstructionTime, ResolvedLineBatch>,
    boundaries: KeyedCache<ReconstructionTime, ResolvedBoundaryBatch>,
    rejected: Vec<TopologyReferenceError>,
    subject_token: SubjectToken,
    resolved_lines_subject_token: SubjectToken,
}

impl TopologyGeometryState {
    fn record_rejected(&mut self, rejected: Vec<TopologyReferenceError>) {
        for error in rejected {
            if !self.rejected.contains(&error) {
                self.rejected.push(error);
            }
        }
    }
}

/// Resolves topological lines and closed plate boundaries.
#[derive(Debug)]
pub struct TopologyGeometryResolverLayerProxy {
    id: LayerProxyId,
    state: Mutex<TopologyGeometryState>,
    feature_store: Arc<FeatureStore>,
    geometry_service: Arc<dyn GeometryService>,
    index: Arc<ReconstructedGeometryIndex>,
    metrics: ProxyMetrics,
}

impl TopologyGeometryResolverLayerProxy {
    pub fn new(
        context: &EngineContext,
        reconstruction_layer: Arc<ReconstructionLayerProxy>,
    ) -> Self {
        let max_entries = context.config.topology.max_cached_resolutions;
        TopologyGeometryResolverLayerProxy {
            id: LayerProxyId::next(),
            state: Mutex::new(TopologyGeometryState {
                inputs: TopologyLayerInputs::new(GEOMETRY_KINDS, reconstruction_layer),
                resolved_line_layers: InputLayerProxySequence::new(),
                current_reconstruction_time: ReconstructionTime::PRESENT_DAY,
                lines: KeyedCache::new(max_entries),
                boundaries: KeyedCache::new(max_entries),
                rejected: Vec::new(),
                subject_token: SubjectToken::new(),
                resolved_lines_subject_token: SubjectToken::new(),
            }),
            feature_store: context.feature_store.clone(),
            geometry_service: context.geometry_service.clone(),
            index: context.reconstructed_geometry_index.clone(),
            metrics: ProxyMetrics::new("topology_geometry_resolver"),
        }
    }

    pub fn get_resolved_topological_lines(&self, time: ReconstructionTime) -> ResolvedLineBatch {
        let mut state = self.state.lock();
        self.check_line_inputs(&mut state);
        self.resolved_lines(&mut state, time)
    }

    pub fn get_current_resolved_topological_lines(&self) -> ResolvedLineBatch {
        let time = self.get_current_reconstruction_time();
        self.get_resolved_topological_lines(time)
    }

    pub fn get_resolved_topological_boundaries(
        &self,
        time: ReconstructionTime,
    ) -> ResolvedBoundaryBatch {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);

        if let Some(batch) = state.boundaries.get(&time) {
            self.metrics.record_hit();
            return batch;
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let mut lines: HashMap<FeatureId, Arc<ResolvedTopologicalLine>> = HashMap::new();
        for layer in state.resolved_line_layers.input_layer_proxies() {
            for line in &layer.get_resolved_topological_lines(time).items {
                lines.insert(line.feature_id().clone(), line.clone());
            }
        }
        // Lines of this layer shadow same-id lines from other layers.
        for line in &self.resolved_lines(&mut state, time).items {
            lines.insert(line.feature_id().clone(), line.clone());
        }

        let sections = state.inputs.gather_sections(&self.index, time);
        let features = state.inputs.features();
        let creator = state.inputs.reconstruction_tree_creator();
        let resolver = TopologyResolver {
            geometry_service: self.geometry_service.as_ref(),
            feature_store: &self.feature_store,
            reconstruction_time: time,
            reconstruct_handle: ReconstructHandle::next(),
            reconstruction_tree_creator: &creator,
            sections: &sections,
            lines: &lines,
        };
        let TopologyResolution {
            topologies,
            rejected,
        } = resolver.resolve_boundaries(features.iter());
        state.record_rejected(rejected);
        self.metrics.record_compute(started.elapsed());

        let batch = Arc::new(ReconstructBatch {
            reconstruct_handle: resolver.reconstruct_handle,
            items: topologies,
        });
        tracing::debug!(
            layer = %self.id,
            %time,
            boundaries = batch.len(),
            "resolved topological boundaries"
        );
        if state.boundaries.insert(time, batch.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        batch
    }

    pub fn get_current_resolved_topological_boundaries(&self) -> ResolvedBoundaryBatch {
        let time = self.get_current_reconstruction_time();
        self.get_resolved_topological_boundaries(time)
    }

    /// Ids of the sections referenced by this layer's lines, or by all of its
    /// topologies.
    pub fn get_topological_section_feature_ids(&self, lines_only: bool) -> HashSet<FeatureId> {
        let mut state = self.state.lock();
        self.check_line_inputs(&mut state);
        let kinds = if lines_only {
            &GEOMETRY_KINDS[..1]
        } else {
            GEOMETRY_KINDS
        };
        state.inputs.referenced_feature_ids(kinds)
    }

    /// Topologies rejected for referencing a disallowed topology type.
    pub fn get_topology_reference_errors(&self) -> Vec<TopologyReferenceError> {
        self.state.lock().rejected.clone()
    }

    /// Changes whenever this layer's resolved lines change.
    pub fn get_resolved_topological_lines_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_line_inputs(&mut state);
        state.resolved_lines_subject_token.clone()
    }

    pub fn get_current_reconstruction_time(&self) -> ReconstructionTime {
        self.state.lock().current_reconstruction_time
    }

    pub fn get_reconstruction_layer_proxy(&self) -> Arc<ReconstructionLayerProxy> {
        self.state.lock().inputs.reconstruction_layer().clone()
    }

    pub fn set_current_reconstruction_layer_proxy(&self, proxy: Arc<ReconstructionLayerProxy>) {
        let mut state = self.state.lock();
        if state.inputs.set_reconstruction_layer(proxy) {
            self.reset(&mut state);
        }
    }

    pub fn get_topological_feature_collections(&self) -> Vec<FeatureCollectionHandle> {
        self.state.lock().inputs.feature_collections()
    }

    pub fn add_topological_feature_collection(&self, collection: FeatureCollectionHandle) {
        self.state.lock().inputs.add_feature_collection(collection);
    }

    pub fn remove_topological_feature_collection(&self, collection: &FeatureCollectionHandle) {
        self.state.lock().inputs.remove_feature_collection(collection);
    }

    pub fn modified_topological_feature_collection(&self, _collection: &FeatureCollectionHandle) {
        self.state.lock().inputs.modified_feature_collection();
    }

    pub fn get_topological_section_layer_proxies(&self) -> Vec<Arc<ReconstructLayerProxy>> {
        self.state.lock().inputs.section_layers()
    }

    pub fn set_topological_section_layer_proxies(
        &self,
        layers: impl IntoIterator<Item = Arc<ReconstructLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        if state.inputs.set_section_layers(layers) {
            self.reset(&mut state);
        }
    }

    pub fn get_resolved_line_layer_proxies(&self) -> Vec<Arc<TopologyGeometryResolverLayerProxy>> {
        self.state
            .lock()
            .resolved_line_layers
            .input_layer_proxies()
            .cloned()
            .collect()
    }

    /// Other geometry resolver layers whose lines boundaries may reference.
    /// This layer itself is skipped.
    pub fn set_resolved_line_layer_proxies(
        &self,
        layers: impl IntoIterator<Item = Arc<TopologyGeometryResolverLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        let changed = state.resolved_line_layers.set_input_layer_proxies_with_selector(
            layers
                .into_iter()
                .filter(|layer| layer.id != self.id)
                .map(|layer| (layer, TopologyGeometrySubjectToken::ResolvedLines)),
        );
        if changed {
            self.invalidate_boundaries(&mut state);
        }
    }

    pub fn set_max_num_resolutions_in_cache(&self, max_entries: usize) {
        let mut state = self.state.lock();
        state.lines.resize(max_entries);
        state.boundaries.resize(max_entries);
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.lock().boundaries.stats()
    }

    fn resolved_lines(
        &self,
        state: &mut TopologyGeometryState,
        time: ReconstructionTime,
    ) -> ResolvedLineBatch {
        if let Some(batch) = state.lines.get(&time) {
            return batch;
        }

        let started = Instant::now();
        let sections = state.inputs.gather_sections(&self.index, time);
        let features = state.inputs.features();
        let creator = state.inputs.reconstruction_tree_creator();
        let no_lines = HashMap::new();
        let resolver = TopologyResolver {
            geometry_service: self.geometry_service.as_ref(),
            feature_store: &self.feature_store,
            reconstruction_time: time,
            reconstruct_handle: ReconstructHandle::next(),
            reconstruction_tree_creator: &creator,
            sections: &sections,
            lines: &no_lines,
        };
        let TopologyResolution {
            topologies,
            rejected,
        } = resolver.resolve_lines(features.iter());
        state.record_rejected(rejected);
        self.metrics.record_compute(started.elapsed());

        let batch = Arc::new(ReconstructBatch {
            reconstruct_handle: resolver.reconstruct_handle,
            items: topologies,
        });
        tracing::debug!(layer = %self.id, %time, lines = batch.len(), "resolved topological lines");
        if state.lines.insert(time, batch.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        batch
    }

    /// Poll the inputs lines depend on.
    fn check_line_inputs(&self, state: &mut TopologyGeometryState) {
        if state.inputs.check() {
            self.reset(state);
        }
    }

    /// Poll every input.
    fn check_input_layer_proxies(&self, state: &mut TopologyGeometryState) {
        self.check_line_inputs(state);
        if !state.resolved_line_layers.is_up_to_date() {
            state.resolved_line_layers.set_up_to_date();
            self.invalidate_boundaries(state);
        }
    }

    fn reset(&self, state: &mut TopologyGeometryState) {
        state.lines.clear();
        state.boundaries.clear();
        state.rejected.clear();
        state.resolved_lines_subject_token.invalidate();
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
        tracing::debug!(layer = %self.id, "discarded resolved lines and boundaries");
    }

    fn invalidate_boundaries(&self, state: &mut TopologyGeometryState) {
        state.boundaries.clear();
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
        tracing::debug!(layer = %self.id, "discarded resolved boundaries");
    }
}

impl LayerProxy for TopologyGeometryResolverLayerProxy {
    fn layer_proxy_id(&self) -> LayerProxyId {
        self.id
    }

    fn get_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.subject_token.clone()
    }

    fn accept_visitor(self: Arc<Self>, visitor: &mut dyn LayerProxyVisitor) {
        visitor.visit_topology_geometry_resolver_layer_proxy(self);
    }

    fn accept_const_visitor(&self, visitor: &mut dyn ConstLayerProxyVisitor) {
        visitor.visit_topology_geometry_resolver_layer_proxy(self);
    }

    fn set_current_reconstruction_time(&self, time: ReconstructionTime) {
        self.state.lock().current_reconstruction_time = time;
    }
}

impl InputLayer for TopologyGeometryResolverLayerProxy {
    type Selector = TopologyGeometrySubjectToken;

    fn subject_token(&self, selector: TopologyGeometrySubjectToken) -> SubjectToken {
        match selector {
            TopologyGeometrySubjectToken::All => self.get_subject_token(),
            TopologyGeometrySubjectToken::ResolvedLines => {
                self.get_resolved_topological_lines_subject_token()
            }
        }
    }
}
