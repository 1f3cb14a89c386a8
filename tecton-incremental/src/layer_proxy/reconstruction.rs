//! Reconstruction layer: rotation feature collections to reconstruction trees

use super::input::FeatureCollectionInputs;
use super::{
    subject_token_selector, ConstLayerProxyVisitor, InputLayer, LayerProxy, LayerProxyVisitor,
};
use crate::cache::{CacheStats, Insertion, KeyedCache};
use crate::engine::EngineContext;
use crate::metrics::ProxyMetrics;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tecton_model::{FeatureCollectionHandle, ReconstructionTree, TotalReconstructionSequence};
use tecton_types::{LayerProxyId, PlateId, ReconstructionTime, SubjectToken};

subject_token_selector! {
    /// Subject tokens of a [`ReconstructionLayerProxy`].
    pub enum ReconstructionSubjectToken {
        All => "ReconstructionLayerProxy::get_subject_token",
    }
}

type TreeKey = (ReconstructionTime, PlateId);

#[derive(Debug)]
struct ReconstructionState {
    rotation_feature_collections: FeatureCollectionInputs,
    current_reconstruction_time: ReconstructionTime,
    current_anchor_plate_id: PlateId,
    trees: KeyedCache<TreeKey, Arc<ReconstructionTree>>,
    subject_token: SubjectToken,
}

/// Builds and caches reconstruction trees keyed by (time, anchor plate).
#[derive(Debug)]
pub struct ReconstructionLayerProxy {
    id: LayerProxyId,
    state: Mutex<ReconstructionState>,
    metrics: ProxyMetrics,
}

impl ReconstructionLayerProxy {
    pub fn new(context: &EngineContext) -> Self {
        let config = &context.config.reconstruction;
        ReconstructionLayerProxy {
            id: LayerProxyId::next(),
            state: Mutex::new(ReconstructionState {
                rotation_feature_collections: FeatureCollectionInputs::new(),
                current_reconstruction_time: ReconstructionTime::PRESENT_DAY,
                current_anchor_plate_id: config.default_anchor_plate_id,
                trees: KeyedCache::new(config.max_reconstruction_trees_in_cache),
                subject_token: SubjectToken::new(),
            }),
            metrics: ProxyMetrics::new("reconstruction"),
        }
    }

    /// The tree for (`time`, `anchor_plate_id`), built on first request.
    pub fn get_reconstruction_tree(
        &self,
        time: ReconstructionTime,
        anchor_plate_id: PlateId,
    ) -> Arc<ReconstructionTree> {
        let mut state = self.state.lock();
        self.check_input_collections(&mut state);

        let key = (time, anchor_plate_id);
        if let Some(tree) = state.trees.get(&key) {
            self.metrics.record_hit();
            tracing::trace!(
                layer = %self.id,
                %time,
                anchor = %anchor_plate_id,
                "reconstruction tree cache hit"
            );
            return tree;
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let sequences = rotation_sequences(&state.rotation_feature_collections.collections());
        let tree = Arc::new(ReconstructionTree::build(&sequences, time, anchor_plate_id));
        self.metrics.record_compute(started.elapsed());
        tracing::debug!(
            layer = %self.id,
            %time,
            anchor = %anchor_plate_id,
            edges = tree.num_edges(),
            "built reconstruction tree"
        );

        if state.trees.insert(key, tree.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        tree
    }

    /// The tree at the current time and anchor.
    pub fn get_current_reconstruction_tree(&self) -> Arc<ReconstructionTree> {
        let (time, anchor) = {
            let state = self.state.lock();
            (state.current_reconstruction_time, state.current_anchor_plate_id)
        };
        self.get_reconstruction_tree(time, anchor)
    }

    /// A handle that builds trees at any time relative to `anchor_plate_id`,
    /// or to the current anchor plate when `None`.
    pub fn reconstruction_tree_creator(
        self: &Arc<Self>,
        anchor_plate_id: Option<PlateId>,
    ) -> ReconstructionTreeCreator {
        ReconstructionTreeCreator {
            proxy: self.clone(),
            anchor_plate_id,
        }
    }

    pub fn get_current_reconstruction_time(&self) -> ReconstructionTime {
        self.state.lock().current_reconstruction_time
    }

    pub fn get_current_anchor_plate_id(&self) -> PlateId {
        self.state.lock().current_anchor_plate_id
    }

    /// Change the anchor plate of the current tree.
    ///
    /// Downstream layers reconstruct relative to the current anchor, so a
    /// different anchor is an output change.
    pub fn set_current_anchor_plate_id(&self, anchor_plate_id: PlateId) {
        let mut state = self.state.lock();
        if state.current_anchor_plate_id == anchor_plate_id {
            return;
        }
        state.current_anchor_plate_id = anchor_plate_id;
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
    }

    pub fn set_max_num_reconstruction_trees_in_cache(&self, max_num_trees: usize) {
        self.state.lock().trees.resize(max_num_trees);
    }

    pub fn get_rotation_feature_collections(&self) -> Vec<FeatureCollectionHandle> {
        self.state.lock().rotation_feature_collections.collections()
    }

    pub fn add_rotation_feature_collection(&self, collection: FeatureCollectionHandle) {
        let mut state = self.state.lock();
        if state.rotation_feature_collections.add(collection) {
            self.invalidate(&mut state);
        }
    }

    pub fn remove_rotation_feature_collection(&self, collection: &FeatureCollectionHandle) {
        let mut state = self.state.lock();
        if state.rotation_feature_collections.remove(collection) {
            self.invalidate(&mut state);
        }
    }

    /// Notify that a rotation collection was edited.
    pub fn modified_rotation_feature_collection(&self, _collection: &FeatureCollectionHandle) {
        let mut state = self.state.lock();
        self.invalidate(&mut state);
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.lock().trees.stats()
    }

    fn check_input_collections(&self, state: &mut ReconstructionState) {
        if !state.rotation_feature_collections.is_up_to_date() {
            self.invalidate(state);
        }
    }

    fn invalidate(&self, state: &mut ReconstructionState) {
        state.rotation_feature_collections.set_up_to_date();
        if state.trees.clear() {
            tracing::debug!(layer = %self.id, "rotations changed; cleared reconstruction trees");
        }
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
    }
}

fn rotation_sequences(collections: &[FeatureCollectionHandle]) -> Vec<TotalReconstructionSequence> {
    collections
        .iter()
        .flat_map(FeatureCollectionHandle::features)
        .filter_map(|feature| feature.read().rotation_sequence.clone())
        .collect()
}

impl LayerProxy for ReconstructionLayerProxy {
    fn layer_proxy_id(&self) -> LayerProxyId {
        self.id
    }

    fn get_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_collections(&mut state);
        state.subject_token.clone()
    }

    fn accept_visitor(self: Arc<Self>, visitor: &mut dyn LayerProxyVisitor) {
        visitor.visit_reconstruction_layer_proxy(self);
    }

    fn accept_const_visitor(&self, visitor: &mut dyn ConstLayerProxyVisitor) {
        visitor.visit_reconstruction_layer_proxy(self);
    }

    fn set_current_reconstruction_time(&self, time: ReconstructionTime) {
        self.state.lock().current_reconstruction_time = time;
    }
}

impl InputLayer for ReconstructionLayerProxy {
    type Selector = ReconstructionSubjectToken;

    fn subject_token(&self, selector: ReconstructionSubjectToken) -> SubjectToken {
        match selector {
            ReconstructionSubjectToken::All => self.get_subject_token(),
        }
    }
}

/// Creates reconstruction trees at arbitrary times for reconstruct methods
/// that need more than the tree at the reconstruction time.
#[derive(Clone)]
pub struct ReconstructionTreeCreator {
    proxy: Arc<ReconstructionLayerProxy>,
    anchor_plate_id: Option<PlateId>,
}

impl ReconstructionTreeCreator {
    pub fn get_reconstruction_tree(&self, time: ReconstructionTime) -> Arc<ReconstructionTree> {
        let anchor = self
            .anchor_plate_id
            .unwrap_or_else(|| self.proxy.get_current_anchor_plate_id());
        self.proxy.get_reconstruction_tree(time, anchor)
    }

    pub fn reconstruction_layer_proxy(&self) -> &Arc<ReconstructionLayerProxy> {
        &self.proxy
    }

    pub fn anchor_plate_id(&self) -> Option<PlateId> {
        self.anchor_plate_id
    }
}

impl fmt::Debug for ReconstructionTreeCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconstructionTreeCreator")
            .field("proxy", &self.proxy.id)
            .field("anchor_plate_id", &self.anchor_plate_id)
            .finish()
    }
}
