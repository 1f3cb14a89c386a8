//! Reconstruct layer: regular features to reconstructed geometries
//!
//! Results are cached per reconstruction time under the layer's current
//! reconstruct parameters. Changing the parameters, the reconstruction layer,
//! or the feature collections discards every cached result and bumps the
//! layer's subject token; requesting a new time only adds a cache entry.

use super::input::{FeatureCollectionInputs, InputLayerProxy};
use super::reconstruction::ReconstructionLayerProxy;
use super::{
    subject_token_selector, ConstLayerProxyVisitor, InputLayer, LayerProxy, LayerProxyVisitor,
};
use crate::cache::{CacheStats, Insertion, KeyedCache};
use crate::engine::EngineContext;
use crate::metrics::ProxyMetrics;
use crate::reconstruct_context::{
    GeometryPropertyHandle, ReconstructContext, ReconstructContextState, ReconstructableFeature,
};
use crate::reconstruct_method::{ReconstructMethodContext, ReconstructParams};
use crate::reconstructed::{
    ReconstructBatch, ReconstructedFeature, ReconstructedFeatureGeometry,
    ReconstructedFeatureTimeSpan, Reconstruction,
};
use crate::rfg_index::ReconstructedGeometryIndex;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tecton_model::{FeatureCollectionHandle, GeometryOnSphere, GeometryService, PolygonMesh};
use tecton_types::{FeatureId, LayerProxyId, ReconstructionTime, SubjectToken, TimeSpanRange};

subject_token_selector! {
    /// Subject tokens of a [`ReconstructLayerProxy`].
    pub enum ReconstructSubjectToken {
        All => "ReconstructLayerProxy::get_subject_token",
        ReconstructableFeatureCollections =>
            "ReconstructLayerProxy::get_reconstructable_feature_collections_subject_token",
    }
}

type RfgBatch = Arc<ReconstructBatch<Arc<ReconstructedFeatureGeometry>>>;
type TimeCache<T> = KeyedCache<ReconstructionTime, Arc<ReconstructBatch<T>>>;

#[derive(Debug)]
struct ReconstructCaches {
    geometries: TimeCache<Arc<ReconstructedFeatureGeometry>>,
    reconstructions: TimeCache<Reconstruction>,
    features: TimeCache<ReconstructedFeature>,
    time_span: Option<(TimeSpanRange, Arc<ReconstructBatch<ReconstructedFeatureTimeSpan>>)>,
    /// Union of every id set requested as topological sections.
    section_ids: HashSet<FeatureId>,
    sections: TimeCache<Arc<ReconstructedFeatureGeometry>>,
    polygon_meshes: Option<Arc<Vec<Option<PolygonMesh>>>>,
}

impl ReconstructCaches {
    fn new(max_entries: usize) -> Self {
        ReconstructCaches {
            geometries: KeyedCache::new(max_entries),
            reconstructions: KeyedCache::new(max_entries),
            features: KeyedCache::new(max_entries),
            time_span: None,
            section_ids: HashSet::new(),
            sections: KeyedCache::new(max_entries),
            polygon_meshes: None,
        }
    }

    /// Drop every reconstructed result; returns whether anything was cached.
    fn clear_reconstructions(&mut self) -> bool {
        let mut discarded = self.geometries.clear();
        discarded |= self.reconstructions.clear();
        discarded |= self.features.clear();
        discarded |= self.sections.clear();
        discarded |= self.time_span.take().is_some();
        discarded
    }

    fn clear_all(&mut self) -> bool {
        let mut discarded = self.clear_reconstructions();
        discarded |= self.polygon_meshes.take().is_some();
        self.section_ids.clear();
        discarded
    }

    fn resize(&mut self, max_entries: usize) {
        self.geometries.resize(max_entries);
        self.reconstructions.resize(max_entries);
        self.features.resize(max_entries);
        self.sections.resize(max_entries);
    }
}

#[derive(Debug)]
struct ReconstructState {
    reconstruction_layer: InputLayerProxy<ReconstructionLayerProxy>,
    feature_collections: FeatureCollectionInputs,
    features_modified: bool,
    context: ReconstructContext,
    context_state: Option<Arc<ReconstructContextState>>,
    current_reconstruction_time: ReconstructionTime,
    current_reconstruct_params: ReconstructParams,
    caches: ReconstructCaches,
    subject_token: SubjectToken,
    feature_collections_subject_token: SubjectToken,
}

/// Reconstructs the regular features of its feature collections.
#[derive(Debug)]
pub struct ReconstructLayerProxy {
    id: LayerProxyId,
    state: Mutex<ReconstructState>,
    geometry_service: Arc<dyn GeometryService>,
    index: Arc<ReconstructedGeometryIndex>,
    metrics: ProxyMetrics,
}

impl ReconstructLayerProxy {
    pub fn new(
        context: &EngineContext,
        reconstruction_layer: Arc<ReconstructionLayerProxy>,
    ) -> Self {
        let config = &context.config.reconstruct;
        ReconstructLayerProxy {
            id: LayerProxyId::next(),
            state: Mutex::new(ReconstructState {
                reconstruction_layer: InputLayerProxy::new(reconstruction_layer),
                feature_collections: FeatureCollectionInputs::new(),
                features_modified: true,
                context: ReconstructContext::new(context.reconstructed_geometry_index.clone()),
                context_state: None,
                current_reconstruction_time: ReconstructionTime::PRESENT_DAY,
                current_reconstruct_params: config.default_params.clone(),
                caches: ReconstructCaches::new(config.max_cached_reconstructions),
                subject_token: SubjectToken::new(),
                feature_collections_subject_token: SubjectToken::new(),
            }),
            geometry_service: context.geometry_service.clone(),
            index: context.reconstructed_geometry_index.clone(),
            metrics: ProxyMetrics::new("reconstruct"),
        }
    }

    pub fn get_reconstructed_feature_geometries(&self, time: ReconstructionTime) -> RfgBatch {
        self.get_or_reconstruct(
            time,
            |caches| &mut caches.geometries,
            |context, state| context.get_reconstructed_feature_geometries(state, time),
        )
    }

    pub fn get_current_reconstructed_feature_geometries(&self) -> RfgBatch {
        self.get_reconstructed_feature_geometries(self.get_current_reconstruction_time())
    }

    pub fn get_reconstructions(
        &self,
        time: ReconstructionTime,
    ) -> Arc<ReconstructBatch<Reconstruction>> {
        self.get_or_reconstruct(
            time,
            |caches| &mut caches.reconstructions,
            |context, state| context.get_reconstructions(state, time),
        )
    }

    pub fn get_reconstructed_features(
        &self,
        time: ReconstructionTime,
    ) -> Arc<ReconstructBatch<ReconstructedFeature>> {
        self.get_or_reconstruct(
            time,
            |caches| &mut caches.features,
            |context, state| context.get_reconstructed_features(state, time),
        )
    }

    /// Per-feature reconstructions at every slot of `time_span`.
    ///
    /// Only the most recently requested span is cached.
    pub fn get_reconstructed_feature_time_span(
        &self,
        time_span: &TimeSpanRange,
    ) -> Arc<ReconstructBatch<ReconstructedFeatureTimeSpan>> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);

        if let Some((cached_span, batch)) = &state.caches.time_span {
            if cached_span == time_span {
                self.metrics.record_hit();
                return batch.clone();
            }
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let context_state = self.context_state(&mut state);
        let batch = Arc::new(
            state
                .context
                .get_reconstructed_feature_time_spans(&context_state, time_span),
        );
        self.metrics.record_time_span(started.elapsed());
        tracing::debug!(
            layer = %self.id,
            slots = time_span.num_time_slots(),
            features = batch.len(),
            "reconstructed time span"
        );
        if state.caches.time_span.replace((*time_span, batch.clone())).is_some() {
            self.evicted();
        }
        batch
    }

    /// Reconstructed geometries of only those features in `feature_ids`.
    ///
    /// The cached id set grows to the union of every requested set, so the
    /// result may include features outside `feature_ids`.
    pub fn get_reconstructed_topological_sections(
        &self,
        feature_ids: &HashSet<FeatureId>,
        time: ReconstructionTime,
    ) -> RfgBatch {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);

        if !feature_ids.is_subset(&state.caches.section_ids) {
            state.caches.section_ids.extend(feature_ids.iter().cloned());
            state.caches.sections.clear();
            tracing::debug!(
                layer = %self.id,
                sections = state.caches.section_ids.len(),
                "grew topological section id set"
            );
        }

        if let Some(batch) = state.caches.sections.get(&time) {
            self.metrics.record_hit();
            return batch;
        }

        self.metrics.record_miss();
        let context_state = self.context_state(&mut state);
        let batch = Arc::new(state.context.get_reconstructed_topological_sections(
            &state.caches.section_ids,
            &context_state,
            time,
        ));
        if state.caches.sections.insert(time, batch.clone()) == Insertion::Evicted {
            self.evicted();
        }
        batch
    }

    /// Present-day geometries indexed by geometry property handle.
    pub fn get_present_day_feature_geometries(&self) -> Arc<Vec<GeometryOnSphere>> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.context.get_present_day_feature_geometries()
    }

    /// A mesh per geometry property handle; `None` where the geometry is not a
    /// polygon or cannot be meshed.
    pub fn get_present_day_polygon_meshes(&self) -> Arc<Vec<Option<PolygonMesh>>> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        if let Some(meshes) = &state.caches.polygon_meshes {
            return meshes.clone();
        }

        let meshes: Vec<Option<PolygonMesh>> = state
            .context
            .get_present_day_feature_geometries()
            .iter()
            .map(|geometry| match geometry {
                GeometryOnSphere::Polygon(points) => {
                    self.geometry_service.build_polygon_mesh(points)
                }
                _ => None,
            })
            .collect();
        let meshes = Arc::new(meshes);
        state.caches.polygon_meshes = Some(meshes.clone());
        meshes
    }

    pub fn get_geometry_property_handle(
        &self,
        feature_id: &FeatureId,
        property_index: usize,
    ) -> Option<GeometryPropertyHandle> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state
            .context
            .get_geometry_property_handle(feature_id, property_index)
    }

    pub fn get_reconstructable_features(&self) -> Vec<ReconstructableFeature> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.context.reconstructable_features().to_vec()
    }

    pub fn get_reconstructable_feature_ids(&self) -> HashSet<FeatureId> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state
            .context
            .reconstructable_features()
            .iter()
            .map(|feature| feature.feature_id().clone())
            .collect()
    }

    /// Whether any of `feature_ids` is one of this layer's reconstructable
    /// features.
    pub fn contains_any_feature(&self, feature_ids: &HashSet<FeatureId>) -> bool {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state
            .context
            .reconstructable_features()
            .iter()
            .any(|feature| feature_ids.contains(feature.feature_id()))
    }

    pub fn get_reconstructable_feature_collections(&self) -> Vec<FeatureCollectionHandle> {
        self.state.lock().feature_collections.collections()
    }

    /// Changes whenever the set of reconstructable features changes.
    pub fn get_reconstructable_feature_collections_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.feature_collections_subject_token.clone()
    }

    pub fn get_current_reconstruction_time(&self) -> ReconstructionTime {
        self.state.lock().current_reconstruction_time
    }

    pub fn get_current_reconstruct_params(&self) -> ReconstructParams {
        self.state.lock().current_reconstruct_params.clone()
    }

    pub fn get_reconstruction_layer_proxy(&self) -> Arc<ReconstructionLayerProxy> {
        self.state
            .lock()
            .reconstruction_layer
            .input_layer_proxy()
            .clone()
    }

    pub fn set_current_reconstruct_params(&self, params: ReconstructParams) {
        let mut state = self.state.lock();
        if state.current_reconstruct_params == params {
            return;
        }
        state.current_reconstruct_params = params;
        self.invalidate_reconstructions(&mut state);
    }

    pub fn set_current_reconstruction_layer_proxy(&self, proxy: Arc<ReconstructionLayerProxy>) {
        let mut state = self.state.lock();
        if Arc::ptr_eq(state.reconstruction_layer.input_layer_proxy(), &proxy) {
            return;
        }
        state.reconstruction_layer = InputLayerProxy::new(proxy);
        self.invalidate_reconstructions(&mut state);
    }

    pub fn add_reconstructable_feature_collection(&self, collection: FeatureCollectionHandle) {
        let mut state = self.state.lock();
        if state.feature_collections.add(collection) {
            state.features_modified = true;
        }
    }

    pub fn remove_reconstructable_feature_collection(&self, collection: &FeatureCollectionHandle) {
        let mut state = self.state.lock();
        if state.feature_collections.remove(collection) {
            state.features_modified = true;
        }
    }

    /// Notify that features of a collection were edited.
    pub fn modified_reconstructable_feature_collection(
        &self,
        _collection: &FeatureCollectionHandle,
    ) {
        self.state.lock().features_modified = true;
    }

    pub fn set_max_num_reconstructions_in_cache(&self, max_entries: usize) {
        self.state.lock().caches.resize(max_entries);
        self.metrics.record_pruned(self.index.prune());
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.lock().caches.geometries.stats()
    }

    fn get_or_reconstruct<T>(
        &self,
        time: ReconstructionTime,
        select: fn(&mut ReconstructCaches) -> &mut TimeCache<T>,
        reconstruct: impl FnOnce(
            &ReconstructContext,
            &ReconstructContextState,
        ) -> ReconstructBatch<T>,
    ) -> Arc<ReconstructBatch<T>> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);

        if let Some(batch) = select(&mut state.caches).get(&time) {
            self.metrics.record_hit();
            tracing::trace!(layer = %self.id, %time, "reconstruct cache hit");
            return batch;
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let context_state = self.context_state(&mut state);
        let batch = Arc::new(reconstruct(&state.context, context_state.as_ref()));
        self.metrics.record_compute(started.elapsed());
        tracing::debug!(
            layer = %self.id,
            %time,
            handle = %batch.reconstruct_handle,
            items = batch.len(),
            "reconstructed features"
        );

        if select(&mut state.caches).insert(time, batch.clone()) == Insertion::Evicted {
            self.evicted();
        }
        batch
    }

    /// An evicted batch may have released the last reference to its
    /// geometries, so their index entries can go too.
    fn evicted(&self) {
        self.metrics.record_eviction();
        self.metrics.record_pruned(self.index.prune());
    }

    fn context_state(&self, state: &mut ReconstructState) -> Arc<ReconstructContextState> {
        if let Some(context_state) = &state.context_state {
            return context_state.clone();
        }
        let reconstruction_layer = state.reconstruction_layer.input_layer_proxy();
        let creator = reconstruction_layer
            .reconstruction_tree_creator(Some(reconstruction_layer.get_current_anchor_plate_id()));
        let context_state = state.context.create_context_state(ReconstructMethodContext::new(
            creator,
            state.current_reconstruct_params.clone(),
        ));
        state.context_state = Some(context_state.clone());
        context_state
    }

    /// Poll every input, discarding cached results derived from stale ones.
    fn check_input_layer_proxies(&self, state: &mut ReconstructState) {
        if state.features_modified || !state.feature_collections.is_up_to_date() {
            let collections = state.feature_collections.collections();
            state.context.set_feature_collections(&collections);
            state.feature_collections.set_up_to_date();
            state.features_modified = false;
            state.context_state = None;
            state.caches.clear_all();
            state.feature_collections_subject_token.invalidate();
            state.subject_token.invalidate();
            self.metrics.record_invalidation();
            self.metrics.record_pruned(self.index.prune());
            tracing::debug!(layer = %self.id, "reconstructable features changed");
        }

        if !state.reconstruction_layer.is_up_to_date() {
            state.reconstruction_layer.set_up_to_date();
            self.invalidate_reconstructions(state);
        }
    }

    fn invalidate_reconstructions(&self, state: &mut ReconstructState) {
        state.context_state = None;
        if state.caches.clear_reconstructions() {
            self.metrics.record_pruned(self.index.prune());
            tracing::debug!(layer = %self.id, "discarded cached reconstructions");
        }
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
    }
}

impl LayerProxy for ReconstructLayerProxy {
    fn layer_proxy_id(&self) -> LayerProxyId {
        self.id
    }

    fn get_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.subject_token.clone()
    }

    fn accept_visitor(self: Arc<Self>, visitor: &mut dyn LayerProxyVisitor) {
        visitor.visit_reconstruct_layer_proxy(self);
    }

    fn accept_const_visitor(&self, visitor: &mut dyn ConstLayerProxyVisitor) {
        visitor.visit_reconstruct_layer_proxy(self);
    }

    fn set_current_reconstruction_time(&self, time: ReconstructionTime) {
        self.state.lock().current_reconstruction_time = time;
    }
}

impl InputLayer for ReconstructLayerProxy {
    type Selector = ReconstructSubjectToken;

    fn subject_token(&self, selector: ReconstructSubjectToken) -> SubjectToken {
        match selector {
            ReconstructSubjectToken::All => self.get_subject_token(),
            ReconstructSubjectToken::ReconstructableFeatureCollections => {
                self.get_reconstructable_feature_collections_subject_token()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_fixtures::{
        point_feature, polygon_feature, polyline_feature, rotation_feature, CountingGeometryService,
    };
    use tecton_model::{PointOnSphere, ReconstructionTree};
    use tecton_types::PlateId;

    struct Fixture {
        context: EngineContext,
        reconstruction: Arc<ReconstructionLayerProxy>,
        rotations: FeatureCollectionHandle,
        features: FeatureCollectionHandle,
        layer: Arc<ReconstructLayerProxy>,
    }

    fn fixture_with(context: EngineContext) -> Fixture {
        let reconstruction = Arc::new(ReconstructionLayerProxy::new(&context));
        let rotations = context.feature_store.create_feature_collection("rotations");
        rotations.add_feature(rotation_feature(0, 801, 30.0));
        reconstruction.add_rotation_feature_collection(rotations.clone());

        let features = context.feature_store.create_feature_collection("coastlines");
        features.add_feature(point_feature("a", 801, 0.0, 0.0));
        features.add_feature(point_feature("b", 0, 10.0, 10.0));

        let layer = Arc::new(ReconstructLayerProxy::new(&context, reconstruction.clone()));
        layer.add_reconstructable_feature_collection(features.clone());
        Fixture {
            context,
            reconstruction,
            rotations,
            features,
            layer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(EngineContext::default())
    }

    #[test]
    fn test_same_time_returns_cached_batch() {
        let f = fixture();
        let first = f.layer.get_reconstructed_feature_geometries(50.0.into());
        let token = f.layer.get_subject_token();
        let second = f.layer.get_reconstructed_feature_geometries(50.0.into());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.layer.get_subject_token(), token);
        assert_eq!(first.len(), 2);
        assert!(first
            .items
            .iter()
            .all(|rfg| rfg.reconstruct_handle() == first.reconstruct_handle));
    }

    #[test]
    fn test_evicted_batches_leave_the_index() {
        let f = fixture();
        f.layer.set_max_num_reconstructions_in_cache(2);
        for step in 0..200 {
            f.layer
                .get_reconstructed_feature_geometries(ReconstructionTime::from(step as f64 * 0.5));
        }
        let index = &f.context.reconstructed_geometry_index;
        // Two cached batches of two features each.
        assert_eq!(index.len(), 4);
        assert_eq!(f.layer.metrics().snapshot().evictions, 198);

        f.layer.set_max_num_reconstructions_in_cache(1);
        assert_eq!(index.len(), 2);
        assert_eq!(f.layer.metrics().snapshot().pruned_index_entries, 398);
    }

    #[test]
    fn test_new_time_does_not_bump_token() {
        let f = fixture();
        let at_50 = f.layer.get_reconstructed_feature_geometries(50.0.into());
        let token = f.layer.get_subject_token();
        let at_60 = f.layer.get_reconstructed_feature_geometries(60.0.into());

        assert_eq!(f.layer.get_subject_token(), token);
        assert!(at_60.reconstruct_handle > at_50.reconstruct_handle);
    }

    #[test]
    fn test_reconstructs_by_plate_id() {
        let f = fixture();
        let batch = f.layer.get_reconstructed_feature_geometries(100.0.into());
        let a = batch
            .items
            .iter()
            .find(|rfg| rfg.feature_id().as_str() == "a")
            .unwrap();
        assert_eq!(a.reconstruction_plate_id(), Some(PlateId(801)));
        let GeometryOnSphere::Point(point) = a.reconstructed_geometry() else {
            panic!("expected a point");
        };
        assert!(point.is_close(&PointOnSphere::from_lat_lon(0.0, 30.0), 1e-9));
    }

    #[test]
    fn test_feature_edit_bumps_both_tokens() {
        let f = fixture();
        let before = f.layer.get_reconstructed_feature_geometries(50.0.into());
        let token = f.layer.get_subject_token();
        let collections_token = f.layer.get_reconstructable_feature_collections_subject_token();

        f.features.add_feature(point_feature("c", 801, -10.0, 0.0));

        assert_ne!(f.layer.get_subject_token(), token);
        assert_ne!(
            f.layer.get_reconstructable_feature_collections_subject_token(),
            collections_token
        );
        let after = f.layer.get_reconstructed_feature_geometries(50.0.into());
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.len(), 3);
    }

    #[test]
    fn test_rotation_edit_keeps_feature_token() {
        let f = fixture();
        f.layer.get_reconstructed_feature_geometries(50.0.into());
        let token = f.layer.get_subject_token();
        let collections_token = f.layer.get_reconstructable_feature_collections_subject_token();

        f.rotations.add_feature(rotation_feature(801, 802, 5.0));

        assert_ne!(f.layer.get_subject_token(), token);
        assert_eq!(
            f.layer.get_reconstructable_feature_collections_subject_token(),
            collections_token
        );
    }

    #[test]
    fn test_params_change_discards_results() {
        let f = fixture();
        let before = f.layer.get_reconstructed_feature_geometries(50.0.into());
        let token = f.layer.get_subject_token();

        f.layer.set_current_reconstruct_params(ReconstructParams::default());
        assert_eq!(f.layer.get_subject_token(), token);

        f.layer.set_current_reconstruct_params(ReconstructParams {
            reconstruct_by_plate_id_outside_active_time_period: true,
            ..ReconstructParams::default()
        });
        assert_ne!(f.layer.get_subject_token(), token);
        let after = f.layer.get_reconstructed_feature_geometries(50.0.into());
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_inactive_features_contribute_nothing() {
        let f = fixture();
        f.features.add_feature(
            point_feature("young", 801, 5.0, 5.0).valid_between(20.0, 0.0),
        );
        let old = f.layer.get_reconstructed_feature_geometries(50.0.into());
        let young = f.layer.get_reconstructed_feature_geometries(10.0.into());
        assert_eq!(old.len(), 2);
        assert_eq!(young.len(), 3);
    }

    #[test]
    fn test_topological_sections_restricted_to_ids() {
        let f = fixture();
        let ids: HashSet<FeatureId> = [FeatureId::new("a")].into_iter().collect();
        let sections = f.layer.get_reconstructed_topological_sections(&ids, 50.0.into());
        assert_eq!(sections.len(), 1);
        assert_eq!(sections.items[0].feature_id().as_str(), "a");

        let again = f.layer.get_reconstructed_topological_sections(&ids, 50.0.into());
        assert!(Arc::ptr_eq(&sections, &again));

        let b: HashSet<FeatureId> = [FeatureId::new("b")].into_iter().collect();
        let union = f.layer.get_reconstructed_topological_sections(&b, 50.0.into());
        assert_eq!(union.len(), 2);
    }

    #[test]
    fn test_sections_are_found_through_the_index() {
        let f = fixture();
        let ids: HashSet<FeatureId> = [FeatureId::new("a")].into_iter().collect();
        let sections = f.layer.get_reconstructed_topological_sections(&ids, 50.0.into());

        let found = f
            .context
            .reconstructed_geometry_index
            .find(&FeatureId::new("a"), &[sections.reconstruct_handle]);
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &sections.items[0]));
    }

    #[test]
    fn test_geometry_property_handles_are_stable() {
        let f = fixture();
        let a = f.layer.get_geometry_property_handle(&FeatureId::new("a"), 0);
        let b = f.layer.get_geometry_property_handle(&FeatureId::new("b"), 0);
        f.layer.modified_reconstructable_feature_collection(&f.features);
        assert_eq!(f.layer.get_geometry_property_handle(&FeatureId::new("a"), 0), a);

        f.features.add_feature(point_feature("c", 801, 1.0, 1.0));
        assert_eq!(f.layer.get_geometry_property_handle(&FeatureId::new("a"), 0), a);
        assert_eq!(f.layer.get_geometry_property_handle(&FeatureId::new("b"), 0), b);
        assert_eq!(
            f.layer.get_geometry_property_handle(&FeatureId::new("c"), 0),
            Some(GeometryPropertyHandle(2))
        );
        assert_eq!(f.layer.get_present_day_feature_geometries().len(), 3);
    }

    #[test]
    fn test_polygon_meshes_align_with_handles() {
        let counting = Arc::new(CountingGeometryService::default());
        let f = fixture_with(EngineContext::default().with_geometry_service(counting.clone()));
        f.features.add_feature(polygon_feature(
            "plate",
            801,
            &[(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0)],
        ));
        f.features.add_feature(polygon_feature("sliver", 801, &[(0.0, 0.0), (1.0, 1.0)]));
        f.features.add_feature(polyline_feature("trench", 801, &[(0.0, 0.0), (5.0, 5.0)]));

        let meshes = f.layer.get_present_day_polygon_meshes();
        let handle = |id: &str| {
            f.layer
                .get_geometry_property_handle(&FeatureId::new(id), 0)
                .unwrap()
                .0
        };
        assert_eq!(meshes.len(), 5);
        assert!(meshes[handle("plate")].is_some());
        assert!(meshes[handle("sliver")].is_none());
        assert!(meshes[handle("trench")].is_none());
        assert!(meshes[handle("a")].is_none());

        f.layer.get_present_day_polygon_meshes();
        assert_eq!(counting.meshes(), 2);
    }

    #[test]
    fn test_time_span_is_cached_once() {
        let f = fixture();
        let span = TimeSpanRange::new(40.0, 0.0, 10.0);
        let first = f.layer.get_reconstructed_feature_time_span(&span);
        let second = f.layer.get_reconstructed_feature_time_span(&span);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
        assert!(first.items.iter().all(|feature| feature.time_slots.len() == 5));

        let snapshot = f.layer.metrics().snapshot();
        assert_eq!((snapshot.time_spans, snapshot.computes), (1, 0));
        assert_eq!(snapshot.hits, 1);
        drop((first, second));

        // A different span replaces the cached one and its index entries.
        f.layer
            .get_reconstructed_feature_time_span(&TimeSpanRange::new(20.0, 0.0, 10.0));
        let snapshot = f.layer.metrics().snapshot();
        assert_eq!(snapshot.time_spans, 2);
        assert_eq!(snapshot.evictions, 1);
        assert_eq!(snapshot.pruned_index_entries, 10);
    }

    #[test]
    fn test_reconstruction_cache_is_bounded() {
        let mut config = EngineConfig::default();
        config.reconstruct.max_cached_reconstructions = 2;
        let f = fixture_with(EngineContext::new(config));

        for time in [10.0, 20.0, 30.0] {
            f.layer.get_reconstructed_feature_geometries(time.into());
        }
        assert_eq!(f.layer.cache_stats().entries, 2);
        assert_eq!(f.layer.metrics().snapshot().evictions, 1);
    }

    #[test]
    fn test_anchor_change_reconstructs_relative_to_new_anchor() {
        let f = fixture();
        f.layer.get_reconstructed_feature_geometries(100.0.into());
        let token = f.layer.get_subject_token();

        f.reconstruction.set_current_anchor_plate_id(PlateId(801));
        assert_ne!(f.layer.get_subject_token(), token);

        let batch = f.layer.get_reconstructed_feature_geometries(100.0.into());
        let a = batch
            .items
            .iter()
            .find(|rfg| rfg.feature_id().as_str() == "a")
            .unwrap();
        let tree: Arc<ReconstructionTree> = a
            .reconstruction_tree_creator()
            .get_reconstruction_tree(100.0.into());
        assert_eq!(tree.anchor_plate_id(), PlateId(801));
        assert!(a.finite_rotation().unwrap().is_identity());
    }
}
