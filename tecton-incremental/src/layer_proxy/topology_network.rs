//! Topology network resolver layer: deforming networks
//!
//! Networks are resolved from reconstructed sections and resolved lines of
//! geometry resolver layers. Each parameter set needs its own resolution
//! pass, so per-time results are keyed by (time, params). A contiguous
//! history of networks can also be requested as one time span; that single
//! span is discarded wholesale on any relevant change.

use super::input::InputLayerProxySequence;
use super::reconstruct::ReconstructLayerProxy;
use super::reconstruction::ReconstructionLayerProxy;
use super::topology_geometry::{TopologyGeometryResolverLayerProxy, TopologyGeometrySubjectToken};
use super::topology_sections::TopologyLayerInputs;
use super::{
    subject_token_selector, ConstLayerProxyVisitor, InputLayer, LayerProxy, LayerProxyVisitor,
};
use crate::cache::{CacheStats, Insertion, KeyedCache};
use crate::engine::EngineContext;
use crate::error::TopologyReferenceError;
use crate::metrics::ProxyMetrics;
use crate::reconstructed::{ReconstructBatch, ReconstructHandle, TimeSlotReconstruction};
use crate::rfg_index::ReconstructedGeometryIndex;
use crate::topology::{ResolvedTopologicalLine, ResolvedTopologicalNetwork, TopologyResolver};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tecton_model::{
    FeatureCollectionHandle, FeatureStore, GeometryService, MeshingOptions, PointOnSphere,
    TopologyKind,
};
use tecton_types::{FeatureId, LayerProxyId, ReconstructionTime, SubjectToken, TimeSpanRange};

subject_token_selector! {
    /// Subject tokens of a [`TopologyNetworkResolverLayerProxy`].
    pub enum TopologyNetworkSubjectToken {
        All => "TopologyNetworkResolverLayerProxy::get_subject_token",
    }
}

/// How strain rates are sampled within a network triangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrainRateSmoothing {
    #[default]
    None,
    Barycentric,
    Natural,
}

/// Meshing and strain-rate settings of a network resolution pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyNetworkParams {
    /// Use interior sections as triangulation constraints.
    pub constrained_triangulation: bool,
    pub refine_triangulation: bool,
    pub strain_rate_smoothing: StrainRateSmoothing,
    /// Upper bound on the magnitude of the dilatation strain rate.
    pub strain_rate_clamping: Option<f64>,
}

impl TopologyNetworkParams {
    pub fn meshing_options(&self) -> MeshingOptions {
        MeshingOptions {
            constrained: self.constrained_triangulation,
            refine: self.refine_triangulation,
        }
    }

    /// Dilatation strain rate of `network` at `point`, clamped, or `None`
    /// outside the network.
    pub fn dilatation_strain_rate(
        &self,
        service: &dyn GeometryService,
        network: &ResolvedTopologicalNetwork,
        point: &PointOnSphere,
    ) -> Option<f64> {
        let rate = service.network_dilatation_strain_rate(network.geometry(), point)?;
        Some(match self.strain_rate_clamping {
            Some(max) => rate.clamp(-max.abs(), max.abs()),
            None => rate,
        })
    }

    fn clamping_bits(&self) -> Option<u64> {
        self.strain_rate_clamping.map(f64::to_bits)
    }
}

impl PartialEq for TopologyNetworkParams {
    fn eq(&self, other: &Self) -> bool {
        self.constrained_triangulation == other.constrained_triangulation
            && self.refine_triangulation == other.refine_triangulation
            && self.strain_rate_smoothing == other.strain_rate_smoothing
            && self.clamping_bits() == other.clamping_bits()
    }
}

impl Eq for TopologyNetworkParams {}

impl Hash for TopologyNetworkParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.constrained_triangulation.hash(state);
        self.refine_triangulation.hash(state);
        self.strain_rate_smoothing.hash(state);
        self.clamping_bits().hash(state);
    }
}

const NETWORK_KINDS: &[TopologyKind] = &[TopologyKind::Network];

pub type ResolvedNetworkBatch = Arc<ReconstructBatch<Arc<ResolvedTopologicalNetwork>>>;

/// Resolved networks at every slot of a time span.
#[derive(Debug)]
pub struct ResolvedNetworkTimeSpan {
    pub time_span: TimeSpanRange,
    pub params: TopologyNetworkParams,
    /// One entry per slot, oldest first.
    pub time_slots: Vec<TimeSlotReconstruction<Arc<ResolvedTopologicalNetwork>>>,
}

impl ResolvedNetworkTimeSpan {
    /// Networks at `time`, if it is one of the span's slots.
    pub fn networks_at(
        &self,
        time: ReconstructionTime,
    ) -> Option<&[Arc<ResolvedTopologicalNetwork>]> {
        let slot = self.time_span.time_slot(time)?;
        self.time_slots.get(slot).map(|slot| slot.items.as_slice())
    }
}

#[derive(Debug)]
struct TopologyNetworkState {
    inputs: TopologyLayerInputs,
    resolved_line_layers: InputLayerProxySequence<TopologyGeometryResolverLayerProxy>,
    current_reconstruction_time: ReconstructionTime,
    current_params: TopologyNetworkParams,
    networks: KeyedCache<(ReconstructionTime, TopologyNetworkParams), ResolvedNetworkBatch>,
    time_span: Option<Arc<ResolvedNetworkTimeSpan>>,
    rejected: Vec<TopologyReferenceError>,
    subject_token: SubjectToken,
}

/// Resolves topological networks.
#[derive(Debug)]
pub struct TopologyNetworkResolverLayerProxy {
    id: LayerProxyId,
    state: Mutex<TopologyNetworkState>,
    feature_store: Arc<FeatureStore>,
    geometry_service: Arc<dyn GeometryService>,
    index: Arc<ReconstructedGeometryIndex>,
    metrics: ProxyMetrics,
}

impl TopologyNetworkResolverLayerProxy {
    pub fn new(
        context: &EngineContext,
        reconstruction_layer: Arc<ReconstructionLayerProxy>,
    ) -> Self {
        let config = &context.config.topology;
        TopologyNetworkResolverLayerProxy {
            id: LayerProxyId::next(),
            state: Mutex::new(TopologyNetworkState {
                inputs: TopologyLayerInputs::new(NETWORK_KINDS, reconstruction_layer),
                resolved_line_layers: InputLayerProxySequence::new(),
                current_reconstruction_time: ReconstructionTime::PRESENT_DAY,
                current_params: config.default_network_params,
                networks: KeyedCache::new(config.max_cached_resolutions),
                time_span: None,
                rejected: Vec::new(),
                subject_token: SubjectToken::new(),
            }),
            feature_store: context.feature_store.clone(),
            geometry_service: context.geometry_service.clone(),
            index: context.reconstructed_geometry_index.clone(),
            metrics: ProxyMetrics::new("topology_network_resolver"),
        }
    }

    /// Networks at `time` under the current params.
    pub fn get_resolved_topological_networks(
        &self,
        time: ReconstructionTime,
    ) -> ResolvedNetworkBatch {
        let mut state = self.state.lock();
        let params = state.current_params;
        self.resolved_networks(&mut state, time, params)
    }

    pub fn get_resolved_topological_networks_with_params(
        &self,
        time: ReconstructionTime,
        params: TopologyNetworkParams,
    ) -> ResolvedNetworkBatch {
        let mut state = self.state.lock();
        self.resolved_networks(&mut state, time, params)
    }

    pub fn get_current_resolved_topological_networks(&self) -> ResolvedNetworkBatch {
        let mut state = self.state.lock();
        let (time, params) = (state.current_reconstruction_time, state.current_params);
        self.resolved_networks(&mut state, time, params)
    }

    /// Networks at every slot of `time_span` under the current params.
    ///
    /// Only the most recently requested span is cached.
    pub fn get_resolved_network_time_span(
        &self,
        time_span: &TimeSpanRange,
    ) -> Arc<ResolvedNetworkTimeSpan> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);

        let params = state.current_params;
        if let Some(cached) = &state.time_span {
            if cached.time_span == *time_span && cached.params == params {
                self.metrics.record_hit();
                return cached.clone();
            }
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let time_slots = time_span
            .time_slots()
            .map(|time| TimeSlotReconstruction {
                time,
                items: self.resolve(&mut state, time, params).items,
            })
            .collect();
        let span = Arc::new(ResolvedNetworkTimeSpan {
            time_span: *time_span,
            params,
            time_slots,
        });
        self.metrics.record_time_span(started.elapsed());
        tracing::debug!(
            layer = %self.id,
            slots = time_span.num_time_slots(),
            "resolved network time span"
        );
        state.time_span = Some(span.clone());
        span
    }

    pub fn get_current_topology_network_params(&self) -> TopologyNetworkParams {
        self.state.lock().current_params
    }

    /// Per-time results stay cached under their own params; the span does not.
    pub fn set_current_topology_network_params(&self, params: TopologyNetworkParams) {
        let mut state = self.state.lock();
        if state.current_params == params {
            return;
        }
        state.current_params = params;
        state.time_span = None;
        state.subject_token.invalidate();
        tracing::debug!(layer = %self.id, ?params, "network params changed");
    }

    pub fn get_topology_reference_errors(&self) -> Vec<TopologyReferenceError> {
        self.state.lock().rejected.clone()
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

    pub fn set_resolved_line_layer_proxies(
        &self,
        layers: impl IntoIterator<Item = Arc<TopologyGeometryResolverLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        let changed = state.resolved_line_layers.set_input_layer_proxies_with_selector(
            layers
                .into_iter()
                .map(|layer| (layer, TopologyGeometrySubjectToken::ResolvedLines)),
        );
        if changed {
            self.reset(&mut state);
        }
    }

    pub fn set_max_num_resolutions_in_cache(&self, max_entries: usize) {
        self.state.lock().networks.resize(max_entries);
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.lock().networks.stats()
    }

    fn resolved_networks(
        &self,
        state: &mut TopologyNetworkState,
        time: ReconstructionTime,
        params: TopologyNetworkParams,
    ) -> ResolvedNetworkBatch {
        self.check_input_layer_proxies(state);

        let key = (time, params);
        if let Some(batch) = state.networks.get(&key) {
            self.metrics.record_hit();
            tracing::trace!(layer = %self.id, %time, "network cache hit");
            return batch;
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let batch = Arc::new(self.resolve(state, time, params));
        self.metrics.record_compute(started.elapsed());
        tracing::debug!(
            layer = %self.id,
            %time,
            networks = batch.len(),
            "resolved topological networks"
        );
        if state.networks.insert(key, batch.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        batch
    }

    fn resolve(
        &self,
        state: &mut TopologyNetworkState,
        time: ReconstructionTime,
        params: TopologyNetworkParams,
    ) -> ReconstructBatch<Arc<ResolvedTopologicalNetwork>> {
        let mut lines: HashMap<FeatureId, Arc<ResolvedTopologicalLine>> = HashMap::new();
        for layer in state.resolved_line_layers.input_layer_proxies() {
            for line in &layer.get_resolved_topological_lines(time).items {
                lines.insert(line.feature_id().clone(), line.clone());
            }
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
        let resolution = resolver.resolve_networks(features.iter(), &params.meshing_options());
        for error in resolution.rejected {
            if !state.rejected.contains(&error) {
                state.rejected.push(error);
            }
        }
        ReconstructBatch {
            reconstruct_handle: resolver.reconstruct_handle,
            items: resolution.topologies,
        }
    }

    fn check_input_layer_proxies(&self, state: &mut TopologyNetworkState) {
        let mut stale = state.inputs.check();
        if !state.resolved_line_layers.is_up_to_date() {
            state.resolved_line_layers.set_up_to_date();
            stale = true;
        }
        if stale {
            self.reset(state);
        }
    }

    fn reset(&self, state: &mut TopologyNetworkState) {
        state.networks.clear();
        state.time_span = None;
        state.rejected.clear();
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
        tracing::debug!(layer = %self.id, "discarded resolved networks");
    }
}

impl LayerProxy for TopologyNetworkResolverLayerProxy {
    fn layer_proxy_id(&self) -> LayerProxyId {
        self.id
    }

    fn get_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.subject_token.clone()
    }

    fn accept_visitor(self: Arc<Self>, visitor: &mut dyn LayerProxyVisitor) {
        visitor.visit_topology_network_resolver_layer_proxy(self);
    }

    fn accept_const_visitor(&self, visitor: &mut dyn ConstLayerProxyVisitor) {
        visitor.visit_topology_network_resolver_layer_proxy(self);
    }

    fn set_current_reconstruction_time(&self, time: ReconstructionTime) {
        self.state.lock().current_reconstruction_time = time;
    }
}

impl InputLayer for TopologyNetworkResolverLayerProxy {
    type Selector = TopologyNetworkSubjectToken;

    fn subject_token(&self, selector: TopologyNetworkSubjectToken) -> SubjectToken {
        match selector {
            TopologyNetworkSubjectToken::All => self.get_subject_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{polyline_feature, CountingGeometryService};
    use crate::topology::SectionSource;
    use tecton_model::{Feature, FeatureType, TopologicalSectionRef, TopologyDefinition};

    struct Fixture {
        service: Arc<CountingGeometryService>,
        sections: FeatureCollectionHandle,
        layer: Arc<TopologyNetworkResolverLayerProxy>,
    }

    fn fixture() -> Fixture {
        let service = Arc::new(CountingGeometryService::default());
        let context = EngineContext::default().with_geometry_service(service.clone());
        let reconstruction = Arc::new(ReconstructionLayerProxy::new(&context));

        let sections = context.feature_store.create_feature_collection("sections");
        sections.add_feature(polyline_feature("west", 0, &[(0.0, 0.0), (10.0, 0.0)]));
        sections.add_feature(polyline_feature("north", 0, &[(10.0, 0.0), (10.0, 10.0)]));
        sections.add_feature(polyline_feature("east", 0, &[(10.0, 10.0), (0.0, 10.0)]));
        sections.add_feature(polyline_feature("fault", 0, &[(2.0, 2.0), (8.0, 8.0)]));
        let section_layer = Arc::new(ReconstructLayerProxy::new(&context, reconstruction.clone()));
        section_layer.add_reconstructable_feature_collection(sections.clone());

        let topologies = context.feature_store.create_feature_collection("networks");
        topologies.add_feature(
            Feature::with_id(FeatureId::new("basin"), FeatureType::TopologicalNetwork)
                .plate_id(0)
                .valid_between(50.0, 0.0)
                .topology(TopologyDefinition {
                    sections: ["west", "north", "east"]
                        .into_iter()
                        .map(|id| TopologicalSectionRef::new(FeatureId::new(id)))
                        .collect(),
                    interior: vec![TopologicalSectionRef::new(FeatureId::new("fault"))],
                }),
        );

        let layer = Arc::new(TopologyNetworkResolverLayerProxy::new(&context, reconstruction));
        layer.add_topological_feature_collection(topologies);
        layer.set_topological_section_layer_proxies([section_layer]);
        Fixture {
            service,
            sections,
            layer,
        }
    }

    fn constrained() -> TopologyNetworkParams {
        TopologyNetworkParams {
            constrained_triangulation: true,
            ..TopologyNetworkParams::default()
        }
    }

    #[test]
    fn test_networks_cached_per_params() {
        let f = fixture();
        let plain = f.layer.get_resolved_topological_networks(0.0.into());
        assert_eq!(plain.len(), 1);
        assert_eq!(plain.items[0].geometry().vertices.len(), 4);

        let meshed = f
            .layer
            .get_resolved_topological_networks_with_params(0.0.into(), constrained());
        assert!(!Arc::ptr_eq(&plain, &meshed));
        assert_eq!(meshed.items[0].geometry().vertices.len(), 6);

        let assemblies = f.service.assemblies();
        let again = f.layer.get_resolved_topological_networks(0.0.into());
        assert!(Arc::ptr_eq(&plain, &again));
        assert_eq!(f.service.assemblies(), assemblies);
    }

    #[test]
    fn test_params_change_keeps_per_time_cache() {
        let f = fixture();
        let plain = f.layer.get_resolved_topological_networks(0.0.into());
        let token = f.layer.get_subject_token();

        f.layer.set_current_topology_network_params(constrained());
        assert_ne!(f.layer.get_subject_token(), token);
        let meshed = f.layer.get_resolved_topological_networks(0.0.into());
        assert_eq!(meshed.items[0].geometry().vertices.len(), 6);

        f.layer
            .set_current_topology_network_params(TopologyNetworkParams::default());
        let back = f.layer.get_resolved_topological_networks(0.0.into());
        assert!(Arc::ptr_eq(&plain, &back));
    }

    #[test]
    fn test_time_span_cached_and_invalidated_wholesale() {
        let f = fixture();
        let range = TimeSpanRange::new(60.0, 0.0, 20.0);
        let span = f.layer.get_resolved_network_time_span(&range);
        assert_eq!(span.time_slots.len(), 4);
        // Not yet active at 60 Ma.
        assert_eq!(span.networks_at(60.0.into()).map(<[_]>::len), Some(0));
        assert_eq!(span.networks_at(20.0.into()).map(<[_]>::len), Some(1));
        assert!(span.networks_at(30.0.into()).is_none());

        let again = f.layer.get_resolved_network_time_span(&range);
        assert!(Arc::ptr_eq(&span, &again));

        f.sections.modify_feature(&FeatureId::new("fault"), |feature| {
            feature.name = "edited".to_string();
        });
        let after = f.layer.get_resolved_network_time_span(&range);
        assert!(!Arc::ptr_eq(&span, &after));
    }

    #[test]
    fn test_network_over_resolved_line() {
        let context = EngineContext::default();
        let reconstruction = Arc::new(ReconstructionLayerProxy::new(&context));
        let sections = context.feature_store.create_feature_collection("sections");
        sections.add_feature(polyline_feature("west", 0, &[(0.0, 0.0), (10.0, 0.0)]));
        sections.add_feature(polyline_feature("north", 0, &[(10.0, 0.0), (10.0, 10.0)]));
        sections.add_feature(polyline_feature("east", 0, &[(10.0, 10.0), (0.0, 10.0)]));
        let section_layer = Arc::new(ReconstructLayerProxy::new(&context, reconstruction.clone()));
        section_layer.add_reconstructable_feature_collection(sections.clone());

        let topology = |id: &str, feature_type, ids: &[&str]| {
            Feature::with_id(FeatureId::new(id), feature_type)
                .plate_id(0)
                .topology(TopologyDefinition {
                    sections: ids
                        .iter()
                        .map(|id| TopologicalSectionRef::new(FeatureId::new(*id)))
                        .collect(),
                    interior: Vec::new(),
                })
        };
        let lines = context.feature_store.create_feature_collection("lines");
        lines.add_feature(topology("line", FeatureType::TopologicalLine, &["north", "east"]));
        let line_layer = Arc::new(TopologyGeometryResolverLayerProxy::new(
            &context,
            reconstruction.clone(),
        ));
        line_layer.add_topological_feature_collection(lines);
        line_layer.set_topological_section_layer_proxies([section_layer.clone()]);

        let networks = context.feature_store.create_feature_collection("networks");
        networks.add_feature(topology("net", FeatureType::TopologicalNetwork, &["west", "line"]));
        let layer = Arc::new(TopologyNetworkResolverLayerProxy::new(&context, reconstruction));
        layer.add_topological_feature_collection(networks);
        layer.set_topological_section_layer_proxies([section_layer]);

        // Without the line layer the line is a dangling section.
        let without = layer.get_resolved_topological_networks(0.0.into());
        assert!(without.items.iter().all(|network| network
            .sections()
            .iter()
            .all(|section| matches!(section.source, SectionSource::Reconstructed(_)))));

        let token = layer.get_subject_token();
        layer.set_resolved_line_layer_proxies([line_layer.clone()]);
        assert_ne!(layer.get_subject_token(), token);

        let with = layer.get_resolved_topological_networks(0.0.into());
        assert_eq!(with.len(), 1);
        let network = &with.items[0];
        assert!(network.sections().iter().any(|section| matches!(
            &section.source,
            SectionSource::ResolvedLine(line) if line.feature_id().as_str() == "line"
        )));
        assert_eq!(network.geometry().vertices.len(), 4);
        assert!(layer.get_topology_reference_errors().is_empty());

        // Editing a section of the line reaches the network.
        let token = layer.get_subject_token();
        sections.modify_feature(&FeatureId::new("east"), |feature| {
            feature.name = "edited".to_string();
        });
        assert_ne!(layer.get_subject_token(), token);
    }

    #[test]
    fn test_params_hash_with_clamping() {
        let a = TopologyNetworkParams {
            strain_rate_clamping: Some(1e-15),
            ..TopologyNetworkParams::default()
        };
        let b = a;
        assert_eq!(a, b);
        assert_ne!(a, TopologyNetworkParams::default());

        let mut cache = std::collections::HashSet::new();
        cache.insert(a);
        assert!(cache.contains(&b));
    }

    #[test]
    fn test_params_from_yaml() {
        let params: TopologyNetworkParams =
            serde_yaml::from_str(
                "constrained_triangulation: true\nstrain_rate_smoothing: natural\n",
            )
            .unwrap();
        assert!(params.constrained_triangulation);
        assert_eq!(params.strain_rate_smoothing, StrainRateSmoothing::Natural);
        assert_eq!(params.strain_rate_clamping, None);
    }
}
