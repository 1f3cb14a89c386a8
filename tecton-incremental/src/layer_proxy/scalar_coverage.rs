//! Reconstruct scalar coverage layer
//!
//! Scalar coverages attach per-point values to a geometry of a domain
//! feature. Over a time span the values are evolved slot by slot, oldest
//! first, by the evolution function registered for their scalar type, fed
//! with per-point deformation from an optional network layer. A point that
//! stops being reconstructed is deactivated for the rest of the span.

use super::input::{InputLayerProxySequence, OptionalInputLayerProxy};
use super::reconstruct::ReconstructLayerProxy;
use super::topology_network::TopologyNetworkResolverLayerProxy;
use super::{
    subject_token_selector, ConstLayerProxyVisitor, InputLayer, LayerProxy, LayerProxyVisitor,
};
use crate::cache::{Insertion, KeyedCache};
use crate::engine::EngineContext;
use crate::metrics::ProxyMetrics;
use crate::reconstructed::ReconstructedFeatureGeometry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tecton_model::{
    Feature, GeometryService, PointOnSphere, ScalarCoverage, ScalarType, WeakFeatureRef,
};
use tecton_types::{FeatureId, LayerProxyId, ReconstructionTime, SubjectToken, TimeSpanRange};

subject_token_selector! {
    /// Subject tokens of a [`ReconstructScalarCoverageLayerProxy`].
    pub enum ScalarCoverageSubjectToken {
        All => "ReconstructScalarCoverageLayerProxy::get_subject_token",
    }
}

/// Deformation of the crust under one point at one time slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeformationInfo {
    pub dilatation_strain_rate: f64,
}

/// Advances per-point scalar values by one time slot.
pub trait ScalarEvolution: Send + Sync + fmt::Debug {
    /// Values at the next slot. `None` entries are inactive points and must
    /// stay `None`.
    fn evolve(
        &self,
        values: &[Option<f64>],
        deformation: &[Option<DeformationInfo>],
        time_increment: f64,
    ) -> Vec<Option<f64>>;
}

/// Copies its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughEvolution;

impl ScalarEvolution for PassThroughEvolution {
    fn evolve(
        &self,
        values: &[Option<f64>],
        _deformation: &[Option<DeformationInfo>],
        _time_increment: f64,
    ) -> Vec<Option<f64>> {
        values.to_vec()
    }
}

/// Evolution functions keyed by scalar type. Types without one keep their
/// values constant.
#[derive(Debug, Clone)]
pub struct ScalarEvolutionRegistry {
    functions: HashMap<ScalarType, Arc<dyn ScalarEvolution>>,
}

impl ScalarEvolutionRegistry {
    pub fn empty() -> Self {
        ScalarEvolutionRegistry {
            functions: HashMap::new(),
        }
    }

    pub fn register(&mut self, scalar_type: ScalarType, evolution: Arc<dyn ScalarEvolution>) {
        self.functions.insert(scalar_type, evolution);
    }

    pub fn get(&self, scalar_type: &ScalarType) -> Option<&Arc<dyn ScalarEvolution>> {
        self.functions.get(scalar_type)
    }

    pub fn is_evolved(&self, scalar_type: &ScalarType) -> bool {
        self.functions.contains_key(scalar_type)
    }
}

/// The crustal thickness family, each with [`PassThroughEvolution`].
impl Default for ScalarEvolutionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for scalar_type in [
            ScalarType::crustal_thickness(),
            ScalarType::crustal_stretching_factor(),
            ScalarType::crustal_thinning_factor(),
        ] {
            registry.register(scalar_type, Arc::new(PassThroughEvolution));
        }
        registry
    }
}

/// Settings of one scalar coverage evolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScalarCoverageParams {
    /// The history over which values are evolved and statistics gathered.
    pub time_span: TimeSpanRange,
}

impl Default for ScalarCoverageParams {
    fn default() -> Self {
        ScalarCoverageParams {
            time_span: TimeSpanRange::new(100.0, 0.0, 10.0),
        }
    }
}

/// Evolved values of one coverage over a time span.
#[derive(Debug, Clone)]
pub struct ScalarCoverageHistory {
    pub feature: WeakFeatureRef,
    /// Index of the covered geometry property.
    pub property_index: usize,
    /// Per slot (oldest first), per point; `None` where inactive.
    pub time_slots: Vec<Vec<Option<f64>>>,
}

/// Evolved histories of every coverage of one scalar type.
#[derive(Debug)]
pub struct ScalarCoverageTimeSpan {
    pub scalar_type: ScalarType,
    pub params: ScalarCoverageParams,
    pub coverages: Vec<ScalarCoverageHistory>,
}

impl ScalarCoverageTimeSpan {
    fn values_at(
        &self,
        feature_id: &FeatureId,
        property_index: usize,
        slot: usize,
    ) -> Option<&[Option<f64>]> {
        self.coverages
            .iter()
            .find(|coverage| {
                coverage.feature.feature_id() == feature_id
                    && coverage.property_index == property_index
            })?
            .time_slots
            .get(slot)
            .map(Vec::as_slice)
    }
}

/// A domain geometry reconstructed at one time with its scalar values.
#[derive(Debug, Clone)]
pub struct ReconstructedScalarCoverage {
    pub rfg: Arc<ReconstructedFeatureGeometry>,
    pub scalar_type: ScalarType,
    /// One per point of the reconstructed geometry; `None` where inactive.
    pub values: Vec<Option<f64>>,
}

/// Statistics over a time span with each point weighted equally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarStatistic {
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub standard_deviation: f64,
}

type CoverageKey = (ScalarType, ScalarCoverageParams, ReconstructionTime);

#[derive(Debug)]
struct ScalarCoverageState {
    domain_layers: InputLayerProxySequence<ReconstructLayerProxy>,
    network_layer: OptionalInputLayerProxy<TopologyNetworkResolverLayerProxy>,
    current_reconstruction_time: ReconstructionTime,
    current_params: ScalarCoverageParams,
    time_spans: KeyedCache<(ScalarType, ScalarCoverageParams), Arc<ScalarCoverageTimeSpan>>,
    reconstructions: KeyedCache<CoverageKey, Arc<Vec<ReconstructedScalarCoverage>>>,
    subject_token: SubjectToken,
}

/// Reconstructs and evolves the scalar coverages of its domain layers.
#[derive(Debug)]
pub struct ReconstructScalarCoverageLayerProxy {
    id: LayerProxyId,
    state: Mutex<ScalarCoverageState>,
    evolutions: ScalarEvolutionRegistry,
    geometry_service: Arc<dyn GeometryService>,
    metrics: ProxyMetrics,
}

impl ReconstructScalarCoverageLayerProxy {
    pub fn new(context: &EngineContext) -> Self {
        Self::with_evolution_registry(context, ScalarEvolutionRegistry::default())
    }

    pub fn with_evolution_registry(
        context: &EngineContext,
        evolutions: ScalarEvolutionRegistry,
    ) -> Self {
        ReconstructScalarCoverageLayerProxy {
            id: LayerProxyId::next(),
            state: Mutex::new(ScalarCoverageState {
                domain_layers: InputLayerProxySequence::new(),
                network_layer: OptionalInputLayerProxy::new(),
                current_reconstruction_time: ReconstructionTime::PRESENT_DAY,
                current_params: ScalarCoverageParams::default(),
                time_spans: KeyedCache::new(
                    context.config.scalar_coverage.max_time_spans_in_cache,
                ),
                reconstructions: KeyedCache::new(
                    context.config.scalar_coverage.max_reconstructions_in_cache,
                ),
                subject_token: SubjectToken::new(),
            }),
            evolutions,
            geometry_service: context.geometry_service.clone(),
            metrics: ProxyMetrics::new("reconstruct_scalar_coverage"),
        }
    }

    /// Scalar types present in any domain feature, in first-seen order.
    pub fn get_scalar_types(&self) -> Vec<ScalarType> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        let mut scalar_types = Vec::new();
        for layer in state.domain_layers.input_layer_proxies() {
            for feature in layer.get_reconstructable_features() {
                for coverage in &feature.snapshot().scalar_coverages {
                    if !scalar_types.contains(&coverage.scalar_type) {
                        scalar_types.push(coverage.scalar_type.clone());
                    }
                }
            }
        }
        scalar_types
    }

    pub fn get_scalar_coverage_time_span(
        &self,
        scalar_type: &ScalarType,
        params: &ScalarCoverageParams,
    ) -> Arc<ScalarCoverageTimeSpan> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        self.time_span(&mut state, scalar_type, params)
    }

    /// Coverages of `scalar_type` at `time`. Times on a slot of the params'
    /// time span carry evolved values; other times carry the stored values.
    pub fn get_reconstructed_scalar_coverages(
        &self,
        scalar_type: &ScalarType,
        params: &ScalarCoverageParams,
        time: ReconstructionTime,
    ) -> Arc<Vec<ReconstructedScalarCoverage>> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);

        let key = (scalar_type.clone(), *params, time);
        if let Some(coverages) = state.reconstructions.get(&key) {
            self.metrics.record_hit();
            return coverages;
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let slot = params.time_span.time_slot(time);
        let history = slot.map(|_| self.time_span(&mut state, scalar_type, params));

        let mut coverages = Vec::new();
        for layer in state.domain_layers.input_layer_proxies() {
            let features: HashMap<FeatureId, Feature> = layer
                .get_reconstructable_features()
                .into_iter()
                .map(|feature| (feature.feature_id().clone(), feature.snapshot().clone()))
                .collect();
            for rfg in &layer.get_reconstructed_feature_geometries(time).items {
                let Some(coverage) = features
                    .get(rfg.feature_id())
                    .and_then(|feature| find_coverage(feature, scalar_type, rfg.property_index()))
                else {
                    continue;
                };
                let values = match (&history, slot) {
                    (Some(history), Some(slot)) => history
                        .values_at(rfg.feature_id(), rfg.property_index(), slot)
                        .map(<[_]>::to_vec)
                        .unwrap_or_default(),
                    _ => coverage.values.iter().copied().map(Some).collect(),
                };
                coverages.push(ReconstructedScalarCoverage {
                    rfg: rfg.clone(),
                    scalar_type: scalar_type.clone(),
                    values,
                });
            }
        }
        self.metrics.record_compute(started.elapsed());
        tracing::debug!(
            layer = %self.id,
            %time,
            %scalar_type,
            coverages = coverages.len(),
            "reconstructed scalar coverages"
        );

        let coverages = Arc::new(coverages);
        if state.reconstructions.insert(key, coverages.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        coverages
    }

    pub fn get_current_reconstructed_scalar_coverages(
        &self,
        scalar_type: &ScalarType,
    ) -> Arc<Vec<ReconstructedScalarCoverage>> {
        let (params, time) = {
            let state = self.state.lock();
            (state.current_params, state.current_reconstruction_time)
        };
        self.get_reconstructed_scalar_coverages(scalar_type, &params, time)
    }

    /// Statistics of `scalar_type` over the params' time span.
    ///
    /// Each point's samples are first averaged over its own active slots, so
    /// a point deactivated early weighs no less than one active throughout.
    pub fn get_scalar_statistics(
        &self,
        scalar_type: &ScalarType,
        params: &ScalarCoverageParams,
    ) -> Option<ScalarStatistic> {
        let span = self.get_scalar_coverage_time_span(scalar_type, params);
        scalar_statistics(&span)
    }

    /// Number of cached per-time reconstructions.
    pub fn get_num_cached_reconstructions(&self) -> usize {
        self.state.lock().reconstructions.len()
    }

    pub fn get_current_scalar_coverage_params(&self) -> ScalarCoverageParams {
        self.state.lock().current_params
    }

    pub fn set_current_scalar_coverage_params(&self, params: ScalarCoverageParams) {
        let mut state = self.state.lock();
        if state.current_params != params {
            state.current_params = params;
            state.subject_token.invalidate();
        }
    }

    pub fn get_current_reconstruction_time(&self) -> ReconstructionTime {
        self.state.lock().current_reconstruction_time
    }

    pub fn get_domain_layer_proxies(&self) -> Vec<Arc<ReconstructLayerProxy>> {
        self.state.lock().domain_layers.input_layer_proxies().cloned().collect()
    }

    pub fn set_domain_layer_proxies(
        &self,
        layers: impl IntoIterator<Item = Arc<ReconstructLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        if state.domain_layers.set_input_layer_proxies(layers) {
            self.invalidate(&mut state);
        }
    }

    pub fn get_deformation_network_layer_proxy(
        &self,
    ) -> Option<Arc<TopologyNetworkResolverLayerProxy>> {
        self.state.lock().network_layer.get_input_layer_proxy().cloned()
    }

    pub fn set_deformation_network_layer_proxy(
        &self,
        proxy: Option<Arc<TopologyNetworkResolverLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        if state.network_layer.set_input_layer_proxy(proxy) {
            self.invalidate(&mut state);
        }
    }

    pub fn set_max_num_reconstructions_in_cache(&self, max_entries: usize) {
        self.state.lock().reconstructions.resize(max_entries);
    }

    pub fn set_max_num_time_spans_in_cache(&self, max_entries: usize) {
        self.state.lock().time_spans.resize(max_entries);
    }

    /// Number of cached evolved time spans.
    pub fn get_num_cached_time_spans(&self) -> usize {
        self.state.lock().time_spans.len()
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    fn time_span(
        &self,
        state: &mut ScalarCoverageState,
        scalar_type: &ScalarType,
        params: &ScalarCoverageParams,
    ) -> Arc<ScalarCoverageTimeSpan> {
        let key = (scalar_type.clone(), *params);
        if let Some(span) = state.time_spans.get(&key) {
            return span.clone();
        }

        let started = Instant::now();
        let network_layer = state.network_layer.get_input_layer_proxy().cloned();
        let mut coverages = Vec::new();
        for layer in state.domain_layers.input_layer_proxies() {
            let features: HashMap<FeatureId, Feature> = layer
                .get_reconstructable_features()
                .into_iter()
                .map(|feature| (feature.feature_id().clone(), feature.snapshot().clone()))
                .collect();
            let time_spans = layer.get_reconstructed_feature_time_span(&params.time_span);
            for feature_span in &time_spans.items {
                let Some(feature) = features.get(feature_span.feature.feature_id()) else {
                    continue;
                };
                for coverage in feature
                    .scalar_coverages
                    .iter()
                    .filter(|coverage| &coverage.scalar_type == scalar_type)
                {
                    let slots: Vec<Option<Arc<ReconstructedFeatureGeometry>>> = feature_span
                        .time_slots
                        .iter()
                        .map(|slot| {
                            slot.items
                                .iter()
                                .find(|r| r.rfg.property_index() == coverage.geometry_index)
                                .map(|r| r.rfg.clone())
                        })
                        .collect();
                    coverages.push(ScalarCoverageHistory {
                        feature: feature_span.feature.clone(),
                        property_index: coverage.geometry_index,
                        time_slots: self.evolve(
                            coverage,
                            &slots,
                            &params.time_span,
                            network_layer.as_deref(),
                        ),
                    });
                }
            }
        }

        let span = Arc::new(ScalarCoverageTimeSpan {
            scalar_type: scalar_type.clone(),
            params: *params,
            coverages,
        });
        self.metrics.record_time_span(started.elapsed());
        tracing::debug!(
            layer = %self.id,
            %scalar_type,
            coverages = span.coverages.len(),
            "evolved scalar coverages"
        );
        if state.time_spans.insert(key, span.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        span
    }

    /// Values of one coverage at each slot, given its reconstruction at each
    /// slot.
    fn evolve(
        &self,
        coverage: &ScalarCoverage,
        slots: &[Option<Arc<ReconstructedFeatureGeometry>>],
        time_span: &TimeSpanRange,
        network_layer: Option<&TopologyNetworkResolverLayerProxy>,
    ) -> Vec<Vec<Option<f64>>> {
        let num_points = coverage.values.len();
        let evolution = self.evolutions.get(&coverage.scalar_type);
        let mut history = Vec::with_capacity(slots.len());
        let mut current: Option<Vec<Option<f64>>> = None;
        let mut ended = false;

        for (slot, rfg) in slots.iter().enumerate() {
            let values = match (rfg, ended) {
                (Some(rfg), false) => {
                    let next = match (current.take(), evolution) {
                        (None, _) => coverage.values.iter().copied().map(Some).collect(),
                        (Some(previous), Some(evolution)) => {
                            let deformation = self.deformation(
                                network_layer,
                                rfg.reconstructed_geometry().points(),
                                time_span.time_slot_time(slot),
                            );
                            evolution.evolve(&previous, &deformation, time_span.time_increment())
                        }
                        (Some(previous), None) => previous,
                    };
                    current = Some(next.clone());
                    next
                }
                _ => {
                    ended |= current.is_some();
                    current = None;
                    vec![None; num_points]
                }
            };
            history.push(values);
        }
        history
    }

    fn deformation(
        &self,
        network_layer: Option<&TopologyNetworkResolverLayerProxy>,
        points: &[PointOnSphere],
        time: ReconstructionTime,
    ) -> Vec<Option<DeformationInfo>> {
        let Some(network_layer) = network_layer else {
            return vec![None; points.len()];
        };
        let params = network_layer.get_current_topology_network_params();
        let networks = network_layer.get_resolved_topological_networks(time);
        points
            .iter()
            .map(|point| {
                networks.items.iter().find_map(|network| {
                    params
                        .dilatation_strain_rate(self.geometry_service.as_ref(), network, point)
                        .map(|rate| DeformationInfo {
                            dilatation_strain_rate: rate,
                        })
                })
            })
            .collect()
    }

    fn check_input_layer_proxies(&self, state: &mut ScalarCoverageState) {
        let mut stale = false;
        if !state.domain_layers.is_up_to_date() {
            state.domain_layers.set_up_to_date();
            stale = true;
        }
        if !state.network_layer.is_up_to_date() {
            state.network_layer.set_up_to_date();
            stale = true;
        }
        if stale {
            self.invalidate(state);
        }
    }

    fn invalidate(&self, state: &mut ScalarCoverageState) {
        state.time_spans.clear();
        if state.reconstructions.clear() {
            tracing::debug!(layer = %self.id, "discarded reconstructed scalar coverages");
        }
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
    }
}

fn find_coverage<'a>(
    feature: &'a Feature,
    scalar_type: &ScalarType,
    property_index: usize,
) -> Option<&'a ScalarCoverage> {
    feature.scalar_coverages.iter().find(|coverage| {
        &coverage.scalar_type == scalar_type && coverage.geometry_index == property_index
    })
}

/// Per-point normalised statistics; `None` without any active sample.
pub fn scalar_statistics(span: &ScalarCoverageTimeSpan) -> Option<ScalarStatistic> {
    let mut minimum = f64::INFINITY;
    let mut maximum = f64::NEG_INFINITY;
    let mut sum_of_means = 0.0;
    let mut sum_of_mean_squares = 0.0;
    let mut num_points = 0usize;

    for coverage in &span.coverages {
        let width = coverage.time_slots.iter().map(Vec::len).max().unwrap_or(0);
        for point in 0..width {
            let samples: Vec<f64> = coverage
                .time_slots
                .iter()
                .filter_map(|slot| slot.get(point).copied().flatten())
                .collect();
            if samples.is_empty() {
                continue;
            }
            let count = samples.len() as f64;
            for &sample in &samples {
                minimum = minimum.min(sample);
                maximum = maximum.max(sample);
            }
            sum_of_means += samples.iter().sum::<f64>() / count;
            sum_of_mean_squares += samples.iter().map(|s| s * s).sum::<f64>() / count;
            num_points += 1;
        }
    }

    if num_points == 0 {
        return None;
    }
    let mean = sum_of_means / num_points as f64;
    let variance = (sum_of_mean_squares / num_points as f64 - mean * mean).max(0.0);
    Some(ScalarStatistic {
        minimum,
        maximum,
        mean,
        standard_deviation: variance.sqrt(),
    })
}

impl LayerProxy for ReconstructScalarCoverageLayerProxy {
    fn layer_proxy_id(&self) -> LayerProxyId {
        self.id
    }

    fn get_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.subject_token.clone()
    }

    fn accept_visitor(self: Arc<Self>, visitor: &mut dyn LayerProxyVisitor) {
        visitor.visit_reconstruct_scalar_coverage_layer_proxy(self);
    }

    fn accept_const_visitor(&self, visitor: &mut dyn ConstLayerProxyVisitor) {
        visitor.visit_reconstruct_scalar_coverage_layer_proxy(self);
    }

    fn set_current_reconstruction_time(&self, time: ReconstructionTime) {
        self.state.lock().current_reconstruction_time = time;
    }
}

impl InputLayer for ReconstructScalarCoverageLayerProxy {
    type Selector = ScalarCoverageSubjectToken;

    fn subject_token(&self, selector: ScalarCoverageSubjectToken) -> SubjectToken {
        match selector {
            ScalarCoverageSubjectToken::All => self.get_subject_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer_proxy::reconstruction::ReconstructionLayerProxy;
    use crate::test_fixtures::points;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tecton_model::{FeatureCollectionHandle, FeatureType, GeometryOnSphere};

    fn thickness() -> ScalarType {
        ScalarType::crustal_thickness()
    }

    fn params() -> ScalarCoverageParams {
        ScalarCoverageParams {
            time_span: TimeSpanRange::new(80.0, 0.0, 20.0),
        }
    }

    fn coverage_feature(id: &str, valid: (f64, f64), values: Vec<f64>) -> Feature {
        let lat_lons: Vec<(f64, f64)> = (0..values.len()).map(|i| (i as f64, 0.0)).collect();
        Feature::with_id(FeatureId::new(id), FeatureType::Unclassified)
            .plate_id(0)
            .valid_between(valid.0, valid.1)
            .geometry("domain", GeometryOnSphere::MultiPoint(points(&lat_lons)))
            .scalar_coverage(0, thickness(), values)
    }

    fn layer_with(
        evolutions: ScalarEvolutionRegistry,
    ) -> (Arc<ReconstructScalarCoverageLayerProxy>, FeatureCollectionHandle) {
        let context = EngineContext::default();
        let reconstruction = Arc::new(ReconstructionLayerProxy::new(&context));
        let collection = context.feature_store.create_feature_collection("domain");
        let domain = Arc::new(ReconstructLayerProxy::new(&context, reconstruction));
        domain.add_reconstructable_feature_collection(collection.clone());
        let layer = Arc::new(ReconstructScalarCoverageLayerProxy::with_evolution_registry(
            &context, evolutions,
        ));
        layer.set_domain_layer_proxies([domain]);
        (layer, collection)
    }

    #[test]
    fn test_statistics_weight_points_equally() {
        let (layer, collection) = layer_with(ScalarEvolutionRegistry::default());
        collection.add_feature(coverage_feature("a", (1000.0, 0.0), vec![10.0]));
        // Active at 80, 60, 40 and 20 Ma only.
        collection.add_feature(coverage_feature("b", (80.0, 15.0), vec![0.0]));

        let span = layer.get_scalar_coverage_time_span(&thickness(), &params());
        assert_eq!(span.coverages.len(), 2);
        let b = span
            .coverages
            .iter()
            .find(|coverage| coverage.feature.feature_id().as_str() == "b")
            .unwrap();
        assert_eq!(b.time_slots.iter().filter(|slot| slot[0].is_some()).count(), 4);

        let statistics = layer.get_scalar_statistics(&thickness(), &params()).unwrap();
        assert!((statistics.mean - 5.0).abs() < 1e-12);
        assert_eq!(statistics.minimum, 0.0);
        assert_eq!(statistics.maximum, 10.0);
        assert!((statistics.standard_deviation - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_cache_bounded_and_lru() {
        let (layer, collection) = layer_with(ScalarEvolutionRegistry::default());
        collection.add_feature(coverage_feature("a", (1000.0, 0.0), vec![1.0, 2.0]));

        for _ in 0..3 {
            layer.get_reconstructed_scalar_coverages(&thickness(), &params(), 20.0.into());
        }
        assert_eq!(layer.get_num_cached_reconstructions(), 1);

        for time in [0.0, 20.0, 40.0, 60.0, 80.0] {
            layer.get_reconstructed_scalar_coverages(&thickness(), &params(), time.into());
        }
        assert_eq!(
            layer.get_num_cached_reconstructions(),
            crate::config::MAX_NUM_RECONSTRUCTIONS_IN_CACHE
        );

        // 0 Ma was least recently used and has been evicted.
        let misses = layer.metrics().snapshot().misses;
        layer.get_reconstructed_scalar_coverages(&thickness(), &params(), 80.0.into());
        assert_eq!(layer.metrics().snapshot().misses, misses);
        layer.get_reconstructed_scalar_coverages(&thickness(), &params(), 0.0.into());
        assert_eq!(layer.metrics().snapshot().misses, misses + 1);
    }

    #[test]
    fn test_time_span_cache_bounded() {
        let (layer, collection) = layer_with(ScalarEvolutionRegistry::default());
        collection.add_feature(coverage_feature("a", (1000.0, 0.0), vec![1.0]));

        let spans: Vec<ScalarCoverageParams> = [10.0, 20.0, 40.0]
            .into_iter()
            .map(|increment| ScalarCoverageParams {
                time_span: TimeSpanRange::new(80.0, 0.0, increment),
            })
            .collect();
        let first = layer.get_scalar_coverage_time_span(&thickness(), &spans[0]);
        assert!(Arc::ptr_eq(
            &first,
            &layer.get_scalar_coverage_time_span(&thickness(), &spans[0])
        ));
        for params in &spans[1..] {
            layer.get_scalar_coverage_time_span(&thickness(), params);
        }
        assert_eq!(
            layer.get_num_cached_time_spans(),
            crate::config::MAX_NUM_TIME_SPANS_IN_CACHE
        );
        let snapshot = layer.metrics().snapshot();
        assert_eq!((snapshot.time_spans, snapshot.evictions), (3, 1));

        // The first span was evicted and is evolved again.
        let again = layer.get_scalar_coverage_time_span(&thickness(), &spans[0]);
        assert!(!Arc::ptr_eq(&first, &again));
        assert_eq!(layer.metrics().snapshot().time_spans, 4);

        layer.set_max_num_time_spans_in_cache(1);
        assert_eq!(layer.get_num_cached_time_spans(), 1);
    }

    #[derive(Debug, Default)]
    struct Doubling {
        calls: AtomicUsize,
    }

    impl ScalarEvolution for Doubling {
        fn evolve(
            &self,
            values: &[Option<f64>],
            _deformation: &[Option<DeformationInfo>],
            _time_increment: f64,
        ) -> Vec<Option<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            values.iter().map(|value| value.map(|v| v * 2.0)).collect()
        }
    }

    #[test]
    fn test_registered_evolution_runs_per_slot() {
        let doubling = Arc::new(Doubling::default());
        let mut registry = ScalarEvolutionRegistry::empty();
        registry.register(thickness(), doubling.clone());
        let (layer, collection) = layer_with(registry);
        collection.add_feature(coverage_feature("a", (1000.0, 0.0), vec![1.0]));

        let present = layer.get_reconstructed_scalar_coverages(&thickness(), &params(), 0.0.into());
        assert_eq!(present[0].values, vec![Some(16.0)]);
        assert_eq!(doubling.calls.load(Ordering::SeqCst), 4);

        // Off-slot times carry the stored values.
        let off_slot =
            layer.get_reconstructed_scalar_coverages(&thickness(), &params(), 10.0.into());
        assert_eq!(off_slot[0].values, vec![Some(1.0)]);
    }

    #[test]
    fn test_scalar_types_and_invalidation() {
        let (layer, collection) = layer_with(ScalarEvolutionRegistry::default());
        assert!(layer.get_scalar_types().is_empty());
        collection.add_feature(coverage_feature("a", (1000.0, 0.0), vec![1.0]));
        assert_eq!(layer.get_scalar_types(), vec![thickness()]);

        let before = layer.get_scalar_coverage_time_span(&thickness(), &params());
        let token = layer.get_subject_token();
        collection.add_feature(coverage_feature("b", (1000.0, 0.0), vec![2.0]));
        assert_ne!(layer.get_subject_token(), token);
        let after = layer.get_scalar_coverage_time_span(&thickness(), &params());
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.coverages.len(), 2);
    }

    #[test]
    fn test_crustal_types_registered() {
        let registry = ScalarEvolutionRegistry::default();
        assert!(registry.is_evolved(&ScalarType::crustal_thinning_factor()));
        assert!(!registry.is_evolved(&ScalarType::new("Temperature")));
        let values = [Some(1.0), None];
        assert_eq!(
            PassThroughEvolution.evolve(&values, &[None, None], 10.0),
            values.to_vec()
        );
    }
}
