//! Velocity field calculator layer
//!
//! Velocities are calculated at the points of the domain layers' reconstructed
//! geometries. Each point takes the motion of the first surface containing
//! it, searching resolved networks, then resolved boundaries, then static
//! polygons.

use super::input::InputLayerProxySequence;
use super::reconstruct::ReconstructLayerProxy;
use super::topology_geometry::TopologyGeometryResolverLayerProxy;
use super::topology_network::TopologyNetworkResolverLayerProxy;
use super::{
    subject_token_selector, ConstLayerProxyVisitor, InputLayer, LayerProxy, LayerProxyVisitor,
};
use crate::cache::{Insertion, KeyedCache};
use crate::engine::EngineContext;
use crate::layer_proxy::reconstruction::ReconstructionTreeCreator;
use crate::metrics::ProxyMetrics;
use crate::reconstructed::ReconstructedFeatureGeometry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tecton_model::{GeometryKind, GeometryService, PointOnSphere};
use tecton_types::{LayerProxyId, PlateId, ReconstructionTime, SubjectToken};

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// One km/Myr in cm/yr.
const KM_PER_MYR_IN_CM_PER_YR: f64 = 0.1;

subject_token_selector! {
    /// Subject tokens of a [`VelocityFieldCalculatorLayerProxy`].
    pub enum VelocitySubjectToken {
        All => "VelocityFieldCalculatorLayerProxy::get_subject_token",
    }
}

/// Which interval around the reconstruction time the motion is taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VelocityDeltaTimeType {
    /// From `t + dt` to `t`.
    #[default]
    PlusDeltaTToT,
    /// From `t` to `t - dt`.
    TToMinusDeltaT,
    /// From `t + dt/2` to `t - dt/2`.
    PlusMinusHalfDeltaT,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityParams {
    /// In Myr; must be positive.
    pub delta_time: f64,
    pub delta_time_type: VelocityDeltaTimeType,
}

impl Default for VelocityParams {
    fn default() -> Self {
        VelocityParams {
            delta_time: 1.0,
            delta_time_type: VelocityDeltaTimeType::default(),
        }
    }
}

impl VelocityParams {
    /// Whether `delta_time` is finite and positive.
    pub fn is_valid(&self) -> bool {
        self.delta_time.is_finite() && self.delta_time > 0.0
    }

    /// The (older, younger) times bracketing `time`.
    pub fn interval(&self, time: ReconstructionTime) -> (ReconstructionTime, ReconstructionTime) {
        let t = time.value();
        let dt = self.delta_time;
        let (older, younger) = match self.delta_time_type {
            VelocityDeltaTimeType::PlusDeltaTToT => (t + dt, t),
            VelocityDeltaTimeType::TToMinusDeltaT => (t, t - dt),
            VelocityDeltaTimeType::PlusMinusHalfDeltaT => (t + dt / 2.0, t - dt / 2.0),
        };
        (older.into(), younger.into())
    }
}

/// Cartesian velocity in cm/yr.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl VelocityVector {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Which kind of surface a point's velocity was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VelocitySurface {
    Network,
    Boundary,
    StaticPolygon,
}

/// Velocity of one domain point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointVelocity {
    pub velocity: VelocityVector,
    pub plate_id: Option<PlateId>,
    pub surface: VelocitySurface,
}

/// Velocities at the points of one domain geometry. `None` where no surface
/// contains the point.
#[derive(Debug, Clone)]
pub struct MultiPointVectorField {
    pub domain: Arc<ReconstructedFeatureGeometry>,
    pub velocities: Vec<Option<PointVelocity>>,
}

impl MultiPointVectorField {
    pub fn points(&self) -> &[PointOnSphere] {
        self.domain.reconstructed_geometry().points()
    }
}

/// A surface that can move the points inside it.
struct Surface {
    kind: VelocitySurface,
    polygon: Vec<PointOnSphere>,
    plate_id: Option<PlateId>,
    tree_creator: ReconstructionTreeCreator,
}

impl Surface {
    fn velocity(
        &self,
        point: &PointOnSphere,
        time: ReconstructionTime,
        params: &VelocityParams,
    ) -> PointVelocity {
        let velocity = match self.plate_id {
            Some(plate_id) => plate_velocity(&self.tree_creator, plate_id, point, time, params),
            None => VelocityVector::default(),
        };
        PointVelocity {
            velocity,
            plate_id: self.plate_id,
            surface: self.kind,
        }
    }
}

/// Velocity of `point`, located at `time`, when carried by `plate_id`.
pub fn plate_velocity(
    tree_creator: &ReconstructionTreeCreator,
    plate_id: PlateId,
    point: &PointOnSphere,
    time: ReconstructionTime,
    params: &VelocityParams,
) -> VelocityVector {
    if !params.is_valid() {
        return VelocityVector::default();
    }
    let (older, younger) = params.interval(time);
    let rotation_at = |t| {
        tree_creator
            .get_reconstruction_tree(t)
            .composed_absolute_rotation(plate_id)
            .0
    };

    let present_day = rotation_at(time).reverse().rotate_point(point);
    let from = rotation_at(older).rotate_point(&present_day);
    let to = rotation_at(younger).rotate_point(&present_day);

    let scale = EARTH_RADIUS_KM * KM_PER_MYR_IN_CM_PER_YR / (older.value() - younger.value());
    VelocityVector {
        x: (to.x() - from.x()) * scale,
        y: (to.y() - from.y()) * scale,
        z: (to.z() - from.z()) * scale,
    }
}

type VelocityBatch = Arc<Vec<MultiPointVectorField>>;

#[derive(Debug)]
struct VelocityState {
    domain_layers: InputLayerProxySequence<ReconstructLayerProxy>,
    static_polygon_layers: InputLayerProxySequence<ReconstructLayerProxy>,
    boundary_layers: InputLayerProxySequence<TopologyGeometryResolverLayerProxy>,
    network_layers: InputLayerProxySequence<TopologyNetworkResolverLayerProxy>,
    current_reconstruction_time: ReconstructionTime,
    current_params: VelocityParams,
    velocity_fields: KeyedCache<ReconstructionTime, VelocityBatch>,
    subject_token: SubjectToken,
}

/// Calculates plate velocities at domain points.
#[derive(Debug)]
pub struct VelocityFieldCalculatorLayerProxy {
    id: LayerProxyId,
    state: Mutex<VelocityState>,
    geometry_service: Arc<dyn GeometryService>,
    metrics: ProxyMetrics,
}

impl VelocityFieldCalculatorLayerProxy {
    pub fn new(context: &EngineContext) -> Self {
        let config = &context.config.velocity;
        VelocityFieldCalculatorLayerProxy {
            id: LayerProxyId::next(),
            state: Mutex::new(VelocityState {
                domain_layers: InputLayerProxySequence::new(),
                static_polygon_layers: InputLayerProxySequence::new(),
                boundary_layers: InputLayerProxySequence::new(),
                network_layers: InputLayerProxySequence::new(),
                current_reconstruction_time: ReconstructionTime::PRESENT_DAY,
                current_params: config.default_params,
                velocity_fields: KeyedCache::new(config.max_cached_velocity_fields),
                subject_token: SubjectToken::new(),
            }),
            geometry_service: context.geometry_service.clone(),
            metrics: ProxyMetrics::new("velocity_field_calculator"),
        }
    }

    pub fn get_velocity_multi_point_vector_fields(
        &self,
        time: ReconstructionTime,
    ) -> VelocityBatch {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);

        if let Some(fields) = state.velocity_fields.get(&time) {
            self.metrics.record_hit();
            tracing::trace!(layer = %self.id, %time, "velocity cache hit");
            return fields;
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let surfaces = self.gather_surfaces(&state, time);
        let params = state.current_params;

        let mut fields = Vec::new();
        for layer in state.domain_layers.input_layer_proxies() {
            for rfg in &layer.get_reconstructed_feature_geometries(time).items {
                let velocities = rfg
                    .reconstructed_geometry()
                    .points()
                    .iter()
                    .map(|point| {
                        surfaces
                            .iter()
                            .find(|surface| {
                                self.geometry_service.polygon_contains(&surface.polygon, point)
                            })
                            .map(|surface| surface.velocity(point, time, &params))
                    })
                    .collect();
                fields.push(MultiPointVectorField {
                    domain: rfg.clone(),
                    velocities,
                });
            }
        }
        self.metrics.record_compute(started.elapsed());
        tracing::debug!(
            layer = %self.id,
            %time,
            surfaces = surfaces.len(),
            fields = fields.len(),
            "calculated velocity fields"
        );

        let fields = Arc::new(fields);
        if state.velocity_fields.insert(time, fields.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        fields
    }

    pub fn get_current_velocity_multi_point_vector_fields(&self) -> VelocityBatch {
        let time = self.get_current_reconstruction_time();
        self.get_velocity_multi_point_vector_fields(time)
    }

    pub fn get_current_reconstruction_time(&self) -> ReconstructionTime {
        self.state.lock().current_reconstruction_time
    }

    pub fn get_current_velocity_params(&self) -> VelocityParams {
        self.state.lock().current_params
    }

    /// Params with a non-positive `delta_time` are refused and the current
    /// ones kept. Returns whether `params` are now current.
    pub fn set_current_velocity_params(&self, params: VelocityParams) -> bool {
        if !params.is_valid() {
            tracing::warn!(
                layer = %self.id,
                delta_time = params.delta_time,
                "refused velocity params"
            );
            return false;
        }
        let mut state = self.state.lock();
        if state.current_params != params {
            state.current_params = params;
            self.invalidate(&mut state);
        }
        true
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

    pub fn get_static_polygon_layer_proxies(&self) -> Vec<Arc<ReconstructLayerProxy>> {
        self.state
            .lock()
            .static_polygon_layers
            .input_layer_proxies()
            .cloned()
            .collect()
    }

    pub fn set_static_polygon_layer_proxies(
        &self,
        layers: impl IntoIterator<Item = Arc<ReconstructLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        if state.static_polygon_layers.set_input_layer_proxies(layers) {
            self.invalidate(&mut state);
        }
    }

    pub fn get_boundary_layer_proxies(&self) -> Vec<Arc<TopologyGeometryResolverLayerProxy>> {
        self.state
            .lock()
            .boundary_layers
            .input_layer_proxies()
            .cloned()
            .collect()
    }

    pub fn set_boundary_layer_proxies(
        &self,
        layers: impl IntoIterator<Item = Arc<TopologyGeometryResolverLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        if state.boundary_layers.set_input_layer_proxies(layers) {
            self.invalidate(&mut state);
        }
    }

    pub fn get_network_layer_proxies(&self) -> Vec<Arc<TopologyNetworkResolverLayerProxy>> {
        self.state
            .lock()
            .network_layers
            .input_layer_proxies()
            .cloned()
            .collect()
    }

    pub fn set_network_layer_proxies(
        &self,
        layers: impl IntoIterator<Item = Arc<TopologyNetworkResolverLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        if state.network_layers.set_input_layer_proxies(layers) {
            self.invalidate(&mut state);
        }
    }

    pub fn set_max_num_velocity_fields_in_cache(&self, max_entries: usize) {
        self.state.lock().velocity_fields.resize(max_entries);
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Candidate surfaces at `time` in search order.
    fn gather_surfaces(&self, state: &VelocityState, time: ReconstructionTime) -> Vec<Surface> {
        let mut surfaces = Vec::new();
        for layer in state.network_layers.input_layer_proxies() {
            for network in &layer.get_resolved_topological_networks(time).items {
                surfaces.push(Surface {
                    kind: VelocitySurface::Network,
                    polygon: network.geometry().boundary.clone(),
                    plate_id: network.plate_id(),
                    tree_creator: network.reconstruction_tree_creator().clone(),
                });
            }
        }
        for layer in state.boundary_layers.input_layer_proxies() {
            for boundary in &layer.get_resolved_topological_boundaries(time).items {
                surfaces.push(Surface {
                    kind: VelocitySurface::Boundary,
                    polygon: boundary.geometry().0.clone(),
                    plate_id: boundary.plate_id(),
                    tree_creator: boundary.reconstruction_tree_creator().clone(),
                });
            }
        }
        for layer in state.static_polygon_layers.input_layer_proxies() {
            for rfg in &layer.get_reconstructed_feature_geometries(time).items {
                if rfg.reconstructed_geometry().kind() != GeometryKind::Polygon {
                    continue;
                }
                surfaces.push(Surface {
                    kind: VelocitySurface::StaticPolygon,
                    polygon: rfg.reconstructed_geometry().points().to_vec(),
                    plate_id: rfg.reconstruction_plate_id(),
                    tree_creator: rfg.reconstruction_tree_creator().clone(),
                });
            }
        }
        surfaces
    }

    fn check_input_layer_proxies(&self, state: &mut VelocityState) {
        let stale = !state.domain_layers.is_up_to_date()
            || !state.static_polygon_layers.is_up_to_date()
            || !state.boundary_layers.is_up_to_date()
            || !state.network_layers.is_up_to_date();
        if stale {
            state.domain_layers.set_up_to_date();
            state.static_polygon_layers.set_up_to_date();
            state.boundary_layers.set_up_to_date();
            state.network_layers.set_up_to_date();
            self.invalidate(state);
        }
    }

    fn invalidate(&self, state: &mut VelocityState) {
        if state.velocity_fields.clear() {
            tracing::debug!(layer = %self.id, "discarded velocity fields");
        }
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
    }
}

impl LayerProxy for VelocityFieldCalculatorLayerProxy {
    fn layer_proxy_id(&self) -> LayerProxyId {
        self.id
    }

    fn get_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.subject_token.clone()
    }

    fn accept_visitor(self: Arc<Self>, visitor: &mut dyn LayerProxyVisitor) {
        visitor.visit_velocity_field_calculator_layer_proxy(self);
    }

    fn accept_const_visitor(&self, visitor: &mut dyn ConstLayerProxyVisitor) {
        visitor.visit_velocity_field_calculator_layer_proxy(self);
    }

    fn set_current_reconstruction_time(&self, time: ReconstructionTime) {
        self.state.lock().current_reconstruction_time = time;
    }
}

impl InputLayer for VelocityFieldCalculatorLayerProxy {
    type Selector = VelocitySubjectToken;

    fn subject_token(&self, selector: VelocitySubjectToken) -> SubjectToken {
        match selector {
            VelocitySubjectToken::All => self.get_subject_token(),
        }
    }
}
