//! The owning layer graph
//!
//! Proxies only hold references to their inputs, so something has to own
//! them. [`ReconstructGraph`] creates every proxy with the shared
//! [`EngineContext`], keeps each alive while it is part of the graph and
//! propagates the reconstruction time.
//!
//! Topology layers with no explicitly connected section layers are connected
//! to every active reconstruct layer. Likewise their resolved lines come from
//! every active geometry resolver layer unless connected explicitly. Both are
//! reconnected whenever the set of layers or their active state changes.

use crate::engine::EngineContext;
use crate::layer_proxy::raster::RasterLayerProxy;
use crate::layer_proxy::reconstruct::ReconstructLayerProxy;
use crate::layer_proxy::reconstruction::ReconstructionLayerProxy;
use crate::layer_proxy::scalar_coverage::ReconstructScalarCoverageLayerProxy;
use crate::layer_proxy::topology_geometry::TopologyGeometryResolverLayerProxy;
use crate::layer_proxy::topology_network::TopologyNetworkResolverLayerProxy;
use crate::layer_proxy::velocity::VelocityFieldCalculatorLayerProxy;
use crate::layer_proxy::{
    get_layer_proxy_derived_type, DerivedLayerProxy, LayerProxy, LayerProxyHandle,
    LayerProxyVisitor,
};
use std::collections::HashMap;
use std::sync::Arc;
use tecton_types::{LayerProxyId, ReconstructionTime};

#[derive(Debug)]
struct Layer {
    handle: LayerProxyHandle,
    active: bool,
}

/// Owns the layer proxies of one reconstruction session.
#[derive(Debug)]
pub struct ReconstructGraph {
    context: EngineContext,
    layers: Vec<Layer>,
    default_reconstruction_layer: Arc<ReconstructionLayerProxy>,
    /// Topology layer id to its explicitly connected section layers.
    section_connections: HashMap<LayerProxyId, Vec<Arc<ReconstructLayerProxy>>>,
    /// Topology layer id to its explicitly connected resolved-line layers.
    line_connections: HashMap<LayerProxyId, Vec<Arc<TopologyGeometryResolverLayerProxy>>>,
    reconstruction_time: ReconstructionTime,
}

impl ReconstructGraph {
    /// A graph holding only its default reconstruction layer.
    pub fn new(context: EngineContext) -> Self {
        let default_reconstruction_layer = Arc::new(ReconstructionLayerProxy::new(&context));
        let mut graph = ReconstructGraph {
            context,
            layers: Vec::new(),
            default_reconstruction_layer: default_reconstruction_layer.clone(),
            section_connections: HashMap::new(),
            line_connections: HashMap::new(),
            reconstruction_time: ReconstructionTime::PRESENT_DAY,
        };
        graph.insert(default_reconstruction_layer);
        graph
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn default_reconstruction_layer(&self) -> &Arc<ReconstructionLayerProxy> {
        &self.default_reconstruction_layer
    }

    pub fn add_reconstruction_layer(&mut self) -> Arc<ReconstructionLayerProxy> {
        let layer = Arc::new(ReconstructionLayerProxy::new(&self.context));
        self.insert(layer.clone());
        layer
    }

    /// A reconstruct layer using `reconstruction_layer`, or the default one.
    pub fn add_reconstruct_layer(
        &mut self,
        reconstruction_layer: Option<Arc<ReconstructionLayerProxy>>,
    ) -> Arc<ReconstructLayerProxy> {
        let layer = Arc::new(ReconstructLayerProxy::new(
            &self.context,
            self.reconstruction_layer_or_default(reconstruction_layer),
        ));
        self.insert(layer.clone());
        layer
    }

    pub fn add_topology_geometry_resolver_layer(
        &mut self,
        reconstruction_layer: Option<Arc<ReconstructionLayerProxy>>,
    ) -> Arc<TopologyGeometryResolverLayerProxy> {
        let layer = Arc::new(TopologyGeometryResolverLayerProxy::new(
            &self.context,
            self.reconstruction_layer_or_default(reconstruction_layer),
        ));
        self.insert(layer.clone());
        layer
    }

    pub fn add_topology_network_resolver_layer(
        &mut self,
        reconstruction_layer: Option<Arc<ReconstructionLayerProxy>>,
    ) -> Arc<TopologyNetworkResolverLayerProxy> {
        let layer = Arc::new(TopologyNetworkResolverLayerProxy::new(
            &self.context,
            self.reconstruction_layer_or_default(reconstruction_layer),
        ));
        self.insert(layer.clone());
        layer
    }

    pub fn add_raster_layer(&mut self) -> Arc<RasterLayerProxy> {
        let layer = Arc::new(RasterLayerProxy::new(&self.context));
        self.insert(layer.clone());
        layer
    }

    pub fn add_scalar_coverage_layer(&mut self) -> Arc<ReconstructScalarCoverageLayerProxy> {
        let layer = Arc::new(ReconstructScalarCoverageLayerProxy::new(&self.context));
        self.insert(layer.clone());
        layer
    }

    pub fn add_velocity_field_calculator_layer(
        &mut self,
    ) -> Arc<VelocityFieldCalculatorLayerProxy> {
        let layer = Arc::new(VelocityFieldCalculatorLayerProxy::new(&self.context));
        self.insert(layer.clone());
        layer
    }

    /// Drop a layer from the graph. Downstream proxies still holding it keep
    /// it alive until they are reconnected. The default reconstruction layer
    /// cannot be removed.
    pub fn remove_layer(&mut self, id: LayerProxyId) -> bool {
        if id == self.default_reconstruction_layer.layer_proxy_id() {
            return false;
        }
        let before = self.layers.len();
        self.layers.retain(|layer| layer.handle.layer_proxy_id() != id);
        if before == self.layers.len() {
            return false;
        }
        // A topology layer whose explicit connections all went away falls
        // back to the default.
        self.section_connections.remove(&id);
        self.section_connections.retain(|_, connected| {
            connected.retain(|layer| layer.layer_proxy_id() != id);
            !connected.is_empty()
        });
        self.line_connections.remove(&id);
        self.line_connections.retain(|_, connected| {
            connected.retain(|layer| layer.layer_proxy_id() != id);
            !connected.is_empty()
        });
        tracing::debug!(layer = %id, "removed layer");
        self.update_topology_connections();
        true
    }

    /// Returns false if no layer has `id`.
    pub fn set_layer_active(&mut self, id: LayerProxyId, active: bool) -> bool {
        let Some(layer) = self
            .layers
            .iter_mut()
            .find(|layer| layer.handle.layer_proxy_id() == id)
        else {
            return false;
        };
        if layer.active != active {
            layer.active = active;
            self.update_topology_connections();
        }
        true
    }

    pub fn is_layer_active(&self, id: LayerProxyId) -> bool {
        self.layers
            .iter()
            .any(|layer| layer.active && layer.handle.layer_proxy_id() == id)
    }

    /// Connect a topology layer to exactly `section_layers`. An empty list
    /// restores the default of every active reconstruct layer.
    pub fn connect_topological_section_layers(
        &mut self,
        topology_layer: LayerProxyId,
        section_layers: Vec<Arc<ReconstructLayerProxy>>,
    ) {
        if section_layers.is_empty() {
            self.section_connections.remove(&topology_layer);
        } else {
            self.section_connections.insert(topology_layer, section_layers);
        }
        self.update_topology_connections();
    }

    /// Connect a topology layer to exactly `line_layers` for the resolved
    /// lines its boundaries or networks may use. An empty list restores the
    /// default of every active geometry resolver layer.
    pub fn connect_resolved_line_layers(
        &mut self,
        topology_layer: LayerProxyId,
        line_layers: Vec<Arc<TopologyGeometryResolverLayerProxy>>,
    ) {
        if line_layers.is_empty() {
            self.line_connections.remove(&topology_layer);
        } else {
            self.line_connections.insert(topology_layer, line_layers);
        }
        self.update_topology_connections();
    }

    pub fn layer_proxies(&self) -> impl Iterator<Item = &LayerProxyHandle> {
        self.layers.iter().map(|layer| &layer.handle)
    }

    pub fn find_layer_proxy<T: DerivedLayerProxy>(&self, id: LayerProxyId) -> Option<Arc<T>> {
        self.layers
            .iter()
            .find(|layer| layer.handle.layer_proxy_id() == id)
            .and_then(|layer| get_layer_proxy_derived_type::<T>(&layer.handle))
    }

    /// Every layer of type `T`, active or not, in insertion order.
    pub fn layer_proxies_of_type<T: DerivedLayerProxy>(&self) -> Vec<Arc<T>> {
        self.layers
            .iter()
            .filter_map(|layer| get_layer_proxy_derived_type::<T>(&layer.handle))
            .collect()
    }

    pub fn reconstruction_time(&self) -> ReconstructionTime {
        self.reconstruction_time
    }

    /// Set every layer's current time. Cached results are untouched.
    pub fn set_reconstruction_time(&mut self, time: ReconstructionTime) {
        self.reconstruction_time = time;
        for layer in &self.layers {
            layer.handle.set_current_reconstruction_time(time);
        }
        tracing::debug!(%time, layers = self.layers.len(), "set reconstruction time");
    }

    fn reconstruction_layer_or_default(
        &self,
        layer: Option<Arc<ReconstructionLayerProxy>>,
    ) -> Arc<ReconstructionLayerProxy> {
        layer.unwrap_or_else(|| self.default_reconstruction_layer.clone())
    }

    fn insert<P: LayerProxy + 'static>(&mut self, proxy: Arc<P>) {
        proxy.set_current_reconstruction_time(self.reconstruction_time);
        tracing::debug!(layer = %proxy.layer_proxy_id(), "added layer");
        self.layers.push(Layer {
            handle: proxy,
            active: true,
        });
        self.update_topology_connections();
    }

    fn update_topology_connections(&self) {
        let active: Vec<&LayerProxyHandle> = self
            .layers
            .iter()
            .filter(|layer| layer.active)
            .map(|layer| &layer.handle)
            .collect();
        let default_sections: Vec<Arc<ReconstructLayerProxy>> = active
            .iter()
            .filter_map(|handle| get_layer_proxy_derived_type(handle))
            .collect();
        let default_lines: Vec<Arc<TopologyGeometryResolverLayerProxy>> = active
            .iter()
            .filter_map(|handle| get_layer_proxy_derived_type(handle))
            .collect();
        let mut connector = TopologyLayerConnector {
            section_connections: &self.section_connections,
            line_connections: &self.line_connections,
            default_sections: &default_sections,
            default_lines: &default_lines,
        };
        for layer in &self.layers {
            layer.handle.clone().accept_visitor(&mut connector);
        }
    }
}

impl Default for ReconstructGraph {
    fn default() -> Self {
        Self::new(EngineContext::default())
    }
}

/// Sets the section and resolved-line layers of each topology layer it
/// visits.
struct TopologyLayerConnector<'a> {
    section_connections: &'a HashMap<LayerProxyId, Vec<Arc<ReconstructLayerProxy>>>,
    line_connections: &'a HashMap<LayerProxyId, Vec<Arc<TopologyGeometryResolverLayerProxy>>>,
    default_sections: &'a [Arc<ReconstructLayerProxy>],
    default_lines: &'a [Arc<TopologyGeometryResolverLayerProxy>],
}

impl TopologyLayerConnector<'_> {
    fn section_layers(&self, topology_layer: LayerProxyId) -> Vec<Arc<ReconstructLayerProxy>> {
        self.section_connections
            .get(&topology_layer)
            .map_or_else(|| self.default_sections.to_vec(), Clone::clone)
    }

    /// Geometry resolvers skip themselves when given these.
    fn line_layers(
        &self,
        topology_layer: LayerProxyId,
    ) -> Vec<Arc<TopologyGeometryResolverLayerProxy>> {
        self.line_connections
            .get(&topology_layer)
            .map_or_else(|| self.default_lines.to_vec(), Clone::clone)
    }
}

impl LayerProxyVisitor for TopologyLayerConnector<'_> {
    fn visit_topology_geometry_resolver_layer_proxy(
        &mut self,
        proxy: Arc<TopologyGeometryResolverLayerProxy>,
    ) {
        let id = proxy.layer_proxy_id();
        proxy.set_topological_section_layer_proxies(self.section_layers(id));
        proxy.set_resolved_line_layer_proxies(self.line_layers(id));
    }

    fn visit_topology_network_resolver_layer_proxy(
        &mut self,
        proxy: Arc<TopologyNetworkResolverLayerProxy>,
    ) {
        let id = proxy.layer_proxy_id();
        proxy.set_topological_section_layer_proxies(self.section_layers(id));
        proxy.set_resolved_line_layer_proxies(self.line_layers(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(layers: &[Arc<ReconstructLayerProxy>]) -> Vec<LayerProxyId> {
        let mut ids: Vec<_> = layers.iter().map(|layer| layer.layer_proxy_id()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_topology_layers_default_to_active_reconstruct_layers() {
        let mut graph = ReconstructGraph::default();
        let topology = graph.add_topology_geometry_resolver_layer(None);
        let a = graph.add_reconstruct_layer(None);
        let b = graph.add_reconstruct_layer(None);

        let expected = ids(&[a.clone(), b.clone()]);
        assert_eq!(ids(&topology.get_topological_section_layer_proxies()), expected);

        graph.set_layer_active(b.layer_proxy_id(), false);
        assert_eq!(
            ids(&topology.get_topological_section_layer_proxies()),
            vec![a.layer_proxy_id()]
        );

        graph.remove_layer(a.layer_proxy_id());
        assert!(topology.get_topological_section_layer_proxies().is_empty());
    }

    #[test]
    fn test_explicit_section_connections_override_default() {
        let mut graph = ReconstructGraph::default();
        let network = graph.add_topology_network_resolver_layer(None);
        let a = graph.add_reconstruct_layer(None);
        let b = graph.add_reconstruct_layer(None);

        graph.connect_topological_section_layers(network.layer_proxy_id(), vec![b.clone()]);
        assert_eq!(
            ids(&network.get_topological_section_layer_proxies()),
            vec![b.layer_proxy_id()]
        );

        graph.connect_topological_section_layers(network.layer_proxy_id(), Vec::new());
        assert_eq!(
            ids(&network.get_topological_section_layer_proxies()),
            ids(&[a, b])
        );
    }

    fn line_ids(layers: &[Arc<TopologyGeometryResolverLayerProxy>]) -> Vec<LayerProxyId> {
        let mut ids: Vec<_> = layers.iter().map(|layer| layer.layer_proxy_id()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_resolved_line_layers_follow_geometry_layers() {
        let mut graph = ReconstructGraph::default();
        let network = graph.add_topology_network_resolver_layer(None);
        let a = graph.add_topology_geometry_resolver_layer(None);
        let b = graph.add_topology_geometry_resolver_layer(None);

        assert_eq!(
            line_ids(&network.get_resolved_line_layer_proxies()),
            line_ids(&[a.clone(), b.clone()])
        );
        // A geometry layer never takes lines from itself.
        assert_eq!(
            line_ids(&a.get_resolved_line_layer_proxies()),
            vec![b.layer_proxy_id()]
        );

        graph.set_layer_active(b.layer_proxy_id(), false);
        assert_eq!(
            line_ids(&network.get_resolved_line_layer_proxies()),
            vec![a.layer_proxy_id()]
        );
        assert!(a.get_resolved_line_layer_proxies().is_empty());

        graph.set_layer_active(b.layer_proxy_id(), true);
        graph.connect_resolved_line_layers(network.layer_proxy_id(), vec![b.clone()]);
        assert_eq!(
            line_ids(&network.get_resolved_line_layer_proxies()),
            vec![b.layer_proxy_id()]
        );

        graph.remove_layer(b.layer_proxy_id());
        assert_eq!(
            line_ids(&network.get_resolved_line_layer_proxies()),
            vec![a.layer_proxy_id()]
        );
    }

    #[test]
    fn test_find_layer_proxy_by_type() {
        let mut graph = ReconstructGraph::default();
        let raster = graph.add_raster_layer();
        let id = raster.layer_proxy_id();

        assert!(graph.find_layer_proxy::<RasterLayerProxy>(id).is_some());
        assert!(graph.find_layer_proxy::<ReconstructLayerProxy>(id).is_none());
        assert_eq!(graph.layer_proxies_of_type::<ReconstructionLayerProxy>().len(), 1);

        let default_id = graph.default_reconstruction_layer().layer_proxy_id();
        assert!(!graph.remove_layer(default_id));
        assert!(graph.remove_layer(id));
        assert!(graph.find_layer_proxy::<RasterLayerProxy>(id).is_none());
    }

    #[test]
    fn test_reconstruction_time_reaches_every_layer() {
        let mut graph = ReconstructGraph::default();
        let reconstruct = graph.add_reconstruct_layer(None);
        let velocity = graph.add_velocity_field_calculator_layer();
        graph.set_reconstruction_time(50.0.into());

        assert_eq!(reconstruct.get_current_reconstruction_time(), 50.0.into());
        assert_eq!(velocity.get_current_reconstruction_time(), 50.0.into());

        // Layers added later start at the graph's time.
        let scalar = graph.add_scalar_coverage_layer();
        assert_eq!(scalar.get_current_reconstruction_time(), 50.0.into());
    }
}
