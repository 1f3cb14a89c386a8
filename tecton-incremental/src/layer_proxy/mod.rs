//! Layer proxies
//!
//! A layer proxy is a demand-computed, cached node of the reconstruction
//! dependency graph. Every proxy follows the same pattern when asked for its
//! output at a time:
//!
//! 1. compare the requested key against the cached key
//! 2. check every input wrapper with `is_up_to_date()`
//! 3. on a miss or a stale input, pull from the inputs, recompute, cache the
//!    result, `set_up_to_date()` every input and invalidate the proxy's own
//!    subject token if cached results were discarded
//! 4. return the cached result
//!
//! Proxies keep their state behind a mutex for interior mutability only; the
//! graph is pulled synchronously on the caller's thread.

pub mod input;
pub mod raster;
pub mod reconstruct;
pub mod reconstruction;
pub mod scalar_coverage;
pub mod topology_geometry;
pub mod topology_network;
pub mod topology_sections;
pub mod velocity;

use raster::RasterLayerProxy;
use reconstruct::ReconstructLayerProxy;
use reconstruction::ReconstructionLayerProxy;
use scalar_coverage::ReconstructScalarCoverageLayerProxy;
use std::fmt;
use std::sync::Arc;
use tecton_types::{LayerProxyId, SubjectToken};
use topology_geometry::TopologyGeometryResolverLayerProxy;
use topology_network::TopologyNetworkResolverLayerProxy;
use velocity::VelocityFieldCalculatorLayerProxy;

/// A node of the layer dependency graph.
pub trait LayerProxy: Send + Sync + fmt::Debug {
    fn layer_proxy_id(&self) -> LayerProxyId;

    /// The primary output token: changes whenever the proxy's output changes.
    fn get_subject_token(&self) -> SubjectToken;

    /// Double dispatch to the visitor method for the concrete proxy type.
    fn accept_visitor(self: Arc<Self>, visitor: &mut dyn LayerProxyVisitor);

    fn accept_const_visitor(&self, visitor: &mut dyn ConstLayerProxyVisitor);

    /// Update the proxy's convenience "current" time.
    fn set_current_reconstruction_time(&self, time: tecton_types::ReconstructionTime);
}

pub type LayerProxyHandle = Arc<dyn LayerProxy>;

/// Visits shared handles to concrete proxies. Every method defaults to
/// ignoring the proxy.
#[allow(unused_variables)]
pub trait LayerProxyVisitor {
    fn visit_reconstruction_layer_proxy(&mut self, proxy: Arc<ReconstructionLayerProxy>) {}

    fn visit_reconstruct_layer_proxy(&mut self, proxy: Arc<ReconstructLayerProxy>) {}

    fn visit_topology_geometry_resolver_layer_proxy(
        &mut self,
        proxy: Arc<TopologyGeometryResolverLayerProxy>,
    ) {
    }

    fn visit_topology_network_resolver_layer_proxy(
        &mut self,
        proxy: Arc<TopologyNetworkResolverLayerProxy>,
    ) {
    }

    fn visit_raster_layer_proxy(&mut self, proxy: Arc<RasterLayerProxy>) {}

    fn visit_reconstruct_scalar_coverage_layer_proxy(
        &mut self,
        proxy: Arc<ReconstructScalarCoverageLayerProxy>,
    ) {
    }

    fn visit_velocity_field_calculator_layer_proxy(
        &mut self,
        proxy: Arc<VelocityFieldCalculatorLayerProxy>,
    ) {
    }
}

/// Visits borrowed concrete proxies.
#[allow(unused_variables)]
pub trait ConstLayerProxyVisitor {
    fn visit_reconstruction_layer_proxy(&mut self, proxy: &ReconstructionLayerProxy) {}

    fn visit_reconstruct_layer_proxy(&mut self, proxy: &ReconstructLayerProxy) {}

    fn visit_topology_geometry_resolver_layer_proxy(
        &mut self,
        proxy: &TopologyGeometryResolverLayerProxy,
    ) {
    }

    fn visit_topology_network_resolver_layer_proxy(
        &mut self,
        proxy: &TopologyNetworkResolverLayerProxy,
    ) {
    }

    fn visit_raster_layer_proxy(&mut self, proxy: &RasterLayerProxy) {}

    fn visit_reconstruct_scalar_coverage_layer_proxy(
        &mut self,
        proxy: &ReconstructScalarCoverageLayerProxy,
    ) {
    }

    fn visit_velocity_field_calculator_layer_proxy(
        &mut self,
        proxy: &VelocityFieldCalculatorLayerProxy,
    ) {
    }
}

/// A concrete proxy recovered by visiting a [`LayerProxyHandle`].
#[derive(Debug, Clone)]
pub enum VisitedLayerProxy {
    Reconstruction(Arc<ReconstructionLayerProxy>),
    Reconstruct(Arc<ReconstructLayerProxy>),
    TopologyGeometryResolver(Arc<TopologyGeometryResolverLayerProxy>),
    TopologyNetworkResolver(Arc<TopologyNetworkResolverLayerProxy>),
    Raster(Arc<RasterLayerProxy>),
    ReconstructScalarCoverage(Arc<ReconstructScalarCoverageLayerProxy>),
    VelocityFieldCalculator(Arc<VelocityFieldCalculatorLayerProxy>),
}

impl VisitedLayerProxy {
    /// Recover the concrete proxy behind `handle`.
    pub fn of(handle: &LayerProxyHandle) -> Option<VisitedLayerProxy> {
        let mut visitor = VisitedLayerProxyCollector(None);
        handle.clone().accept_visitor(&mut visitor);
        visitor.0
    }
}

struct VisitedLayerProxyCollector(Option<VisitedLayerProxy>);

impl LayerProxyVisitor for VisitedLayerProxyCollector {
    fn visit_reconstruction_layer_proxy(&mut self, proxy: Arc<ReconstructionLayerProxy>) {
        self.0 = Some(VisitedLayerProxy::Reconstruction(proxy));
    }

    fn visit_reconstruct_layer_proxy(&mut self, proxy: Arc<ReconstructLayerProxy>) {
        self.0 = Some(VisitedLayerProxy::Reconstruct(proxy));
    }

    fn visit_topology_geometry_resolver_layer_proxy(
        &mut self,
        proxy: Arc<TopologyGeometryResolverLayerProxy>,
    ) {
        self.0 = Some(VisitedLayerProxy::TopologyGeometryResolver(proxy));
    }

    fn visit_topology_network_resolver_layer_proxy(
        &mut self,
        proxy: Arc<TopologyNetworkResolverLayerProxy>,
    ) {
        self.0 = Some(VisitedLayerProxy::TopologyNetworkResolver(proxy));
    }

    fn visit_raster_layer_proxy(&mut self, proxy: Arc<RasterLayerProxy>) {
        self.0 = Some(VisitedLayerProxy::Raster(proxy));
    }

    fn visit_reconstruct_scalar_coverage_layer_proxy(
        &mut self,
        proxy: Arc<ReconstructScalarCoverageLayerProxy>,
    ) {
        self.0 = Some(VisitedLayerProxy::ReconstructScalarCoverage(proxy));
    }

    fn visit_velocity_field_calculator_layer_proxy(
        &mut self,
        proxy: Arc<VelocityFieldCalculatorLayerProxy>,
    ) {
        self.0 = Some(VisitedLayerProxy::VelocityFieldCalculator(proxy));
    }
}

/// A concrete layer proxy type that can be recovered from a handle.
pub trait DerivedLayerProxy: LayerProxy + Sized + 'static {
    fn from_visited(visited: VisitedLayerProxy) -> Option<Arc<Self>>;
}

macro_rules! derived_layer_proxy {
    ($proxy:ty, $variant:ident) => {
        impl DerivedLayerProxy for $proxy {
            fn from_visited(visited: VisitedLayerProxy) -> Option<Arc<Self>> {
                match visited {
                    VisitedLayerProxy::$variant(proxy) => Some(proxy),
                    _ => None,
                }
            }
        }
    };
}

derived_layer_proxy!(ReconstructionLayerProxy, Reconstruction);
derived_layer_proxy!(ReconstructLayerProxy, Reconstruct);
derived_layer_proxy!(TopologyGeometryResolverLayerProxy, TopologyGeometryResolver);
derived_layer_proxy!(TopologyNetworkResolverLayerProxy, TopologyNetworkResolver);
derived_layer_proxy!(RasterLayerProxy, Raster);
derived_layer_proxy!(ReconstructScalarCoverageLayerProxy, ReconstructScalarCoverage);
derived_layer_proxy!(VelocityFieldCalculatorLayerProxy, VelocityFieldCalculator);

/// The concrete proxy of type `T` behind `handle`, if it is one.
pub fn get_layer_proxy_derived_type<T: DerivedLayerProxy>(
    handle: &LayerProxyHandle,
) -> Option<Arc<T>> {
    VisitedLayerProxy::of(handle).and_then(T::from_visited)
}

/// Which of a proxy type's subject tokens an input polls.
///
/// Each proxy type has a small closed set of tokens. The scribe id of each
/// variant is part of the archive format and must never change meaning.
pub trait SubjectTokenSelector: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// The proxy's primary output token.
    const DEFAULT: Self;

    fn scribe_id(self) -> &'static str;

    fn from_scribe_id(id: &str) -> Option<Self>;
}

/// A proxy that can be the upstream end of an input wrapper.
pub trait InputLayer: LayerProxy + 'static {
    type Selector: SubjectTokenSelector;

    /// The token selected by `selector`, after polling the proxy's own inputs.
    fn subject_token(&self, selector: Self::Selector) -> SubjectToken;
}

macro_rules! subject_token_selector {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $id:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl $crate::layer_proxy::SubjectTokenSelector for $name {
            const DEFAULT: Self = $name::All;

            fn scribe_id(self) -> &'static str {
                match self {
                    $($name::$variant => $id,)+
                }
            }

            fn from_scribe_id(id: &str) -> Option<Self> {
                match id {
                    $($id => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

pub(crate) use subject_token_selector;
