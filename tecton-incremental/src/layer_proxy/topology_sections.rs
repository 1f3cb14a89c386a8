//! Inputs shared by the topology resolver layers
//!
//! Both resolver layers consume a reconstruction layer, their own topological
//! feature collections and a set of reconstruct layers supplying sections.
//! Section layers are numerous and mostly unrelated to any one topology, so a
//! change in one only discards cached resolutions when that layer contributed
//! a section or now contains a referenced feature.

use super::input::{FeatureCollectionInputs, InputLayerProxy, InputLayerProxySequence};
use super::reconstruct::ReconstructLayerProxy;
use super::reconstruction::{ReconstructionLayerProxy, ReconstructionTreeCreator};
use super::LayerProxy;
use crate::reconstructed::ReconstructedFeatureGeometry;
use crate::rfg_index::ReconstructedGeometryIndex;
use crate::topology::TopologicalFeature;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tecton_model::{FeatureCollectionHandle, TopologyKind};
use tecton_types::{FeatureId, LayerProxyId, ReconstructionTime};

/// The section layers cached resolutions depend on.
#[derive(Debug, Default)]
pub struct DependentTopologicalSectionLayers {
    contributing: HashSet<LayerProxyId>,
    referenced: HashSet<FeatureId>,
}

impl DependentTopologicalSectionLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate the dependencies of one more resolution.
    pub fn record(
        &mut self,
        referenced: impl IntoIterator<Item = FeatureId>,
        contributing: impl IntoIterator<Item = LayerProxyId>,
    ) {
        self.referenced.extend(referenced);
        self.contributing.extend(contributing);
    }

    pub fn clear(&mut self) {
        self.contributing.clear();
        self.referenced.clear();
    }

    pub fn is_contributing(&self, layer: LayerProxyId) -> bool {
        self.contributing.contains(&layer)
    }

    /// Whether a change in `layer` can alter a cached resolution.
    pub fn is_affected_by(&self, layer: &ReconstructLayerProxy) -> bool {
        self.is_contributing(layer.layer_proxy_id())
            || (!self.referenced.is_empty() && layer.contains_any_feature(&self.referenced))
    }
}

/// Topological features of `kinds` currently in `collections`.
pub fn read_topological_features(
    collections: &[FeatureCollectionHandle],
    kinds: &[TopologyKind],
) -> Vec<TopologicalFeature> {
    collections
        .iter()
        .flat_map(FeatureCollectionHandle::features)
        .filter_map(|handle| {
            let snapshot = handle.read();
            let kind = snapshot.feature_type.topology_kind()?;
            kinds.contains(&kind).then(|| TopologicalFeature {
                feature: handle.weak_ref(),
                snapshot: Arc::new(snapshot.clone()),
            })
        })
        .collect()
}

/// Ids referenced by those of `features` with one of `kinds`.
pub fn referenced_feature_ids(
    features: &[TopologicalFeature],
    kinds: &[TopologyKind],
) -> HashSet<FeatureId> {
    features
        .iter()
        .filter(|feature| feature.kind().is_some_and(|kind| kinds.contains(&kind)))
        .filter_map(|feature| feature.snapshot.topology.as_ref())
        .flat_map(|definition| definition.referenced_feature_ids().cloned())
        .collect()
}

/// The inputs common to every topology resolver layer.
#[derive(Debug)]
pub struct TopologyLayerInputs {
    kinds: &'static [TopologyKind],
    reconstruction_layer: InputLayerProxy<ReconstructionLayerProxy>,
    feature_collections: FeatureCollectionInputs,
    features_modified: bool,
    features: Arc<Vec<TopologicalFeature>>,
    section_layers: InputLayerProxySequence<ReconstructLayerProxy>,
    dependencies: DependentTopologicalSectionLayers,
}

impl TopologyLayerInputs {
    /// Inputs resolving topologies of `kinds`.
    pub fn new(
        kinds: &'static [TopologyKind],
        reconstruction_layer: Arc<ReconstructionLayerProxy>,
    ) -> Self {
        TopologyLayerInputs {
            kinds,
            reconstruction_layer: InputLayerProxy::new(reconstruction_layer),
            feature_collections: FeatureCollectionInputs::new(),
            features_modified: true,
            features: Arc::new(Vec::new()),
            section_layers: InputLayerProxySequence::new(),
            dependencies: DependentTopologicalSectionLayers::new(),
        }
    }

    /// Poll every input. Returns true when cached resolutions must be
    /// discarded; every input is up to date afterwards.
    pub fn check(&mut self) -> bool {
        let mut stale = false;
        if self.features_modified || !self.feature_collections.is_up_to_date() {
            self.features = Arc::new(read_topological_features(
                &self.feature_collections.collections(),
                self.kinds,
            ));
            self.feature_collections.set_up_to_date();
            self.features_modified = false;
            stale = true;
        }

        if !self.reconstruction_layer.is_up_to_date() {
            self.reconstruction_layer.set_up_to_date();
            stale = true;
        }

        if !stale {
            stale = self.section_layers.stale_inputs().any(|input| {
                let affected = self.dependencies.is_affected_by(input.input_layer_proxy());
                if !affected {
                    tracing::trace!(
                        section_layer = %input.input_layer_proxy().layer_proxy_id(),
                        "ignoring unrelated section layer change"
                    );
                }
                affected
            });
        }
        self.section_layers.set_up_to_date();

        if stale {
            self.dependencies.clear();
        }
        stale
    }

    pub fn features(&self) -> Arc<Vec<TopologicalFeature>> {
        self.features.clone()
    }

    pub fn referenced_feature_ids(&self, kinds: &[TopologyKind]) -> HashSet<FeatureId> {
        referenced_feature_ids(&self.features, kinds)
    }

    /// Reconstructed sections referenced by any topology of this layer,
    /// drawn from the section layers in order. Records the dependencies.
    pub fn gather_sections(
        &mut self,
        index: &ReconstructedGeometryIndex,
        time: ReconstructionTime,
    ) -> HashMap<FeatureId, Arc<ReconstructedFeatureGeometry>> {
        let referenced = self.referenced_feature_ids(self.kinds);
        let mut sections = HashMap::new();
        let mut contributing = HashSet::new();
        if !referenced.is_empty() {
            for layer in self.section_layers.input_layer_proxies() {
                let batch = layer.get_reconstructed_topological_sections(&referenced, time);
                for feature_id in &referenced {
                    if sections.contains_key(feature_id) {
                        continue;
                    }
                    let found = index
                        .find(feature_id, &[batch.reconstruct_handle])
                        .into_iter()
                        .min_by_key(|rfg| rfg.property_index());
                    if let Some(rfg) = found {
                        sections.insert(feature_id.clone(), rfg);
                        contributing.insert(layer.layer_proxy_id());
                    }
                }
            }
        }
        self.dependencies.record(referenced, contributing);
        sections
    }

    pub fn reconstruction_layer(&self) -> &Arc<ReconstructionLayerProxy> {
        self.reconstruction_layer.input_layer_proxy()
    }

    pub fn reconstruction_tree_creator(&self) -> ReconstructionTreeCreator {
        let layer = self.reconstruction_layer();
        layer.reconstruction_tree_creator(Some(layer.get_current_anchor_plate_id()))
    }

    /// Returns whether the reconstruction layer changed.
    pub fn set_reconstruction_layer(&mut self, proxy: Arc<ReconstructionLayerProxy>) -> bool {
        if Arc::ptr_eq(self.reconstruction_layer.input_layer_proxy(), &proxy) {
            return false;
        }
        self.reconstruction_layer = InputLayerProxy::new(proxy);
        true
    }

    pub fn feature_collections(&self) -> Vec<FeatureCollectionHandle> {
        self.feature_collections.collections()
    }

    pub fn add_feature_collection(&mut self, collection: FeatureCollectionHandle) {
        if self.feature_collections.add(collection) {
            self.features_modified = true;
        }
    }

    pub fn remove_feature_collection(&mut self, collection: &FeatureCollectionHandle) {
        if self.feature_collections.remove(collection) {
            self.features_modified = true;
        }
    }

    pub fn modified_feature_collection(&mut self) {
        self.features_modified = true;
    }

    pub fn section_layers(&self) -> Vec<Arc<ReconstructLayerProxy>> {
        self.section_layers.input_layer_proxies().cloned().collect()
    }

    /// Returns whether the set of section layers changed.
    pub fn set_section_layers(
        &mut self,
        layers: impl IntoIterator<Item = Arc<ReconstructLayerProxy>>,
    ) -> bool {
        self.section_layers.set_input_layer_proxies(layers)
    }
}
