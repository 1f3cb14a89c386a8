//! Reconstruct context
//!
//! Assigning a reconstruct method to each feature is expensive relative to
//! reconstructing it at a nearby time, so [`ReconstructContext::set_features`]
//! does the classification once and the `get_*` calls reuse it at every
//! requested time.
//!
//! Each present-day geometry property is identified by a
//! [`GeometryPropertyHandle`]. Handles are stable across calls to
//! `set_features` with the same features, and new features extend the handle
//! range without renumbering existing handles. They are only reassigned when a
//! previously seen geometry property disappears.

use crate::reconstruct_method::{
    MethodOutput, ReconstructMethod, ReconstructMethodContext, ReconstructMethodRegistry,
};
use crate::reconstructed::{
    ReconstructBatch, ReconstructHandle, ReconstructedFeature, ReconstructedFeatureGeometry,
    ReconstructedFeatureTimeSpan, Reconstruction, TimeSlotReconstruction,
};
use crate::rfg_index::ReconstructedGeometryIndex;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tecton_model::{
    Feature, FeatureCollectionHandle, FeatureHandle, GeometryOnSphere, WeakFeatureRef,
};
use tecton_types::{FeatureId, ReconstructionTime, TimeSpanRange};

/// Index of a present-day geometry in
/// [`ReconstructContext::get_present_day_feature_geometries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryPropertyHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryPropertyEntry {
    pub property_index: usize,
    pub handle: GeometryPropertyHandle,
}

/// A feature with an assigned reconstruct method.
#[derive(Debug, Clone)]
pub struct ReconstructableFeature {
    pub feature: WeakFeatureRef,
    pub method: ReconstructMethod,
    pub geometry_properties: Vec<GeometryPropertyEntry>,
    snapshot: Arc<Feature>,
}

impl ReconstructableFeature {
    pub fn feature_id(&self) -> &FeatureId {
        self.feature.feature_id()
    }

    /// The feature as it was when `set_features` was called.
    pub fn snapshot(&self) -> &Feature {
        &self.snapshot
    }

    fn handle_for(&self, property_index: usize) -> Option<GeometryPropertyHandle> {
        self.geometry_properties
            .iter()
            .find(|entry| entry.property_index == property_index)
            .map(|entry| entry.handle)
    }
}

type HandleKey = (FeatureId, usize);

/// Per-feature reconstruct method bound to one context state.
///
/// Remembers the method outputs for the last requested time so that several
/// batches at the same time only run the method once.
#[derive(Debug)]
struct MethodInstance {
    method: ReconstructMethod,
    feature: Arc<Feature>,
    last_outputs: Mutex<Option<(ReconstructionTime, Arc<Vec<MethodOutput>>)>>,
}

impl MethodInstance {
    fn outputs(
        &self,
        time: ReconstructionTime,
        context: &ReconstructMethodContext,
    ) -> Arc<Vec<MethodOutput>> {
        let mut last = self.last_outputs.lock();
        if let Some((cached_time, outputs)) = last.as_ref() {
            if *cached_time == time {
                return outputs.clone();
            }
        }
        let outputs = Arc::new(self.method.reconstruct(&self.feature, time, context));
        *last = Some((time, outputs.clone()));
        outputs
    }
}

#[derive(Debug, Default)]
struct StateInstances {
    generation: u64,
    instances: Vec<Option<Arc<MethodInstance>>>,
}

/// A reconstruct method context bound to the features of a
/// [`ReconstructContext`].
///
/// Method instances are built lazily on first use and rebuilt automatically
/// after the context's features change.
#[derive(Debug)]
pub struct ReconstructContextState {
    method_context: ReconstructMethodContext,
    instances: Mutex<StateInstances>,
}

impl ReconstructContextState {
    pub fn method_context(&self) -> &ReconstructMethodContext {
        &self.method_context
    }

    fn instance(
        &self,
        generation: u64,
        index: usize,
        feature: &ReconstructableFeature,
        num_features: usize,
    ) -> Arc<MethodInstance> {
        let mut state = self.instances.lock();
        if state.generation != generation || state.instances.len() != num_features {
            state.generation = generation;
            state.instances = vec![None; num_features];
        }
        state.instances[index]
            .get_or_insert_with(|| {
                Arc::new(MethodInstance {
                    method: feature.method,
                    feature: feature.snapshot.clone(),
                    last_outputs: Mutex::new(None),
                })
            })
            .clone()
    }
}

#[derive(Debug)]
pub struct ReconstructContext {
    registry: ReconstructMethodRegistry,
    index: Arc<ReconstructedGeometryIndex>,
    features: Vec<ReconstructableFeature>,
    generation: u64,
    handles: HashMap<HandleKey, GeometryPropertyHandle>,
    handle_keys: Vec<HandleKey>,
    present_day_geometries: Option<Arc<Vec<GeometryOnSphere>>>,
}

impl ReconstructContext {
    pub fn new(index: Arc<ReconstructedGeometryIndex>) -> Self {
        ReconstructContext {
            registry: ReconstructMethodRegistry::new(),
            index,
            features: Vec::new(),
            generation: 0,
            handles: HashMap::new(),
            handle_keys: Vec::new(),
            present_day_geometries: None,
        }
    }

    /// Classify the features of `collections`, in order.
    pub fn set_feature_collections(
        &mut self,
        collections: &[FeatureCollectionHandle],
    ) -> Vec<ReconstructableFeature> {
        self.set_features(collections.iter().flat_map(|collection| collection.features()))
    }

    /// Assign a reconstruct method and geometry property handles to every
    /// reconstructable feature. Features without a method are skipped.
    pub fn set_features(
        &mut self,
        features: impl IntoIterator<Item = FeatureHandle>,
    ) -> Vec<ReconstructableFeature> {
        let classified: Vec<(FeatureHandle, Arc<Feature>, ReconstructMethod)> = features
            .into_iter()
            .filter_map(|handle| {
                let snapshot = Arc::new(handle.read().clone());
                let method = self.registry.reconstruct_method_type(&snapshot)?;
                Some((handle, snapshot, method))
            })
            .collect();

        let keys: HashSet<HandleKey> = classified
            .iter()
            .flat_map(|(handle, snapshot, _)| {
                (0..snapshot.geometries.len()).map(|index| (handle.feature_id().clone(), index))
            })
            .collect();
        if !self.handle_keys.iter().all(|key| keys.contains(key)) {
            tracing::debug!("geometry properties removed; reassigning handles");
            self.handles.clear();
            self.handle_keys.clear();
        }

        self.features = classified
            .into_iter()
            .map(|(handle, snapshot, method)| {
                let geometry_properties = (0..snapshot.geometries.len())
                    .map(|property_index| GeometryPropertyEntry {
                        property_index,
                        handle: self.handle((handle.feature_id().clone(), property_index)),
                    })
                    .collect();
                ReconstructableFeature {
                    feature: handle.weak_ref(),
                    method,
                    geometry_properties,
                    snapshot,
                }
            })
            .collect();

        self.generation += 1;
        self.present_day_geometries = None;
        tracing::debug!(
            features = self.features.len(),
            handles = self.handle_keys.len(),
            "classified reconstructable features"
        );
        self.features.clone()
    }

    fn handle(&mut self, key: HandleKey) -> GeometryPropertyHandle {
        if let Some(handle) = self.handles.get(&key) {
            return *handle;
        }
        let handle = GeometryPropertyHandle(self.handle_keys.len());
        self.handle_keys.push(key.clone());
        self.handles.insert(key, handle);
        handle
    }

    pub fn reconstructable_features(&self) -> &[ReconstructableFeature] {
        &self.features
    }

    pub fn get_geometry_property_handle(
        &self,
        feature_id: &FeatureId,
        property_index: usize,
    ) -> Option<GeometryPropertyHandle> {
        self.handles
            .get(&(feature_id.clone(), property_index))
            .copied()
    }

    /// Present-day geometries indexed by [`GeometryPropertyHandle`].
    pub fn get_present_day_feature_geometries(&mut self) -> Arc<Vec<GeometryOnSphere>> {
        if let Some(geometries) = &self.present_day_geometries {
            return geometries.clone();
        }
        let by_key: HashMap<HandleKey, &GeometryOnSphere> = self
            .features
            .iter()
            .flat_map(|feature| {
                feature
                    .snapshot
                    .geometries
                    .iter()
                    .enumerate()
                    .map(|(index, property)| {
                        ((feature.feature_id().clone(), index), &property.geometry)
                    })
            })
            .collect();
        let geometries: Vec<GeometryOnSphere> = self
            .handle_keys
            .iter()
            .filter_map(|key| by_key.get(key).map(|geometry| (*geometry).clone()))
            .collect();
        debug_assert_eq!(geometries.len(), self.handle_keys.len());

        let geometries = Arc::new(geometries);
        self.present_day_geometries = Some(geometries.clone());
        geometries
    }

    /// Bind a method context to this context's features.
    pub fn create_context_state(
        &self,
        method_context: ReconstructMethodContext,
    ) -> Arc<ReconstructContextState> {
        Arc::new(ReconstructContextState {
            method_context,
            instances: Mutex::new(StateInstances::default()),
        })
    }

    fn reconstruct_feature(
        &self,
        state: &ReconstructContextState,
        index: usize,
        time: ReconstructionTime,
        reconstruct_handle: ReconstructHandle,
    ) -> Vec<Reconstruction> {
        let feature = &self.features[index];
        if !feature.feature.is_valid() {
            return Vec::new();
        }
        let instance = state.instance(self.generation, index, feature, self.features.len());
        let params = &state.method_context.reconstruct_params;
        if !instance.method.is_active(&instance.feature, time, params) {
            return Vec::new();
        }

        instance
            .outputs(time, &state.method_context)
            .iter()
            .filter_map(|output| {
                let handle = feature.handle_for(output.property_index)?;
                let rfg = Arc::new(ReconstructedFeatureGeometry {
                    feature: feature.feature.clone(),
                    property_index: output.property_index,
                    property_handle: handle,
                    geometry: output.geometry.clone(),
                    reconstruction_time: time,
                    reconstruct_handle,
                    reconstruct_method: feature.method,
                    reconstruction_plate_id: output.plate_id,
                    finite_rotation: output.rotation,
                    reconstruction_tree_creator: state
                        .method_context
                        .reconstruction_tree_creator
                        .clone(),
                });
                self.index.register(&rfg);
                Some(Reconstruction {
                    geometry_property_handle: handle,
                    rfg,
                })
            })
            .collect()
    }

    fn reconstruct_at(
        &self,
        state: &ReconstructContextState,
        time: ReconstructionTime,
        reconstruct_handle: ReconstructHandle,
        include: impl Fn(&ReconstructableFeature) -> bool,
    ) -> Vec<(usize, Vec<Reconstruction>)> {
        (0..self.features.len())
            .filter(|&index| include(&self.features[index]))
            .map(|index| {
                (
                    index,
                    self.reconstruct_feature(state, index, time, reconstruct_handle),
                )
            })
            .filter(|(_, reconstructions)| !reconstructions.is_empty())
            .collect()
    }

    pub fn get_reconstructed_feature_geometries(
        &self,
        state: &ReconstructContextState,
        time: ReconstructionTime,
    ) -> ReconstructBatch<Arc<ReconstructedFeatureGeometry>> {
        let reconstruct_handle = ReconstructHandle::next();
        let items = self
            .reconstruct_at(state, time, reconstruct_handle, |_| true)
            .into_iter()
            .flat_map(|(_, reconstructions)| reconstructions.into_iter().map(|r| r.rfg))
            .collect();
        ReconstructBatch {
            reconstruct_handle,
            items,
        }
    }

    pub fn get_reconstructions(
        &self,
        state: &ReconstructContextState,
        time: ReconstructionTime,
    ) -> ReconstructBatch<Reconstruction> {
        let reconstruct_handle = ReconstructHandle::next();
        let items = self
            .reconstruct_at(state, time, reconstruct_handle, |_| true)
            .into_iter()
            .flat_map(|(_, reconstructions)| reconstructions)
            .collect();
        ReconstructBatch {
            reconstruct_handle,
            items,
        }
    }

    pub fn get_reconstructed_features(
        &self,
        state: &ReconstructContextState,
        time: ReconstructionTime,
    ) -> ReconstructBatch<ReconstructedFeature> {
        let reconstruct_handle = ReconstructHandle::next();
        let items = self
            .reconstruct_at(state, time, reconstruct_handle, |_| true)
            .into_iter()
            .map(|(index, reconstructions)| ReconstructedFeature {
                feature: self.features[index].feature.clone(),
                reconstructions,
            })
            .collect();
        ReconstructBatch {
            reconstruct_handle,
            items,
        }
    }

    /// Like [`get_reconstructed_feature_geometries`] but only for features
    /// whose id is in `feature_ids`.
    ///
    /// [`get_reconstructed_feature_geometries`]: Self::get_reconstructed_feature_geometries
    pub fn get_reconstructed_topological_sections(
        &self,
        feature_ids: &HashSet<FeatureId>,
        state: &ReconstructContextState,
        time: ReconstructionTime,
    ) -> ReconstructBatch<Arc<ReconstructedFeatureGeometry>> {
        let reconstruct_handle = ReconstructHandle::next();
        let items = self
            .reconstruct_at(state, time, reconstruct_handle, |feature| {
                feature_ids.contains(feature.feature_id())
            })
            .into_iter()
            .flat_map(|(_, reconstructions)| reconstructions.into_iter().map(|r| r.rfg))
            .collect();
        ReconstructBatch {
            reconstruct_handle,
            items,
        }
    }

    fn reconstruct_time_span(
        &self,
        state: &ReconstructContextState,
        time_span: &TimeSpanRange,
        reconstruct_handle: ReconstructHandle,
    ) -> Vec<(ReconstructionTime, Vec<(usize, Vec<Reconstruction>)>)> {
        time_span
            .time_slots()
            .map(|time| {
                (
                    time,
                    self.reconstruct_at(state, time, reconstruct_handle, |_| true),
                )
            })
            .collect()
    }

    /// Reconstructed geometries at every slot of `time_span`, oldest first.
    pub fn get_reconstructed_feature_geometry_time_spans(
        &self,
        state: &ReconstructContextState,
        time_span: &TimeSpanRange,
    ) -> ReconstructBatch<TimeSlotReconstruction<Arc<ReconstructedFeatureGeometry>>> {
        let reconstruct_handle = ReconstructHandle::next();
        let items = self
            .reconstruct_time_span(state, time_span, reconstruct_handle)
            .into_iter()
            .map(|(time, features)| TimeSlotReconstruction {
                time,
                items: features
                    .into_iter()
                    .flat_map(|(_, reconstructions)| reconstructions.into_iter().map(|r| r.rfg))
                    .collect(),
            })
            .collect();
        ReconstructBatch {
            reconstruct_handle,
            items,
        }
    }

    pub fn get_reconstruction_time_spans(
        &self,
        state: &ReconstructContextState,
        time_span: &TimeSpanRange,
    ) -> ReconstructBatch<TimeSlotReconstruction<Reconstruction>> {
        let reconstruct_handle = ReconstructHandle::next();
        let items = self
            .reconstruct_time_span(state, time_span, reconstruct_handle)
            .into_iter()
            .map(|(time, features)| TimeSlotReconstruction {
                time,
                items: features
                    .into_iter()
                    .flat_map(|(_, reconstructions)| reconstructions)
                    .collect(),
            })
            .collect();
        ReconstructBatch {
            reconstruct_handle,
            items,
        }
    }

    /// Per-feature reconstructions over `time_span`; features inactive over
    /// the whole span are omitted.
    pub fn get_reconstructed_feature_time_spans(
        &self,
        state: &ReconstructContextState,
        time_span: &TimeSpanRange,
    ) -> ReconstructBatch<ReconstructedFeatureTimeSpan> {
        let reconstruct_handle = ReconstructHandle::next();
        let mut per_feature: Vec<Vec<TimeSlotReconstruction<Reconstruction>>> = self
            .features
            .iter()
            .map(|_| Vec::with_capacity(time_span.num_time_slots()))
            .collect();

        for time in time_span.time_slots() {
            for (index, slots) in per_feature.iter_mut().enumerate() {
                slots.push(TimeSlotReconstruction {
                    time,
                    items: self.reconstruct_feature(state, index, time, reconstruct_handle),
                });
            }
        }

        let items = per_feature
            .into_iter()
            .enumerate()
            .filter(|(_, slots)| slots.iter().any(|slot| !slot.items.is_empty()))
            .map(|(index, time_slots)| ReconstructedFeatureTimeSpan {
                feature: self.features[index].feature.clone(),
                time_slots,
            })
            .collect();
        ReconstructBatch {
            reconstruct_handle,
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineContext;
    use crate::layer_proxy::reconstruction::ReconstructionLayerProxy;
    use crate::reconstruct_method::ReconstructParams;
    use crate::test_fixtures::{point_feature, polyline_feature};
    use tecton_model::{FeatureType, PointOnSphere, TopologicalSectionRef, TopologyDefinition};

    struct Fixture {
        context: EngineContext,
        reconstruction: Arc<ReconstructionLayerProxy>,
        reconstruct_context: ReconstructContext,
    }

    fn fixture() -> Fixture {
        let context = EngineContext::default();
        let reconstruction = Arc::new(ReconstructionLayerProxy::new(&context));
        let reconstruct_context =
            ReconstructContext::new(context.reconstructed_geometry_index.clone());
        Fixture {
            context,
            reconstruction,
            reconstruct_context,
        }
    }

    impl Fixture {
        fn state(&self) -> Arc<ReconstructContextState> {
            self.reconstruct_context
                .create_context_state(ReconstructMethodContext::new(
                    self.reconstruction.reconstruction_tree_creator(None),
                    ReconstructParams::default(),
                ))
        }

        fn handle(&self, id: &str) -> Option<usize> {
            self.reconstruct_context
                .get_geometry_property_handle(&FeatureId::new(id), 0)
                .map(|handle| handle.0)
        }
    }

    #[test]
    fn test_handles_survive_additions_and_reset_on_removal() {
        let mut f = fixture();
        let coastlines = f.context.feature_store.create_feature_collection("coastlines");
        let a = coastlines.add_feature(point_feature("a", 0, 0.0, 0.0));
        let b = coastlines.add_feature(point_feature("b", 0, 5.0, 5.0));

        f.reconstruct_context.set_features([a.clone(), b.clone()]);
        assert_eq!((f.handle("a"), f.handle("b")), (Some(0), Some(1)));

        // A new feature listed first still extends the range.
        let c = coastlines.add_feature(point_feature("c", 0, 9.0, 9.0));
        f.reconstruct_context.set_features([c.clone(), a.clone(), b.clone()]);
        assert_eq!(
            (f.handle("a"), f.handle("b"), f.handle("c")),
            (Some(0), Some(1), Some(2))
        );

        f.reconstruct_context.set_features([c, a]);
        assert_eq!(f.handle("b"), None);
        assert_eq!(
            (f.handle("c"), f.handle("a")),
            (Some(0), Some(1)),
            "handles are reassigned in feature order once one disappears"
        );
    }

    #[test]
    fn test_present_day_geometries_follow_handle_order() {
        let mut f = fixture();
        let features = f.context.feature_store.create_feature_collection("features");
        let a = features.add_feature(point_feature("a", 0, 1.0, 2.0));
        f.reconstruct_context.set_features([a.clone()]);
        let first = f.reconstruct_context.get_present_day_feature_geometries();
        assert!(Arc::ptr_eq(
            &first,
            &f.reconstruct_context.get_present_day_feature_geometries()
        ));

        let line =
            features.add_feature(polyline_feature("line", 0, &[(0.0, 0.0), (0.0, 10.0)]));
        f.reconstruct_context.set_features([line, a]);
        let geometries = f.reconstruct_context.get_present_day_feature_geometries();
        assert!(!Arc::ptr_eq(&first, &geometries));
        assert_eq!(
            geometries.as_slice(),
            &[
                GeometryOnSphere::Point(PointOnSphere::from_lat_lon(1.0, 2.0)),
                GeometryOnSphere::Polyline(vec![
                    PointOnSphere::from_lat_lon(0.0, 0.0),
                    PointOnSphere::from_lat_lon(0.0, 10.0),
                ]),
            ]
        );
    }

    #[test]
    fn test_context_state_rebuilds_instances_after_set_features() {
        let mut f = fixture();
        let features = f.context.feature_store.create_feature_collection("features");
        let a = features.add_feature(point_feature("a", 0, 0.0, 0.0));
        f.reconstruct_context.set_features([a.clone()]);
        let state = f.state();

        let time = ReconstructionTime::from(10.0);
        let before = f
            .reconstruct_context
            .get_reconstructed_feature_geometries(&state, time);
        assert_eq!(before.len(), 1);

        features.modify_feature(&FeatureId::new("a"), |feature| {
            feature.geometries[0].geometry =
                GeometryOnSphere::Point(PointOnSphere::from_lat_lon(20.0, 30.0));
        });
        // Same state, same time: the method instances still see the old
        // snapshot until the features are set again.
        let stale = f
            .reconstruct_context
            .get_reconstructed_feature_geometries(&state, time);
        assert_eq!(
            stale.items[0].reconstructed_geometry(),
            before.items[0].reconstructed_geometry()
        );

        f.reconstruct_context.set_features([a]);
        let after = f
            .reconstruct_context
            .get_reconstructed_feature_geometries(&state, time);
        let moved = after.items[0].reconstructed_geometry().points()[0];
        let expected = PointOnSphere::from_lat_lon(20.0, 30.0);
        assert!((moved.x() - expected.x()).abs() < 1e-12);
        assert!((moved.y() - expected.y()).abs() < 1e-12);
        assert!((moved.z() - expected.z()).abs() < 1e-12);
        assert!(after.reconstruct_handle > stale.reconstruct_handle);
    }

    #[test]
    fn test_unreconstructable_and_inactive_features_yield_nothing() {
        let mut f = fixture();
        let features = f.context.feature_store.create_feature_collection("features");
        let topology = features.add_feature(
            Feature::with_id(FeatureId::new("plate"), FeatureType::TopologicalClosedPlateBoundary)
                .topology(TopologyDefinition {
                    sections: vec![TopologicalSectionRef::new(FeatureId::new("a"))],
                    interior: Vec::new(),
                }),
        );
        let young =
            features.add_feature(point_feature("young", 0, 0.0, 0.0).valid_between(5.0, 0.0));
        let a = features.add_feature(point_feature("a", 0, 3.0, 3.0));

        let classified = f.reconstruct_context.set_features([topology, young, a]);
        assert_eq!(classified.len(), 2);
        assert_eq!(f.handle("plate"), None);

        let state = f.state();
        let batch = f
            .reconstruct_context
            .get_reconstructed_features(&state, 50.0.into());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.items[0].feature.feature_id().as_str(), "a");

        let ids: HashSet<FeatureId> = [FeatureId::new("young")].into_iter().collect();
        let sections = f
            .reconstruct_context
            .get_reconstructed_topological_sections(&ids, &state, 1.0.into());
        assert_eq!(sections.len(), 1);
        assert_eq!(sections.items[0].feature_id().as_str(), "young");
    }
}
