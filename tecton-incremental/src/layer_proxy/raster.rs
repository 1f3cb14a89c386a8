//! Raster layer: band selection, age-grid masking and reconstruction
//!
//! Besides its primary token the layer advertises two narrower ones.
//! `RasterFeature` changes only when feature-level metadata (band names,
//! georeferencing) changes. `ProxiedRaster` changes whenever the raster
//! returned for the current time and band may differ, which includes moving
//! the current time across a time-sample boundary.

use super::input::{FeatureCollectionInputs, InputLayerProxySequence, OptionalInputLayerProxy};
use super::reconstruct::ReconstructLayerProxy;
use super::{
    subject_token_selector, ConstLayerProxyVisitor, InputLayer, LayerProxy, LayerProxyVisitor,
};
use crate::cache::{Insertion, KeyedCache};
use crate::engine::EngineContext;
use crate::metrics::ProxyMetrics;
use crate::reconstructed::ReconstructedFeatureGeometry;
use parking_lot::Mutex;
use std::sync::Arc;
use tecton_model::{
    FeatureCollectionHandle, GeometryKind, Georeferencing, PolygonMesh, ProxiedRaster,
    RasterProperty,
};
use tecton_types::{FeatureId, LayerProxyId, ReconstructionTime, SubjectToken};

subject_token_selector! {
    /// Subject tokens of a [`RasterLayerProxy`].
    pub enum RasterSubjectToken {
        All => "RasterLayerProxy::get_subject_token",
        ProxiedRaster => "RasterLayerProxy::get_proxied_raster_subject_token",
        RasterFeature => "RasterLayerProxy::get_raster_feature_subject_token",
    }
}

type RasterKey = (ReconstructionTime, String);

/// A reconstructed polygon carrying part of a raster.
#[derive(Debug, Clone)]
pub struct ReconstructedRasterPolygon {
    pub rfg: Arc<ReconstructedFeatureGeometry>,
    /// Triangulation of the polygon's present-day geometry.
    pub present_day_mesh: Option<PolygonMesh>,
}

/// A raster band at one time together with the polygons reconstructing it.
///
/// With no polygon layers connected the raster is not reconstructed and
/// `polygons` is empty.
#[derive(Debug)]
pub struct ReconstructedRaster {
    pub reconstruction_time: ReconstructionTime,
    pub proxied_raster: Arc<ProxiedRaster>,
    pub georeferencing: Option<Georeferencing>,
    pub polygons: Vec<ReconstructedRasterPolygon>,
}

#[derive(Debug)]
struct RasterFeatureInput {
    collection: FeatureCollectionInputs,
    feature_id: Option<FeatureId>,
    modified: bool,
    raster: Option<Arc<RasterProperty>>,
}

impl RasterFeatureInput {
    fn read(&self) -> Option<Arc<RasterProperty>> {
        let feature_id = self.feature_id.as_ref()?;
        self.collection.collections().iter().find_map(|collection| {
            let handle = collection.find_feature(feature_id)?;
            let raster = handle.read().raster.clone()?;
            Some(Arc::new(raster))
        })
    }
}

#[derive(Debug)]
struct RasterState {
    raster_feature: RasterFeatureInput,
    age_grid_layer: OptionalInputLayerProxy<RasterLayerProxy>,
    normal_map_layer: OptionalInputLayerProxy<RasterLayerProxy>,
    polygon_layers: InputLayerProxySequence<ReconstructLayerProxy>,
    current_reconstruction_time: ReconstructionTime,
    current_band_name: Option<String>,
    proxied_rasters: KeyedCache<RasterKey, Option<Arc<ProxiedRaster>>>,
    reconstructed_rasters: KeyedCache<RasterKey, Option<Arc<ReconstructedRaster>>>,
    subject_token: SubjectToken,
    proxied_raster_token: SubjectToken,
    raster_feature_token: SubjectToken,
}

impl RasterState {
    fn raster(&self) -> Option<&RasterProperty> {
        self.raster_feature.raster.as_deref()
    }

    fn current_band_name(&self) -> Option<String> {
        self.current_band_name
            .clone()
            .or_else(|| self.raster()?.band_names.first().cloned())
    }

    fn time_sample_index(&self, time: ReconstructionTime) -> Option<usize> {
        self.raster()?
            .time_samples
            .iter()
            .position(|sample| sample.valid_time.contains(time))
    }
}

/// Serves one raster feature, optionally masked and reconstructed.
#[derive(Debug)]
pub struct RasterLayerProxy {
    id: LayerProxyId,
    state: Mutex<RasterState>,
    metrics: ProxyMetrics,
}

impl RasterLayerProxy {
    pub fn new(context: &EngineContext) -> Self {
        let max_entries = context.config.reconstruct.max_cached_reconstructions;
        RasterLayerProxy {
            id: LayerProxyId::next(),
            state: Mutex::new(RasterState {
                raster_feature: RasterFeatureInput {
                    collection: FeatureCollectionInputs::new(),
                    feature_id: None,
                    modified: false,
                    raster: None,
                },
                age_grid_layer: OptionalInputLayerProxy::new(),
                normal_map_layer: OptionalInputLayerProxy::new(),
                polygon_layers: InputLayerProxySequence::new(),
                current_reconstruction_time: ReconstructionTime::PRESENT_DAY,
                current_band_name: None,
                proxied_rasters: KeyedCache::new(max_entries),
                reconstructed_rasters: KeyedCache::new(max_entries),
                subject_token: SubjectToken::new(),
                proxied_raster_token: SubjectToken::new(),
                raster_feature_token: SubjectToken::new(),
            }),
            metrics: ProxyMetrics::new("raster"),
        }
    }

    pub fn get_raster_band_names(&self) -> Vec<String> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state
            .raster()
            .map(|raster| raster.band_names.clone())
            .unwrap_or_default()
    }

    pub fn get_georeferencing(&self) -> Option<Georeferencing> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.raster()?.georeferencing
    }

    /// Band `band_name` of the time sample valid at `time`, masked by the
    /// age grid if one is connected.
    pub fn get_proxied_raster(
        &self,
        time: ReconstructionTime,
        band_name: &str,
    ) -> Option<Arc<ProxiedRaster>> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        self.proxied_raster(&mut state, time, band_name)
    }

    /// The current band at `time`.
    pub fn get_proxied_raster_for_current_band(
        &self,
        time: ReconstructionTime,
    ) -> Option<Arc<ProxiedRaster>> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        let band_name = state.current_band_name()?;
        self.proxied_raster(&mut state, time, &band_name)
    }

    pub fn get_current_proxied_raster(&self) -> Option<Arc<ProxiedRaster>> {
        let time = self.get_current_reconstruction_time();
        self.get_proxied_raster_for_current_band(time)
    }

    pub fn get_reconstructed_raster(
        &self,
        time: ReconstructionTime,
        band_name: &str,
    ) -> Option<Arc<ReconstructedRaster>> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);

        let key = (time, band_name.to_string());
        if let Some(cached) = state.reconstructed_rasters.get(&key) {
            self.metrics.record_hit();
            return cached;
        }

        self.metrics.record_miss();
        let reconstructed = self
            .proxied_raster(&mut state, time, band_name)
            .map(|proxied_raster| {
                let polygons = state
                    .polygon_layers
                    .input_layer_proxies()
                    .flat_map(|layer| reconstructed_polygons(layer, time))
                    .collect();
                Arc::new(ReconstructedRaster {
                    reconstruction_time: time,
                    proxied_raster,
                    georeferencing: state.raster().and_then(|raster| raster.georeferencing),
                    polygons,
                })
            });
        if state.reconstructed_rasters.insert(key, reconstructed.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        reconstructed
    }

    pub fn get_current_raster_band_name(&self) -> Option<String> {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.current_band_name()
    }

    pub fn set_current_raster_band_name(&self, band_name: impl Into<String>) {
        let band_name = band_name.into();
        let mut state = self.state.lock();
        if state.current_band_name.as_deref() == Some(band_name.as_str()) {
            return;
        }
        state.current_band_name = Some(band_name);
        state.proxied_raster_token.invalidate();
        state.subject_token.invalidate();
    }

    pub fn get_current_reconstruction_time(&self) -> ReconstructionTime {
        self.state.lock().current_reconstruction_time
    }

    /// Serve the raster property of `feature_id` in `collection`, or nothing.
    pub fn set_current_raster_feature(
        &self,
        raster_feature: Option<(FeatureCollectionHandle, FeatureId)>,
    ) {
        let mut state = self.state.lock();
        let input = &mut state.raster_feature;
        input.collection = FeatureCollectionInputs::new();
        input.feature_id = None;
        if let Some((collection, feature_id)) = raster_feature {
            input.collection.add(collection);
            input.feature_id = Some(feature_id);
        }
        input.modified = true;
    }

    pub fn modified_raster_feature(&self) {
        self.state.lock().raster_feature.modified = true;
    }

    pub fn get_age_grid_layer_proxy(&self) -> Option<Arc<RasterLayerProxy>> {
        self.state.lock().age_grid_layer.get_input_layer_proxy().cloned()
    }

    /// Mask pixels whose age is younger than the reconstruction time.
    pub fn set_age_grid_layer_proxy(&self, proxy: Option<Arc<RasterLayerProxy>>) {
        let proxy = proxy.filter(|proxy| proxy.id != self.id);
        self.state.lock().age_grid_layer.set_input_layer_proxy(proxy);
    }

    pub fn get_normal_map_layer_proxy(&self) -> Option<Arc<RasterLayerProxy>> {
        self.state.lock().normal_map_layer.get_input_layer_proxy().cloned()
    }

    pub fn set_normal_map_layer_proxy(&self, proxy: Option<Arc<RasterLayerProxy>>) {
        let proxy = proxy.filter(|proxy| proxy.id != self.id);
        self.state.lock().normal_map_layer.set_input_layer_proxy(proxy);
    }

    pub fn get_reconstructed_polygon_layer_proxies(&self) -> Vec<Arc<ReconstructLayerProxy>> {
        self.state.lock().polygon_layers.input_layer_proxies().cloned().collect()
    }

    pub fn set_reconstructed_polygon_layer_proxies(
        &self,
        layers: impl IntoIterator<Item = Arc<ReconstructLayerProxy>>,
    ) {
        let mut state = self.state.lock();
        if state.polygon_layers.set_input_layer_proxies(layers) {
            state.reconstructed_rasters.clear();
            state.subject_token.invalidate();
        }
    }

    pub fn get_proxied_raster_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.proxied_raster_token.clone()
    }

    pub fn get_raster_feature_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.raster_feature_token.clone()
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    fn proxied_raster(
        &self,
        state: &mut RasterState,
        time: ReconstructionTime,
        band_name: &str,
    ) -> Option<Arc<ProxiedRaster>> {
        let key = (time, band_name.to_string());
        if let Some(cached) = state.proxied_rasters.get(&key) {
            return cached;
        }

        let raster = state.raster()?.raster_at(time, band_name);
        let age_grid_layer = state.age_grid_layer.get_input_layer_proxy().cloned();
        let raster = match (raster, age_grid_layer) {
            (Some(band), Some(age_grid_layer)) => {
                match age_grid_layer.get_proxied_raster_for_current_band(time) {
                    Some(age_grid) => Some(Arc::new(mask_by_age_grid(&band, &age_grid, time))),
                    None => Some(band),
                }
            }
            (raster, _) => raster,
        };
        if state.proxied_rasters.insert(key, raster.clone()) == Insertion::Evicted {
            self.metrics.record_eviction();
        }
        raster
    }

    fn check_input_layer_proxies(&self, state: &mut RasterState) {
        let input = &mut state.raster_feature;
        if input.modified || !input.collection.is_up_to_date() {
            input.collection.set_up_to_date();
            input.modified = false;
            let raster = input.read();
            if raster != input.raster {
                let metadata_changed = match (&raster, &input.raster) {
                    (Some(new), Some(old)) => {
                        new.band_names != old.band_names || new.georeferencing != old.georeferencing
                    }
                    _ => true,
                };
                input.raster = raster;
                if metadata_changed {
                    state.raster_feature_token.invalidate();
                }
                self.invalidate_rasters(state);
                tracing::debug!(layer = %self.id, metadata_changed, "raster feature changed");
            }
        }

        if !state.age_grid_layer.is_up_to_date() {
            state.age_grid_layer.set_up_to_date();
            self.invalidate_rasters(state);
        }

        if !state.normal_map_layer.is_up_to_date() {
            state.normal_map_layer.set_up_to_date();
            state.subject_token.invalidate();
        }

        if !state.polygon_layers.is_up_to_date() {
            state.polygon_layers.set_up_to_date();
            if state.reconstructed_rasters.clear() {
                tracing::debug!(layer = %self.id, "discarded reconstructed rasters");
            }
            state.subject_token.invalidate();
            self.metrics.record_invalidation();
        }
    }

    fn invalidate_rasters(&self, state: &mut RasterState) {
        state.proxied_rasters.clear();
        state.reconstructed_rasters.clear();
        state.proxied_raster_token.invalidate();
        state.subject_token.invalidate();
        self.metrics.record_invalidation();
    }
}

fn reconstructed_polygons(
    layer: &Arc<ReconstructLayerProxy>,
    time: ReconstructionTime,
) -> Vec<ReconstructedRasterPolygon> {
    let meshes = layer.get_present_day_polygon_meshes();
    layer
        .get_reconstructed_feature_geometries(time)
        .items
        .iter()
        .filter(|rfg| rfg.reconstructed_geometry().kind() == GeometryKind::Polygon)
        .map(|rfg| ReconstructedRasterPolygon {
            rfg: rfg.clone(),
            present_day_mesh: meshes
                .get(rfg.geometry_property_handle().0)
                .cloned()
                .flatten(),
        })
        .collect()
}

/// Pixels whose age-grid age is younger than `time` did not exist yet and
/// become NaN. Mismatched grids leave the raster unmasked.
fn mask_by_age_grid(
    raster: &ProxiedRaster,
    age_grid: &ProxiedRaster,
    time: ReconstructionTime,
) -> ProxiedRaster {
    if raster.width != age_grid.width || raster.height != age_grid.height {
        tracing::warn!(
            raster = %raster.band_name,
            age_grid = %age_grid.band_name,
            "age grid dimensions differ from raster; not masking"
        );
        return raster.clone();
    }
    let values = raster
        .values
        .iter()
        .zip(&age_grid.values)
        .map(|(&value, &age)| {
            if f64::from(age) < time.value() {
                f32::NAN
            } else {
                value
            }
        })
        .collect();
    ProxiedRaster {
        values,
        ..raster.clone()
    }
}

impl LayerProxy for RasterLayerProxy {
    fn layer_proxy_id(&self) -> LayerProxyId {
        self.id
    }

    fn get_subject_token(&self) -> SubjectToken {
        let mut state = self.state.lock();
        self.check_input_layer_proxies(&mut state);
        state.subject_token.clone()
    }

    fn accept_visitor(self: Arc<Self>, visitor: &mut dyn LayerProxyVisitor) {
        visitor.visit_raster_layer_proxy(self);
    }

    fn accept_const_visitor(&self, visitor: &mut dyn ConstLayerProxyVisitor) {
        visitor.visit_raster_layer_proxy(self);
    }

    /// Crossing into another time sample changes the current proxied raster.
    fn set_current_reconstruction_time(&self, time: ReconstructionTime) {
        let mut state = self.state.lock();
        let previous = state.current_reconstruction_time;
        state.current_reconstruction_time = time;
        if state.time_sample_index(previous) != state.time_sample_index(time)
            || state.age_grid_layer.get_input_layer_proxy().is_some()
        {
            state.proxied_raster_token.invalidate();
            state.subject_token.invalidate();
        }
    }
}

impl InputLayer for RasterLayerProxy {
    type Selector = RasterSubjectToken;

    fn subject_token(&self, selector: RasterSubjectToken) -> SubjectToken {
        match selector {
            RasterSubjectToken::All => self.get_subject_token(),
            RasterSubjectToken::ProxiedRaster => self.get_proxied_raster_subject_token(),
            RasterSubjectToken::RasterFeature => self.get_raster_feature_subject_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer_proxy::reconstruction::ReconstructionLayerProxy;
    use crate::test_fixtures::polygon_feature;
    use tecton_model::{Feature, FeatureType, RasterTimeSample};
    use tecton_types::TimePeriod;

    fn band(name: &str, values: Vec<f32>) -> Arc<ProxiedRaster> {
        Arc::new(ProxiedRaster {
            band_name: name.to_string(),
            width: 2,
            height: 1,
            values,
        })
    }

    fn raster_feature(id: &str, samples: Vec<(TimePeriod, Vec<f32>)>) -> Feature {
        Feature::with_id(FeatureId::new(id), FeatureType::Raster).raster(RasterProperty {
            band_names: vec!["band".to_string()],
            georeferencing: Some(Georeferencing {
                top_left_lat: 90.0,
                top_left_lon: -180.0,
                pixel_width_degrees: 180.0,
                pixel_height_degrees: 180.0,
            }),
            time_samples: samples
                .into_iter()
                .map(|(valid_time, values)| RasterTimeSample {
                    valid_time,
                    bands: vec![band("band", values)],
                })
                .collect(),
        })
    }

    fn time_dependent() -> Feature {
        raster_feature(
            "topography",
            vec![
                (TimePeriod::new(10.0, 0.0), vec![1.0, 2.0]),
                (TimePeriod::new(100.0, 10.001), vec![3.0, 4.0]),
            ],
        )
    }

    fn layer_with(
        context: &EngineContext,
        feature: Feature,
    ) -> (Arc<RasterLayerProxy>, FeatureCollectionHandle) {
        let collection = context.feature_store.create_feature_collection("rasters");
        let id = collection.add_feature(feature).feature_id().clone();
        let layer = Arc::new(RasterLayerProxy::new(context));
        layer.set_current_raster_feature(Some((collection.clone(), id)));
        (layer, collection)
    }

    #[test]
    fn test_metadata_and_band_selection() {
        let context = EngineContext::default();
        let (layer, _) = layer_with(&context, time_dependent());
        assert_eq!(layer.get_raster_band_names(), vec!["band".to_string()]);
        assert!(layer.get_georeferencing().is_some());
        assert_eq!(layer.get_current_raster_band_name().as_deref(), Some("band"));

        let young = layer.get_proxied_raster(5.0.into(), "band").unwrap();
        assert_eq!(young.value(1, 0), Some(2.0));
        let again = layer.get_proxied_raster(5.0.into(), "band").unwrap();
        assert!(Arc::ptr_eq(&young, &again));
        assert_eq!(
            layer.get_proxied_raster(50.0.into(), "band").unwrap().value(0, 0),
            Some(3.0)
        );
        assert!(layer.get_proxied_raster(5.0.into(), "missing").is_none());
    }

    #[test]
    fn test_narrow_tokens() {
        let context = EngineContext::default();
        let (layer, collection) = layer_with(&context, time_dependent());
        let feature_token = layer.get_raster_feature_subject_token();
        let raster_token = layer.get_proxied_raster_subject_token();

        // Within one time sample.
        layer.set_current_reconstruction_time(5.0.into());
        assert_eq!(layer.get_proxied_raster_subject_token(), raster_token);

        layer.set_current_reconstruction_time(50.0.into());
        assert_ne!(layer.get_proxied_raster_subject_token(), raster_token);
        let raster_token = layer.get_proxied_raster_subject_token();
        assert_eq!(layer.get_raster_feature_subject_token(), feature_token);

        // New pixel data, same metadata.
        collection.modify_feature(&FeatureId::new("topography"), |feature| {
            if let Some(raster) = feature.raster.as_mut() {
                raster.time_samples[0].bands = vec![band("band", vec![9.0, 9.0])];
            }
        });
        assert_ne!(layer.get_proxied_raster_subject_token(), raster_token);
        assert_eq!(layer.get_raster_feature_subject_token(), feature_token);

        collection.modify_feature(&FeatureId::new("topography"), |feature| {
            if let Some(raster) = feature.raster.as_mut() {
                raster.band_names.push("extra".to_string());
            }
        });
        assert_ne!(layer.get_raster_feature_subject_token(), feature_token);
    }

    #[test]
    fn test_age_grid_masks_unformed_crust() {
        let context = EngineContext::default();
        let (layer, _) = layer_with(
            &context,
            raster_feature("topography", vec![(TimePeriod::always(), vec![1.0, 2.0])]),
        );
        let (age_grid, age_collection) = layer_with(
            &context,
            raster_feature("ages", vec![(TimePeriod::always(), vec![5.0, 50.0])]),
        );
        layer.set_age_grid_layer_proxy(Some(age_grid));

        let masked = layer.get_proxied_raster(20.0.into(), "band").unwrap();
        assert!(masked.value(0, 0).unwrap().is_nan());
        assert_eq!(masked.value(1, 0), Some(2.0));

        age_collection.modify_feature(&FeatureId::new("ages"), |feature| {
            if let Some(raster) = feature.raster.as_mut() {
                raster.time_samples[0].bands = vec![band("band", vec![50.0, 50.0])];
            }
        });
        let unmasked = layer.get_proxied_raster(20.0.into(), "band").unwrap();
        assert_eq!(unmasked.value(0, 0), Some(1.0));
    }

    #[test]
    fn test_reconstructed_raster_polygons() {
        let context = EngineContext::default();
        let (layer, _) = layer_with(
            &context,
            raster_feature("topography", vec![(TimePeriod::always(), vec![1.0, 2.0])]),
        );
        let reconstruction = Arc::new(ReconstructionLayerProxy::new(&context));
        let polygons = context.feature_store.create_feature_collection("polygons");
        polygons.add_feature(polygon_feature(
            "block",
            0,
            &[(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0)],
        ));
        let polygon_layer = Arc::new(ReconstructLayerProxy::new(&context, reconstruction));
        polygon_layer.add_reconstructable_feature_collection(polygons.clone());
        layer.set_reconstructed_polygon_layer_proxies([polygon_layer]);

        let reconstructed = layer.get_reconstructed_raster(0.0.into(), "band").unwrap();
        assert_eq!(reconstructed.polygons.len(), 1);
        assert!(reconstructed.polygons[0].present_day_mesh.is_some());
        let again = layer.get_reconstructed_raster(0.0.into(), "band").unwrap();
        assert!(Arc::ptr_eq(&reconstructed, &again));

        let token = layer.get_subject_token();
        polygons.add_feature(polygon_feature(
            "second",
            0,
            &[(20.0, 0.0), (20.0, 10.0), (30.0, 10.0), (30.0, 0.0)],
        ));
        assert_ne!(layer.get_subject_token(), token);
        let after = layer.get_reconstructed_raster(0.0.into(), "band").unwrap();
        assert_eq!(after.polygons.len(), 2);
    }
}
