//! Raster properties
//!
//! Raster pixel data lives outside the engine; a [`ProxiedRaster`] stands in
//! for one band of one time sample.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tecton_types::{ReconstructionTime, TimePeriod};

/// Maps pixel coordinates onto latitude/longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Georeferencing {
    pub top_left_lat: f64,
    pub top_left_lon: f64,
    pub pixel_width_degrees: f64,
    pub pixel_height_degrees: f64,
}

impl Georeferencing {
    /// Latitude/longitude of the centre of pixel (`column`, `row`).
    pub fn pixel_centre(&self, column: u32, row: u32) -> (f64, f64) {
        let lat = self.top_left_lat - (row as f64 + 0.5) * self.pixel_height_degrees;
        let lon = self.top_left_lon + (column as f64 + 0.5) * self.pixel_width_degrees;
        (lat, lon)
    }
}

/// One band of one raster time sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxiedRaster {
    pub band_name: String,
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

impl ProxiedRaster {
    pub fn value(&self, column: u32, row: u32) -> Option<f32> {
        if column >= self.width || row >= self.height {
            return None;
        }
        self.values
            .get(row as usize * self.width as usize + column as usize)
            .copied()
    }
}

/// The bands of a raster over one time period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterTimeSample {
    pub valid_time: TimePeriod,
    pub bands: Vec<Arc<ProxiedRaster>>,
}

/// The raster-valued properties of a raster feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RasterProperty {
    pub band_names: Vec<String>,
    #[serde(default)]
    pub georeferencing: Option<Georeferencing>,
    #[serde(default)]
    pub time_samples: Vec<RasterTimeSample>,
}

impl RasterProperty {
    pub fn is_time_dependent(&self) -> bool {
        self.time_samples.len() > 1
    }

    /// The band `band_name` of the time sample valid at `time`.
    pub fn raster_at(
        &self,
        time: ReconstructionTime,
        band_name: &str,
    ) -> Option<Arc<ProxiedRaster>> {
        self.time_samples
            .iter()
            .find(|sample| sample.valid_time.contains(time))?
            .bands
            .iter()
            .find(|band| band.band_name == band_name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(name: &str, value: f32) -> Arc<ProxiedRaster> {
        Arc::new(ProxiedRaster {
            band_name: name.to_string(),
            width: 2,
            height: 1,
            values: vec![value, value],
        })
    }

    #[test]
    fn test_time_dependent_selection() {
        let raster = RasterProperty {
            band_names: vec!["elevation".into()],
            georeferencing: None,
            time_samples: vec![
                RasterTimeSample {
                    valid_time: TimePeriod::new(10.0, 0.0),
                    bands: vec![band("elevation", 1.0)],
                },
                RasterTimeSample {
                    valid_time: TimePeriod::new(20.0, 10.0 + 1e-3),
                    bands: vec![band("elevation", 2.0)],
                },
            ],
        };

        assert!(raster.is_time_dependent());
        let young = raster.raster_at(5.0.into(), "elevation").unwrap();
        let old = raster.raster_at(15.0.into(), "elevation").unwrap();
        assert_eq!(young.value(0, 0), Some(1.0));
        assert_eq!(old.value(1, 0), Some(2.0));
        assert!(raster.raster_at(5.0.into(), "missing").is_none());
        assert!(raster.raster_at(50.0.into(), "elevation").is_none());
    }

    #[test]
    fn test_pixel_centre() {
        let georeferencing = Georeferencing {
            top_left_lat: 90.0,
            top_left_lon: -180.0,
            pixel_width_degrees: 1.0,
            pixel_height_degrees: 1.0,
        };
        assert_eq!(georeferencing.pixel_centre(0, 0), (89.5, -179.5));
    }
}
