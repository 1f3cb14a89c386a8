//! Engine configuration
//!
//! Cache bounds and default layer parameters, loaded from YAML. Every field has
//! a default so an empty document is a valid configuration.

use crate::layer_proxy::topology_network::TopologyNetworkParams;
use crate::layer_proxy::velocity::VelocityParams;
use crate::reconstruct_method::ReconstructParams;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tecton_types::PlateId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Default cache bound for reconstructed scalar coverages.
pub const MAX_NUM_RECONSTRUCTIONS_IN_CACHE: usize = 4;

/// Default cache bound for evolved scalar coverage time spans.
pub const MAX_NUM_TIME_SPANS_IN_CACHE: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,

    #[serde(default)]
    pub reconstruct: ReconstructConfig,

    #[serde(default)]
    pub topology: TopologyConfig,

    #[serde(default)]
    pub scalar_coverage: ScalarCoverageConfig,

    #[serde(default)]
    pub velocity: VelocityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    #[serde(default = "default_max_reconstruction_trees")]
    pub max_reconstruction_trees_in_cache: usize,

    #[serde(default)]
    pub default_anchor_plate_id: PlateId,
}

fn default_max_reconstruction_trees() -> usize {
    64
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        ReconstructionConfig {
            max_reconstruction_trees_in_cache: default_max_reconstruction_trees(),
            default_anchor_plate_id: PlateId::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructConfig {
    #[serde(default = "default_max_cached")]
    pub max_cached_reconstructions: usize,

    #[serde(default)]
    pub default_params: ReconstructParams,
}

fn default_max_cached() -> usize {
    4
}

impl Default for ReconstructConfig {
    fn default() -> Self {
        ReconstructConfig {
            max_cached_reconstructions: default_max_cached(),
            default_params: ReconstructParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_max_cached")]
    pub max_cached_resolutions: usize,

    #[serde(default)]
    pub default_network_params: TopologyNetworkParams,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig {
            max_cached_resolutions: default_max_cached(),
            default_network_params: TopologyNetworkParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarCoverageConfig {
    #[serde(default = "default_max_scalar_reconstructions")]
    pub max_reconstructions_in_cache: usize,

    /// Each span holds every slot of every coverage of one scalar type.
    #[serde(default = "default_max_scalar_time_spans")]
    pub max_time_spans_in_cache: usize,
}

fn default_max_scalar_reconstructions() -> usize {
    MAX_NUM_RECONSTRUCTIONS_IN_CACHE
}

fn default_max_scalar_time_spans() -> usize {
    MAX_NUM_TIME_SPANS_IN_CACHE
}

impl Default for ScalarCoverageConfig {
    fn default() -> Self {
        ScalarCoverageConfig {
            max_reconstructions_in_cache: default_max_scalar_reconstructions(),
            max_time_spans_in_cache: default_max_scalar_time_spans(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityConfig {
    #[serde(default = "default_max_cached")]
    pub max_cached_velocity_fields: usize,

    #[serde(default)]
    pub default_params: VelocityParams,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        VelocityConfig {
            max_cached_velocity_fields: default_max_cached(),
            default_params: VelocityParams::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject cache bounds of zero and non-positive velocity delta times.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [
            (
                "reconstruction.max_reconstruction_trees_in_cache",
                self.reconstruction.max_reconstruction_trees_in_cache,
            ),
            (
                "reconstruct.max_cached_reconstructions",
                self.reconstruct.max_cached_reconstructions,
            ),
            (
                "topology.max_cached_resolutions",
                self.topology.max_cached_resolutions,
            ),
            (
                "scalar_coverage.max_reconstructions_in_cache",
                self.scalar_coverage.max_reconstructions_in_cache,
            ),
            (
                "scalar_coverage.max_time_spans_in_cache",
                self.scalar_coverage.max_time_spans_in_cache,
            ),
            (
                "velocity.max_cached_velocity_fields",
                self.velocity.max_cached_velocity_fields,
            ),
        ];
        for (field, value) in bounds {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "cache must hold at least one entry".to_string(),
                });
            }
        }

        if !self.velocity.default_params.is_valid() {
            return Err(ConfigError::InvalidValue {
                field: "velocity.default_params.delta_time",
                reason: format!(
                    "{} is not a positive duration",
                    self.velocity.default_params.delta_time
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config.reconstruction.max_reconstruction_trees_in_cache, 64);
        assert_eq!(
            config.scalar_coverage.max_reconstructions_in_cache,
            MAX_NUM_RECONSTRUCTIONS_IN_CACHE
        );
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_yaml_str(
            "reconstruction:\n  max_reconstruction_trees_in_cache: 8\n  default_anchor_plate_id: 701\n",
        )
        .unwrap();
        assert_eq!(config.reconstruction.max_reconstruction_trees_in_cache, 8);
        assert_eq!(config.reconstruction.default_anchor_plate_id, PlateId(701));
        assert_eq!(config.reconstruct.max_cached_reconstructions, 4);
    }

    #[test]
    fn test_zero_bound_is_rejected() {
        let err = EngineConfig::from_yaml_str("topology:\n  max_cached_resolutions: 0\n")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "topology.max_cached_resolutions",
                ..
            }
        ));
    }

    #[test]
    fn test_non_positive_delta_time_is_rejected() {
        let err = EngineConfig::from_yaml_str("velocity:\n  default_params:\n    delta_time: 0.0\n")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "velocity.default_params.delta_time",
                ..
            }
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scalar_coverage:\n  max_reconstructions_in_cache: 2").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scalar_coverage.max_reconstructions_in_cache, 2);
        assert_eq!(
            config.scalar_coverage.max_time_spans_in_cache,
            MAX_NUM_TIME_SPANS_IN_CACHE
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::from_file(dir.path().join("missing.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
