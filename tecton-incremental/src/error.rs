//! Error types

use tecton_model::TopologyKind;
use tecton_types::{FeatureId, LayerProxyId};
use thiserror::Error;

/// Failure to save or load a layer graph archive.
#[derive(Error, Debug)]
pub enum ScribeError {
    #[error("Malformed archive record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive version {found} is newer than supported version {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Archive references missing layer {0}")]
    MissingLayer(LayerProxyId),
}

/// A topological section reference rejected during resolution.
///
/// Lines may only reference regular features, and boundaries and networks may
/// only reference regular features and lines. A rejected topology yields no
/// output; its siblings resolve normally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyReferenceError {
    #[error("topological line {topology} references topological feature {section}")]
    LineReferencesTopology {
        topology: FeatureId,
        section: FeatureId,
    },

    #[error("topological {kind} {topology} references topological {section_kind} {section}")]
    ReferencesBoundaryOrNetwork {
        topology: FeatureId,
        kind: TopologyKind,
        section: FeatureId,
        section_kind: TopologyKind,
    },
}

impl TopologyReferenceError {
    /// The topology that was rejected.
    pub fn topology(&self) -> &FeatureId {
        match self {
            TopologyReferenceError::LineReferencesTopology { topology, .. }
            | TopologyReferenceError::ReferencesBoundaryOrNetwork { topology, .. } => topology,
        }
    }

    pub fn section(&self) -> &FeatureId {
        match self {
            TopologyReferenceError::LineReferencesTopology { section, .. }
            | TopologyReferenceError::ReferencesBoundaryOrNetwork { section, .. } => section,
        }
    }
}
