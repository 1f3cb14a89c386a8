//! Shared types for tecton
//!
//! This crate provides the identifiers, time values and change-detection
//! tokens used across the tecton workspace.

pub mod time;
pub mod token;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use time::{ReconstructionTime, TimePeriod, TimeSpanRange};
pub use token::{ObserverToken, SubjectToken};

/// Globally unique feature identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureId(pub String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, never before seen feature id.
    pub fn generate() -> Self {
        Self(format!("tecton-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tectonic plate identifier; the default is plate zero, the usual anchor.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlateId(pub u64);

impl PlateId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for PlateId {
    fn from(id: u64) -> Self {
        PlateId(id)
    }
}

impl From<PlateId> for u64 {
    fn from(id: PlateId) -> Self {
        id.0
    }
}

impl fmt::Display for PlateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a layer proxy node.
///
/// Allocated once per proxy and never reused, so it can stand in for the
/// proxy in archives and in dependency sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerProxyId(pub u64);

static NEXT_LAYER_PROXY_ID: AtomicU64 = AtomicU64::new(1);

impl LayerProxyId {
    pub fn next() -> Self {
        LayerProxyId(NEXT_LAYER_PROXY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LayerProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}
