//! Search for reconstructed geometries by feature
//!
//! Reconstructed geometries are owned by whichever cache produced them. The
//! index only observes them, so a feature's geometries can be found without
//! knowing which layer reconstructed it. Entries from older batches are
//! filtered out at lookup time rather than deleted; [`prune`] drops entries
//! whose geometries no longer exist.
//!
//! [`prune`]: ReconstructedGeometryIndex::prune

use crate::reconstructed::{ReconstructHandle, ReconstructedFeatureGeometry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tecton_types::FeatureId;

type Entry = (ReconstructHandle, Weak<ReconstructedFeatureGeometry>);

#[derive(Debug, Default)]
pub struct ReconstructedGeometryIndex {
    entries: RwLock<HashMap<FeatureId, Vec<Entry>>>,
}

impl ReconstructedGeometryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, rfg: &Arc<ReconstructedFeatureGeometry>) {
        self.entries
            .write()
            .entry(rfg.feature_id().clone())
            .or_default()
            .push((rfg.reconstruct_handle(), Arc::downgrade(rfg)));
    }

    /// Live geometries of `feature_id` produced by any of `handles`.
    pub fn find(
        &self,
        feature_id: &FeatureId,
        handles: &[ReconstructHandle],
    ) -> Vec<Arc<ReconstructedFeatureGeometry>> {
        let entries = self.entries.read();
        let Some(list) = entries.get(feature_id) else {
            return Vec::new();
        };
        list.iter()
            .filter(|(handle, _)| handles.contains(handle))
            .filter_map(|(_, rfg)| rfg.upgrade())
            .collect()
    }

    /// Live geometries of `feature_id` from the most recent batch that still
    /// has any.
    pub fn find_latest(&self, feature_id: &FeatureId) -> Vec<Arc<ReconstructedFeatureGeometry>> {
        let entries = self.entries.read();
        let Some(list) = entries.get(feature_id) else {
            return Vec::new();
        };
        let live: Vec<_> = list
            .iter()
            .filter_map(|(handle, rfg)| rfg.upgrade().map(|rfg| (*handle, rfg)))
            .collect();
        let Some(latest) = live.iter().map(|(handle, _)| *handle).max() else {
            return Vec::new();
        };
        live.into_iter()
            .filter(|(handle, _)| *handle == latest)
            .map(|(_, rfg)| rfg)
            .collect()
    }

    /// Drop entries whose geometries have been released; returns how many.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0;
        entries.retain(|_, list| {
            let before = list.len();
            list.retain(|(_, rfg)| rfg.strong_count() > 0);
            removed += before - list.len();
            !list.is_empty()
        });
        if removed > 0 {
            tracing::debug!(removed, "pruned reconstructed geometry index");
        }
        removed
    }

    /// Number of entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
