//! Versioned feature store
//!
//! Collections advertise changes through a [`SubjectToken`] that consumers
//! poll. Mutations made while a [`NotificationGuard`] is held are batched into
//! one invalidation per collection, flushed when the last guard is released.

use crate::feature::Feature;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tecton_types::{FeatureId, SubjectToken};

/// Shared, mutable access to one feature.
#[derive(Debug, Clone)]
pub struct FeatureHandle {
    id: FeatureId,
    inner: Arc<RwLock<Feature>>,
}

impl FeatureHandle {
    fn new(feature: Feature) -> Self {
        FeatureHandle {
            id: feature.id.clone(),
            inner: Arc::new(RwLock::new(feature)),
        }
    }

    pub fn feature_id(&self) -> &FeatureId {
        &self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Feature> {
        self.inner.read()
    }

    pub fn weak_ref(&self) -> WeakFeatureRef {
        WeakFeatureRef {
            id: self.id.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &FeatureHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A reference that silently becomes invalid once the feature is destroyed.
#[derive(Debug, Clone)]
pub struct WeakFeatureRef {
    id: FeatureId,
    inner: Weak<RwLock<Feature>>,
}

impl WeakFeatureRef {
    pub fn feature_id(&self) -> &FeatureId {
        &self.id
    }

    pub fn is_valid(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<FeatureHandle> {
        self.inner.upgrade().map(|inner| FeatureHandle {
            id: self.id.clone(),
            inner,
        })
    }
}

/// Identity of a feature collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureCollectionId(pub u64);

static NEXT_COLLECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct StoreShared {
    index: RwLock<HashMap<FeatureId, WeakFeatureRef>>,
    guard_depth: AtomicUsize,
    pending: Mutex<Vec<Weak<CollectionInner>>>,
}

impl StoreShared {
    fn flush_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for collection in pending.iter().filter_map(Weak::upgrade) {
            collection.pending.store(false, Ordering::Relaxed);
            collection.token.lock().invalidate();
        }
        if !pending.is_empty() {
            tracing::debug!(collections = pending.len(), "flushed batched feature notifications");
        }
    }
}

#[derive(Debug)]
struct CollectionInner {
    id: FeatureCollectionId,
    name: String,
    features: RwLock<Vec<FeatureHandle>>,
    token: Mutex<SubjectToken>,
    pending: AtomicBool,
    store: Weak<StoreShared>,
}

/// Shared handle to a feature collection.
#[derive(Debug, Clone)]
pub struct FeatureCollectionHandle(Arc<CollectionInner>);

impl FeatureCollectionHandle {
    pub fn id(&self) -> FeatureCollectionId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn ptr_eq(&self, other: &FeatureCollectionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Snapshot of the change token; compare with an observer to poll.
    pub fn subject_token(&self) -> SubjectToken {
        self.0.token.lock().clone()
    }

    pub fn features(&self) -> Vec<FeatureHandle> {
        self.0.features.read().clone()
    }

    pub fn len(&self) -> usize {
        self.0.features.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.features.read().is_empty()
    }

    pub fn find_feature(&self, id: &FeatureId) -> Option<FeatureHandle> {
        self.0
            .features
            .read()
            .iter()
            .find(|handle| handle.feature_id() == id)
            .cloned()
    }

    pub fn add_feature(&self, feature: Feature) -> FeatureHandle {
        let handle = FeatureHandle::new(feature);
        self.0.features.write().push(handle.clone());
        if let Some(store) = self.0.store.upgrade() {
            store
                .index
                .write()
                .insert(handle.feature_id().clone(), handle.weak_ref());
        }
        self.notify_modified();
        handle
    }

    pub fn remove_feature(&self, id: &FeatureId) -> Option<FeatureHandle> {
        let removed = {
            let mut features = self.0.features.write();
            let position = features.iter().position(|handle| handle.feature_id() == id)?;
            features.remove(position)
        };
        if let Some(store) = self.0.store.upgrade() {
            unregister(&store, &removed);
        }
        self.notify_modified();
        Some(removed)
    }

    /// Mutate a feature in place. The closure must not change the feature id.
    ///
    /// Returns false if no feature with `id` is in this collection.
    pub fn modify_feature(&self, id: &FeatureId, modify: impl FnOnce(&mut Feature)) -> bool {
        let Some(handle) = self.find_feature(id) else {
            return false;
        };
        {
            let mut feature = handle.inner.write();
            modify(&mut feature);
            debug_assert_eq!(&feature.id, id, "feature ids are immutable");
        }
        self.notify_modified();
        true
    }

    fn notify_modified(&self) {
        if let Some(store) = self.0.store.upgrade() {
            if store.guard_depth.load(Ordering::Acquire) > 0 {
                if !self.0.pending.swap(true, Ordering::AcqRel) {
                    store.pending.lock().push(Arc::downgrade(&self.0));
                }
                return;
            }
        }
        self.0.token.lock().invalidate();
    }
}

fn unregister(store: &StoreShared, handle: &FeatureHandle) {
    let mut index = store.index.write();
    let is_same = index
        .get(handle.feature_id())
        .and_then(WeakFeatureRef::upgrade)
        .is_some_and(|indexed| indexed.ptr_eq(handle));
    if is_same {
        index.remove(handle.feature_id());
    }
}

/// Owner of all loaded feature collections and of the global feature-id index.
#[derive(Debug)]
pub struct FeatureStore {
    shared: Arc<StoreShared>,
    collections: RwLock<Vec<FeatureCollectionHandle>>,
}

impl FeatureStore {
    pub fn new() -> Self {
        FeatureStore {
            shared: Arc::new(StoreShared {
                index: RwLock::new(HashMap::new()),
                guard_depth: AtomicUsize::new(0),
                pending: Mutex::new(Vec::new()),
            }),
            collections: RwLock::new(Vec::new()),
        }
    }

    pub fn create_feature_collection(&self, name: impl Into<String>) -> FeatureCollectionHandle {
        let handle = FeatureCollectionHandle(Arc::new(CollectionInner {
            id: FeatureCollectionId(NEXT_COLLECTION_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            features: RwLock::new(Vec::new()),
            token: Mutex::new(SubjectToken::new()),
            pending: AtomicBool::new(false),
            store: Arc::downgrade(&self.shared),
        }));
        self.collections.write().push(handle.clone());
        handle
    }

    /// Forget a collection and drop its features from the id index.
    pub fn unload_feature_collection(&self, collection: &FeatureCollectionHandle) -> bool {
        let removed = {
            let mut collections = self.collections.write();
            let before = collections.len();
            collections.retain(|c| !c.ptr_eq(collection));
            before != collections.len()
        };
        if removed {
            for feature in collection.features() {
                unregister(&self.shared, &feature);
            }
        }
        removed
    }

    pub fn feature_collections(&self) -> Vec<FeatureCollectionHandle> {
        self.collections.read().clone()
    }

    /// Look up a live feature by id across every collection.
    pub fn find_feature(&self, id: &FeatureId) -> Option<FeatureHandle> {
        self.shared.index.read().get(id)?.upgrade()
    }

    /// Start batching change notifications until the guard is released.
    pub fn notification_guard(&self) -> NotificationGuard {
        self.shared.guard_depth.fetch_add(1, Ordering::AcqRel);
        NotificationGuard {
            shared: self.shared.clone(),
            released: false,
        }
    }

    pub fn is_notification_guard_active(&self) -> bool {
        self.shared.guard_depth.load(Ordering::Acquire) > 0
    }
}

impl Default for FeatureStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Batches model-change notifications while held.
///
/// Guards nest; the consolidated notification is flushed when the outermost
/// guard is released, explicitly or on drop.
pub struct NotificationGuard {
    shared: Arc<StoreShared>,
    released: bool,
}

impl NotificationGuard {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.shared.guard_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.flush_pending();
        }
    }
}

impl Drop for NotificationGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for NotificationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationGuard")
            .field("released", &self.released)
            .finish()
    }
}
