use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::{
    await_condition::AwaitCondition,
    bus::EventBus,
    diff::{DiffPolicy, diff, synthesize_joins},
    error::{SyncError, SyncErrorCategory},
    record::StateRecord,
    source::{CollectionFilter, ResourcePatch, ResourceSource},
    types::{Change, Scope, SyncEvent},
};

/// Behavior knobs for a [`Reconciler`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerOptions {
    pub policy: DiffPolicy,
    /// Filter used for every collection fetch.
    pub filter: CollectionFilter,
    /// Publish a `MembershipJoined` per initial member after the tracked
    /// resource is first observed.
    pub announce_initial_members: bool,
}

/// What a refresh cycle fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshMode {
    /// Fetch a single resource by id.
    One(String),
    /// Fetch the whole collection.
    Collection,
}

/// Held for the duration of one refresh cycle.
pub(crate) type RefreshPermit = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
struct ResourceCache {
    current: Option<Arc<StateRecord>>,
    collection: Arc<Vec<Arc<StateRecord>>>,
}

/// Fetches resource state, diffs it against the cache and republishes the
/// differences on the [`EventBus`].
///
/// At most one refresh runs at a time. Events of one cycle are published
/// while the cycle still holds the refresh gate, so cycles never interleave.
pub struct Reconciler<S> {
    source: S,
    bus: EventBus,
    options: ReconcilerOptions,
    gate: Arc<Mutex<()>>,
    cache: RwLock<ResourceCache>,
}

impl<S: ResourceSource> Reconciler<S> {
    /// Reconciler with empty caches.
    pub fn new(source: S, bus: EventBus, options: ReconcilerOptions) -> Self {
        Self {
            source,
            bus,
            options,
            gate: Arc::new(Mutex::new(())),
            cache: RwLock::new(ResourceCache::default()),
        }
    }

    /// Bus every change is published on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Underlying resource source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Options fixed at construction.
    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    /// Snapshot of the tracked resource.
    pub fn current(&self) -> Option<Arc<StateRecord>> {
        self.read_cache().current.clone()
    }

    /// Id of the tracked resource.
    pub fn current_id(&self) -> Option<String> {
        self.read_cache()
            .current
            .as_ref()
            .map(|record| record.id.clone())
    }

    /// Snapshot of the known collection, in service order.
    pub fn collection(&self) -> Arc<Vec<Arc<StateRecord>>> {
        self.read_cache().collection.clone()
    }

    /// Mode picked by [`refresh`](Self::refresh): the tracked resource if
    /// any, otherwise the collection.
    pub fn default_mode(&self) -> RefreshMode {
        match self.current_id() {
            Some(id) => RefreshMode::One(id),
            None => RefreshMode::Collection,
        }
    }

    /// Fetch one resource and publish how it differs from the tracked one.
    ///
    /// A `NotFound` answer is treated as absence. Any other failure leaves
    /// the cache untouched and publishes nothing.
    pub async fn refresh_one(&self, id: &str) -> Result<Vec<Change>, SyncError> {
        let _permit = self.gate.lock().await;
        self.refresh_one_locked(id).await
    }

    /// Fetch the collection and publish removals, additions and per-item
    /// changes, then reconcile the tracked resource against its fresh copy.
    pub async fn refresh_collection(&self) -> Result<Arc<Vec<Arc<StateRecord>>>, SyncError> {
        let _permit = self.gate.lock().await;
        self.refresh_collection_locked().await
    }

    /// Refresh using [`default_mode`](Self::default_mode).
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let _permit = self.gate.lock().await;
        let mode = self.default_mode();
        self.run_mode(&mode).await
    }

    /// Adopt a freshly created or joined resource as the tracked one.
    pub async fn track(&self, record: StateRecord) -> Vec<Change> {
        let _permit = self.gate.lock().await;
        info!(resource_id = %record.id, "tracking resource");
        self.apply_current(Some(Arc::new(record)))
    }

    /// Stop tracking the current resource.
    pub async fn leave(&self) -> Vec<Change> {
        let _permit = self.gate.lock().await;
        if let Some(id) = self.current_id() {
            info!(resource_id = %id, "leaving resource");
        }
        self.apply_current(None)
    }

    /// Send `patch` for the tracked resource and publish the result.
    pub async fn mutate(&self, patch: ResourcePatch) -> Result<Vec<Change>, SyncError> {
        let _permit = self.gate.lock().await;
        let id = self
            .current_id()
            .ok_or_else(|| SyncError::not_tracking("mutate"))?;

        debug!(resource_id = %id, ?patch, "mutating resource");
        let record = self.source.mutate_one(&id, &patch).await.inspect_err(|err| {
            warn!(resource_id = %id, code = %err.code, error = %err.message, "mutation failed");
        })?;
        Ok(self.apply_current(Some(Arc::new(record))))
    }

    /// Wait for the tracked resource to satisfy `predicate`.
    ///
    /// The current snapshot is checked first, so a condition that already
    /// holds resolves without waiting for the next refresh. Fails with
    /// `not_tracking` when no resource is tracked; build an
    /// [`AwaitCondition`] directly to wait on an arbitrary resource.
    pub fn condition<P>(&self, predicate: P) -> Result<AwaitCondition, SyncError>
    where
        P: Fn(&StateRecord) -> bool + Send + Sync + 'static,
    {
        let current = self
            .current()
            .ok_or_else(|| SyncError::not_tracking("condition"))?;
        Ok(AwaitCondition::new(self.bus.clone(), predicate)
            .for_resource(current.id.clone())
            .with_initial(current))
    }

    pub(crate) fn try_begin_refresh(&self) -> Option<RefreshPermit> {
        self.gate.clone().try_lock_owned().ok()
    }

    /// Run one polled cycle. Failures are published as `RefreshFailed`
    /// before the permit is released.
    pub(crate) async fn run_tick(&self, permit: RefreshPermit, mode: RefreshMode) {
        if let Err(err) = self.run_mode(&mode).await {
            self.bus.publish(SyncEvent::RefreshFailed(err));
        }
        drop(permit);
    }

    async fn run_mode(&self, mode: &RefreshMode) -> Result<(), SyncError> {
        match mode {
            RefreshMode::One(id) => self.refresh_one_locked(id).await.map(|_| ()),
            RefreshMode::Collection => self.refresh_collection_locked().await.map(|_| ()),
        }
    }

    async fn refresh_one_locked(&self, id: &str) -> Result<Vec<Change>, SyncError> {
        let fetched = match self.source.fetch_one(id).await {
            Ok(record) => Some(Arc::new(record)),
            Err(err) if err.is_not_found() => {
                debug!(resource_id = %id, "resource no longer exists");
                None
            }
            Err(err) => {
                log_fetch_error(&err, Some(id));
                return Err(err);
            }
        };
        Ok(self.apply_current(fetched))
    }

    async fn refresh_collection_locked(&self) -> Result<Arc<Vec<Arc<StateRecord>>>, SyncError> {
        let fetched = self
            .source
            .fetch_collection(&self.options.filter)
            .await
            .inspect_err(|err| log_fetch_error(err, None))?;

        let new: Arc<Vec<Arc<StateRecord>>> =
            Arc::new(fetched.into_iter().map(Arc::new).collect());
        let old = self.collection();

        let new_ids: HashSet<&str> = new.iter().map(|record| record.id.as_str()).collect();
        let old_by_id: HashMap<&str, &Arc<StateRecord>> = old
            .iter()
            .map(|record| (record.id.as_str(), record))
            .collect();

        let mut removed = 0usize;
        for record in old.iter().filter(|record| !new_ids.contains(record.id.as_str())) {
            removed += 1;
            self.bus.publish(SyncEvent::ResourceRemoved(record.clone()));
        }

        let mut added = 0usize;
        for record in new.iter() {
            match old_by_id.get(record.id.as_str()).copied() {
                None => {
                    added += 1;
                    self.bus.publish(SyncEvent::ResourceAdded(record.clone()));
                }
                Some(previous) => {
                    let changes = diff(Some(&**previous), Some(&**record), &self.options.policy);
                    self.publish_changes(Scope::Collection, &changes, Some(record));
                }
            }
        }

        self.bus.publish(SyncEvent::CollectionRefreshed(new.clone()));
        self.write_cache().collection = new.clone();
        debug!(
            resource_count = new.len(),
            added, removed, "collection refreshed"
        );

        if let Some(current_id) = self.current_id()
            && let Some(fresh) = new.iter().find(|record| record.id == current_id)
        {
            self.apply_current(Some(fresh.clone()));
        }

        Ok(new)
    }

    /// Diff `new` against the tracked resource, publish, then swap the cache.
    fn apply_current(&self, new: Option<Arc<StateRecord>>) -> Vec<Change> {
        let old = self.current();
        let mut changes = diff(old.as_deref(), new.as_deref(), &self.options.policy);

        if self.options.announce_initial_members
            && let Some(record) = new.as_deref()
            && changes
                .iter()
                .any(|change| matches!(change, Change::ResourceCreated { .. }))
        {
            changes.extend(synthesize_joins(record));
        }

        self.publish_changes(Scope::Current, &changes, new.as_ref());
        if !changes.is_empty() {
            debug!(
                resource_id = new.as_ref().or(old.as_ref()).map(|record| record.id.as_str()),
                change_count = changes.len(),
                "tracked resource changed"
            );
        }
        self.write_cache().current = new;
        changes
    }

    fn publish_changes(
        &self,
        scope: Scope,
        changes: &[Change],
        snapshot: Option<&Arc<StateRecord>>,
    ) {
        for change in changes {
            let snapshot = match change {
                Change::ResourceDestroyed { .. } => None,
                _ => snapshot.cloned(),
            };
            self.bus.publish(SyncEvent::Changed {
                scope,
                change: change.clone(),
                snapshot,
            });
        }
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, ResourceCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, ResourceCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_fetch_error(err: &SyncError, resource_id: Option<&str>) {
    if err.category == SyncErrorCategory::MalformedResponse {
        error!(
            resource_id,
            code = %err.code,
            error = %err.message,
            "service returned a malformed payload"
        );
    } else {
        warn!(
            resource_id,
            category = ?err.category,
            code = %err.code,
            error = %err.message,
            "fetch failed; keeping last known state"
        );
    }
}
