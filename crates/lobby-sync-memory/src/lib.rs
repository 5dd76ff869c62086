//! In-memory [`ResourceSource`] for tests, demos and offline runs.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use lobby_sync_core::{
    CollectionFilter, ResourcePatch, ResourceSource, StateRecord, SyncError, SyncErrorCategory,
};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Attribute marking a lobby as hidden from public listings.
pub const PRIVATE_ATTRIBUTE: &str = "isPrivate";
/// Attribute capping the member count.
pub const MAX_MEMBERS_ATTRIBUTE: &str = "maxPlayers";

#[derive(Default)]
struct StoreInner {
    records: RwLock<Vec<StateRecord>>,
    failures: Mutex<VecDeque<SyncError>>,
    fetches: AtomicUsize,
    requests: Mutex<Vec<(String, Value)>>,
}

/// Shared in-memory resource table. Clones see the same data.
#[derive(Clone, Default)]
pub struct InMemoryResourceStore {
    inner: Arc<StoreInner>,
}

impl InMemoryResourceStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, keeping its listing position.
    pub fn insert(&self, record: StateRecord) {
        let mut records = self.write();
        match records.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Store `template` under a fresh id and return the stored record.
    pub fn create(&self, template: StateRecord) -> StateRecord {
        let record = StateRecord {
            id: Uuid::new_v4().to_string(),
            ..template
        };
        debug!(resource_id = %record.id, "resource created");
        self.insert(record.clone());
        record
    }

    /// Delete a record; later fetches answer `NotFound`.
    pub fn remove(&self, id: &str) -> Option<StateRecord> {
        let mut records = self.write();
        let index = records.iter().position(|record| record.id == id)?;
        Some(records.remove(index))
    }

    /// Copy of the stored record.
    pub fn get(&self, id: &str) -> Option<StateRecord> {
        self.read().iter().find(|record| record.id == id).cloned()
    }

    /// Edit a stored record in place and return the result.
    pub fn update<F>(&self, id: &str, edit: F) -> Result<StateRecord, SyncError>
    where
        F: FnOnce(&mut StateRecord),
    {
        let mut records = self.write();
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| SyncError::not_found(id))?;
        edit(record);
        Ok(record.clone())
    }

    /// Number of stored records, private ones included.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no records are stored.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Make the next source call fail with `err`. Failures queue up.
    pub fn fail_next(&self, err: SyncError) {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(err);
    }

    /// Number of fetches served, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Mutation requests received so far, as `(resource id, wire payload)`.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_failure(&self) -> Result<(), SyncError> {
        let failure = self
            .inner
            .failures
            .lock()
            .map_err(|_| poisoned())?
            .pop_front();
        match failure {
            Some(err) => {
                debug!(code = %err.code, "injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<StateRecord>> {
        self.inner
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<StateRecord>> {
        self.inner
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ResourceSource for InMemoryResourceStore {
    async fn fetch_one(&self, id: &str) -> Result<StateRecord, SyncError> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let records = self.inner.records.read().map_err(|_| poisoned())?;
        records
            .iter()
            .find(|record| record.id == id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(id))
    }

    async fn fetch_collection(
        &self,
        filter: &CollectionFilter,
    ) -> Result<Vec<StateRecord>, SyncError> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let records = self.inner.records.read().map_err(|_| poisoned())?;
        let public_only = filter.public_only.unwrap_or(false);
        Ok(records
            .iter()
            .filter(|record| !public_only || !is_private(record))
            .cloned()
            .collect())
    }

    async fn mutate_one(&self, id: &str, patch: &ResourcePatch) -> Result<StateRecord, SyncError> {
        self.take_failure()?;
        let payload = patch.to_payload();
        debug!(resource_id = %id, %payload, "mutation received");
        self.inner
            .requests
            .lock()
            .map_err(|_| poisoned())?
            .push((id.to_owned(), payload));

        let mut records = self.inner.records.write().map_err(|_| poisoned())?;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| SyncError::not_found(id))?;

        let mut updated = record.clone();
        apply_patch(&mut updated, patch)?;
        *record = updated.clone();
        debug!(resource_id = %id, "patch applied");
        Ok(updated)
    }
}

/// Apply `patch` with the lobby service's membership rules.
pub fn apply_patch(record: &mut StateRecord, patch: &ResourcePatch) -> Result<(), SyncError> {
    match patch {
        ResourcePatch::Status(status) => record.status = status.clone(),
        ResourcePatch::Owner(owner) => {
            if !record.has_member(owner) {
                return Err(rejected(
                    "owner_not_member",
                    format!("{owner} is not a member of {}", record.id),
                ));
            }
            record.owner = Some(owner.clone());
        }
        ResourcePatch::Settings(settings) => record.settings = settings.clone(),
        ResourcePatch::ParticipantState { participant, state } => {
            if !record.has_member(participant) {
                return Err(rejected(
                    "participant_not_member",
                    format!("{participant} is not a member of {}", record.id),
                ));
            }
            record
                .participant_states
                .insert(participant.clone(), state.clone());
        }
        ResourcePatch::AddMember(participant) => {
            if record.has_member(participant) {
                return Ok(());
            }
            if let Some(max) = max_members(record)
                && record.members.len() >= max
            {
                return Err(rejected(
                    "resource_full",
                    format!("{} already has {max} members", record.id),
                ));
            }
            record.members.push(participant.clone());
        }
        ResourcePatch::RemoveMember(participant) => {
            record.members.retain(|member| member != participant);
            record.participant_states.remove(participant);
            if record.is_owned_by(participant) {
                record.owner = record.members.first().cloned();
            }
        }
    }
    Ok(())
}

fn is_private(record: &StateRecord) -> bool {
    record
        .attributes
        .get(PRIVATE_ATTRIBUTE)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn max_members(record: &StateRecord) -> Option<usize> {
    record
        .attributes
        .get(MAX_MEMBERS_ATTRIBUTE)
        .and_then(Value::as_u64)
        .and_then(|max| usize::try_from(max).ok())
}

fn rejected(code: &str, message: String) -> SyncError {
    SyncError::new(SyncErrorCategory::Config, code, message)
}

fn poisoned() -> SyncError {
    SyncError::new(SyncErrorCategory::Internal, "poisoned_lock", "poisoned lock")
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use lobby_sync_core::{
        AwaitCondition, AwaitOutcome, Change, EventBus, EventKind, PollConfig, PollLoop,
        Reconciler, ReconcilerOptions, RefreshMode, SyncEvent, status_is, sub_resource_status_is,
    };
    use serde_json::json;
    use tokio::time::{Instant, sleep};

    use super::*;

    fn lobby(id: &str) -> StateRecord {
        StateRecord::new(id)
            .with_owner("alice")
            .with_status("waiting")
            .with_members(["alice", "bob"])
    }

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[tokio::test]
    async fn missing_resource_is_not_found() {
        let store = InMemoryResourceStore::new();
        let err = store
            .fetch_one("nope")
            .await
            .expect_err("nothing is stored");
        assert!(err.is_not_found());
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn public_only_filter_hides_private_resources() {
        let store = InMemoryResourceStore::new();
        store.insert(lobby("open"));
        let mut hidden = lobby("hidden");
        hidden
            .attributes
            .insert(PRIVATE_ATTRIBUTE.to_owned(), json!(true));
        store.insert(hidden);

        let all = store
            .fetch_collection(&CollectionFilter::default())
            .await
            .expect("listing should work");
        let public = store
            .fetch_collection(&CollectionFilter::public_only())
            .await
            .expect("listing should work");

        assert_eq!(all.len(), 2);
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].id, "open");
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let store = InMemoryResourceStore::new();
        store.insert(lobby("lobby-1"));
        store.fail_next(SyncError::transport("connection reset"));

        let err = store
            .fetch_one("lobby-1")
            .await
            .expect_err("first fetch should fail");
        assert!(err.is_transient());
        store
            .fetch_one("lobby-1")
            .await
            .expect("second fetch should work");
    }

    #[test]
    fn create_assigns_fresh_id() {
        let store = InMemoryResourceStore::new();
        let a = store.create(lobby(""));
        let b = store.create(lobby(""));

        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
        assert_eq!(store.len(), 2);
        assert_eq!(store.remove(&a.id).map(|record| record.id), Some(a.id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn membership_patches_follow_lobby_rules() {
        let mut record = lobby("lobby-1");
        record
            .attributes
            .insert(MAX_MEMBERS_ATTRIBUTE.to_owned(), json!(3));

        apply_patch(&mut record, &ResourcePatch::AddMember("carol".into()))
            .expect("room for carol");
        let err = apply_patch(&mut record, &ResourcePatch::AddMember("dave".into()))
            .expect_err("lobby is full");
        assert_eq!(err.code, "resource_full");

        let err = apply_patch(
            &mut record,
            &ResourcePatch::ParticipantState {
                participant: "dave".into(),
                state: json!({"ready": true}),
            },
        )
        .expect_err("dave is not a member");
        assert_eq!(err.code, "participant_not_member");

        apply_patch(&mut record, &ResourcePatch::RemoveMember("alice".into()))
            .expect("alice can leave");
        assert_eq!(record.owner.as_deref(), Some("bob"));
        assert_eq!(record.members, vec!["bob", "carol"]);
    }

    #[tokio::test(start_paused = true)]
    async fn polled_lobby_resolves_game_server_wait() {
        let store = InMemoryResourceStore::new();
        store.insert(lobby("lobby-1").with_sub_resource("status", json!("launching")));

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            EventBus::default(),
            ReconcilerOptions::default(),
        ));
        reconciler.track(lobby("lobby-1")).await;
        let mut poll = PollLoop::start(reconciler.clone(), PollConfig::default());

        let writer = store.clone();
        tokio::spawn(async move {
            sleep(secs(4)).await;
            writer
                .update("lobby-1", |record| {
                    record
                        .sub_resources
                        .insert("status".into(), json!("running"));
                })
                .expect("lobby should exist");
        });

        let start = Instant::now();
        let outcome = reconciler
            .condition(sub_resource_status_is("running"))
            .expect("lobby is tracked")
            .wait(secs(30))
            .await;
        poll.stop().await;

        assert_eq!(start.elapsed(), secs(6));
        assert!(outcome.is_resolved());
        assert_eq!(reconciler.bus().listener_count(), 0);
        assert_eq!(
            reconciler
                .current()
                .and_then(|record| record.sub_resource_status().map(ToOwned::to_owned)),
            Some("running".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn matchmaking_ticket_wait_times_out_then_matches() {
        let store = InMemoryResourceStore::new();
        store.insert(StateRecord::new("ticket-1").with_status("pending"));
        let bus = EventBus::default();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            bus.clone(),
            ReconcilerOptions::default(),
        ));
        let mut poll = PollLoop::start_with_selector(reconciler.clone(), PollConfig::default(), || {
            RefreshMode::One("ticket-1".into())
        });

        let early = AwaitCondition::new(bus.clone(), status_is("matched"))
            .for_resource("ticket-1")
            .wait(secs(2))
            .await;
        assert_eq!(early, AwaitOutcome::TimedOut);

        store
            .update("ticket-1", |ticket| ticket.status = "matched".into())
            .expect("ticket should exist");
        let start = Instant::now();
        let matched = AwaitCondition::new(bus.clone(), status_is("matched"))
            .for_resource("ticket-1")
            .wait(secs(10))
            .await;
        poll.stop().await;

        assert!(matched.is_resolved());
        assert_eq!(start.elapsed(), secs(1));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_delays_but_never_loses_a_transition() {
        let store = InMemoryResourceStore::new();
        store.insert(lobby("lobby-1"));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            EventBus::default(),
            ReconcilerOptions::default(),
        ));
        reconciler.track(lobby("lobby-1")).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = seen.clone();
            reconciler.bus().on_any(move |event| {
                seen.lock().expect("seen lock").push(event.kind());
            })
        };

        store
            .update("lobby-1", |record| record.status = "in_game".into())
            .expect("lobby should exist");
        store.fail_next(SyncError::transport("gateway timeout"));

        let mut poll = PollLoop::start(reconciler.clone(), PollConfig::default());
        sleep(Duration::from_millis(3500)).await;
        poll.stop().await;

        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec![
                EventKind::RefreshFailed,
                EventKind::StatusChanged,
                EventKind::MatchStarted,
                EventKind::GenericModified,
            ]
        );
    }

    #[tokio::test]
    async fn mutation_round_trips_through_store() {
        let store = InMemoryResourceStore::new();
        store.insert(lobby("lobby-1"));
        let reconciler = Reconciler::new(store.clone(), EventBus::default(), ReconcilerOptions::default());
        reconciler.track(lobby("lobby-1")).await;
        let mut stream = reconciler.bus().stream();

        let changes = reconciler
            .mutate(ResourcePatch::Owner("bob".into()))
            .await
            .expect("bob is a member");

        assert_eq!(
            changes[0],
            Change::OwnerChanged {
                old: Some("alice".into()),
                new: Some("bob".into()),
            }
        );
        assert_eq!(store.get("lobby-1").and_then(|record| record.owner), Some("bob".into()));
        assert_eq!(
            store.requests(),
            vec![("lobby-1".to_owned(), json!({ "host": "bob" }))]
        );
        match stream.recv().await.expect("event should be streamed") {
            SyncEvent::Changed { change, .. } => assert_eq!(change, changes[0]),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
