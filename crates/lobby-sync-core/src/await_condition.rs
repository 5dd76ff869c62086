//! One-shot wait for a resource snapshot that satisfies a predicate.
//!
//! The predicate is checked on the initial snapshot (if any) and then against
//! every published event that carries a snapshot. The first match, the
//! timeout or a cancellation ends the wait; the listener is unregistered
//! before [`AwaitCondition::wait`] returns.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    bus::{EventBus, Subscription},
    record::StateRecord,
};

/// Shared predicate over resource snapshots.
pub type Predicate = Arc<dyn Fn(&StateRecord) -> bool + Send + Sync>;

/// Lifecycle of one wait; the last three states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitState {
    Idle,
    Listening,
    Resolved,
    TimedOut,
    Cancelled,
}

impl AwaitState {
    /// Whether the wait has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::TimedOut | Self::Cancelled)
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    /// The predicate held for this snapshot.
    Resolved(Arc<StateRecord>),
    TimedOut,
    Cancelled,
}

impl AwaitOutcome {
    /// Whether a matching snapshot was found.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Matching snapshot, if resolved.
    pub fn record(&self) -> Option<&Arc<StateRecord>> {
        match self {
            Self::Resolved(record) => Some(record),
            Self::TimedOut | Self::Cancelled => None,
        }
    }

    fn state(&self) -> AwaitState {
        match self {
            Self::Resolved(_) => AwaitState::Resolved,
            Self::TimedOut => AwaitState::TimedOut,
            Self::Cancelled => AwaitState::Cancelled,
        }
    }
}

struct WaitShared {
    token: CancellationToken,
    subscription: Mutex<Option<Subscription>>,
    state: Mutex<AwaitState>,
}

impl WaitShared {
    fn state(&self) -> AwaitState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: AwaitState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() {
            *state = next;
        }
    }

    fn release_listener(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}

/// Unregisters the wait's listener on every exit from `wait`, including the
/// future being dropped mid-wait.
struct ListenerRelease<'a> {
    shared: &'a WaitShared,
}

impl Drop for ListenerRelease<'_> {
    fn drop(&mut self) {
        self.shared.release_listener();
        self.shared.set_state(AwaitState::Cancelled);
    }
}

/// Cancels a pending [`AwaitCondition`] from elsewhere.
#[derive(Clone)]
pub struct AwaitCancelHandle {
    shared: Arc<WaitShared>,
}

impl AwaitCancelHandle {
    /// Cancel the wait. Once this returns the predicate is never evaluated
    /// again and the listener is gone from the bus.
    pub fn cancel(&self) {
        self.shared.token.cancel();
        self.shared.release_listener();
        self.shared.set_state(AwaitState::Cancelled);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Current state of the wait this handle controls.
    pub fn state(&self) -> AwaitState {
        self.shared.state()
    }
}

impl fmt::Debug for AwaitCancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitCancelHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Predicate-based wait with timeout and cancellation.
pub struct AwaitCondition {
    bus: EventBus,
    predicate: Predicate,
    resource_id: Option<String>,
    initial: Option<Arc<StateRecord>>,
    shared: Arc<WaitShared>,
}

impl AwaitCondition {
    /// Wait on `bus` for any snapshot satisfying `predicate`.
    pub fn new<P>(bus: EventBus, predicate: P) -> Self
    where
        P: Fn(&StateRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            bus,
            predicate: Arc::new(predicate),
            resource_id: None,
            initial: None,
            shared: Arc::new(WaitShared {
                token: CancellationToken::new(),
                subscription: Mutex::new(None),
                state: Mutex::new(AwaitState::Idle),
            }),
        }
    }

    /// Only consider snapshots of the resource with this id.
    pub fn for_resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    /// Snapshot checked before listening.
    pub fn with_initial(mut self, snapshot: Arc<StateRecord>) -> Self {
        self.initial = Some(snapshot);
        self
    }

    /// Handle that cancels this wait from another task.
    pub fn cancel_handle(&self) -> AwaitCancelHandle {
        AwaitCancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Current state of this wait.
    pub fn state(&self) -> AwaitState {
        self.shared.state()
    }

    /// Wait up to `timeout` for a matching snapshot.
    ///
    /// Dropping the returned future before it completes unregisters the
    /// listener and leaves the wait `Cancelled`.
    pub async fn wait(self, timeout: Duration) -> AwaitOutcome {
        let _release = ListenerRelease {
            shared: &self.shared,
        };
        let outcome = self.wait_inner(timeout).await;
        self.shared.release_listener();
        self.shared.set_state(outcome.state());
        debug!(
            resource_id = self.resource_id.as_deref(),
            state = ?outcome.state(),
            "await condition finished"
        );
        outcome
    }

    async fn wait_inner(&self, timeout: Duration) -> AwaitOutcome {
        let token = self.shared.token.clone();
        if token.is_cancelled() {
            return AwaitOutcome::Cancelled;
        }

        if let Some(initial) = self.initial.as_ref()
            && self.in_scope(initial)
            && (self.predicate)(&**initial)
        {
            return AwaitOutcome::Resolved(initial.clone());
        }

        let (matched_tx, mut matched_rx) = oneshot::channel::<Arc<StateRecord>>();
        let mut matched_tx = Some(matched_tx);
        let predicate = self.predicate.clone();
        let resource_id = self.resource_id.clone();
        let listener_token = token.clone();

        let subscription = self.bus.on_any(move |event| {
            if listener_token.is_cancelled() {
                return;
            }
            let Some(snapshot) = event.snapshot() else {
                return;
            };
            let in_scope = resource_id
                .as_deref()
                .is_none_or(|id| id == snapshot.id);
            if in_scope
                && predicate(&**snapshot)
                && let Some(tx) = matched_tx.take()
            {
                let _ = tx.send(snapshot.clone());
            }
        });
        *self
            .shared
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        // cancel() may have run before the subscription was stored
        if token.is_cancelled() {
            return AwaitOutcome::Cancelled;
        }
        self.shared.set_state(AwaitState::Listening);
        debug!(
            resource_id = self.resource_id.as_deref(),
            timeout_ms = timeout.as_millis() as u64,
            "await condition listening"
        );

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => AwaitOutcome::Cancelled,
            matched = &mut matched_rx => match matched {
                Ok(record) => AwaitOutcome::Resolved(record),
                Err(_) => AwaitOutcome::Cancelled,
            },
            _ = tokio::time::sleep(timeout) => AwaitOutcome::TimedOut,
        };

        if token.is_cancelled() {
            return AwaitOutcome::Cancelled;
        }
        outcome
    }

    fn in_scope(&self, snapshot: &StateRecord) -> bool {
        self.resource_id
            .as_deref()
            .is_none_or(|id| id == snapshot.id)
    }
}

impl fmt::Debug for AwaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitCondition")
            .field("resource_id", &self.resource_id)
            .field("has_initial", &self.initial.is_some())
            .field("state", &self.state())
            .finish()
    }
}

/// Matches when the resource status equals `tag` (e.g. a ticket `matched`).
pub fn status_is(tag: impl Into<String>) -> impl Fn(&StateRecord) -> bool + Send + Sync + 'static {
    let tag = tag.into();
    move |record| record.status == tag
}

/// Matches when the provisioned sub-resource reports status `tag`
/// (e.g. a game server `running`).
pub fn sub_resource_status_is(
    tag: impl Into<String>,
) -> impl Fn(&StateRecord) -> bool + Send + Sync + 'static {
    let tag = tag.into();
    move |record| record.sub_resource_status() == Some(tag.as_str())
}
