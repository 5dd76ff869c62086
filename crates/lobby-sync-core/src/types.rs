use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::SyncError, record::StateRecord};

/// Semantic change detected between two observations of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Change {
    /// The resource appeared (created, joined, or first observed).
    ResourceCreated {
        /// Resource id.
        id: String,
    },
    /// The resource disappeared (left, destroyed, or no longer found).
    ResourceDestroyed {
        /// Resource id.
        id: String,
    },
    /// Ownership moved to another participant.
    OwnerChanged {
        old: Option<String>,
        new: Option<String>,
    },
    /// Status tag changed.
    StatusChanged { old: String, new: String },
    /// Status crossed the configured "started" transition.
    MatchStarted {
        /// Resource id.
        id: String,
    },
    /// Status crossed the configured "ended" transition.
    MatchEnded {
        /// Resource id.
        id: String,
    },
    /// A participant is now a member.
    MembershipJoined { participant: String },
    /// A participant is no longer a member.
    MembershipLeft { participant: String },
    /// Settings changed; carries the full replacement map.
    SettingsChanged { settings: Map<String, Value> },
    /// Sub-resource data changed; carries the full replacement map.
    SubResourceChanged { sub_resources: Map<String, Value> },
    /// A participant's real-time state was added or changed.
    ParticipantStateChanged { participant: String, state: Value },
    /// Trailing summary emitted once when any field-level change occurred.
    GenericModified {
        /// Resource id.
        id: String,
    },
}

impl Change {
    /// Event kind used for listener registration.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ResourceCreated { .. } => EventKind::ResourceCreated,
            Self::ResourceDestroyed { .. } => EventKind::ResourceDestroyed,
            Self::OwnerChanged { .. } => EventKind::OwnerChanged,
            Self::StatusChanged { .. } => EventKind::StatusChanged,
            Self::MatchStarted { .. } => EventKind::MatchStarted,
            Self::MatchEnded { .. } => EventKind::MatchEnded,
            Self::MembershipJoined { .. } => EventKind::MembershipJoined,
            Self::MembershipLeft { .. } => EventKind::MembershipLeft,
            Self::SettingsChanged { .. } => EventKind::SettingsChanged,
            Self::SubResourceChanged { .. } => EventKind::SubResourceChanged,
            Self::ParticipantStateChanged { .. } => EventKind::ParticipantStateChanged,
            Self::GenericModified { .. } => EventKind::GenericModified,
        }
    }
}

/// Listener registration key. Every [`SyncEvent`] maps to exactly one kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    ResourceCreated,
    ResourceDestroyed,
    OwnerChanged,
    StatusChanged,
    MatchStarted,
    MatchEnded,
    MembershipJoined,
    MembershipLeft,
    SettingsChanged,
    SubResourceChanged,
    ParticipantStateChanged,
    GenericModified,
    ResourceAdded,
    ResourceRemoved,
    CollectionRefreshed,
    RefreshFailed,
}

/// Which cache a published change was derived from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Scope {
    /// The resource the local actor is tracking (joined lobby, own ticket).
    Current,
    /// An item of the known collection (lobby browser).
    Collection,
}

/// Event published on the [`EventBus`](crate::bus::EventBus).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncEvent {
    /// Differ output for one resource.
    Changed {
        scope: Scope,
        change: Change,
        /// Record the change was derived from; absent when the resource is gone.
        snapshot: Option<Arc<StateRecord>>,
    },
    /// A resource appeared in the collection.
    ResourceAdded(Arc<StateRecord>),
    /// A resource disappeared from the collection.
    ResourceRemoved(Arc<StateRecord>),
    /// Collection refresh finished; carries the full new collection.
    CollectionRefreshed(Arc<Vec<Arc<StateRecord>>>),
    /// A polled refresh failed; caches were left untouched.
    RefreshFailed(SyncError),
}

impl SyncEvent {
    /// Kind this event is dispatched under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Changed { change, .. } => change.kind(),
            Self::ResourceAdded(_) => EventKind::ResourceAdded,
            Self::ResourceRemoved(_) => EventKind::ResourceRemoved,
            Self::CollectionRefreshed(_) => EventKind::CollectionRefreshed,
            Self::RefreshFailed(_) => EventKind::RefreshFailed,
        }
    }

    /// Record carried by the event, if any.
    pub fn snapshot(&self) -> Option<&Arc<StateRecord>> {
        match self {
            Self::Changed { snapshot, .. } => snapshot.as_ref(),
            Self::ResourceAdded(record) => Some(record),
            Self::ResourceRemoved(_) | Self::CollectionRefreshed(_) | Self::RefreshFailed(_) => {
                None
            }
        }
    }

    /// Carried change, for `Changed` events.
    pub fn change(&self) -> Option<&Change> {
        match self {
            Self::Changed { change, .. } => Some(change),
            _ => None,
        }
    }

    /// Which cache produced the event, for `Changed` events.
    pub fn scope(&self) -> Option<Scope> {
        match self {
            Self::Changed { scope, .. } => Some(*scope),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_event_kind_follows_change() {
        let event = SyncEvent::Changed {
            scope: Scope::Current,
            change: Change::MembershipJoined {
                participant: "carol".into(),
            },
            snapshot: None,
        };
        assert_eq!(event.kind(), EventKind::MembershipJoined);
        assert_eq!(event.scope(), Some(Scope::Current));
    }

    #[test]
    fn removed_resource_does_not_expose_snapshot() {
        let event = SyncEvent::ResourceRemoved(Arc::new(StateRecord::new("lobby-1")));
        assert_eq!(event.kind(), EventKind::ResourceRemoved);
        assert!(event.snapshot().is_none());
    }
}
