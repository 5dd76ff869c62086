//! Field-by-field comparison of two resource snapshots.
//!
//! [`diff`] is pure: it never looks at caches or publishes anything. Output
//! order is fixed (owner, status, settings, membership, sub-resources,
//! participant state, trailing summary) and participant-keyed changes are
//! sorted by participant id, so identical inputs always produce identical
//! output.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::{record::StateRecord, types::Change};

/// A `from -> to` status pair that carries extra meaning (match start/end).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: String,
    pub to: String,
}

impl StatusTransition {
    /// Transition from `from` to `to`.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Parse `from:to`. Returns `None` when either side is empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let (from, to) = raw.split_once(':')?;
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() {
            return None;
        }
        Some(Self::new(from, to))
    }

    /// Whether a status change from `old` to `new` is this transition.
    pub fn matches(&self, old: &str, new: &str) -> bool {
        self.from == old && self.to == new
    }
}

/// Policy knobs for [`diff`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffPolicy {
    /// Transition reported as [`Change::MatchStarted`].
    pub match_started: Option<StatusTransition>,
    /// Transition reported as [`Change::MatchEnded`].
    pub match_ended: Option<StatusTransition>,
    /// When a participant is still a member but their real-time state entry
    /// disappeared, report it as a `ParticipantStateChanged` with a `null`
    /// state. Off by default: removed entries are silently dropped.
    pub report_cleared_participant_state: bool,
}

impl DiffPolicy {
    /// Lobby defaults: `waiting -> in_game` starts a match, the reverse ends it.
    pub fn lobby() -> Self {
        Self {
            match_started: Some(StatusTransition::new("waiting", "in_game")),
            match_ended: Some(StatusTransition::new("in_game", "waiting")),
            report_cleared_participant_state: false,
        }
    }

    /// No derived match events; only raw status changes are reported.
    pub fn without_match_transitions() -> Self {
        Self {
            match_started: None,
            match_ended: None,
            report_cleared_participant_state: false,
        }
    }
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self::lobby()
    }
}

/// Compare two observations of a resource and list what changed.
///
/// `None` means "not present". Creation and destruction are reported alone;
/// creation does not imply per-member joins (see [`synthesize_joins`]).
pub fn diff(
    old: Option<&StateRecord>,
    new: Option<&StateRecord>,
    policy: &DiffPolicy,
) -> Vec<Change> {
    match (old, new) {
        (None, None) => Vec::new(),
        (None, Some(new)) => vec![Change::ResourceCreated { id: new.id.clone() }],
        (Some(old), None) => vec![Change::ResourceDestroyed { id: old.id.clone() }],
        (Some(old), Some(new)) if old.id != new.id => vec![
            Change::ResourceDestroyed { id: old.id.clone() },
            Change::ResourceCreated { id: new.id.clone() },
        ],
        (Some(old), Some(new)) => diff_fields(old, new, policy),
    }
}

/// Joined-events for every initial member of a freshly observed resource,
/// sorted by participant id.
pub fn synthesize_joins(record: &StateRecord) -> Vec<Change> {
    member_set(record)
        .into_iter()
        .map(|participant| Change::MembershipJoined {
            participant: participant.to_owned(),
        })
        .collect()
}

/// Structural equality over JSON-like values, comparing numbers by value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => maps_equal(x, y),
        _ => a == b,
    }
}

/// [`values_equal`] for string-keyed maps.
pub fn maps_equal(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(key, value)| b.get(key).is_some_and(|other| values_equal(value, other)))
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if x == y {
        return true;
    }
    // 3 and 3.0 are the same setting value
    if x.is_f64() || y.is_f64() {
        return matches!((x.as_f64(), y.as_f64()), (Some(a), Some(b)) if a == b);
    }
    false
}

fn diff_fields(old: &StateRecord, new: &StateRecord, policy: &DiffPolicy) -> Vec<Change> {
    let mut changes = Vec::new();

    if old.owner != new.owner {
        changes.push(Change::OwnerChanged {
            old: old.owner.clone(),
            new: new.owner.clone(),
        });
    }

    if old.status != new.status {
        changes.push(Change::StatusChanged {
            old: old.status.clone(),
            new: new.status.clone(),
        });

        let started = policy
            .match_started
            .as_ref()
            .is_some_and(|pair| pair.matches(&old.status, &new.status));
        let ended = policy
            .match_ended
            .as_ref()
            .is_some_and(|pair| pair.matches(&old.status, &new.status));
        if started {
            changes.push(Change::MatchStarted { id: new.id.clone() });
        } else if ended {
            changes.push(Change::MatchEnded { id: new.id.clone() });
        }
    }

    if !maps_equal(&old.settings, &new.settings) {
        changes.push(Change::SettingsChanged {
            settings: new.settings.clone(),
        });
    }

    let old_members = member_set(old);
    let new_members = member_set(new);
    changes.extend(
        new_members
            .difference(&old_members)
            .map(|participant| Change::MembershipJoined {
                participant: (*participant).to_owned(),
            }),
    );
    changes.extend(
        old_members
            .difference(&new_members)
            .map(|participant| Change::MembershipLeft {
                participant: (*participant).to_owned(),
            }),
    );

    if !maps_equal(&old.sub_resources, &new.sub_resources) {
        changes.push(Change::SubResourceChanged {
            sub_resources: new.sub_resources.clone(),
        });
    }

    // One pass over both key sets keeps updates and clears in participant order.
    let participants: BTreeSet<&String> = old
        .participant_states
        .keys()
        .chain(new.participant_states.keys())
        .collect();
    for participant in participants {
        match (
            old.participant_states.get(participant),
            new.participant_states.get(participant),
        ) {
            (previous, Some(state)) => {
                if !previous.is_some_and(|previous| values_equal(previous, state)) {
                    changes.push(Change::ParticipantStateChanged {
                        participant: participant.clone(),
                        state: state.clone(),
                    });
                }
            }
            (Some(_), None)
                if policy.report_cleared_participant_state && new.has_member(participant) =>
            {
                changes.push(Change::ParticipantStateChanged {
                    participant: participant.clone(),
                    state: Value::Null,
                });
            }
            _ => {}
        }
    }

    if !changes.is_empty() {
        changes.push(Change::GenericModified { id: new.id.clone() });
    }

    changes
}

fn member_set(record: &StateRecord) -> BTreeSet<&str> {
    record.members.iter().map(String::as_str).collect()
}
