//! Collaborator seam: where resource snapshots come from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{error::SyncError, record::StateRecord};

/// Query narrowing a collection fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionFilter {
    /// `Some(true)` lists only public resources.
    pub public_only: Option<bool>,
}

impl CollectionFilter {
    /// List public resources only.
    pub fn public_only() -> Self {
        Self {
            public_only: Some(true),
        }
    }
}

/// Mutation requested for one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResourcePatch {
    /// Set the status tag (e.g. start or end a match).
    Status(String),
    /// Hand ownership to another participant.
    Owner(String),
    /// Replace the settings map.
    Settings(Map<String, Value>),
    /// Replace one participant's real-time state.
    ParticipantState { participant: String, state: Value },
    /// Add a participant to the member list.
    AddMember(String),
    /// Remove a participant from the member list.
    RemoveMember(String),
}

impl ResourcePatch {
    /// JSON request body understood by the lobby service.
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Status(status) => json!({ "status": status }),
            Self::Owner(owner) => json!({ "host": owner }),
            Self::Settings(settings) => json!({ "settings": settings }),
            Self::ParticipantState { participant, state } => json!({
                "playerId": participant,
                "playerState": state,
            }),
            Self::AddMember(participant) => json!({ "players": { "add": participant } }),
            Self::RemoveMember(participant) => json!({ "players": { "remove": participant } }),
        }
    }
}

/// Fetches and mutates shared resources on behalf of the reconciler.
///
/// A `NotFound` error from [`fetch_one`](ResourceSource::fetch_one) means the
/// resource is legitimately absent; every other error is a failed attempt.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn fetch_one(&self, id: &str) -> Result<StateRecord, SyncError>;

    async fn fetch_collection(
        &self,
        filter: &CollectionFilter,
    ) -> Result<Vec<StateRecord>, SyncError>;

    /// Apply `patch` and return the updated record.
    async fn mutate_one(&self, id: &str, patch: &ResourcePatch) -> Result<StateRecord, SyncError>;
}
