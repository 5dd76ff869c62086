//! Point-in-time snapshot of a polled resource (lobby or matchmaking ticket).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SyncError;

/// Key under `sub_resources` holding the provisioned server status.
pub const SUB_RESOURCE_STATUS_KEY: &str = "status";
/// Key under `sub_resources` holding the network port list.
pub const NETWORK_PORTS_KEY: &str = "network_ports";

/// Snapshot of a shared resource as reported by the service.
///
/// Records are replaced wholesale on every refresh and never mutated in place
/// by the sync engine. Field names follow the lobby service payload; a
/// matchmaking ticket deserializes into the same shape (`ticket_id` is
/// accepted for `id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateRecord {
    /// Stable identifier, unique within the resource namespace.
    #[serde(alias = "ticket_id")]
    pub id: String,
    /// Display name, when the service provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Owner/host participant.
    #[serde(rename = "host", default)]
    pub owner: Option<String>,
    /// Open-set status tag such as `waiting`, `in_game` or `matched`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    /// Participant ids; order is not significant.
    #[serde(rename = "players", default, deserialize_with = "null_as_default")]
    pub members: Vec<String>,
    /// Free-form settings, replaced as a whole.
    #[serde(default, deserialize_with = "null_as_default")]
    pub settings: Map<String, Value>,
    /// Externally provisioned infrastructure (game server, ports, ...).
    #[serde(rename = "gameServer", default, deserialize_with = "null_as_default")]
    pub sub_resources: Map<String, Value>,
    /// Per-participant real-time state.
    #[serde(
        rename = "lobbyStateRealTime",
        default,
        deserialize_with = "null_as_default"
    )]
    pub participant_states: BTreeMap<String, Value>,
    /// Remaining service attributes, kept so the record round-trips.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl StateRecord {
    /// Create an empty record with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Decode a record from a JSON response body.
    pub fn from_json(raw: &str) -> Result<Self, SyncError> {
        serde_json::from_str(raw).map_err(SyncError::from_json)
    }

    /// Decode a record from an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        serde_json::from_value(value).map_err(SyncError::from_json)
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Replace the member list, keeping the given order.
    pub fn with_members<I, M>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    /// Set one settings entry.
    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Set one sub-resource field.
    pub fn with_sub_resource(mut self, key: impl Into<String>, value: Value) -> Self {
        self.sub_resources.insert(key.into(), value);
        self
    }

    /// Set one participant's state.
    pub fn with_participant_state(mut self, participant: impl Into<String>, state: Value) -> Self {
        self.participant_states.insert(participant.into(), state);
        self
    }

    /// Whether `participant` is listed as a member.
    pub fn has_member(&self, participant: &str) -> bool {
        self.members.iter().any(|member| member == participant)
    }

    /// Whether `participant` owns the resource.
    pub fn is_owned_by(&self, participant: &str) -> bool {
        self.owner.as_deref() == Some(participant)
    }

    /// Status string of the provisioned sub-resource, if reported.
    pub fn sub_resource_status(&self) -> Option<&str> {
        self.sub_resources
            .get(SUB_RESOURCE_STATUS_KEY)
            .and_then(Value::as_str)
    }

    /// Network ports advertised by the sub-resource.
    ///
    /// Entries that are not objects or lack an `internal_port` are skipped.
    pub fn network_ports(&self) -> Vec<NetworkPort> {
        let Some(ports) = get_ignore_case(&self.sub_resources, NETWORK_PORTS_KEY) else {
            return Vec::new();
        };
        let Some(ports) = ports.as_array() else {
            debug!(resource_id = %self.id, "network_ports is not an array");
            return Vec::new();
        };

        ports.iter().filter_map(NetworkPort::from_value).collect()
    }

    /// First reachable port matching `internal_port` and, when given, the
    /// protocol and port name (both compared case-insensitively).
    ///
    /// Only ports with both a host and an external port qualify.
    pub fn find_network_port(
        &self,
        internal_port: u16,
        protocol: Option<&str>,
        name: Option<&str>,
    ) -> Option<NetworkPort> {
        self.network_ports().into_iter().find(|port| {
            port.internal_port == internal_port
                && matches_optional(protocol, port.protocol.as_deref())
                && matches_optional(name, port.name.as_deref())
                && port.is_reachable()
        })
    }
}

/// One entry of the sub-resource `network_ports` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkPort {
    pub name: Option<String>,
    pub host: Option<String>,
    pub internal_port: u16,
    pub external_port: Option<u16>,
    pub protocol: Option<String>,
    pub tls_enabled: Option<bool>,
}

impl NetworkPort {
    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let internal_port = port_number(object.get("internal_port"))?;

        Some(Self {
            name: string_field(object, "name"),
            host: string_field(object, "host").filter(|host| !host.is_empty()),
            internal_port,
            external_port: port_number(object.get("external_port")),
            protocol: string_field(object, "protocol"),
            tls_enabled: object.get("tls_enabled").and_then(Value::as_bool),
        })
    }

    /// A port is reachable once the service assigned a host and external port.
    pub fn is_reachable(&self) -> bool {
        self.host.is_some() && self.external_port.is_some()
    }

    /// `host:external_port`, when reachable.
    pub fn address(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let port = self.external_port?;
        Some(format!("{host}:{port}"))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn get_ignore_case<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).or_else(|| {
        map.iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    })
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

fn port_number(value: Option<&Value>) -> Option<u16> {
    let value = value?;
    let number = match value {
        Value::Number(number) => number.as_u64()?,
        Value::String(raw) => raw.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u16::try_from(number).ok()
}

fn matches_optional(wanted: Option<&str>, actual: Option<&str>) -> bool {
    match wanted.filter(|value| !value.is_empty()) {
        None => true,
        Some(wanted) => actual.is_some_and(|actual| actual.eq_ignore_ascii_case(wanted)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn lobby_payload() -> Value {
        json!({
            "id": "lobby-1",
            "name": "Friday night",
            "host": "alice",
            "status": "waiting",
            "players": ["alice", "bob"],
            "settings": {"map": "dunes", "rounds": 3},
            "gameServer": {
                "status": "launching",
                "Network_Ports": [
                    {"name": "game_udp", "host": "10.0.0.7", "internal_port": 7777,
                     "external_port": 31001, "protocol": "UDP", "tls_enabled": false},
                    {"name": "web", "host": "", "internal_port": 8080,
                     "external_port": 31002, "protocol": "tcp"},
                    "garbage"
                ]
            },
            "lobbyStateRealTime": {"bob": {"ready": true}},
            "maxPlayers": 4,
            "isPrivate": false
        })
    }

    #[test]
    fn decodes_lobby_payload_with_service_field_names() {
        let record = StateRecord::from_value(lobby_payload()).expect("payload should decode");

        assert_eq!(record.id, "lobby-1");
        assert_eq!(record.name.as_deref(), Some("Friday night"));
        assert_eq!(record.owner.as_deref(), Some("alice"));
        assert_eq!(record.members, vec!["alice", "bob"]);
        assert_eq!(record.settings["rounds"], json!(3));
        assert_eq!(record.participant_states["bob"], json!({"ready": true}));
        assert_eq!(record.attributes["maxPlayers"], json!(4));
        assert_eq!(record.sub_resource_status(), Some("launching"));
        assert!(record.is_owned_by("alice"));
        assert!(record.has_member("bob"));
    }

    #[test]
    fn null_collections_decode_as_empty() {
        let record = StateRecord::from_value(json!({
            "id": "lobby-2",
            "host": null,
            "status": null,
            "players": null,
            "settings": null,
            "gameServer": null,
            "lobbyStateRealTime": null
        }))
        .expect("payload should decode");

        assert_eq!(record, StateRecord::new("lobby-2"));
    }

    #[test]
    fn decodes_ticket_id_alias() {
        let record = StateRecord::from_value(json!({"ticket_id": "t-9", "status": "pending"}))
            .expect("ticket should decode");
        assert_eq!(record.id, "t-9");
        assert_eq!(record.status, "pending");
    }

    #[test]
    fn rejects_payload_without_id_as_malformed() {
        let err = StateRecord::from_json(r#"{"status": "waiting"}"#)
            .expect_err("id is required");
        assert_eq!(err.category, crate::error::SyncErrorCategory::MalformedResponse);
    }

    #[test]
    fn parses_network_ports_and_skips_invalid_entries() {
        let record = StateRecord::from_value(lobby_payload()).expect("payload should decode");
        let ports = record.network_ports();

        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].address().as_deref(), Some("10.0.0.7:31001"));
        assert_eq!(ports[0].tls_enabled, Some(false));
        assert!(!ports[1].is_reachable());
    }

    #[test]
    fn finds_port_by_internal_port_protocol_and_name() {
        let record = StateRecord::from_value(lobby_payload()).expect("payload should decode");

        let port = record
            .find_network_port(7777, Some("udp"), Some("GAME_UDP"))
            .expect("port should match case-insensitively");
        assert_eq!(port.external_port, Some(31001));

        assert!(record.find_network_port(7777, Some("tcp"), None).is_none());
        // host is empty, so the web port is not usable yet
        assert!(record.find_network_port(8080, None, None).is_none());
    }
}
