//! Environment-backed tuning for the sync engine.

use std::{env, time::Duration};

use thiserror::Error;

use crate::{
    diff::{DiffPolicy, StatusTransition},
    error::{SyncError, SyncErrorCategory},
    poll::{MIN_POLL_INTERVAL, PollConfig},
    reconciler::ReconcilerOptions,
    source::CollectionFilter,
};

const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_AWAIT_TIMEOUT_MS: u64 = 30_000;

const POLL_INTERVAL_KEY: &str = "LOBBY_SYNC_POLL_INTERVAL_MS";
const AWAIT_TIMEOUT_KEY: &str = "LOBBY_SYNC_AWAIT_TIMEOUT_MS";
const MATCH_STARTED_KEY: &str = "LOBBY_SYNC_MATCH_STARTED";
const MATCH_ENDED_KEY: &str = "LOBBY_SYNC_MATCH_ENDED";
const REPORT_CLEARED_STATE_KEY: &str = "LOBBY_SYNC_REPORT_CLEARED_STATE";
const ANNOUNCE_INITIAL_MEMBERS_KEY: &str = "LOBBY_SYNC_ANNOUNCE_INITIAL_MEMBERS";
const PUBLIC_ONLY_KEY: &str = "LOBBY_SYNC_PUBLIC_ONLY";

/// Runtime configuration for a reconciler, its poll loop and waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Requested poll interval; the floor is applied when the loop starts.
    pub poll_interval: Duration,
    /// Default timeout for condition waits.
    pub await_timeout: Duration,
    pub policy: DiffPolicy,
    pub public_only: bool,
    pub announce_initial_members: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            await_timeout: Duration::from_millis(DEFAULT_AWAIT_TIMEOUT_MS),
            policy: DiffPolicy::lobby(),
            public_only: false,
            announce_initial_members: false,
        }
    }
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let poll_interval_ms =
            parse_u64_with_default(POLL_INTERVAL_KEY, DEFAULT_POLL_INTERVAL_MS, &mut lookup)?;
        let await_timeout_ms =
            parse_u64_with_default(AWAIT_TIMEOUT_KEY, DEFAULT_AWAIT_TIMEOUT_MS, &mut lookup)?;
        if await_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: AWAIT_TIMEOUT_KEY,
                value: "0".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        let defaults = DiffPolicy::lobby();
        let policy = DiffPolicy {
            match_started: parse_transition(MATCH_STARTED_KEY, defaults.match_started, &mut lookup)?,
            match_ended: parse_transition(MATCH_ENDED_KEY, defaults.match_ended, &mut lookup)?,
            report_cleared_participant_state: parse_bool(
                REPORT_CLEARED_STATE_KEY,
                false,
                &mut lookup,
            )?,
        };

        Ok(Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            await_timeout: Duration::from_millis(await_timeout_ms),
            policy,
            public_only: parse_bool(PUBLIC_ONLY_KEY, false, &mut lookup)?,
            announce_initial_members: parse_bool(ANNOUNCE_INITIAL_MEMBERS_KEY, false, &mut lookup)?,
        })
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: self.poll_interval,
            floor: MIN_POLL_INTERVAL,
        }
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            policy: self.policy.clone(),
            filter: CollectionFilter {
                public_only: self.public_only.then_some(true),
            },
            announce_initial_members: self.announce_initial_members,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::new(SyncErrorCategory::Config, "invalid_config", err.to_string())
    }
}

fn optional_trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean (true/false)".to_owned(),
        }),
    }
}

fn parse_transition<F>(
    key: &'static str,
    default: Option<StatusTransition>,
    lookup: &mut F,
) -> Result<Option<StatusTransition>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    if value.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    match StatusTransition::parse(&value) {
        Some(transition) => Ok(Some(transition)),
        None => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected 'from:to' or 'off'".to_owned(),
        }),
    }
}
