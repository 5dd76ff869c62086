//! Client-side synchronization of polled, shared session state.
//!
//! A [`Reconciler`] fetches snapshots of a lobby (or matchmaking ticket)
//! through a [`ResourceSource`], diffs them against its cache and publishes
//! the differences on an [`EventBus`]. A [`PollLoop`] drives refreshes on a
//! timer, and an [`AwaitCondition`] waits for a snapshot that satisfies a
//! predicate, with timeout and cancellation.

/// Predicate-based waits over published snapshots.
pub mod await_condition;
/// Listener registry and async event stream.
pub mod bus;
/// Environment-backed engine configuration.
pub mod config;
/// Pure snapshot comparison.
pub mod diff;
/// Stable sync error types and HTTP classification helpers.
pub mod error;
/// Timer-driven refresh loop.
pub mod poll;
/// Fetch, diff and publish cycle over the resource caches.
pub mod reconciler;
/// Resource snapshot model.
pub mod record;
/// Collaborator trait for fetching and mutating resources.
pub mod source;
/// Change and event taxonomy.
pub mod types;

pub use await_condition::{
    AwaitCancelHandle, AwaitCondition, AwaitOutcome, AwaitState, Predicate, status_is,
    sub_resource_status_is,
};
pub use bus::{DEFAULT_STREAM_BUFFER, EventBus, EventStream, Subscription};
pub use config::{ConfigError, SyncConfig};
pub use diff::{DiffPolicy, StatusTransition, diff, synthesize_joins, values_equal};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use poll::{MIN_POLL_INTERVAL, ModeSelector, PollConfig, PollLoop, clamp_interval};
pub use reconciler::{Reconciler, ReconcilerOptions, RefreshMode};
pub use record::{NETWORK_PORTS_KEY, NetworkPort, SUB_RESOURCE_STATUS_KEY, StateRecord};
pub use source::{CollectionFilter, ResourcePatch, ResourceSource};
pub use types::{Change, EventKind, Scope, SyncEvent};
