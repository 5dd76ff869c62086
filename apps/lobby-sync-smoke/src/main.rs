mod logging;

use std::{sync::Arc, time::Duration};

use lobby_sync_core::{
    AwaitOutcome, AwaitCondition, EventBus, EventKind, PollLoop, Reconciler, RefreshMode,
    ResourcePatch, StateRecord, SyncConfig, SyncError, SyncEvent, status_is,
    sub_resource_status_is,
};
use lobby_sync_memory::{InMemoryResourceStore, MAX_MEMBERS_ATTRIBUTE, PRIVATE_ATTRIBUTE};
use serde_json::json;
use tracing::{error, info, warn};

const LOCAL_PLAYER: &str = "smoke-player";
const GAME_PORT: u16 = 7777;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        error!(%err, "smoke run failed");
        std::process::exit(1);
    }
}

async fn run(config: SyncConfig) -> Result<(), SyncError> {
    let store = seed_store();
    let bus = EventBus::default();
    watch_lobby(&bus);

    let lobbies = Arc::new(Reconciler::new(
        store.clone(),
        bus.clone(),
        config.reconciler_options(),
    ));
    let listing = lobbies.refresh_collection().await?;
    info!(lobby_count = listing.len(), "lobby browser loaded");

    let Some(target) = listing.first().cloned() else {
        warn!("no joinable lobby listed");
        return Ok(());
    };
    lobbies.track((*target).clone()).await;
    lobbies
        .mutate(ResourcePatch::AddMember(LOCAL_PLAYER.to_owned()))
        .await?;
    lobbies
        .mutate(ResourcePatch::ParticipantState {
            participant: LOCAL_PLAYER.to_owned(),
            state: json!({"ready": true, "loadout": "scout"}),
        })
        .await?;

    let mut lobby_poll = PollLoop::start(lobbies.clone(), config.poll_config());
    tokio::spawn(simulate_host(store.clone(), target.id.clone()));

    let server = lobbies
        .condition(sub_resource_status_is("running"))?
        .wait(config.await_timeout)
        .await;
    match &server {
        AwaitOutcome::Resolved(record) => {
            match record.find_network_port(GAME_PORT, Some("udp"), None) {
                Some(port) => info!(
                    address = port.address().as_deref(),
                    "game server running"
                ),
                None => warn!(internal_port = GAME_PORT, "game server has no reachable port"),
            }
        }
        other => warn!(outcome = ?other, "game server did not come up"),
    }

    lobby_poll.stop().await;
    lobbies
        .mutate(ResourcePatch::RemoveMember(LOCAL_PLAYER.to_owned()))
        .await?;
    lobbies.leave().await;

    find_match(&store, &config).await
}

async fn find_match(store: &InMemoryResourceStore, config: &SyncConfig) -> Result<(), SyncError> {
    let ticket = store.create(
        StateRecord::new("")
            .with_status("pending")
            .with_members([LOCAL_PLAYER]),
    );
    info!(ticket_id = %ticket.id, "matchmaking ticket created");

    let bus = EventBus::default();
    let tickets = Arc::new(Reconciler::new(
        store.clone(),
        bus.clone(),
        config.reconciler_options(),
    ));
    let ticket_id = ticket.id.clone();
    let mut ticket_poll = PollLoop::start_with_selector(tickets.clone(), config.poll_config(), move || {
        RefreshMode::One(ticket_id.clone())
    });

    let matcher = store.clone();
    let matched_id = ticket.id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        if let Err(err) = matcher.update(&matched_id, |ticket| {
            ticket.status = "matched".to_owned();
            ticket.members.push("remote-player".to_owned());
        }) {
            warn!(%err, "matchmaker could not update ticket");
        }
    });

    let condition = AwaitCondition::new(bus, status_is("matched")).for_resource(ticket.id.clone());
    let cancel = condition.cancel_handle();
    let outcome = tokio::select! {
        outcome = condition.wait(config.await_timeout) => outcome,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            AwaitOutcome::Cancelled
        }
    };
    ticket_poll.stop().await;

    match outcome {
        AwaitOutcome::Resolved(ticket) => {
            info!(ticket_id = %ticket.id, players = ?ticket.members, "match found");
        }
        AwaitOutcome::TimedOut => warn!("matchmaking timed out"),
        AwaitOutcome::Cancelled => info!("matchmaking cancelled"),
    }
    store.remove(&ticket.id);
    Ok(())
}

fn seed_store() -> InMemoryResourceStore {
    let store = InMemoryResourceStore::new();
    let mut open = StateRecord::new("lobby-friday")
        .with_owner("host-player")
        .with_status("waiting")
        .with_members(["host-player"])
        .with_setting("map", json!("dunes"))
        .with_setting("rounds", json!(3));
    open.name = Some("Friday night".to_owned());
    open.attributes
        .insert(MAX_MEMBERS_ATTRIBUTE.to_owned(), json!(4));
    store.insert(open);

    let mut hidden = StateRecord::new("lobby-private")
        .with_owner("someone-else")
        .with_status("waiting")
        .with_members(["someone-else"]);
    hidden
        .attributes
        .insert(PRIVATE_ATTRIBUTE.to_owned(), json!(true));
    store.insert(hidden);
    store
}

/// Plays the remote host: another player joins, the match starts and a game
/// server comes up.
async fn simulate_host(store: InMemoryResourceStore, lobby_id: String) {
    let steps: [(u64, fn(&mut StateRecord)); 3] = [
        (2, |lobby| lobby.members.push("late-joiner".to_owned())),
        (3, |lobby| {
            lobby.status = "in_game".to_owned();
            lobby
                .sub_resources
                .insert("status".to_owned(), json!("launching"));
        }),
        (4, |lobby| {
            lobby
                .sub_resources
                .insert("status".to_owned(), json!("running"));
            lobby.sub_resources.insert(
                "network_ports".to_owned(),
                json!([{
                    "name": "game_udp",
                    "host": "203.0.113.10",
                    "internal_port": GAME_PORT,
                    "external_port": 31_777,
                    "protocol": "udp",
                    "tls_enabled": false
                }]),
            );
        }),
    ];

    for (delay_secs, step) in steps {
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
        if let Err(err) = store.update(&lobby_id, step) {
            warn!(%err, "host simulation stopped");
            return;
        }
    }
}

fn watch_lobby(bus: &EventBus) {
    bus.on(EventKind::MembershipJoined, |event| {
        if let Some(change) = event.change() {
            info!(?change, scope = ?event.scope(), "player joined");
        }
    })
    .detach();
    bus.on(EventKind::MembershipLeft, |event| {
        if let Some(change) = event.change() {
            info!(?change, scope = ?event.scope(), "player left");
        }
    })
    .detach();
    bus.on(EventKind::MatchStarted, |event| {
        let lobby_id = event.snapshot().map(|record| record.id.clone());
        info!(lobby_id = lobby_id.as_deref(), "match started");
    })
    .detach();
    bus.on(EventKind::SubResourceChanged, |event| {
        let status = event
            .snapshot()
            .and_then(|record| record.sub_resource_status().map(ToOwned::to_owned));
        info!(status = status.as_deref(), "game server changed");
    })
    .detach();
    bus.on(EventKind::RefreshFailed, |event| {
        if let SyncEvent::RefreshFailed(err) = event {
            warn!(code = %err.code, error = %err.message, "refresh failed");
        }
    })
    .detach();
}
