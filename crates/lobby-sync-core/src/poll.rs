use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    reconciler::{Reconciler, RefreshMode},
    source::ResourceSource,
};

/// Shortest interval the service tolerates between polls.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Picks what each tick refreshes.
pub type ModeSelector = Arc<dyn Fn() -> RefreshMode + Send + Sync>;

/// Timing for a [`PollLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Requested interval between ticks.
    pub interval: Duration,
    /// Lower bound applied to `interval`.
    pub floor: Duration,
}

impl PollConfig {
    /// Poll every `interval`, floored at [`MIN_POLL_INTERVAL`].
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Interval actually used, after the floor is applied.
    pub fn effective_interval(&self) -> Duration {
        clamp_interval(self.interval, self.floor)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: MIN_POLL_INTERVAL,
            floor: MIN_POLL_INTERVAL,
        }
    }
}

/// Raise `requested` to `floor` if it is shorter.
pub fn clamp_interval(requested: Duration, floor: Duration) -> Duration {
    if requested < floor {
        warn!(
            requested_ms = requested.as_millis() as u64,
            floor_ms = floor.as_millis() as u64,
            "poll interval below minimum; clamping"
        );
        floor
    } else {
        requested
    }
}

/// Periodic driver of [`Reconciler`] refreshes.
///
/// The first tick fires immediately. A tick that finds a refresh still in
/// flight is dropped; the timer itself never waits for a refresh.
#[derive(Debug)]
pub struct PollLoop {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl PollLoop {
    /// Poll with the reconciler's default mode selection.
    pub fn start<S>(reconciler: Arc<Reconciler<S>>, config: PollConfig) -> Self
    where
        S: ResourceSource + 'static,
    {
        Self::spawn(reconciler, config, None)
    }

    /// Poll with a caller-provided mode selector.
    pub fn start_with_selector<S, F>(
        reconciler: Arc<Reconciler<S>>,
        config: PollConfig,
        selector: F,
    ) -> Self
    where
        S: ResourceSource + 'static,
        F: Fn() -> RefreshMode + Send + Sync + 'static,
    {
        Self::spawn(reconciler, config, Some(Arc::new(selector)))
    }

    fn spawn<S>(
        reconciler: Arc<Reconciler<S>>,
        config: PollConfig,
        selector: Option<ModeSelector>,
    ) -> Self
    where
        S: ResourceSource + 'static,
    {
        let interval = config.effective_interval();
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();

        info!(interval_ms = interval.as_millis() as u64, "poll loop started");
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_child.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(permit) = reconciler.try_begin_refresh() else {
                            debug!("refresh still in flight; dropping tick");
                            continue;
                        };
                        let mode = match &selector {
                            Some(selector) => selector(),
                            None => reconciler.default_mode(),
                        };
                        trace!(?mode, "poll tick");

                        let reconciler = reconciler.clone();
                        tokio::spawn(async move {
                            reconciler.run_tick(permit, mode).await;
                        });
                    }
                }
            }

            debug!("poll loop stopped");
        });

        Self {
            stop,
            task: Some(task),
            interval,
        }
    }

    /// Effective tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the loop task is still alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop ticking. No refresh starts after this returns; one already in
    /// flight still completes and publishes.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::time::{Instant, sleep};

    use super::*;
    use crate::{
        bus::EventBus,
        error::SyncError,
        reconciler::ReconcilerOptions,
        record::StateRecord,
        source::{CollectionFilter, ResourcePatch},
        types::EventKind,
    };

    /// Records when and how it was fetched.
    struct TimedSource {
        delay: Duration,
        fail: bool,
        calls: Mutex<Vec<(Instant, String)>>,
    }

    impl TimedSource {
        fn new(delay: Duration, fail: bool) -> Self {
            Self {
                delay,
                fail,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_since(&self, start: Instant) -> Vec<(Duration, String)> {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .map(|(at, what)| (*at - start, what.clone()))
                .collect()
        }

        async fn record(&self, what: String) -> Result<(), SyncError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((Instant::now(), what));
            sleep(self.delay).await;
            if self.fail {
                return Err(SyncError::transport("service unavailable"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceSource for TimedSource {
        async fn fetch_one(&self, id: &str) -> Result<StateRecord, SyncError> {
            self.record(format!("one:{id}")).await?;
            Ok(StateRecord::new(id))
        }

        async fn fetch_collection(
            &self,
            _filter: &CollectionFilter,
        ) -> Result<Vec<StateRecord>, SyncError> {
            self.record("collection".into()).await?;
            Ok(Vec::new())
        }

        async fn mutate_one(
            &self,
            id: &str,
            _patch: &ResourcePatch,
        ) -> Result<StateRecord, SyncError> {
            Ok(StateRecord::new(id))
        }
    }

    fn reconciler(delay: Duration, fail: bool) -> Arc<Reconciler<TimedSource>> {
        Arc::new(Reconciler::new(
            TimedSource::new(delay, fail),
            EventBus::default(),
            ReconcilerOptions::default(),
        ))
    }

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn clamps_interval_to_floor() {
        assert_eq!(clamp_interval(secs(1), MIN_POLL_INTERVAL), secs(3));
        assert_eq!(clamp_interval(secs(5), MIN_POLL_INTERVAL), secs(5));
        assert_eq!(PollConfig::new(Duration::from_millis(10)).effective_interval(), secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_immediately_then_at_clamped_interval() {
        let reconciler = reconciler(Duration::ZERO, false);
        let start = Instant::now();
        let mut poll = PollLoop::start(reconciler.clone(), PollConfig::new(secs(1)));
        assert_eq!(poll.interval(), secs(3));

        sleep(Duration::from_millis(6500)).await;
        poll.stop().await;

        let at: Vec<Duration> = reconciler
            .source()
            .calls_since(start)
            .into_iter()
            .map(|(at, _)| at)
            .collect();
        assert_eq!(at, vec![secs(0), secs(3), secs(6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_ticks_while_refresh_is_in_flight() {
        let reconciler = reconciler(secs(5), false);
        let start = Instant::now();
        let mut poll = PollLoop::start(reconciler.clone(), PollConfig::default());

        sleep(Duration::from_millis(7500)).await;
        poll.stop().await;

        let at: Vec<Duration> = reconciler
            .source()
            .calls_since(start)
            .into_iter()
            .map(|(at, _)| at)
            .collect();
        assert_eq!(at, vec![secs(0), secs(6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_refreshes() {
        let reconciler = reconciler(Duration::ZERO, false);
        let start = Instant::now();
        let mut poll = PollLoop::start(reconciler.clone(), PollConfig::default());

        sleep(Duration::from_millis(100)).await;
        poll.stop().await;
        assert!(!poll.is_running());
        sleep(secs(30)).await;

        assert_eq!(reconciler.source().calls_since(start).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_loop_cancels_timer() {
        let reconciler = reconciler(Duration::ZERO, false);
        let start = Instant::now();
        let poll = PollLoop::start(reconciler.clone(), PollConfig::default());

        sleep(Duration::from_millis(100)).await;
        drop(poll);
        sleep(secs(30)).await;

        assert_eq!(reconciler.source().calls_since(start).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn selector_chooses_refresh_mode() {
        let reconciler = reconciler(Duration::ZERO, false);
        let start = Instant::now();
        let mut poll = PollLoop::start_with_selector(reconciler.clone(), PollConfig::default(), || {
            RefreshMode::One("ticket-7".into())
        });

        sleep(Duration::from_millis(100)).await;
        poll.stop().await;

        assert_eq!(
            reconciler.source().calls_since(start),
            vec![(Duration::ZERO, "one:ticket-7".to_owned())]
        );
        assert_eq!(reconciler.current_id().as_deref(), Some("ticket-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_published_and_polling_continues() {
        let reconciler = reconciler(Duration::ZERO, true);
        let failures = Arc::new(AtomicUsize::new(0));
        let _subscription = {
            let failures = failures.clone();
            reconciler.bus().on(EventKind::RefreshFailed, move |_| {
                failures.fetch_add(1, Ordering::SeqCst);
            })
        };

        let mut poll = PollLoop::start(reconciler.clone(), PollConfig::default());
        sleep(Duration::from_millis(3100)).await;
        poll.stop().await;

        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert!(reconciler.collection().is_empty());
    }
}
