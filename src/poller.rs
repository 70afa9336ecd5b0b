use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{interval, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    parse_containers, parse_images, CancelToken, CommandResult, Delta, Engine, Executor,
    InventorySnapshot,
};

/// Period between timer driven inventory refreshes
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(5);

/// What the poller tells its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// A successful tick that changed something
    Updated(Vec<Delta>),
    /// The inventory could not be refreshed. Sent once per transition into
    /// failure, not for every failing tick.
    Failed(String),
    /// The first successful tick after `Failed`
    Recovered,
}

#[derive(Debug, Default)]
struct PollState {
    /// Set while failing
    failure: Option<String>,
    malformed_lines: u64,
}

/// An interval that skips missed ticks. Periods under a millisecond are
/// raised to one millisecond since `interval` panics on zero.
pub(crate) fn skipping_interval(period: Duration) -> Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Keeps an [InventorySnapshot] of images and containers up to date by
/// re-running the engine listings.
///
/// The snapshot is only ever replaced whole. Consumers either hold the
/// `Arc` from [InventoryPoller::snapshot] or watch [InventoryPoller::subscribe]
/// and also get [PollEvent]s through the channel given to `new`.
#[derive(Debug)]
pub struct InventoryPoller<E> {
    engine: Engine,
    executor: Arc<E>,
    snapshot_tx: watch::Sender<Arc<InventorySnapshot>>,
    events: mpsc::UnboundedSender<PollEvent>,
    // held for the whole duration of a tick, which serializes ticks
    state: Mutex<PollState>,
}

impl<E: Executor> InventoryPoller<E> {
    pub fn new(engine: Engine, executor: Arc<E>, events: mpsc::UnboundedSender<PollEvent>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(InventorySnapshot::default()));
        Self {
            engine,
            executor,
            snapshot_tx,
            events,
            state: Mutex::new(PollState::default()),
        }
    }

    /// The latest snapshot
    pub fn snapshot(&self) -> Arc<InventorySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receives every snapshot replacement
    pub fn subscribe(&self) -> watch::Receiver<Arc<InventorySnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// If the last tick failed. The snapshot is then the last good one.
    pub async fn is_failing(&self) -> bool {
        self.state.lock().await.failure.is_some()
    }

    /// Why the last tick failed, `None` if it succeeded
    pub async fn failure(&self) -> Option<String> {
        self.state.lock().await.failure.clone()
    }

    /// Total number of listing lines that were skipped as malformed
    pub async fn malformed_lines(&self) -> u64 {
        self.state.lock().await.malformed_lines
    }

    /// Refreshes both inventories, waiting for a tick that is already in
    /// flight to finish first. This is the forced refresh after an action, so
    /// it always observes commands that completed before it was called.
    pub async fn tick(&self) -> (Arc<InventorySnapshot>, Vec<Delta>) {
        let mut state = self.state.lock().await;
        self.tick_locked(&mut state).await
    }

    /// Like [InventoryPoller::tick] but returns `None` without querying if a
    /// tick is already running
    pub async fn try_tick(&self) -> Option<(Arc<InventorySnapshot>, Vec<Delta>)> {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("skipping inventory tick, the previous one is still running");
            return None
        };
        Some(self.tick_locked(&mut state).await)
    }

    async fn tick_locked(&self, state: &mut PollState) -> (Arc<InventorySnapshot>, Vec<Delta>) {
        let (images, containers) = tokio::join!(
            self.executor
                .execute(self.engine.list_images(), None::<CancelToken>),
            self.executor
                .execute(self.engine.list_containers(), None::<CancelToken>),
        );
        let prev = self.snapshot();
        if let Some(reason) = failure_reason(&images).or_else(|| failure_reason(&containers)) {
            if state.failure.is_none() {
                warn!("inventory refresh failed, keeping the previous snapshot: {reason}");
                let _ = self.events.send(PollEvent::Failed(reason.clone()));
            }
            state.failure = Some(reason);
            return (prev, vec![])
        }
        if state.failure.take().is_some() {
            info!("inventory refresh recovered");
            let _ = self.events.send(PollEvent::Recovered);
        }
        let images = parse_images(images.stdout());
        let containers = parse_containers(containers.stdout());
        for e in images.errors.iter().chain(containers.errors.iter()) {
            warn!("skipping inventory line: {e}");
        }
        state.malformed_lines += (images.errors.len() + containers.errors.len()) as u64;
        let next = Arc::new(InventorySnapshot::new(images.records, containers.records));
        let deltas = prev.diff(&next);
        self.snapshot_tx.send_replace(Arc::clone(&next));
        if !deltas.is_empty() {
            debug!("inventory changed: {} deltas", deltas.len());
            let _ = self.events.send(PollEvent::Updated(deltas.clone()));
        }
        (next, deltas)
    }

    /// Ticks every `period` until `shutdown` fires. Ticks that would overlap
    /// with one still running (including forced ones) are skipped, not queued.
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = skipping_interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.try_tick().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("inventory poller stopped");
        })
    }
}

fn failure_reason(result: &CommandResult) -> Option<String> {
    result.diagnostic().map(|diagnostic| {
        format!(
            "`{}` failed: {diagnostic}",
            result.command().get_unified_command()
        )
    })
}
