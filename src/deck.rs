use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    poller::skipping_interval, CancelToken, Command, CommandResult, Engine, Executor, FailureKind,
    ImageRef, InventoryPoller, Outcome, PollEvent, PortMapping, StatusEvent, StatusLine,
    StatusReporter, TaskOutcome, TaskTracker, DEFAULT_TASK_TIMEOUT,
};

/// A user initiated operation on the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Build {
        image: ImageRef,
        context: PathBuf,
    },
    Run {
        image: ImageRef,
        container: String,
        ports: Option<PortMapping>,
    },
    Push {
        image: ImageRef,
    },
    Pull {
        image: ImageRef,
    },
    Stop {
        container: String,
    },
    Commit {
        container: String,
        image: ImageRef,
    },
    RemoveImage {
        id: String,
    },
    Search {
        term: String,
    },
    Logs {
        container: String,
    },
}

impl Action {
    /// The task name used for tracking and status lines. Actions with the same
    /// task name supersede each other.
    pub fn task_name(&self) -> String {
        match self {
            Action::Build { image, .. } => format!("build {image}"),
            Action::Run { container, .. } => format!("run {container}"),
            Action::Push { image } => format!("push {image}"),
            Action::Pull { image } => format!("pull {image}"),
            Action::Stop { container } => format!("stop {container}"),
            Action::Commit { container, image } => format!("commit {container} to {image}"),
            Action::RemoveImage { id } => format!("remove image {id}"),
            Action::Search { term } => format!("search {term}"),
            Action::Logs { container } => format!("logs {container}"),
        }
    }

    pub fn command(&self, engine: &Engine) -> Command {
        match self {
            Action::Build { image, context } => engine.build(image, context),
            Action::Run {
                image,
                container,
                ports,
            } => engine.run(image, container, ports.as_ref()),
            Action::Push { image } => engine.push(image),
            Action::Pull { image } => engine.pull(image),
            Action::Stop { container } => engine.stop(container),
            Action::Commit { container, image } => engine.commit(container, image),
            Action::RemoveImage { id } => engine.remove_image(id),
            Action::Search { term } => engine.search(term),
            Action::Logs { container } => engine.logs(container),
        }
    }

    /// If the inventory should be refreshed after this action
    pub fn changes_inventory(&self) -> bool {
        !matches!(self, Action::Search { .. } | Action::Logs { .. })
    }
}

/// Coordinates actions: task tracking, status reporting, and the refresh that
/// follows each action. Cloning is cheap and clones share everything.
pub struct Deck<E> {
    engine: Engine,
    executor: Arc<E>,
    tracker: Arc<Mutex<TaskTracker>>,
    reporter: StatusReporter,
    poller: Arc<InventoryPoller<E>>,
    command_timeout: Option<Duration>,
}

impl<E> Clone for Deck<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            executor: Arc::clone(&self.executor),
            tracker: Arc::clone(&self.tracker),
            reporter: self.reporter.clone(),
            poller: Arc::clone(&self.poller),
            command_timeout: self.command_timeout,
        }
    }
}

impl<E: Executor> Deck<E> {
    /// Status lines go to `status`, inventory events to `poll_events`
    pub fn new(
        engine: Engine,
        executor: E,
        status: mpsc::UnboundedSender<StatusLine>,
        poll_events: mpsc::UnboundedSender<PollEvent>,
    ) -> Self {
        let executor = Arc::new(executor);
        let poller = Arc::new(InventoryPoller::new(
            engine.clone(),
            Arc::clone(&executor),
            poll_events,
        ));
        Self {
            engine,
            executor,
            tracker: Arc::new(Mutex::new(TaskTracker::new(DEFAULT_TASK_TIMEOUT))),
            reporter: StatusReporter::new(status),
            poller,
            command_timeout: None,
        }
    }

    /// Sets the advisory task timeout. This discards tracked tasks, so it is
    /// meant for construction.
    pub fn task_timeout(self, timeout: Duration) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(TaskTracker::new(timeout))),
            ..self
        }
    }

    /// If set, action commands are killed after this long and finish as
    /// `FailureKind::TimedOut`. Unset by default, matching the advisory only
    /// task timeout.
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn poller(&self) -> &Arc<InventoryPoller<E>> {
        &self.poller
    }

    pub fn tracker(&self) -> &Arc<Mutex<TaskTracker>> {
        &self.tracker
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    /// Runs `<engine> --version` to check that the engine is installed
    pub async fn engine_available(&self) -> bool {
        let result = self.executor.execute(self.engine.version(), None).await;
        if !result.successful() {
            warn!(
                "`{}` is not usable: {}",
                self.engine.program,
                result.diagnostic().unwrap_or_default()
            );
        }
        result.successful()
    }

    /// Performs `action` to completion. The command runs on its own task so
    /// the caller's thread is never blocked by the process. Afterwards the
    /// inventory is refreshed, and that refresh only starts after the command
    /// has finished.
    pub async fn perform(&self, action: Action) -> CommandResult {
        self.perform_cancellable(action, None).await
    }

    pub async fn perform_cancellable(
        &self,
        action: Action,
        cancel: Option<CancelToken>,
    ) -> CommandResult {
        let task = action.task_name();
        let command = action.command(&self.engine).timeout(self.command_timeout);
        let run_id = {
            let mut tracker = self.tracker.lock().await;
            let run_id = tracker.start(task.clone());
            if let Some(state) = tracker.get(&task) {
                self.reporter.publish(StatusEvent::Task(state.clone()));
            }
            run_id
        };
        debug!("performing {task} as `{}`", command.get_unified_command());
        let executor = Arc::clone(&self.executor);
        let fallback = command.clone();
        let spawned =
            tokio::spawn(async move { executor.execute(command, cancel).await }).await;
        let result = match spawned {
            Ok(result) => result,
            Err(e) => CommandResult::new(
                fallback,
                Outcome::Failure(FailureKind::Wait(format!("executor task failed: {e}"))),
                None,
                "",
                "",
                Duration::ZERO,
            ),
        };
        let outcome = if result.successful() {
            TaskOutcome::Succeeded
        } else {
            TaskOutcome::Failed
        };
        let completed = self
            .tracker
            .lock()
            .await
            .complete_run(run_id, outcome, result.diagnostic());
        if completed.is_some() {
            self.reporter.publish(StatusEvent::Command {
                task,
                result: result.clone(),
            });
        } else {
            // the status line belongs to the newer run that is still pending
            debug!("{task} finished after being superseded by a newer run");
        }
        if action.changes_inventory() {
            self.poller.tick().await;
        }
        result
    }

    /// Starts [Deck::perform] in the background and returns immediately
    pub fn dispatch(&self, action: Action) -> JoinHandle<CommandResult> {
        let this = self.clone();
        tokio::spawn(async move { this.perform(action).await })
    }

    /// Marks overdue tasks as timed out and publishes a status line for each.
    /// Returns the names of the newly timed out tasks.
    pub async fn check_timeouts(&self, now: Instant) -> Vec<String> {
        let mut tracker = self.tracker.lock().await;
        let timed_out = tracker.poll_timeouts(now);
        for name in &timed_out {
            if let Some(state) = tracker.get(name) {
                self.reporter.publish(StatusEvent::Task(state.clone()));
            }
        }
        timed_out
    }

    /// Calls [Deck::check_timeouts] every `period` until `shutdown` fires
    pub fn spawn_timeout_watch(
        &self,
        period: Duration,
        mut shutdown: CancelToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = skipping_interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.check_timeouts(Instant::now()).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor::test_support::{Scripted, ScriptedExecutor},
        InventoryFormat, Severity,
    };

    struct Fixture {
        deck: Deck<ScriptedExecutor>,
        executor: ScriptedExecutor,
        engine: Engine,
        status: mpsc::UnboundedReceiver<StatusLine>,
        _events: mpsc::UnboundedReceiver<PollEvent>,
    }

    fn fixture() -> Fixture {
        let engine = Engine::default().format(InventoryFormat::Tabs);
        let executor = ScriptedExecutor::default();
        let (status_tx, status) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let deck = Deck::new(engine.clone(), executor.clone(), status_tx, events_tx);
        Fixture {
            deck,
            executor,
            engine,
            status,
            _events: events,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StatusLine>) -> Vec<StatusLine> {
        let mut lines = vec![];
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn commit_then_refresh_observes_the_new_image() {
        let mut f = fixture();
        let image: ImageRef = "snap:v1".parse().unwrap();
        let action = Action::Commit {
            container: "c1".to_owned(),
            image: image.clone(),
        };
        f.executor.set(&f.engine.list_images(), Scripted::Ok(String::new()));
        f.executor.set(&f.engine.list_containers(), Scripted::Ok(String::new()));
        // the listing after the commit includes the committed image
        f.executor.set(
            &action.command(&f.engine),
            Scripted::Ok("sha256:aaa\n".to_owned()),
        );
        f.executor.respond(
            &f.engine.list_images(),
            Scripted::Ok("snap\tv1\taaa\t5MB\n".to_owned()),
        );

        // the pre-action tick consumes the first, empty, images response
        f.deck.poller().tick().await;
        let result = f.deck.perform(action).await;
        assert!(result.successful());

        let calls = f.executor.calls();
        let commit_at = calls.iter().position(|c| c.starts_with("docker commit")).unwrap();
        assert_eq!(calls[commit_at], "docker commit -- c1 snap:v1");
        // both listings happen after the commit
        assert_eq!(calls.len(), commit_at + 3);
        assert!(f.deck.poller().snapshot().images.contains_key("aaa"));

        let lines = drain(&mut f.status);
        assert_eq!(lines, vec![
            StatusLine::new(Severity::Info, "commit c1 to snap:v1 in progress..."),
            StatusLine::new(Severity::Success, "commit c1 to snap:v1 succeeded"),
        ]);
        let tracker = f.deck.tracker().lock().await;
        assert_eq!(
            tracker.get("commit c1 to snap:v1").unwrap().outcome,
            TaskOutcome::Succeeded
        );
    }

    #[tokio::test]
    async fn failed_action_reports_stderr() {
        let mut f = fixture();
        let action = Action::Push {
            image: "private/app:1".parse().unwrap(),
        };
        f.executor.set(
            &action.command(&f.engine),
            Scripted::Fail(1, "denied: requested access to the resource is denied\n".to_owned()),
        );
        f.executor.set(&f.engine.list_images(), Scripted::Ok(String::new()));
        f.executor.set(&f.engine.list_containers(), Scripted::Ok(String::new()));
        let result = f.deck.perform(action).await;
        assert!(!result.successful());
        let lines = drain(&mut f.status);
        assert_eq!(
            lines.last().unwrap(),
            &StatusLine::new(
                Severity::Error,
                "push private/app:1 failed: denied: requested access to the resource is denied"
            )
        );
        let tracker = f.deck.tracker().lock().await;
        let state = tracker.get("push private/app:1").unwrap();
        assert_eq!(state.outcome, TaskOutcome::Failed);
        assert_eq!(
            state.message.as_deref(),
            Some("denied: requested access to the resource is denied")
        );
    }

    #[tokio::test]
    async fn read_only_actions_do_not_refresh() {
        let f = fixture();
        let action = Action::Logs {
            container: "web".to_owned(),
        };
        f.executor
            .set(&action.command(&f.engine), Scripted::Ok("hello\n".to_owned()));
        let result = f.deck.dispatch(action).await.unwrap();
        assert_eq!(result.stdout(), "hello\n");
        assert_eq!(f.executor.calls(), vec!["docker logs -- web".to_owned()]);
    }

    #[tokio::test]
    async fn timeouts_are_published_once() {
        let mut f = fixture();
        let f_deck = f.deck.clone().task_timeout(Duration::from_secs(60));
        let t0 = Instant::now();
        f_deck.tracker().lock().await.start_at("build app:latest", t0);
        assert!(f_deck
            .check_timeouts(t0 + Duration::from_secs(30))
            .await
            .is_empty());
        assert_eq!(
            f_deck.check_timeouts(t0 + Duration::from_secs(61)).await,
            vec!["build app:latest".to_owned()]
        );
        assert!(f_deck
            .check_timeouts(t0 + Duration::from_secs(62))
            .await
            .is_empty());
        assert_eq!(drain(&mut f.status), vec![StatusLine::new(
            Severity::Error,
            "build app:latest failed: timed out"
        )]);
    }

    #[tokio::test]
    async fn engine_availability() {
        let f = fixture();
        assert!(!f.deck.engine_available().await);
        f.executor
            .set(&f.engine.version(), Scripted::Ok("Docker version 27.0.3\n".to_owned()));
        assert!(f.deck.engine_available().await);
    }

    /// Holds every command until the gate is opened
    #[derive(Clone, Default)]
    struct GatedExecutor {
        gate: Arc<tokio::sync::Notify>,
        inner: ScriptedExecutor,
    }

    impl Executor for GatedExecutor {
        fn execute(
            &self,
            command: Command,
            cancel: Option<CancelToken>,
        ) -> impl std::future::Future<Output = CommandResult> + Send {
            let gate = Arc::clone(&self.gate);
            let inner = self.inner.clone();
            async move {
                gate.notified().await;
                inner.execute(command, cancel).await
            }
        }
    }

    #[tokio::test]
    async fn superseded_run_publishes_no_result() {
        let engine = Engine::default().format(InventoryFormat::Tabs);
        let executor = GatedExecutor::default();
        let (status_tx, mut status) = mpsc::unbounded_channel();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let deck = Deck::new(engine.clone(), executor.clone(), status_tx, events_tx);
        let action = Action::Stop {
            container: "web".to_owned(),
        };
        executor
            .inner
            .set(&action.command(&engine), Scripted::Ok("web\n".to_owned()));

        let handle = deck.dispatch(action);
        tokio::time::timeout(Duration::from_secs(5), async {
            while deck.tracker().lock().await.get("stop web").is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        // a newer run of the same task starts while the first is in flight
        let newer = deck.tracker().lock().await.start("stop web");
        // keeps releasing the stop and the listings that follow it
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.is_finished() {
                    break handle.await.unwrap()
                }
                executor.gate.notify_one();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(result.successful());

        assert_eq!(drain(&mut status), vec![StatusLine::new(
            Severity::Info,
            "stop web in progress..."
        )]);
        let tracker = deck.tracker().lock().await;
        let state = tracker.get("stop web").unwrap();
        assert_eq!(state.run_id, newer);
        assert!(state.is_pending());
    }

    #[tokio::test]
    async fn zero_period_timeout_watch_still_runs() {
        let mut f = fixture();
        let f_deck = f.deck.clone().task_timeout(Duration::ZERO);
        f_deck.tracker().lock().await.start("pull app:latest");
        let canceller = crate::Canceller::new();
        let handle = f_deck.spawn_timeout_watch(Duration::ZERO, canceller.token());
        let line = tokio::time::timeout(Duration::from_secs(5), f.status.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "pull app:latest failed: timed out");
        canceller.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
