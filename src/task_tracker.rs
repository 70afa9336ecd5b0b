use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::{debug, warn};
use uuid::Uuid;

/// The advisory deadline for tasks, after which they are reported as
/// `TimedOut`
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub name: String,
    /// Distinguishes this run from earlier runs with the same name
    pub run_id: Uuid,
    pub started: Instant,
    pub outcome: TaskOutcome,
    pub message: Option<String>,
    /// Set once the task leaves `Pending`
    pub finished: Option<Instant>,
}

impl TaskState {
    pub fn is_pending(&self) -> bool {
        self.outcome == TaskOutcome::Pending
    }

    /// Time since the start, frozen once the task has finished
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        self.finished
            .unwrap_or(now)
            .saturating_duration_since(self.started)
    }
}

/// Tracks at most one task per name. Starting a task with a name that is
/// already tracked supersedes the old state, there is no queue.
///
/// Timeouts are advisory: [TaskTracker::poll_timeouts] marks overdue tasks as
/// `TimedOut` but nothing here kills the underlying command.
#[derive(Debug, Clone)]
pub struct TaskTracker {
    timeout: Duration,
    tasks: HashMap<String, TaskState>,
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_TIMEOUT)
    }
}

impl TaskTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tasks: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start(&mut self, name: impl Into<String>) -> Uuid {
        self.start_at(name, Instant::now())
    }

    pub fn start_at(&mut self, name: impl Into<String>, now: Instant) -> Uuid {
        let name = name.into();
        let run_id = Uuid::new_v4();
        let previous = self.tasks.insert(name.clone(), TaskState {
            name: name.clone(),
            run_id,
            started: now,
            outcome: TaskOutcome::Pending,
            message: None,
            finished: None,
        });
        if let Some(previous) = previous.filter(TaskState::is_pending) {
            debug!(
                "task {name} superseded run {} which was still pending",
                previous.run_id
            );
        }
        run_id
    }

    pub fn get(&self, name: &str) -> Option<&TaskState> {
        self.tasks.get(name)
    }

    pub fn pending(&self) -> impl Iterator<Item = &TaskState> {
        self.tasks.values().filter(|t| t.is_pending())
    }

    pub fn elapsed(&self, name: &str) -> Option<Duration> {
        self.elapsed_at(name, Instant::now())
    }

    pub fn elapsed_at(&self, name: &str, now: Instant) -> Option<Duration> {
        self.tasks.get(name).map(|t| t.elapsed_at(now))
    }

    /// Records the final outcome of the current run of `name`. A completion
    /// that arrives after the task was marked `TimedOut` still replaces it
    /// with the real result. Returns the updated state, or `None` if no such
    /// task is tracked.
    pub fn complete(
        &mut self,
        name: &str,
        outcome: TaskOutcome,
        message: Option<String>,
    ) -> Option<TaskState> {
        self.complete_at(name, outcome, message, Instant::now())
    }

    pub fn complete_at(
        &mut self,
        name: &str,
        outcome: TaskOutcome,
        message: Option<String>,
        now: Instant,
    ) -> Option<TaskState> {
        let state = self.tasks.get_mut(name)?;
        if outcome == TaskOutcome::Pending {
            warn!("task {name} was completed with a `Pending` outcome, ignoring");
            return None
        }
        if state.outcome == TaskOutcome::TimedOut {
            debug!("task {name} finished after it had timed out");
        }
        state.outcome = outcome;
        state.message = message;
        state.finished = Some(now);
        Some(state.clone())
    }

    /// Like [TaskTracker::complete], but only if `run_id` is still the current
    /// run of its task. A superseded run returns `None` and changes nothing.
    pub fn complete_run(
        &mut self,
        run_id: Uuid,
        outcome: TaskOutcome,
        message: Option<String>,
    ) -> Option<TaskState> {
        let name = self
            .tasks
            .values()
            .find(|t| t.run_id == run_id)?
            .name
            .clone();
        self.complete(&name, outcome, message)
    }

    /// Marks every pending task that has been running for at least the
    /// timeout as `TimedOut`, returning the names of the newly timed out tasks
    /// sorted by name
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<String> {
        let mut timed_out = vec![];
        for state in self.tasks.values_mut() {
            if state.is_pending() && state.elapsed_at(now) >= self.timeout {
                warn!(
                    "task {} has been running for over {:?}, marking it as timed out",
                    state.name, self.timeout
                );
                state.outcome = TaskOutcome::TimedOut;
                state.finished = Some(now);
                timed_out.push(state.name.clone());
            }
        }
        timed_out.sort();
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn times_out_after_sixty_seconds() {
        let t0 = Instant::now();
        let mut tracker = TaskTracker::default();
        tracker.start_at("build", t0);
        assert!(tracker.poll_timeouts(t0 + 59 * SEC).is_empty());
        assert_eq!(tracker.elapsed_at("build", t0 + 30 * SEC), Some(30 * SEC));
        assert_eq!(tracker.poll_timeouts(t0 + 61 * SEC), vec!["build".to_owned()]);
        assert_eq!(tracker.get("build").unwrap().outcome, TaskOutcome::TimedOut);
        // not reported twice
        assert!(tracker.poll_timeouts(t0 + 120 * SEC).is_empty());
    }

    #[test]
    fn completing_in_time_suppresses_the_timeout() {
        let t0 = Instant::now();
        let mut tracker = TaskTracker::default();
        tracker.start_at("push", t0);
        let state = tracker
            .complete_at("push", TaskOutcome::Succeeded, None, t0 + 10 * SEC)
            .unwrap();
        assert_eq!(state.outcome, TaskOutcome::Succeeded);
        assert!(tracker.poll_timeouts(t0 + 100 * SEC).is_empty());
        // elapsed is frozen at completion
        assert_eq!(tracker.elapsed_at("push", t0 + 100 * SEC), Some(10 * SEC));
    }

    #[test]
    fn late_completion_replaces_timed_out() {
        let t0 = Instant::now();
        let mut tracker = TaskTracker::default();
        tracker.start_at("pull", t0);
        tracker.poll_timeouts(t0 + 90 * SEC);
        let state = tracker
            .complete_at(
                "pull",
                TaskOutcome::Failed,
                Some("manifest unknown".to_owned()),
                t0 + 95 * SEC,
            )
            .unwrap();
        assert_eq!(state.outcome, TaskOutcome::Failed);
        assert_eq!(state.message.as_deref(), Some("manifest unknown"));
    }

    #[test]
    fn restarting_supersedes() {
        let t0 = Instant::now();
        let mut tracker = TaskTracker::new(10 * SEC);
        let first = tracker.start_at("build", t0);
        let second = tracker.start_at("build", t0 + 8 * SEC);
        assert_ne!(first, second);
        assert_eq!(tracker.pending().count(), 1);
        // the first run finishing must not complete the second
        assert!(tracker
            .complete_run(first, TaskOutcome::Failed, None)
            .is_none());
        assert!(tracker.get("build").unwrap().is_pending());
        // the deadline restarted with the new run
        assert!(tracker.poll_timeouts(t0 + 12 * SEC).is_empty());
        assert_eq!(tracker.poll_timeouts(t0 + 18 * SEC), vec!["build".to_owned()]);
        assert_eq!(
            tracker
                .complete_run(second, TaskOutcome::Succeeded, None)
                .unwrap()
                .outcome,
            TaskOutcome::Succeeded
        );
    }

    #[test]
    fn unknown_and_pending_completions() {
        let mut tracker = TaskTracker::default();
        assert!(tracker.complete("nope", TaskOutcome::Succeeded, None).is_none());
        assert!(tracker.elapsed("nope").is_none());
        tracker.start("stop");
        assert!(tracker.complete("stop", TaskOutcome::Pending, None).is_none());
        assert!(tracker.get("stop").unwrap().is_pending());
    }
}
