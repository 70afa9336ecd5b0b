use std::future::Future;

use tokio::sync::watch;

use crate::{Command, CommandResult};

/// The cancelling half of a cancellation pair. Dropping it without calling
/// [Canceller::cancel] never cancels anything.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

impl Canceller {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns a token that observes this canceller
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Cancels every token, including ones created after this call
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Handed to command execution to allow killing the child from elsewhere
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancelled. Never completes if the `Canceller` is dropped
    /// without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything in this crate that runs an engine command goes through this.
///
/// Implementations must not fail for an unsuccessful command, that is what
/// the `Outcome` in the `CommandResult` is for.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        command: Command,
        cancel: Option<CancelToken>,
    ) -> impl Future<Output = CommandResult> + Send;
}

/// Runs commands as real OS processes
#[derive(Debug, Clone, Copy, Default)]
pub struct OsExecutor;

impl Executor for OsExecutor {
    fn execute(
        &self,
        command: Command,
        cancel: Option<CancelToken>,
    ) -> impl Future<Output = CommandResult> + Send {
        command.execute_inner(cancel)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{FailureKind, Outcome};

    /// A canned response for a command, keyed by its unified command string
    #[derive(Debug, Clone)]
    pub enum Scripted {
        Ok(String),
        Fail(i32, String),
        SpawnError,
    }

    /// An `Executor` that answers from a script instead of running processes.
    /// Responses for one command line are consumed in order and the last one
    /// repeats.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedExecutor {
        script: Arc<Mutex<HashMap<String, VecDeque<Scripted>>>>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedExecutor {
        pub fn respond(&self, command: &Command, response: Scripted) {
            self.script
                .lock()
                .unwrap()
                .entry(command.get_unified_command())
                .or_default()
                .push_back(response);
        }

        /// Replaces any queued responses
        pub fn set(&self, command: &Command, response: Scripted) {
            self.script
                .lock()
                .unwrap()
                .insert(command.get_unified_command(), VecDeque::from([response]));
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self, key: &str) -> Scripted {
            let mut script = self.script.lock().unwrap();
            match script.get_mut(key) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or(Scripted::SpawnError),
                None => Scripted::SpawnError,
            }
        }
    }

    impl Executor for ScriptedExecutor {
        fn execute(
            &self,
            command: Command,
            _cancel: Option<CancelToken>,
        ) -> impl Future<Output = CommandResult> + Send {
            let key = command.get_unified_command();
            self.calls.lock().unwrap().push(key.clone());
            let response = self.next(&key);
            async move {
                match response {
                    Scripted::Ok(stdout) => CommandResult::new(
                        command,
                        Outcome::Success,
                        Some(0),
                        stdout,
                        "",
                        Duration::from_millis(1),
                    ),
                    Scripted::Fail(code, stderr) => CommandResult::new(
                        command,
                        Outcome::Failure(FailureKind::NonZeroExit(Some(code))),
                        Some(code),
                        "",
                        stderr,
                        Duration::from_millis(1),
                    ),
                    Scripted::SpawnError => CommandResult::new(
                        command,
                        Outcome::Failure(FailureKind::Spawn(
                            "No such file or directory (os error 2)".to_owned(),
                        )),
                        None,
                        "",
                        "",
                        Duration::ZERO,
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn token_sees_cancel_before_and_after_creation() {
        let canceller = Canceller::new();
        let early = canceller.token();
        assert!(!early.is_cancelled());
        canceller.cancel();
        let late = canceller.token();
        assert!(early.is_cancelled());
        assert!(late.is_cancelled());
        let mut early = early;
        tokio::time::timeout(Duration::from_secs(1), early.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_canceller_never_cancels() {
        let canceller = Canceller::new();
        let mut token = canceller.token();
        drop(canceller);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), token.cancelled())
                .await
                .is_err()
        );
    }
}
