use core::fmt;
use std::{
    collections::VecDeque,
    fmt::Debug,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use bstr::ByteSlice;
use stacked_errors::{Result, StackableErr};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::{self, Child},
    sync::Mutex,
    task::{self, JoinHandle},
    time::{sleep, timeout_at},
};
use tracing::{debug, warn};

use crate::{
    acquire_dir_path, next_terminal_color, CancelToken, Command, CommandResult, FailureKind,
    Outcome,
};

/// How long the recorder tasks get to drain the pipes after a child was
/// killed. Grandchildren can keep the pipes open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Time between SIGTERM and the hard kill when stopping a child
#[cfg(feature = "nix_support")]
const TERM_GRACE: Duration = Duration::from_secs(2);

type Record = Arc<Mutex<VecDeque<u8>>>;

/// Copies one standard stream of the child into its record, keeping at most
/// `record_limit` of the most recent bytes, and optionally forwards whole
/// lines with a prefix to a stream of this process.
async fn recorder<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    mut std_read: R,
    std_record: Record,
    record_limit: Option<u64>,
    mut std_forward: Option<(W, String)>,
) {
    let limit = record_limit.map(|l| usize::try_from(l).unwrap_or(usize::MAX));
    // partial line waiting for its terminator (only used when forwarding)
    let mut pending_line: Vec<u8> = Vec::new();
    // 8 KB, like BufReader
    let mut buf = [0u8; 8 * 1024];
    loop {
        let bytes_read = match std_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("recording a child process stream failed on read: {e}");
                break
            }
        };
        let bytes = &buf[..bytes_read];
        {
            let mut deque = std_record.lock().await;
            deque.extend(bytes);
            if let Some(limit) = limit {
                if deque.len() > limit {
                    let excess = deque.len() - limit;
                    deque.drain(..excess);
                }
            }
        }
        if let Some((ref mut forward, ref prefix)) = std_forward {
            pending_line.extend_from_slice(bytes);
            // only complete lines are written so that stdout and stderr lines do not
            // run into each other
            if let Some(last_newline) = pending_line.rfind_byte(b'\n') {
                let rest = pending_line.split_off(last_newline + 1);
                let mut out = String::new();
                for line in pending_line.lines() {
                    out.push_str(prefix);
                    out.push_str(&line.to_str_lossy());
                    out.push('\n');
                }
                pending_line = rest;
                let written = forward.write_all(out.as_bytes()).await.is_ok();
                if written {
                    let _ = forward.flush().await;
                } else {
                    // the stream of this process went away, keep recording
                    std_forward = None;
                }
            }
        }
    }
    if let Some((mut forward, prefix)) = std_forward {
        if !pending_line.is_empty() {
            let out = format!("{prefix}{}\n", pending_line.to_str_lossy());
            let _ = forward.write_all(out.as_bytes()).await;
            let _ = forward.flush().await;
        }
    }
}

/// A spawned [Command]. Finish it with [CommandRunner::wait_with_output] or
/// [CommandRunner::terminate].
///
/// If the `tracing` crate is used and a subscriber is active, warnings from
/// bad `Drop`s can be issued. The child is killed on drop regardless.
#[must_use]
pub struct CommandRunner {
    // this information is kept around for failures
    command: Command,
    child_process: Option<Child>,
    handles: Vec<JoinHandle<()>>,
    stdout_record: Record,
    stderr_record: Record,
    start: Instant,
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRunner")
            .field("command", &self.command)
            .field("child_process", &self.child_process)
            .field("handles", &self.handles)
            .finish()
    }
}

impl Drop for CommandRunner {
    fn drop(&mut self) {
        // we purposely parenthesize in this way to avoid calling `panicking` in the
        // normal case
        if self.child_process.is_some() && (!std::thread::panicking()) {
            warn!(
                "A `CommandRunner` was dropped without being properly finished, the command was: \
                 {}",
                self.command.get_unified_command()
            )
        }
    }
}

pub(crate) async fn command_runner(this: Command) -> Result<CommandRunner> {
    let mut cmd = process::Command::new(&this.program);
    if let Some(ref cwd) = this.cwd {
        let cwd = acquire_dir_path(cwd).await.stack_err_with_locationless(|| {
            format!("{this:?}.run() -> failed to acquire current working directory")
        })?;
        cmd.current_dir(cwd);
    }
    cmd.args(&this.args)
        .envs(this.envs.iter().map(|x| (&x.0, &x.1)))
        .kill_on_drop(true);
    let start = Instant::now();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .stack_err_with_locationless(|| {
            format!("{this:?}.run() -> failed to spawn child process")
        })?;
    let child_id = child.id().unwrap_or_default();
    debug!("spawned `{}` as pid {child_id}", this.get_unified_command());
    let (stdout_prefix, stderr_prefix) = if this.debug {
        if let Some(prefix) = &this.debug_line_prefix {
            (prefix.clone(), prefix.clone())
        } else {
            let terminal_color = next_terminal_color();
            let program_name = this.program.to_string_lossy();
            (
                owo_colors::OwoColorize::color(
                    &format!("{program_name} {child_id}  | "),
                    terminal_color,
                )
                .to_string(),
                owo_colors::OwoColorize::color(
                    &format!("{program_name} {child_id} E| "),
                    terminal_color,
                )
                .to_string(),
            )
        }
    } else {
        (String::new(), String::new())
    };
    let stdout_record = Record::default();
    let stderr_record = Record::default();
    let mut handles = vec![];
    let stdout = child
        .stdout
        .take()
        .stack_err_locationless("CommandRunner -> stdout was not piped")?;
    handles.push(task::spawn(recorder(
        stdout,
        Arc::clone(&stdout_record),
        this.record_limit,
        this.debug.then(|| (tokio::io::stdout(), stdout_prefix)),
    )));
    let stderr = child
        .stderr
        .take()
        .stack_err_locationless("CommandRunner -> stderr was not piped")?;
    handles.push(task::spawn(recorder(
        stderr,
        Arc::clone(&stderr_record),
        this.record_limit,
        this.debug.then(|| (tokio::io::stderr(), stderr_prefix)),
    )));
    Ok(CommandRunner {
        command: this,
        child_process: Some(child),
        handles,
        stdout_record,
        stderr_record,
        start,
    })
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

async fn deadline(limit: Option<Duration>) -> Duration {
    match limit {
        Some(limit) => {
            sleep(limit).await;
            limit
        }
        None => std::future::pending().await,
    }
}

async fn cancelled(cancel: Option<CancelToken>) {
    match cancel {
        Some(mut token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl CommandRunner {
    /// The command this runner was started with
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Returns the `pid` of the child process. Returns `None` if the command
    /// has been finished or the internal `id` call returned `None`.
    pub fn pid(&self) -> Option<u32> {
        self.child_process.as_ref().and_then(|c| c.id())
    }

    /// Sends a Unix `Signal` to the process.
    #[cfg(feature = "nix_support")]
    pub fn send_unix_signal(&self, unix_signal: nix::sys::signal::Signal) -> Result<()> {
        send_signal(
            self.pid()
                .stack_err("CommandRunner::send_unix_signal -> process already finished")?,
            unix_signal,
        )
    }

    /// Has the same effect as "Ctrl-C" in a terminal
    #[cfg(feature = "nix_support")]
    pub fn send_unix_sigterm(&self) -> Result<()> {
        self.send_unix_signal(nix::sys::signal::Signal::SIGTERM)
    }

    /// Waits for the process to exit and collects the result. If the command
    /// has a `timeout` or `cancel` fires first, the process is stopped and the
    /// result is `FailureKind::TimedOut` or `FailureKind::Cancelled`. This
    /// never fails, OS errors end up as `FailureKind::Wait`.
    pub async fn wait_with_output(mut self, cancel: Option<CancelToken>) -> CommandResult {
        let Some(mut child) = self.child_process.take() else {
            return self
                .finish(
                    Outcome::Failure(FailureKind::Wait(
                        "a termination method was already called".to_owned(),
                    )),
                    None,
                    Some(DRAIN_TIMEOUT),
                )
                .await
        };
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            limit = deadline(self.command.timeout) => Waited::TimedOut(limit),
            _ = cancelled(cancel) => Waited::Cancelled,
        };
        match waited {
            Waited::Exited(Ok(status)) => {
                let mut outcome = if status.success() {
                    Outcome::Success
                } else {
                    Outcome::Failure(FailureKind::NonZeroExit(status.code()))
                };
                // the pipes can outlive the child when a grandchild inherited them,
                // the timeout covers collecting the output as well
                let Some(limit) = self.command.timeout else {
                    return self.finish(outcome, status.code(), None).await
                };
                let remaining = limit.saturating_sub(self.start.elapsed());
                if !self.drain(Some(remaining)).await {
                    warn!(
                        "`{}` exited but its output was still open after the timeout of \
                         {limit:?}",
                        self.command.get_unified_command()
                    );
                    outcome = Outcome::Failure(FailureKind::TimedOut(limit));
                }
                self.finish(outcome, status.code(), None).await
            }
            Waited::Exited(Err(e)) => {
                let _ = child.kill().await;
                self.finish(
                    Outcome::Failure(FailureKind::Wait(e.to_string())),
                    None,
                    Some(DRAIN_TIMEOUT),
                )
                .await
            }
            Waited::TimedOut(limit) => {
                warn!(
                    "`{}` exceeded its timeout of {limit:?}, stopping it",
                    self.command.get_unified_command()
                );
                stop_child(&mut child).await;
                self.finish(
                    Outcome::Failure(FailureKind::TimedOut(limit)),
                    None,
                    Some(DRAIN_TIMEOUT),
                )
                .await
            }
            Waited::Cancelled => {
                debug!("cancelling `{}`", self.command.get_unified_command());
                stop_child(&mut child).await;
                self.finish(
                    Outcome::Failure(FailureKind::Cancelled),
                    None,
                    Some(DRAIN_TIMEOUT),
                )
                .await
            }
        }
    }

    /// Forces the command to exit, returning the `FailureKind::Cancelled`
    /// result with whatever output was recorded so far
    pub async fn terminate(mut self) -> CommandResult {
        if let Some(mut child) = self.child_process.take() {
            stop_child(&mut child).await;
        }
        self.finish(
            Outcome::Failure(FailureKind::Cancelled),
            None,
            Some(DRAIN_TIMEOUT),
        )
        .await
    }

    /// Waits for the recorder tasks, aborting the ones still running after
    /// `limit`. Returns `false` if any had to be aborted.
    async fn drain(&mut self, limit: Option<Duration>) -> bool {
        let deadline = limit.map(|limit| tokio::time::Instant::now() + limit);
        let mut drained = true;
        while let Some(mut handle) = self.handles.pop() {
            let res = match deadline {
                Some(deadline) => match timeout_at(deadline, &mut handle).await {
                    Ok(res) => res,
                    Err(_) => {
                        handle.abort();
                        drained = false;
                        continue
                    }
                },
                None => handle.await,
            };
            if let Err(e) = res {
                warn!("{:?} -> output recorder task panicked: {e}", self.command);
            }
        }
        drained
    }

    /// Drains the recorders within `drain_limit` and builds the result
    async fn finish(
        &mut self,
        outcome: Outcome,
        exit_code: Option<i32>,
        drain_limit: Option<Duration>,
    ) -> CommandResult {
        self.drain(drain_limit).await;
        let stdout: Vec<u8> = self.stdout_record.lock().await.iter().copied().collect();
        let stderr: Vec<u8> = self.stderr_record.lock().await.iter().copied().collect();
        CommandResult::new(
            self.command.clone(),
            outcome,
            exit_code,
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
            self.start.elapsed(),
        )
    }
}

#[cfg(feature = "nix_support")]
fn send_signal(pid: u32, unix_signal: nix::sys::signal::Signal) -> Result<()> {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(i32::try_from(pid).stack_err("send_signal -> PID overflow")?),
        unix_signal,
    )
    .stack_err("send_signal -> `nix::sys::signal::kill` failed")?;
    Ok(())
}

/// Stops the direct child. With "nix_support" it first gets a SIGTERM and a
/// grace period. Grandchildren in the process group are not signaled.
async fn stop_child(child: &mut Child) {
    #[cfg(feature = "nix_support")]
    {
        if let Some(pid) = child.id() {
            if send_signal(pid, nix::sys::signal::Signal::SIGTERM).is_ok()
                && tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok()
            {
                return
            }
        }
    }
    if let Err(e) = child.kill().await {
        warn!("failed to kill child process: {e}");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use crate::{Canceller, Command, FailureKind, Outcome};

    #[tokio::test]
    async fn shell_metacharacters_are_literal_arguments() {
        let hostile = "img; touch /tmp/pwned | cat $(whoami) `id` && echo hi";
        let res = Command::new("echo").arg(hostile).execute().await;
        assert!(res.successful(), "{res:?}");
        assert_eq!(res.stdout(), format!("{hostile}\n"));
        assert_eq!(res.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn spawn_failure_is_distinct_from_nonzero_exit() {
        let res = Command::new("dock-deck-no-such-binary-7c1e")
            .arg("images")
            .execute()
            .await;
        assert!(matches!(
            res.outcome(),
            Outcome::Failure(FailureKind::Spawn(_))
        ));
        assert_eq!(res.exit_code(), None);

        let res = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .execute()
            .await;
        assert_eq!(
            res.outcome(),
            &Outcome::Failure(FailureKind::NonZeroExit(Some(3)))
        );
        assert_eq!(res.stderr(), "oops\n");
        assert_eq!(res.diagnostic().as_deref(), Some("oops"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let res = Command::new("printf").arg("a\\377b").execute().await;
        assert!(res.successful());
        assert_eq!(res.stdout(), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let res = Command::new("sleep 10")
            .timeout(Some(Duration::from_millis(100)))
            .execute()
            .await;
        assert_eq!(
            res.outcome(),
            &Outcome::Failure(FailureKind::TimedOut(Duration::from_millis(100)))
        );
        assert!(res.duration() < Duration::from_secs(9));
    }

    #[tokio::test]
    async fn cancel_kills_the_process() {
        let canceller = Canceller::new();
        let token = canceller.token();
        let handle = tokio::spawn(Command::new("sleep 10").execute_cancellable(token));
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
        let res = handle.await.unwrap();
        assert_eq!(res.outcome(), &Outcome::Failure(FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn timeout_covers_output_held_open_by_a_grandchild() {
        let res = Command::new("sh")
            .args(["-c", "sleep 3 & echo hi"])
            .timeout(Some(Duration::from_millis(200)))
            .execute()
            .await;
        assert_eq!(
            res.outcome(),
            &Outcome::Failure(FailureKind::TimedOut(Duration::from_millis(200)))
        );
        assert!(res.duration() < Duration::from_secs(2), "{res:?}");
        assert_eq!(res.stdout(), "hi\n");
    }

    #[tokio::test]
    async fn record_limit_keeps_the_tail() {
        let res = Command::new("printf")
            .arg("0123456789")
            .record_limit(Some(4))
            .execute()
            .await;
        assert!(res.successful());
        assert_eq!(res.stdout(), "6789");
    }

    #[tokio::test]
    async fn cwd_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let res = Command::new("pwd").cwd(dir.path()).execute().await;
        assert!(res.successful());
        let expected = crate::acquire_dir_path(dir.path()).await.unwrap();
        assert_eq!(res.stdout().trim_end(), expected.to_string_lossy());
    }
}
