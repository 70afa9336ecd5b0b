use core::fmt;
use std::{
    ffi::{OsStr, OsString},
    fmt::{Debug, Display},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use stacked_errors::{DisplayStr, Result};

use crate::{command_runner::command_runner, CancelToken, CommandRunner, FailureKind};

/// An OS command described as a program and a vector of discrete arguments.
///
/// There is intentionally no way to hand this a string for a shell to
/// interpret. Every argument reaches the child process as exactly one
/// `argv` entry, so image names, container names, and port mappings that
/// contain `;`, `|`, or `$(..)` are just literal text.
#[derive(Clone, Serialize, Deserialize)]
pub struct Command {
    /// The program to run.
    pub program: OsString,
    /// All the arguments that will be passed to the program
    pub args: Vec<OsString>,
    /// Environment variable mappings added on top of the inherited environment
    pub envs: Vec<(OsString, OsString)>,
    /// Working directory for the process, acquired with `acquire_dir_path`
    /// before spawning
    pub cwd: Option<PathBuf>,
    /// If set, the process is killed once this much time has passed and the
    /// result is `FailureKind::TimedOut`. This also bounds collecting output
    /// from pipes that a grandchild keeps open after the child exited.
    pub timeout: Option<Duration>,
    /// Sets a limit on the number of bytes recorded by the stdout and stderr
    /// records separately, after which the records keep only the most recent
    /// bytes. `None` means there is no limit.
    pub record_limit: Option<u64>,
    /// Forward output lines to the standard streams of this process
    pub debug: bool,
    /// If the default debug line prefix (program name and pid) should be
    /// overridden
    pub debug_line_prefix: Option<String>,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            program: Default::default(),
            args: Default::default(),
            envs: Default::default(),
            cwd: Default::default(),
            timeout: None,
            record_limit: None,
            debug: false,
            debug_line_prefix: None,
        }
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "Command {{ program: {:?},",
            DisplayStr(&self.get_unified_command()),
        ))?;
        if !self.envs.is_empty() {
            f.write_fmt(format_args!(" envs: {:?},", self.envs))?;
        }
        if let Some(cwd) = &self.cwd {
            f.write_fmt(format_args!(" cwd: {cwd:?},"))?;
        }
        if let Some(timeout) = self.timeout {
            f.write_fmt(format_args!(" timeout: {timeout:?},"))?;
        }
        if let Some(limit) = self.record_limit {
            f.write_fmt(format_args!(" record_limit: {limit},"))?;
        }
        if self.debug {
            f.write_fmt(format_args!(" debug: true,"))?;
        }
        f.write_fmt(format_args!(" }}"))
    }
}

impl Command {
    /// Creates a new `Command` for launching the `program` with no arguments.
    pub fn new_os_str(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().into(),
            ..Default::default()
        }
    }

    /// Creates a `Command` from a program and arguments separated by
    /// whitespace. This is only meant for literal strings written in source
    /// code such as `Command::new("docker ps -a")`. Anything coming from a
    /// user must go through [Command::arg] so that it stays one argument.
    pub fn new(program_with_args: impl AsRef<str>) -> Self {
        let mut parts = program_with_args.as_ref().split_whitespace();
        let program = parts.next().unwrap_or_default();
        Self {
            program: program.into(),
            args: parts.map(OsString::from).collect(),
            ..Default::default()
        }
    }

    /// Adds an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().into());
        self
    }

    /// Adds arguments to be passed to the program
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|s| s.as_ref().into()));
        self
    }

    /// Sets `self.cwd`
    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_owned());
        self
    }

    /// Adds an environment variable
    pub fn env(mut self, env_key: impl AsRef<OsStr>, env_val: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((env_key.as_ref().into(), env_val.as_ref().into()));
        self
    }

    /// Adds environment variables
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs.extend(
            envs.into_iter()
                .map(|(k, v)| (k.as_ref().into(), v.as_ref().into())),
        );
        self
    }

    /// Sets `timeout`
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets `record_limit`
    pub fn record_limit(mut self, record_limit: Option<u64>) -> Self {
        self.record_limit = record_limit;
        self
    }

    /// Sets `debug` for passing output lines to the standard streams of this
    /// process. Recording happens regardless.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Changes the debug line prefix. If `None`, then the default of the
    /// program name and process ID is used.
    pub fn debug_line_prefix(mut self, line_prefix: Option<String>) -> Self {
        self.debug_line_prefix = line_prefix;
        self
    }

    /// Gets the program and args interspersed with spaces. This is for display
    /// and logging only, it is never executed.
    pub fn get_unified_command(&self) -> String {
        let mut command = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            command.push(' ');
            command += arg.to_string_lossy().as_ref();
        }
        command
    }

    /// Spawns the process, returning a `CommandRunner`. An `Err` here means
    /// the process could not be spawned.
    pub async fn run(self) -> Result<CommandRunner> {
        command_runner(self).await
    }

    /// Spawns the process and waits for it. This never fails, spawn failures
    /// become `FailureKind::Spawn` in the result.
    pub async fn execute(self) -> CommandResult {
        self.execute_inner(None).await
    }

    /// Same as [Command::execute] but the process is killed with a
    /// `FailureKind::Cancelled` result if `cancel` fires first
    pub async fn execute_cancellable(self, cancel: CancelToken) -> CommandResult {
        self.execute_inner(Some(cancel)).await
    }

    pub(crate) async fn execute_inner(self, cancel: Option<CancelToken>) -> CommandResult {
        let start = std::time::Instant::now();
        let command = self.clone();
        match self.run().await {
            Ok(runner) => runner.wait_with_output(cancel).await,
            Err(e) => CommandResult::new(
                command,
                Outcome::Failure(FailureKind::Spawn(e.to_string())),
                None,
                String::new(),
                String::new(),
                start.elapsed(),
            ),
        }
    }
}

/// Success or failure of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureKind),
}

/// The result of a [Command](crate::Command). Fields are read only.
#[must_use]
#[derive(Clone)]
pub struct CommandResult {
    // the command information is kept around for failures
    command: Command,
    outcome: Outcome,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    duration: Duration,
}

impl Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "CommandResult {{\ncommand: {:?},\noutcome: {:?},\nexit_code: {:?},\nduration: \
             {:?},\n",
            self.command, self.outcome, self.exit_code, self.duration
        ))?;
        // move the commas out of the way of the stdout and stderr
        if !self.stdout.is_empty() {
            f.write_fmt(format_args!("stdout: {}\n,", self.stdout))?;
        }
        if !self.stderr.is_empty() {
            f.write_fmt(format_args!("stderr: {}\n,", self.stderr))?;
        }
        f.write_fmt(format_args!("}}"))
    }
}

impl Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#?}", self))
    }
}

impl CommandResult {
    /// Builds a result directly. `Executor` implementations other than the OS
    /// one use this.
    pub fn new(
        command: Command,
        outcome: Outcome,
        exit_code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            command,
            outcome,
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration,
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Returns the failure kind if the command was not successful
    pub fn failure(&self) -> Option<&FailureKind> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure(kind) => Some(kind),
        }
    }

    /// Returns if the command completed with a successful exit status
    pub fn successful(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Captured stdout, invalid UTF-8 was replaced with U+FFFD
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Captured stderr, invalid UTF-8 was replaced with U+FFFD
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Wall clock time from spawning to the result
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The text a user should see for a failed command: the captured stderr
    /// verbatim if there is any, otherwise the failure kind. Returns `None`
    /// for successes.
    pub fn diagnostic(&self) -> Option<String> {
        let kind = self.failure()?;
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            Some(kind.to_string())
        } else {
            Some(stderr.to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_splits_literal_program_and_args() {
        let command = Command::new("docker ps -a").arg("--format").arg("{{json .}}");
        assert_eq!(command.program, OsString::from("docker"));
        assert_eq!(command.args, vec!["ps", "-a", "--format", "{{json .}}"]);
        assert_eq!(command.get_unified_command(), "docker ps -a --format {{json .}}");
    }

    #[test]
    fn arg_keeps_whitespace_and_metacharacters_in_one_token() {
        let command = Command::new("docker stop").arg("web; rm -rf / | $(id)");
        assert_eq!(command.args.len(), 2);
        assert_eq!(command.args[1], OsString::from("web; rm -rf / | $(id)"));
    }

    #[test]
    fn diagnostic_prefers_stderr() {
        let failed = CommandResult::new(
            Command::new("docker push"),
            Outcome::Failure(FailureKind::NonZeroExit(Some(1))),
            Some(1),
            "",
            "  denied: requested access to the resource is denied\n",
            Duration::ZERO,
        );
        assert_eq!(
            failed.diagnostic().as_deref(),
            Some("denied: requested access to the resource is denied")
        );

        let spawn = CommandResult::new(
            Command::new("nope"),
            Outcome::Failure(FailureKind::Spawn("not found".to_owned())),
            None,
            "",
            "",
            Duration::ZERO,
        );
        assert_eq!(
            spawn.diagnostic().as_deref(),
            Some("could not spawn process: not found")
        );
        assert!(!spawn.successful());

        let ok = CommandResult::new(
            Command::new("true"),
            Outcome::Success,
            Some(0),
            "",
            "",
            Duration::ZERO,
        );
        assert!(ok.diagnostic().is_none());
    }
}
