use std::{path::PathBuf, time::Duration};

/// Why a [CommandResult](crate::CommandResult) is not a success. None of these
/// are returned as `Err`s from the execution functions, they are carried in
/// the result so that callers have to look at them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureKind {
    /// The program could not be started at all (e.g. the engine binary is not
    /// installed or is not executable)
    #[error("could not spawn process: {0}")]
    Spawn(String),
    /// The program ran and reported failure. `None` means it was ended by a
    /// signal.
    #[error("process exited unsuccessfully (code {})", DisplayCode(.0))]
    NonZeroExit(Option<i32>),
    /// The `Command` timeout elapsed and the process was killed
    #[error("process timed out after {0:?} and was killed")]
    TimedOut(Duration),
    /// A `Canceller` fired and the process was killed
    #[error("process was cancelled")]
    Cancelled,
    /// The OS failed while waiting on an already spawned process
    #[error("failed while waiting on process: {0}")]
    Wait(String),
}

struct DisplayCode<'a>(&'a Option<i32>);

impl std::fmt::Display for DisplayCode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(code) => write!(f, "{code}"),
            None => f.write_str("none, terminated by signal"),
        }
    }
}

/// A single inventory line that could not be turned into a record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected {expected} tab separated fields but found {found} in line {line:?}")]
    FieldCount {
        expected: usize,
        found: usize,
        line: String,
    },
    #[error("invalid JSON record {line:?}: {reason}")]
    Json { line: String, reason: String },
}

/// Errors from the JSON configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file does not exist, it is never created automatically
    #[error("configuration file {0:?} does not exist, create it first")]
    Missing(PathBuf),
    #[error("could not read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("configuration file {path:?} is not a valid JSON object: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Errors from parsing user supplied image references and port mappings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgError {
    #[error("image reference {0:?} is empty, starts with '-', or contains whitespace")]
    ImageRef(String),
    #[error("port mapping {0:?} is not of the form [IP:]HOST:CONTAINER[/PROTO]")]
    PortMapping(String),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}
