//! Runs container engine commands as argument vectors, keeps a polled
//! inventory of images and containers, and tracks the status of user actions.

mod command;
mod command_runner;
mod config;
mod deck;
mod dockerfile;
mod engine;
mod error;
pub(crate) mod executor;
/// Parsing of engine listings
pub mod inventory;
mod misc;
mod paths;
mod poller;
mod status;
mod task_tracker;

pub use command::*;
pub use command_runner::CommandRunner;
pub use config::*;
pub use deck::*;
pub use dockerfile::*;
pub use engine::*;
pub use error::*;
pub use executor::{CancelToken, Canceller, Executor, OsExecutor};
pub use inventory::*;
pub use misc::*;
pub use paths::*;
pub use poller::*;
pub use status::*;
pub use task_tracker::*;
/// This reexport helps with dependency wrangling
pub use stacked_errors;
