//! Runs scenario programs as independent processes, a bounded number at a
//! time, and reports their outcome.

pub mod catalog;
pub mod handler;
pub mod report;

use std::path::PathBuf;

use thiserror::Error;

pub use catalog::{select, Selection, BASE_SCENARIOS, EXTENDED_SCENARIOS};
pub use handler::{Finished, HandlerSettings, TestHandler, SEED_SLOTS};
pub use report::{ScenarioResult, Status, Style};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to launch scenario {name} ({path:?}): {source}")]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scenario pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("invalid filter: {0}")]
    Filter(#[from] regex::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
