use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::masternode::ActivationPhase;

/// JSON-RPC code the daemon returns while it is still loading its block index.
pub const RPC_IN_WARMUP: i64 = -28;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to launch {binary:?} for node {index}: {source}")]
    ProcessSpawn {
        index: usize,
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("node {index} did not answer within {waited:?}")]
    StartupTimeout { index: usize, waited: Duration },
    #[error("node {index} exited during startup ({status})")]
    EarlyExit { index: usize, status: ExitStatus },
    #[error("node {index} ignored stop for {waited:?} and was killed")]
    ShutdownTimeout { index: usize, waited: Duration },
    #[error("rpc endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("{method} failed with code {code}: {message}")]
    RemoteCall {
        method: String,
        code: i64,
        message: String,
    },
    #[error("malformed rpc response: {0}")]
    Protocol(String),
    #[error("node {0} is not running")]
    InvalidNodeReference(usize),
    #[error("node {0} is already running")]
    NodeAlreadyRunning(usize),
    #[error("timed out after {waited:?} waiting for {what}")]
    ConvergenceTimeout { what: String, waited: Duration },
    #[error("masternode {alias} made no progress after {attempts} attempts")]
    StallDetected { alias: String, attempts: u32 },
    #[error("masternode {alias} is not active yet: {reason}")]
    NotYetActive { alias: String, reason: String },
    #[error("masternode {alias} is {actual:?}, operation needs {expected:?}")]
    InvalidPhase {
        alias: String,
        expected: ActivationPhase,
        actual: ActivationPhase,
    },
    #[error("logical clock cannot move back from {current} to {requested}")]
    ClockRegression { current: i64, requested: i64 },
    #[error("logical clock at {current} cannot advance by {delta}")]
    ClockOverflow { current: i64, delta: u64 },
    #[error("no nodes given for {0}")]
    EmptyNodeSet(String),
    #[error("invalid masternode config line: {0}")]
    InvalidConfigLine(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Conditions a polling loop reads as "not converged yet" rather than fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            HarnessError::Unreachable { .. } | HarnessError::NotYetActive { .. } => true,
            HarnessError::RemoteCall { code, .. } => *code == RPC_IN_WARMUP,
            _ => false,
        }
    }

    pub fn remote_code(&self) -> Option<i64> {
        match self {
            HarnessError::RemoteCall { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
