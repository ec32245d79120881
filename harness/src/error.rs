// Licensed under the Apache-2.0 license

use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while driving a DUT console.
///
/// Test fixtures turn most of these into test failures. [`ConsoleError::Protocol`]
/// and [`ConsoleError::SpawnFailure`] halt the whole session instead.
#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        timeout: Duration,
    },
    #[error("echo mismatch: sent {sent:?}, received {received:?}")]
    EchoMismatch { sent: String, received: String },
    #[error("DUT exited unexpectedly ({0})")]
    Eof(String),
    #[error("check '{name}' fired: {excerpt:?}")]
    CheckFailure { name: String, excerpt: String },
    #[error("failed to spawn DUT: {0}")]
    SpawnFailure(String),
    #[error("harness protocol error: {0}")]
    Protocol(String),
    #[error("command '{command}' failed ({status}):\n{output}")]
    ExternalCommand {
        command: String,
        status: ExitStatus,
        output: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConsoleError {
    /// Returns true for errors after which no further test should use the
    /// session.
    pub fn halts_session(&self) -> bool {
        matches!(
            self,
            ConsoleError::Protocol(_) | ConsoleError::SpawnFailure(_)
        )
    }

    /// Returns true if the DUT must be considered dead after this error.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            ConsoleError::EchoMismatch { .. }
                | ConsoleError::Eof(_)
                | ConsoleError::CheckFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

/// Returned by a test, usually wrapped in an `anyhow::Error`, when it cannot
/// run in this session.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SkipTest(pub String);
