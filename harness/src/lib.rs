// Licensed under the Apache-2.0 license

//! Drives a firmware's serial console for automated testing.
//!
//! A [`Session`] owns the HTML test log and a [`Console`], which boots the
//! device under test through a [`backend::ConsoleBackend`], runs commands
//! with echo synchronization and watches the output for named error
//! patterns.

pub mod backend;
pub mod checks;
pub mod config;
pub mod console;
pub mod error;
pub mod fixture;
pub mod fs_helper;
pub mod markers;
pub mod multiplexed_log;
pub mod spawn;

pub use checks::{Check, CheckPolicy};
pub use config::{Overrides, SessionConfig};
pub use console::{CheckGuard, Console, ConsoleState, RestartOptions, RunOptions, TimeoutGuard};
pub use error::{ConsoleError, Result, SkipTest};
pub use fixture::{Session, TestOutcome, TestStats};
pub use markers::TestMarkers;
pub use multiplexed_log::Logfile;
pub use nix::sys::signal::Signal;
