// Licensed under the Apache-2.0 license

use super::ConsoleBackend;
use crate::config::SessionConfig;
use crate::error::{ConsoleError, Result};
use crate::multiplexed_log::Logfile;
use crate::spawn::Spawn;
use std::path::Path;
use std::process::Command;

const DEFAULT_MAX_FIFO_FILL: usize = 16;

/// A board reached through external helper programs. The board is flashed
/// once when the backend is created; each spawn attaches to its console and
/// then resets it.
pub struct ExecAttach;

fn helper(path: &Path, config: &SessionConfig) -> Command {
    let mut cmd = Command::new(path);
    cmd.arg(&config.board_type)
        .arg(&config.board_identity)
        .envs(config.helper_envs());
    cmd
}

impl ExecAttach {
    pub fn new(config: &SessionConfig, log: &Logfile) -> Result<Self> {
        let _section = log.section("flash")?;
        let runner = log.get_runner("flash", None);
        runner
            .run(&mut helper(&config.helpers.flash, config))
            .map_err(|e| ConsoleError::SpawnFailure(format!("flashing the board failed: {e}")))?;
        Ok(Self)
    }
}

impl ConsoleBackend for ExecAttach {
    fn type_name(&self) -> &'static str {
        "exec-attach"
    }

    fn max_fifo_fill(&self) -> usize {
        DEFAULT_MAX_FIFO_FILL
    }

    fn get_spawn(&mut self, config: &SessionConfig, log: &Logfile) -> Result<Spawn> {
        // Attach first so that no output after the reset is lost.
        let spawn = Spawn::new(&mut helper(&config.helpers.console, config))?;
        let _section = log.section("reset")?;
        let runner = log.get_runner("reset", None);
        runner
            .run(&mut helper(&config.helpers.reset, config))
            .map_err(|e| ConsoleError::SpawnFailure(format!("resetting the board failed: {e}")))?;
        Ok(spawn)
    }
}
