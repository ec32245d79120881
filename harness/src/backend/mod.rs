// Licensed under the Apache-2.0 license

use crate::config::SessionConfig;
use crate::error::{ConsoleError, Result};
use crate::multiplexed_log::Logfile;
use crate::spawn::Spawn;
use nix::sys::signal::Signal;

pub use exec_attach::ExecAttach;
pub use sandbox::Sandbox;

mod exec_attach;
mod sandbox;

/// How a console obtains its connection to the DUT. The console protocol is
/// the same for every backend.
pub trait ConsoleBackend: Send {
    /// The type name of this backend
    fn type_name(&self) -> &'static str;

    /// Largest number of bytes that may be sent before their echo is seen.
    fn max_fifo_fill(&self) -> usize;

    /// Start a fresh DUT and connect to its console.
    fn get_spawn(&mut self, config: &SessionConfig, log: &Logfile) -> Result<Spawn>;

    /// Use `flags` and `use_dtb` for the next spawn only.
    fn set_spawn_flags(&mut self, _flags: Vec<String>, _use_dtb: bool) -> Result<()> {
        Err(ConsoleError::Protocol(format!(
            "{} backend does not take spawn flags",
            self.type_name()
        )))
    }

    /// Go back to the default flags after a restart with custom ones.
    fn reset_spawn_flags(&mut self) {}

    /// Deliver a signal to the DUT.
    fn kill(&mut self, spawn: &mut Spawn, sig: Signal) -> Result<()> {
        spawn.kill(sig)
    }
}

/// Constructs the backend for the session's board type: the local sandbox
/// firmware for `sandbox`, otherwise a board reached through the flash,
/// reset and console helpers.
///
/// Construction of an attached board flashes it, so this fails with
/// [`ConsoleError::SpawnFailure`] if flashing does.
pub fn new_backend(config: &SessionConfig, log: &Logfile) -> Result<Box<dyn ConsoleBackend>> {
    let backend: Box<dyn ConsoleBackend> = if config.board_type == "sandbox" {
        Box::new(Sandbox::new())
    } else {
        Box::new(ExecAttach::new(config, log)?)
    };
    log::info!("Using console backend {}", backend.type_name());
    Ok(backend)
}
