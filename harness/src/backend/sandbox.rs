// Licensed under the Apache-2.0 license

use super::ConsoleBackend;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::multiplexed_log::Logfile;
use crate::spawn::Spawn;
use std::process::Command;

/// The firmware built for the host, run as a child process.
pub struct Sandbox {
    flags: Vec<String>,
    use_dtb: bool,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            flags: vec![],
            use_dtb: true,
        }
    }

    /// The command line used for the next spawn.
    pub fn command(&self, config: &SessionConfig) -> Command {
        let bin = if config.buildconfig_value("vpl") == Some("y") {
            // TPL runs first and then loads VPL.
            config.build_dir.join("tpl/u-boot-tpl")
        } else if config.buildconfig_value("spl") == Some("y") {
            config.build_dir.join("spl/u-boot-spl")
        } else {
            config.build_dir.join("u-boot")
        };

        let mut cmd = match &config.gdbserver {
            Some(channel) => {
                let mut cmd = Command::new("gdbserver");
                cmd.arg(channel).arg(&bin);
                cmd
            }
            None => Command::new(&bin),
        };
        cmd.arg("-v");
        if self.use_dtb && config.use_dtb {
            cmd.arg("-d")
                .arg(config.dtb.clone().unwrap_or_else(|| config.default_dtb()));
        }
        cmd.args(&config.extra_flags)
            .args(&self.flags)
            .current_dir(&config.source_dir);
        cmd
    }
}

impl ConsoleBackend for Sandbox {
    fn type_name(&self) -> &'static str {
        "sandbox"
    }

    fn max_fifo_fill(&self) -> usize {
        1024
    }

    fn get_spawn(&mut self, config: &SessionConfig, log: &Logfile) -> Result<Spawn> {
        let mut cmd = self.command(config);
        log.action(&format!(
            "Starting sandbox: {}",
            crate::multiplexed_log::command_line(&cmd)
        ))?;
        Spawn::new(&mut cmd)
    }

    fn set_spawn_flags(&mut self, flags: Vec<String>, use_dtb: bool) -> Result<()> {
        self.flags = flags;
        self.use_dtb = use_dtb;
        Ok(())
    }

    fn reset_spawn_flags(&mut self) {
        self.flags.clear();
        self.use_dtb = true;
    }
}
