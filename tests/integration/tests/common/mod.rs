// Licensed under the Apache-2.0 license

//! A fake build directory whose firmware is the `sim-shell` binary.

#![allow(dead_code)]

use console_harness::{Overrides, Session, SessionConfig};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const SIM_SHELL: &str = env!("CARGO_BIN_EXE_sim-shell");

pub const BUILDCONFIG: &str = "\
# Automatically generated file; DO NOT EDIT.
CONFIG_SANDBOX=y
CONFIG_SYS_PROMPT=\"=> \"
CONFIG_CMD_MEMORY=y
CONFIG_CMD_BDI=y
CONFIG_CMD_ECHO=y
# CONFIG_SPL is not set
";

pub fn init_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Debug).init();
}

/// A source tree with a build directory holding the simulated firmware.
pub struct SimTree {
    pub dir: TempDir,
}

impl SimTree {
    pub fn new() -> Self {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build-sandbox");
        fs::create_dir_all(&build).unwrap();
        fs::copy(SIM_SHELL, build.join("u-boot")).unwrap();
        fs::write(build.join(".config"), BUILDCONFIG).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn build_dir(&self) -> PathBuf {
        self.path().join("build-sandbox")
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            source_dir: Some(self.path().to_path_buf()),
            persistent_data_dir: Some(self.path().join("data")),
            timeout_ms: Some(10_000),
            ..Default::default()
        }
    }

    pub fn config(&self) -> SessionConfig {
        SessionConfig::load(&self.overrides()).unwrap()
    }

    /// A session on the sandbox backend, booted to the prompt.
    pub fn session(&self) -> Session {
        let mut session = Session::new(self.config()).unwrap();
        session.console().ensure_spawned().unwrap();
        session
    }

    pub fn log_html(&self) -> String {
        fs::read_to_string(self.path().join("data/results/test-log.html")).unwrap()
    }

    /// Write an executable shell script into the tree.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
