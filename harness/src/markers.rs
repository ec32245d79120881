// Licensed under the Apache-2.0 license

//! Gating of tests on the board and build configuration.

use crate::config::SessionConfig;

/// Requirements a test places on the session.
#[derive(Clone, Debug, Default)]
pub struct TestMarkers {
    /// Board types the test runs on. A leading `!` excludes a board type.
    pub boardspec: Vec<String>,
    /// Build options that must be enabled.
    pub buildconfigspec: Vec<String>,
    /// Build options that must be disabled.
    pub notbuildconfigspec: Vec<String>,
    /// The test must not run alongside other sessions.
    pub singlethread: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Gate {
    Run,
    Skip(String),
}

impl TestMarkers {
    pub fn boardspec(mut self, board: &str) -> Self {
        self.boardspec.push(board.to_string());
        self
    }

    pub fn buildconfigspec(mut self, opt: &str) -> Self {
        self.buildconfigspec.push(opt.to_string());
        self
    }

    pub fn notbuildconfigspec(mut self, opt: &str) -> Self {
        self.notbuildconfigspec.push(opt.to_string());
        self
    }

    pub fn singlethread(mut self) -> Self {
        self.singlethread = true;
        self
    }

    /// Decide whether the test runs in a session with `config`.
    pub fn evaluate(&self, config: &SessionConfig) -> Gate {
        let mut required = vec![];
        for board in &self.boardspec {
            match board.strip_prefix('!') {
                Some(excluded) if excluded == config.board_type => {
                    return Gate::Skip(format!("board \"{}\" not supported", config.board_type));
                }
                Some(_) => {}
                None => required.push(board.as_str()),
            }
        }
        if !required.is_empty() && !required.contains(&config.board_type.as_str()) {
            return Gate::Skip(format!("board \"{}\" not supported", config.board_type));
        }

        if let Some(opt) = self
            .buildconfigspec
            .iter()
            .find(|opt| !config.buildconfig_enabled(opt))
        {
            return Gate::Skip(format!(".config feature \"{}\" not enabled", opt.to_lowercase()));
        }
        if let Some(opt) = self
            .notbuildconfigspec
            .iter()
            .find(|opt| config.buildconfig_enabled(opt))
        {
            return Gate::Skip(format!(".config feature \"{}\" enabled", opt.to_lowercase()));
        }
        Gate::Run
    }
}
