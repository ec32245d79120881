// Licensed under the Apache-2.0 license

//! The session that owns the console and its log, and runs tests against it.

use crate::backend::{self, ConsoleBackend};
use crate::config::SessionConfig;
use crate::console::Console;
use crate::error::{ConsoleError, SkipTest};
use crate::markers::{Gate, TestMarkers};
use crate::multiplexed_log::Logfile;
use anyhow::Result;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Skipped(String),
    Failed(String),
}

/// Results of all tests run in a session.
#[derive(Clone, Debug, Default)]
pub struct TestStats {
    pub passed: Vec<String>,
    pub skipped: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
    /// Collected tests that never ran, e.g. after an interrupt.
    pub not_run: Vec<String>,
}

impl TestStats {
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() && self.not_run.is_empty() {
            0
        } else {
            1
        }
    }

    fn record(&mut self, name: &str, outcome: &TestOutcome) {
        match outcome {
            TestOutcome::Passed => self.passed.push(name.to_string()),
            TestOutcome::Skipped(reason) => self.skipped.push((name.to_string(), reason.clone())),
            TestOutcome::Failed(reason) => self.failed.push((name.to_string(), reason.clone())),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

pub struct Session {
    config: Arc<SessionConfig>,
    log: Logfile,
    console: Console,
    stats: TestStats,
    pending: Vec<String>,
    connection_ok: bool,
}

impl Session {
    /// Open the session log and create the console for the configured board.
    /// For an attached board this flashes it.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let config = Arc::new(config);
        let log = Logfile::new(&config.log_path())?;
        let backend = backend::new_backend(&config, &log)?;
        Self::with_backend(config, log, backend)
    }

    pub fn with_backend(
        config: Arc<SessionConfig>,
        log: Logfile,
        backend: Box<dyn ConsoleBackend>,
    ) -> Result<Self> {
        log::info!(
            "Session for {} ({}), log at {}",
            config.board_type,
            config.board_identity,
            config.log_path().display()
        );
        let console = Console::new(log.clone(), config.clone(), backend)?;
        Ok(Self {
            config,
            log,
            console,
            stats: TestStats::default(),
            pending: vec![],
            connection_ok: true,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn log(&self) -> &Logfile {
        &self.log
    }

    pub fn console(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn stats(&self) -> &TestStats {
        &self.stats
    }

    /// Announce tests that are expected to run. Any that have not run by
    /// [`Session::finish`] are reported as not run.
    pub fn collect<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.pending.contains(&name) {
                self.pending.push(name);
            }
        }
    }

    /// False once an error has made the DUT unusable for further tests.
    pub fn connection_ok(&self) -> bool {
        self.connection_ok
    }

    fn mark_connection_bad(&mut self, reason: &str) {
        self.connection_ok = false;
        let msg = format!("{reason}: marking connection bad - no other tests will run");
        log::error!("{msg}");
        let _ = self.log.error(&msg);
        self.console.cleanup_spawn();
    }

    /// Boot the DUT if needed and get it to the prompt, restarting it once
    /// if the first attempt fails.
    fn prepare_console(&mut self) -> std::result::Result<(), String> {
        let err = match self.console.ensure_at_prompt() {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.halts_session() {
            self.mark_connection_bad(&err.to_string());
            return Err(err.to_string());
        }
        log::warn!("DUT failed to start ({err}), restarting");
        self.console.cleanup_spawn();
        match self.console.ensure_spawned() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.mark_connection_bad(&format!("DUT failed to start twice: {err}"));
                Err(err.to_string())
            }
        }
    }

    /// Run one test against the console.
    ///
    /// Panics in `test` are caught and reported as failures. After a failure
    /// the console output is drained into the log and the DUT is dropped, so
    /// the next test starts with a fresh one.
    pub fn run_test<F>(&mut self, name: &str, markers: &TestMarkers, test: F) -> TestOutcome
    where
        F: FnOnce(&mut Console) -> Result<()>,
    {
        let outcome = self.run_test_inner(name, markers, test);
        let note = match &outcome {
            TestOutcome::Passed => self.log.status_pass(&format!("OK: {name}")),
            TestOutcome::Skipped(reason) => {
                self.log.status_skipped(&format!("SKIPPED: {name}: {reason}"))
            }
            TestOutcome::Failed(reason) => {
                self.log.status_fail(&format!("FAILED: {name}: {reason}"))
            }
        };
        if let Err(err) = note {
            log::error!("failed to log result of {name}: {err}");
        }
        log::info!("{name}: {outcome:?}");
        self.pending.retain(|pending| pending != name);
        self.stats.record(name, &outcome);
        outcome
    }

    fn run_test_inner<F>(&mut self, name: &str, markers: &TestMarkers, test: F) -> TestOutcome
    where
        F: FnOnce(&mut Console) -> Result<()>,
    {
        let _section = match self.log.section(name) {
            Ok(section) => section,
            Err(err) => return TestOutcome::Failed(err.to_string()),
        };
        if !self.connection_ok {
            return TestOutcome::Failed("connection to the DUT is bad".into());
        }
        if let Gate::Skip(reason) = markers.evaluate(&self.config) {
            return TestOutcome::Skipped(reason);
        }
        if markers.singlethread {
            let _ = self.log.info("singlethread test");
        }
        if let Err(err) = self.prepare_console() {
            return TestOutcome::Failed(err);
        }

        let console = &mut self.console;
        let res = catch_unwind(AssertUnwindSafe(|| test(console)));
        let reason = match res {
            Ok(Ok(())) => return TestOutcome::Passed,
            Ok(Err(err)) => {
                if let Some(skip) = err.downcast_ref::<SkipTest>() {
                    return TestOutcome::Skipped(skip.0.clone());
                }
                if let Some(console_err) = err.downcast_ref::<ConsoleError>() {
                    if console_err.halts_session() {
                        let reason = format!("{err:#}");
                        self.mark_connection_bad(&reason);
                        return TestOutcome::Failed(reason);
                    }
                }
                let _ = self.log.exception(&err);
                format!("{err:#}")
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                let _ = self.log.error(&format!("panic: {msg}"));
                msg
            }
        };

        self.console.drain_console();
        self.console.cleanup_spawn();
        TestOutcome::Failed(reason)
    }

    /// Shut the DUT down, write the summary and close the log.
    pub fn finish(mut self) -> Result<TestStats> {
        self.console.close()?;
        let mut stats = std::mem::take(&mut self.stats);
        stats.not_run = std::mem::take(&mut self.pending);
        {
            let _section = self.log.section("Status Report")?;
            for name in &stats.passed {
                self.log.status_pass(&format!("PASSED: {name}"))?;
            }
            for (name, reason) in &stats.skipped {
                self.log.status_skipped(&format!("SKIPPED: {name} ({reason})"))?;
            }
            for (name, reason) in &stats.failed {
                self.log.status_fail(&format!("FAILED: {name} ({reason})"))?;
            }
            if !stats.not_run.is_empty() {
                self.log
                    .status_fail(&format!("{} not run", stats.not_run.len()))?;
                for name in &stats.not_run {
                    self.log.status_fail(&format!("NOT RUN: {name}"))?;
                }
            }
        }
        self.log.close()?;
        log::info!(
            "{} passed, {} skipped, {} failed, {} not run",
            stats.passed.len(),
            stats.skipped.len(),
            stats.failed.len(),
            stats.not_run.len()
        );
        Ok(stats)
    }
}
