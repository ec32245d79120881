// Licensed under the Apache-2.0 license

//! The request/response interface to the firmware shell.
//!
//! A [`Console`] starts the DUT through its backend, waits for it to boot to
//! the prompt and then runs commands one at a time: the command is typed in
//! small chunks whose echo is awaited, then the output is collected until
//! the prompt comes back. While waiting, every armed check is matched against
//! the incoming bytes.

use crate::backend::ConsoleBackend;
use crate::checks::{self, CheckPolicy, CheckSet, OverlayToken};
use crate::config::SessionConfig;
use crate::error::{ConsoleError, Result, SkipTest};
use crate::multiplexed_log::{ChainedFile, LogStream, Logfile};
use crate::spawn::Spawn;
use nix::sys::signal::Signal;
use regex::bytes::Regex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long to wait for each chunk of a command to be echoed.
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(1000);
/// Boot timeout once the lab has taken over preparing the board.
pub const LAB_PREPARE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1000);
/// How long a command left running by an earlier test may take to return to
/// the prompt before the DUT is restarted.
const RESYNC_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_POLLS: usize = 10;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const PATTERN_LAB_READY: &str = r"\{lab ready in (.*)s: (.*)\}";
const PATTERN_LAB_MODE: &str = r"\{lab mode.*\}";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleState {
    Unspawned,
    Spawning,
    AtPrompt,
    CommandInFlight,
    AwaitingPattern,
    Crashed,
    Exited,
    Killed,
}

/// Options for [`Console::run_command_with`].
#[derive(Clone, Copy, Debug)]
pub struct RunOptions {
    /// Wait for each chunk of the command to be echoed before sending more.
    pub wait_for_echo: bool,
    /// Terminate the command with a newline.
    pub send_nl: bool,
    /// Wait for the prompt and return the command's output.
    pub wait_for_prompt: bool,
    /// The command reboots the DUT; wait for a full boot instead of a plain
    /// prompt.
    pub wait_for_reboot: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait_for_echo: true,
            send_nl: true,
            wait_for_prompt: true,
            wait_for_reboot: false,
        }
    }
}

/// Options for [`Console::restart_uboot`].
#[derive(Clone, Debug)]
pub struct RestartOptions {
    /// Extra arguments for this boot only.
    pub flags: Option<Vec<String>>,
    pub use_dtb: bool,
    /// The firmware resets itself once before reaching the prompt.
    pub expect_reset: bool,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            flags: None,
            use_dtb: true,
            expect_reset: false,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ConsoleError::Protocol(format!("bad pattern {pattern:?}: {e}")))
}

/// `bytes` as regex escapes, for use in a `(?-u)` pattern.
fn escape_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\x{b:02x}")).collect()
}

/// Regex matching the echo of `chunk`. A newline may come back as either CR
/// or LF.
fn echo_regex(chunk: &[u8]) -> Result<Regex> {
    let pattern: String = chunk
        .split_inclusive(|&b| b == b'\n')
        .map(|line| match line.strip_suffix(b"\n") {
            Some(text) => format!("{}[\\r\\n]", escape_bytes(text)),
            None => escape_bytes(line),
        })
        .collect();
    compile(&format!("(?-u){pattern}"))
}

/// Regex matching the prompt at the start of a line, with any blanks after it.
fn prompt_regex(prompt: &str) -> Result<Regex> {
    compile(&format!(
        "(?m-u)^{}[ \\t]*",
        escape_bytes(prompt.as_bytes())
    ))
}

/// Turn raw command output into text: CRLF becomes LF, stray CRs are dropped
/// and the newlines around the output are trimmed.
fn normalize(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace("\r\n", "\n")
        .replace('\r', "")
        .trim_matches('\n')
        .to_string()
}

pub struct Console {
    log: Logfile,
    logstream: LogStream,
    config: Arc<SessionConfig>,
    backend: Box<dyn ConsoleBackend>,
    spawn: Option<Spawn>,
    state: ConsoleState,
    checks: CheckSet,
    prompt: Regex,
    timeout: Duration,
    timeout_stack: Vec<(u64, Duration)>,
    next_timeout_token: u64,
    at_prompt_logevt: Option<u64>,
    lab_mode: bool,
    version_string: Option<String>,
    ram_base: Option<std::result::Result<u64, String>>,
}

impl Console {
    pub fn new(
        log: Logfile,
        config: Arc<SessionConfig>,
        backend: Box<dyn ConsoleBackend>,
    ) -> Result<Self> {
        let prompt = prompt_regex(&config.prompt)?;
        Ok(Self {
            logstream: log.get_stream("console", None),
            log,
            timeout: default_timeout(&config),
            config,
            backend,
            spawn: None,
            state: ConsoleState::Unspawned,
            checks: CheckSet::new(checks::default_checks()?),
            prompt,
            timeout_stack: vec![],
            next_timeout_token: 0,
            at_prompt_logevt: None,
            lab_mode: false,
            version_string: None,
            ram_base: None,
        })
    }

    pub fn state(&self) -> ConsoleState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn log(&self) -> &Logfile {
        &self.log
    }

    /// Timeout for the next wait; [`Duration::MAX`] means no limit.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The signon text seen during the last boot.
    pub fn version_string(&self) -> Option<&str> {
        self.version_string.as_deref()
    }

    pub fn max_fifo_fill(&self) -> usize {
        self.config
            .max_fifo_fill
            .unwrap_or_else(|| self.backend.max_fifo_fill())
            .max(1)
    }

    /// Process id of the DUT or the helper attached to it.
    pub fn pid(&self) -> Option<u32> {
        self.spawn.as_ref().map(Spawn::pid)
    }

    pub fn is_alive(&mut self) -> bool {
        self.spawn.as_mut().is_some_and(Spawn::is_alive)
    }

    /// Names and policies of the checks currently armed.
    pub fn armed_checks(&self) -> Vec<(String, CheckPolicy)> {
        self.checks.snapshot()
    }

    /// Number of times a non-fatal check has fired.
    pub fn check_hits(&self, name: &str) -> u64 {
        self.checks.hits(name)
    }

    /// Also copy DUT output to `out`, e.g. the terminal.
    pub fn mirror_output(&mut self, out: ChainedFile) {
        self.logstream = self.log.get_stream("console", Some(out));
        if let Some(spawn) = self.spawn.as_mut() {
            spawn.logfile_read = Some(Box::new(self.logstream.clone()));
        }
    }

    fn spawn_mut(&mut self) -> Result<&mut Spawn> {
        self.spawn
            .as_mut()
            .ok_or_else(|| ConsoleError::Protocol("no DUT connection".into()))
    }

    /// Wait for one of `wanted` while evaluating the armed checks.
    ///
    /// Returns the index into `wanted` and all output before the match,
    /// including any text that fired a non-fatal check. With `tolerate_fatal`
    /// fatal checks are only logged.
    fn expect_with_checks(
        &mut self,
        wanted: &[&Regex],
        timeout: Duration,
        tolerate_fatal: bool,
    ) -> Result<(usize, Vec<u8>)> {
        let armed = self.checks.armed();
        let mut patterns = wanted.to_vec();
        patterns.extend(armed.iter().map(|c| &c.pattern));

        let deadline = std::time::Instant::now().checked_add(timeout);
        let mut before = vec![];
        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(std::time::Instant::now()),
                None => timeout,
            };
            let spawn = self
                .spawn
                .as_mut()
                .ok_or_else(|| ConsoleError::Protocol("no DUT connection".into()))?;
            let idx = match spawn.expect(&patterns, remaining) {
                Ok(idx) => idx,
                Err(ConsoleError::Timeout { waiting_for, .. }) => {
                    return Err(ConsoleError::Timeout {
                        waiting_for,
                        timeout,
                    })
                }
                Err(err @ ConsoleError::Eof(_)) => {
                    self.state = ConsoleState::Crashed;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            before.extend_from_slice(spawn.before());
            if idx < wanted.len() {
                return Ok((idx, before));
            }

            let check = &armed[idx - wanted.len()];
            let excerpt = String::from_utf8_lossy(spawn.after()).into_owned();
            before.extend_from_slice(spawn.after());
            match check.policy {
                CheckPolicy::Fatal if !tolerate_fatal => {
                    self.state = ConsoleState::Crashed;
                    self.log
                        .error(&format!("Check '{}' fired: {excerpt}", check.name))?;
                    return Err(ConsoleError::CheckFailure {
                        name: check.name.clone(),
                        excerpt,
                    });
                }
                CheckPolicy::Fatal | CheckPolicy::Warn => {
                    log::warn!("check '{}' matched: {excerpt}", check.name);
                    self.log
                        .warning(&format!("Check '{}' matched: {excerpt}", check.name))?;
                    self.checks.record_hit(&check.name);
                }
                CheckPolicy::Count => self.checks.record_hit(&check.name),
            }
        }
    }

    fn set_at_prompt(&mut self) {
        self.state = ConsoleState::AtPrompt;
        self.at_prompt_logevt = Some(self.log.cur_evt());
        if let Some(spawn) = self.spawn.as_mut() {
            if spawn.pending().iter().any(|b| !b.is_ascii_whitespace()) {
                log::debug!(
                    "discarding output after prompt: {:?}",
                    String::from_utf8_lossy(spawn.pending())
                );
            }
            spawn.clear_pending();
        }
    }

    fn log_implicit_prompt(&mut self) -> Result<()> {
        if self.state == ConsoleState::AtPrompt && self.at_prompt_logevt != Some(self.log.cur_evt())
        {
            self.logstream.write_implicit(self.config.prompt.as_bytes())?;
        }
        Ok(())
    }

    fn set_lab_mode(&mut self) -> Result<()> {
        self.log.info("Lab mode is active")?;
        self.timeout = LAB_PREPARE_TIMEOUT;
        self.lab_mode = true;
        Ok(())
    }

    /// Record `data` in the log as transmitted, then send it to the DUT.
    fn transmit(&mut self, data: &[u8]) -> Result<()> {
        self.logstream.write_tx(data)?;
        let res = self.spawn_mut()?.send(data);
        if let Err(err) = &res {
            if err.is_crash() {
                self.state = ConsoleState::Crashed;
            }
        }
        res
    }

    /// Start the DUT and wait for its first prompt, unless it is already
    /// running.
    pub fn ensure_spawned(&mut self) -> Result<()> {
        self.spawn_and_boot(1)
    }

    /// As [`Console::ensure_spawned`], and also bring the console back to
    /// the prompt if an earlier caller left a command in flight. The DUT gets
    /// a short while to print its prompt and is restarted if it does not.
    pub fn ensure_at_prompt(&mut self) -> Result<()> {
        self.ensure_spawned()?;
        if self.state == ConsoleState::AtPrompt {
            return Ok(());
        }
        self.log.info(&format!(
            "Console left in state {:?}, waiting for the prompt",
            self.state
        ))?;
        self.state = ConsoleState::CommandInFlight;
        let res = {
            let mut console = self.temporary_timeout(RESYNC_TIMEOUT);
            console.wait_for_prompt()
        };
        match res {
            Ok(_) => Ok(()),
            Err(err) => {
                log::warn!("no prompt from the DUT ({err}), restarting it");
                self.log
                    .warning(&format!("No prompt ({err}), restarting U-Boot"))?;
                self.restart_uboot(RestartOptions::default())
            }
        }
    }

    fn spawn_and_boot(&mut self, loop_num: usize) -> Result<()> {
        match self.state {
            ConsoleState::AtPrompt
            | ConsoleState::CommandInFlight
            | ConsoleState::AwaitingPattern => {
                // Tests may have changed the timeout.
                self.timeout = default_timeout(&self.config);
                return Ok(());
            }
            ConsoleState::Spawning => {
                return Err(ConsoleError::Protocol("spawn already in progress".into()))
            }
            ConsoleState::Unspawned
            | ConsoleState::Crashed
            | ConsoleState::Exited
            | ConsoleState::Killed => {}
        }
        if self.spawn.is_some() {
            self.cleanup_spawn();
        }

        let _section = self.log.section("Starting U-Boot")?;
        self.state = ConsoleState::Spawning;
        self.lab_mode = false;
        self.version_string = None;
        self.timeout = default_timeout(&self.config);
        let mut spawn = match self.backend.get_spawn(&self.config, &self.log) {
            Ok(spawn) => spawn,
            Err(err) => {
                self.state = ConsoleState::Unspawned;
                return Err(err);
            }
        };
        spawn.logfile_read = Some(Box::new(self.logstream.clone()));
        self.spawn = Some(spawn);

        let res = if self.config.use_running_system {
            self.attach_running_system()
        } else {
            self.wait_for_boot_prompt(loop_num).map(|_| ())
        };
        self.log.timestamp()?;
        match res {
            Ok(_) => {
                self.set_at_prompt();
                Ok(())
            }
            Err(err) => {
                self.state = ConsoleState::Crashed;
                self.log.error(&format!("Boot failed: {err}"))?;
                Err(err)
            }
        }
    }

    /// Join a system that has already booted. An empty command brings up a
    /// fresh prompt and clears any partly typed command line.
    fn attach_running_system(&mut self) -> Result<()> {
        self.log.info("Attaching to a running system")?;
        self.run_command_inner(b" \n", RunOptions::default())?;
        Ok(())
    }

    /// Watch the DUT boot up to its prompt. Returns the output before the
    /// prompt.
    fn wait_for_boot_prompt(&mut self, loop_num: usize) -> Result<Vec<u8>> {
        self.log.info("Waiting for U-Boot to be ready")?;
        if !self.lab_mode {
            self.wait_for_banner(loop_num)?;
        }
        let before = self.wait_ready()?;
        self.log.info("U-Boot is ready")?;
        Ok(before)
    }

    fn wait_for_banner(&mut self, mut loop_num: usize) -> Result<()> {
        let spl_signon = compile(checks::PATTERN_SPL_SIGNON)?;
        let main_signon = compile(checks::PATTERN_MAIN_SIGNON)?;
        let lab_mode = compile(PATTERN_LAB_MODE)?;
        let spl_serial = self.config.buildconfig_value("spl_serial") == Some("y");

        while loop_num > 0 {
            loop_num -= 1;
            let mut spl_banners = self.config.env.spl_banner_times;
            while spl_serial && !self.config.env.spl_skipped && spl_banners > 0 {
                let (idx, _) =
                    self.expect_with_checks(&[&spl_signon, &lab_mode], self.timeout, false)?;
                if idx == 1 {
                    self.set_lab_mode()?;
                    break;
                }
                spl_banners -= 1;
            }

            if !self.lab_mode {
                let (idx, _) =
                    self.expect_with_checks(&[&main_signon, &lab_mode], self.timeout, false)?;
                if idx == 1 {
                    self.set_lab_mode()?;
                } else {
                    let signon = self.spawn_mut()?.after().to_vec();
                    self.version_string = Some(String::from_utf8_lossy(&signon).into_owned());
                }
            }
        }
        Ok(())
    }

    fn wait_ready(&mut self) -> Result<Vec<u8>> {
        let prompt = self.prompt.clone();
        let ready = compile(PATTERN_LAB_READY)?;
        let autoboot = compile(checks::PATTERN_STOP_AUTOBOOT_PROMPT)?;
        let mut output = vec![];
        loop {
            let (idx, before) =
                self.expect_with_checks(&[&prompt, &ready, &autoboot], self.timeout, self.lab_mode)?;
            output.extend_from_slice(&before);
            match idx {
                0 => return Ok(output),
                1 => {
                    let after = self.spawn_mut()?.after().to_vec();
                    if let Some(caps) = ready.captures(&after) {
                        self.version_string = caps
                            .get(2)
                            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned());
                    }
                    self.log.info("Lab: Board is ready")?;
                    self.timeout = default_timeout(&self.config);
                    return Ok(output);
                }
                _ => {
                    self.log.info("Found autoboot prompt")?;
                    self.transmit(b" ")?;
                }
            }
        }
    }

    /// Run `cmd` and return its output.
    pub fn run_command(&mut self, cmd: &str) -> Result<String> {
        self.run_command_with(cmd, RunOptions::default())
    }

    /// Run `cmd` with explicit control over echo, newline and prompt
    /// handling. Returns an empty string if the prompt is not awaited.
    pub fn run_command_with(&mut self, cmd: &str, opts: RunOptions) -> Result<String> {
        if self.state != ConsoleState::AtPrompt {
            return Err(ConsoleError::Protocol(format!(
                "cannot run '{cmd}' in state {:?}",
                self.state
            )));
        }
        let _section = self.log.section(cmd)?;
        self.log_implicit_prompt()?;
        self.state = ConsoleState::CommandInFlight;

        let mut data = cmd.as_bytes().to_vec();
        if opts.send_nl {
            data.push(b'\n');
        }
        let res = self.run_command_inner(&data, opts);
        self.log.timestamp()?;
        if let Err(err) = &res {
            if err.is_crash() {
                self.state = ConsoleState::Crashed;
            }
            self.log.error(&format!("Error running '{cmd}': {err}"))?;
        }
        res
    }

    fn run_command_inner(&mut self, data: &[u8], opts: RunOptions) -> Result<String> {
        let fifo = self.max_fifo_fill();
        for chunk in data.chunks(fifo) {
            log::debug!("sending {:?}", String::from_utf8_lossy(chunk));
            self.transmit(chunk)?;
            if !opts.wait_for_echo {
                continue;
            }
            let echo = echo_regex(chunk)?;
            if let Err(err) = self.expect_with_checks(&[&echo], ECHO_TIMEOUT, false) {
                let pending = self
                    .spawn
                    .as_ref()
                    .map(|s| s.pending().to_vec())
                    .unwrap_or_default();
                return Err(match err {
                    // Something came back, but not the echo.
                    ConsoleError::Timeout { .. } if !pending.is_empty() => {
                        ConsoleError::EchoMismatch {
                            sent: String::from_utf8_lossy(chunk).into_owned(),
                            received: String::from_utf8_lossy(&pending).into_owned(),
                        }
                    }
                    err => err,
                });
            }
        }
        if !opts.wait_for_prompt {
            return Ok(String::new());
        }

        let before = if opts.wait_for_reboot {
            self.lab_mode = false;
            self.wait_for_boot_prompt(1)?
        } else {
            let prompt = self.prompt.clone();
            self.expect_with_checks(&[&prompt], self.timeout, false)?.1
        };
        self.set_at_prompt();
        Ok(normalize(&before))
    }

    /// Run each command in turn, stopping at the first failure. Returns the
    /// outputs joined by newlines.
    pub fn run_command_list(&mut self, cmds: &[&str]) -> Result<String> {
        let mut outputs = vec![];
        for cmd in cmds {
            outputs.push(self.run_command(cmd)?);
        }
        Ok(outputs.join("\n"))
    }

    /// Send raw text without waiting for echo or prompt.
    pub fn send(&mut self, text: &str) -> Result<()> {
        self.send_bytes(text.as_bytes())
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            ConsoleState::AtPrompt
            | ConsoleState::CommandInFlight
            | ConsoleState::AwaitingPattern => {}
            state => {
                return Err(ConsoleError::Protocol(format!(
                    "cannot send to the DUT in state {state:?}"
                )))
            }
        }
        self.log_implicit_prompt()?;
        self.state = ConsoleState::CommandInFlight;
        let fifo = self.max_fifo_fill();
        for chunk in data.chunks(fifo) {
            self.transmit(chunk)?;
        }
        Ok(())
    }

    /// Send a control character, e.g. `'C'` for Ctrl-C.
    pub fn ctrl(&mut self, ch: char) -> Result<()> {
        let ch = ch.to_ascii_uppercase();
        if !('@'..='_').contains(&ch) {
            return Err(ConsoleError::Protocol(format!("no control code for '{ch}'")));
        }
        self.log.action(&format!("Sending Ctrl-{ch}"))?;
        self.send_bytes(&[ch as u8 - b'@'])
    }

    pub fn ctrlc(&mut self) -> Result<()> {
        self.ctrl('C')
    }

    /// Wait for the prompt after a command sent without waiting for it.
    /// Returns the output since the command.
    pub fn wait_for_prompt(&mut self) -> Result<String> {
        match self.state {
            ConsoleState::CommandInFlight | ConsoleState::AwaitingPattern => {}
            state => {
                return Err(ConsoleError::Protocol(format!(
                    "no command in flight (state {state:?})"
                )))
            }
        }
        let prompt = self.prompt.clone();
        let (_, before) = self.expect_with_checks(&[&prompt], self.timeout, false)?;
        self.set_at_prompt();
        Ok(normalize(&before))
    }

    /// Wait for `text` to appear in the output without sending anything.
    pub fn wait_for(&mut self, text: &str) -> Result<()> {
        let pattern = compile(&regex::escape(text))?;
        self.wait_for_regex(&pattern)?;
        Ok(())
    }

    /// Wait for `pattern` and return the text that matched it.
    pub fn wait_for_regex(&mut self, pattern: &Regex) -> Result<String> {
        let prev = match self.state {
            state @ (ConsoleState::AtPrompt
            | ConsoleState::CommandInFlight
            | ConsoleState::AwaitingPattern) => state,
            state => {
                return Err(ConsoleError::Protocol(format!(
                    "cannot wait for output in state {state:?}"
                )))
            }
        };
        let _section = self.log.section(&format!("wait_for {}", pattern.as_str()))?;
        self.state = ConsoleState::AwaitingPattern;
        match self.expect_with_checks(&[pattern], self.timeout, false) {
            Ok(_) => {
                let matched = String::from_utf8_lossy(self.spawn_mut()?.after()).into_owned();
                if prev == ConsoleState::AtPrompt {
                    self.set_at_prompt();
                } else {
                    self.state = prev;
                }
                Ok(matched)
            }
            Err(err) => {
                if self.state == ConsoleState::AwaitingPattern {
                    self.state = prev;
                }
                Err(err)
            }
        }
    }

    /// Read and log output for a short while. Used after a failure so the
    /// log shows what the DUT printed.
    pub fn drain_console(&mut self) {
        let Some(spawn) = self.spawn.as_mut() else {
            return;
        };
        let Ok(never) = compile("This should never match U-Boot output") else {
            return;
        };
        if let Err(ConsoleError::Eof(desc)) = spawn.expect(&[&never], DRAIN_TIMEOUT) {
            log::debug!("DUT gone while draining: {desc}");
            self.state = ConsoleState::Crashed;
        }
    }

    /// Demote the check `name` to a warning until the guard is dropped.
    pub fn disable_check(&mut self, name: &str) -> Result<CheckGuard<'_>> {
        let token = self.checks.disable(name)?;
        Ok(CheckGuard {
            console: self,
            token: Some(token),
        })
    }

    /// Arm an extra fatal check until the guard is dropped.
    pub fn enable_check(&mut self, name: &str, pattern: &str) -> Result<CheckGuard<'_>> {
        let token = self.checks.enable(name, pattern)?;
        Ok(CheckGuard {
            console: self,
            token: Some(token),
        })
    }

    /// Use `timeout` for waits until the guard is dropped.
    pub fn temporary_timeout(&mut self, timeout: Duration) -> TimeoutGuard<'_> {
        let token = self.next_timeout_token;
        self.next_timeout_token += 1;
        self.timeout_stack.push((token, self.timeout));
        self.timeout = timeout;
        TimeoutGuard {
            console: self,
            token: Some(token),
        }
    }

    fn pop_timeout(&mut self, token: u64) -> Result<()> {
        match self.timeout_stack.last() {
            Some(&(top, prev)) if top == token => {
                self.timeout_stack.pop();
                self.timeout = prev;
                Ok(())
            }
            _ => Err(ConsoleError::Protocol(format!(
                "timeout override {token} is not the innermost"
            ))),
        }
    }

    /// Deliver `sig` to the DUT.
    pub fn kill(&mut self, sig: Signal) -> Result<()> {
        if let Some(spawn) = self.spawn.as_mut() {
            self.log.action(&format!("kill {sig}"))?;
            self.backend.kill(spawn, sig)?;
        }
        self.state = ConsoleState::Killed;
        Ok(())
    }

    /// Wait up to a second for the DUT to exit, then close the connection.
    /// Returns true if it exited by itself.
    ///
    /// Fails with [`ConsoleError::Protocol`] if there is no DUT connection,
    /// i.e. nothing was spawned or the connection was already closed.
    pub fn validate_exited(&mut self) -> Result<bool> {
        let Some(mut spawn) = self.spawn.take() else {
            return Err(ConsoleError::Protocol(
                "no DUT connection to validate".into(),
            ));
        };
        let mut exited = false;
        for _ in 0..EXIT_POLLS {
            if !spawn.is_alive() {
                exited = true;
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        let close_type = spawn.close()?;
        self.log.info(&format!(
            "DUT {}, close type {close_type:?}",
            spawn.check_alive().description
        ))?;
        self.state = if exited {
            ConsoleState::Exited
        } else {
            ConsoleState::Crashed
        };
        Ok(exited)
    }

    /// Drop the connection to the DUT so that the next
    /// [`Console::ensure_spawned`] starts afresh.
    pub fn cleanup_spawn(&mut self) {
        if let Some(mut spawn) = self.spawn.take() {
            if let Err(err) = spawn.close() {
                log::warn!("failed to close DUT connection: {err}");
            }
        }
        self.state = ConsoleState::Unspawned;
    }

    /// Stop the DUT after a test left it in a state later tests cannot use.
    pub fn shutdown_required(&mut self) {
        self.drain_console();
        self.cleanup_spawn();
    }

    /// Stop the DUT and boot it again, optionally with different flags for
    /// this boot only.
    pub fn restart_uboot(&mut self, opts: RestartOptions) -> Result<()> {
        if opts.flags.is_some() || !opts.use_dtb {
            self.backend
                .set_spawn_flags(opts.flags.unwrap_or_default(), opts.use_dtb)?;
        }
        self.shutdown_required();
        let res = self.spawn_and_boot(if opts.expect_reset { 2 } else { 1 });
        self.backend.reset_spawn_flags();
        res
    }

    /// Close the connection at the end of the session.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut spawn) = self.spawn.take() {
            let _section = self.log.section("Stopping U-Boot")?;
            let close_type = spawn.close()?;
            self.log.info(&format!("Close type: {close_type:?}"))?;
            self.state = ConsoleState::Exited;
        }
        self.log.flush()
    }

    /// Everything the DUT printed since it was spawned.
    pub fn get_spawn_output(&self) -> Option<String> {
        self.spawn
            .as_ref()
            .map(|s| String::from_utf8_lossy(s.output()).into_owned())
    }

    /// Fail unless `text` contains the signon seen during boot.
    pub fn validate_main_signon_in_text(&self, text: &str) -> Result<()> {
        match &self.version_string {
            Some(signon) if text.contains(signon.as_str()) => Ok(()),
            _ => Err(ConsoleError::CheckFailure {
                name: checks::MAIN_SIGNON.into(),
                excerpt: text.to_string(),
            }),
        }
    }

    /// Start address of the first RAM bank, from `bdinfo`.
    pub fn find_ram_base(&mut self) -> anyhow::Result<u64> {
        if !self.config.buildconfig_enabled("cmd_bdi") {
            return Err(SkipTest("bdinfo command not supported".into()).into());
        }
        match &self.ram_base {
            Some(Ok(base)) => return Ok(*base),
            Some(Err(_)) => {
                return Err(SkipTest("Previously failed to find RAM bank start".into()).into())
            }
            None => {}
        }

        let _section = self.log.section("find_ram_base")?;
        let response = self.run_command("bdinfo")?;
        let base = response
            .lines()
            .find(|l| l.contains("-> start"))
            .and_then(|l| l.split_once('='))
            .and_then(|(_, v)| {
                let v = v.trim();
                u64::from_str_radix(v.strip_prefix("0x").unwrap_or(v), 16).ok()
            });
        match base {
            Some(base) => {
                self.ram_base = Some(Ok(base));
                Ok(base)
            }
            None => {
                let msg = "Failed to find RAM bank start in `bdinfo`".to_string();
                self.ram_base = Some(Err(msg.clone()));
                anyhow::bail!(msg)
            }
        }
    }
}

/// Wait limit for a session; debugging through gdbserver has none.
fn default_timeout(config: &SessionConfig) -> Duration {
    if config.gdbserver.is_some() {
        Duration::MAX
    } else {
        config.timeout
    }
}

fn release(result: Result<()>) {
    // Guards borrow the console mutably, so they cannot be released out of
    // order. Never panic while already unwinding.
    if let Err(err) = result {
        log::error!("{err}");
        debug_assert!(thread::panicking(), "{err}");
    }
}

/// Returned by [`Console::disable_check`] and [`Console::enable_check`]; the
/// console is used through it while the change is in effect.
pub struct CheckGuard<'a> {
    console: &'a mut Console,
    token: Option<OverlayToken>,
}

impl CheckGuard<'_> {
    /// End the scope, reporting a nesting error instead of panicking.
    pub fn close(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.console.checks.pop(token),
            None => Ok(()),
        }
    }
}

impl Deref for CheckGuard<'_> {
    type Target = Console;

    fn deref(&self) -> &Console {
        self.console
    }
}

impl DerefMut for CheckGuard<'_> {
    fn deref_mut(&mut self) -> &mut Console {
        self.console
    }
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            release(self.console.checks.pop(token));
        }
    }
}

/// Returned by [`Console::temporary_timeout`].
pub struct TimeoutGuard<'a> {
    console: &'a mut Console,
    token: Option<u64>,
}

impl Deref for TimeoutGuard<'_> {
    type Target = Console;

    fn deref(&self) -> &Console {
        self.console
    }
}

impl DerefMut for TimeoutGuard<'_> {
    fn deref_mut(&mut self) -> &mut Console {
        self.console
    }
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            release(self.console.pop_timeout(token));
        }
    }
}
