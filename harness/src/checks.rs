// Licensed under the Apache-2.0 license

//! Named patterns that must not appear in DUT output, and the stack of scoped
//! overlays that relax or extend them.

use crate::error::{ConsoleError, Result};
use regex::bytes::Regex;
use std::collections::BTreeMap;

pub const SPL_SIGNON: &str = "spl_signon";
pub const MAIN_SIGNON: &str = "main_signon";
pub const STOP_AUTOBOOT_PROMPT: &str = "stop_autoboot_prompt";
pub const UNKNOWN_COMMAND: &str = "unknown_command";
pub const ERROR_NOTIFICATION: &str = "error_notification";
pub const ERROR_PLEASE_RESET: &str = "error_please_reset";
pub const EXCEPTION: &str = "exception";
pub const STACK_SMASH: &str = "stack_smash";

pub const PATTERN_SPL_SIGNON: &str = r"(U-Boot Concept SPL \d{4}\.\d{2}[^\r\n]*\))";
pub const PATTERN_MAIN_SIGNON: &str = r"(U-Boot Concept \d{4}\.\d{2}[^\r\n]*\))";
pub const PATTERN_STOP_AUTOBOOT_PROMPT: &str = r"Hit any key to stop autoboot: ";
pub const PATTERN_UNKNOWN_COMMAND: &str = r"Unknown command '.*' - try 'help'";
pub const PATTERN_ERROR_NOTIFICATION: &str = r"## Error: ";
pub const PATTERN_ERROR_PLEASE_RESET: &str = r"### ERROR ### Please RESET the board ###";
pub const PATTERN_EXCEPTION: &str = r"(Unhandled exception|Synchronous Abort|SIGSEGV|SIGILL)";
pub const PATTERN_STACK_SMASH: &str = r"Stack smashing detected";

/// What happens when a check's pattern shows up in the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckPolicy {
    /// Stop waiting and fail with [`ConsoleError::CheckFailure`].
    Fatal,
    /// Log a warning and keep waiting.
    Warn,
    /// Count the hit and keep waiting.
    Count,
}

#[derive(Clone, Debug)]
pub struct Check {
    pub name: String,
    pub pattern: Regex,
    pub policy: CheckPolicy,
}

impl Check {
    pub fn new(name: &str, pattern: &str, policy: CheckPolicy) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| ConsoleError::Protocol(format!("bad pattern for check '{name}': {e}")))?;
        Ok(Self {
            name: name.to_string(),
            pattern,
            policy,
        })
    }
}

/// The checks armed on every new console.
pub fn default_checks() -> Result<Vec<Check>> {
    [
        (SPL_SIGNON, PATTERN_SPL_SIGNON),
        (MAIN_SIGNON, PATTERN_MAIN_SIGNON),
        (STOP_AUTOBOOT_PROMPT, PATTERN_STOP_AUTOBOOT_PROMPT),
        (UNKNOWN_COMMAND, PATTERN_UNKNOWN_COMMAND),
        (ERROR_NOTIFICATION, PATTERN_ERROR_NOTIFICATION),
        (ERROR_PLEASE_RESET, PATTERN_ERROR_PLEASE_RESET),
        (EXCEPTION, PATTERN_EXCEPTION),
        (STACK_SMASH, PATTERN_STACK_SMASH),
    ]
    .into_iter()
    .map(|(name, pattern)| Check::new(name, pattern, CheckPolicy::Fatal))
    .collect()
}

/// Identifies one pushed overlay; must be handed back to [`CheckSet::pop`].
#[derive(Debug, PartialEq, Eq)]
pub struct OverlayToken(u64);

#[derive(Clone, Debug)]
enum Overlay {
    Demote(String),
    Add(Check),
}

/// Base checks plus a strictly nested stack of overlays.
#[derive(Clone, Debug)]
pub struct CheckSet {
    base: Vec<Check>,
    overlays: Vec<(u64, Overlay)>,
    next_token: u64,
    hits: BTreeMap<String, u64>,
}

impl CheckSet {
    pub fn new(base: Vec<Check>) -> Self {
        Self {
            base,
            overlays: vec![],
            next_token: 0,
            hits: BTreeMap::new(),
        }
    }

    fn push(&mut self, overlay: Overlay) -> OverlayToken {
        let token = self.next_token;
        self.next_token += 1;
        self.overlays.push((token, overlay));
        OverlayToken(token)
    }

    /// Demote `name` to [`CheckPolicy::Warn`] until the overlay is popped.
    pub fn disable(&mut self, name: &str) -> Result<OverlayToken> {
        if !self.armed().iter().any(|c| c.name == name) {
            return Err(ConsoleError::Protocol(format!("unknown check '{name}'")));
        }
        Ok(self.push(Overlay::Demote(name.to_string())))
    }

    /// Arm an extra fatal check until the overlay is popped. A check of the
    /// same name is replaced for the duration.
    pub fn enable(&mut self, name: &str, pattern: &str) -> Result<OverlayToken> {
        let check = Check::new(name, pattern, CheckPolicy::Fatal)?;
        Ok(self.push(Overlay::Add(check)))
    }

    /// Remove the innermost overlay, which must be the one `token` names.
    pub fn pop(&mut self, token: OverlayToken) -> Result<()> {
        match self.overlays.last() {
            Some((top, _)) if *top == token.0 => {
                self.overlays.pop();
                Ok(())
            }
            Some((top, _)) => Err(ConsoleError::Protocol(format!(
                "check overlay {} popped while {top} is innermost",
                token.0
            ))),
            None => Err(ConsoleError::Protocol(format!(
                "check overlay {} popped with no overlay active",
                token.0
            ))),
        }
    }

    pub fn depth(&self) -> usize {
        self.overlays.len()
    }

    /// The effective checks with all overlays applied, in arming order.
    pub fn armed(&self) -> Vec<Check> {
        let mut checks = self.base.clone();
        for (_, overlay) in &self.overlays {
            match overlay {
                Overlay::Demote(name) => {
                    for check in checks.iter_mut().filter(|c| &c.name == name) {
                        check.policy = CheckPolicy::Warn;
                    }
                }
                Overlay::Add(check) => {
                    checks.retain(|c| c.name != check.name);
                    checks.push(check.clone());
                }
            }
        }
        checks
    }

    /// Names and policies of the armed checks, for comparing states.
    pub fn snapshot(&self) -> Vec<(String, CheckPolicy)> {
        self.armed()
            .into_iter()
            .map(|c| (c.name, c.policy))
            .collect()
    }

    pub fn record_hit(&mut self, name: &str) {
        *self.hits.entry(name.to_string()).or_default() += 1;
    }

    pub fn hits(&self, name: &str) -> u64 {
        self.hits.get(name).copied().unwrap_or(0)
    }
}
