// Licensed under the Apache-2.0 license

//! Session configuration.
//!
//! A session is configured from defaults, an optional TOML file and the
//! command line, in increasing priority. The build configuration of the
//! firmware is read from the build directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PROMPT: &str = "=>";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Per-board facts that change how the boot is observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoardEnv {
    /// The board starts in the main image, so no SPL banner is printed.
    pub spl_skipped: bool,
    /// Number of SPL banners printed before the main signon.
    pub spl_banner_times: usize,
}

impl Default for BoardEnv {
    fn default() -> Self {
        Self {
            spl_skipped: false,
            spl_banner_times: 1,
        }
    }
}

/// External programs used by the attached backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Helpers {
    pub flash: PathBuf,
    pub reset: PathBuf,
    pub console: PathBuf,
}

impl Default for Helpers {
    fn default() -> Self {
        Self {
            flash: "u-boot-test-flash".into(),
            reset: "u-boot-test-reset".into(),
            console: "u-boot-test-console".into(),
        }
    }
}

/// Settings fixed for the lifetime of a session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub board_type: String,
    pub board_identity: String,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub result_dir: PathBuf,
    pub persistent_data_dir: PathBuf,
    /// Text printed by the firmware when it is ready for a command.
    pub prompt: String,
    /// Build options, keyed by lower-case name such as `config_cmd_memory`.
    pub buildconfig: BTreeMap<String, String>,
    pub env: BoardEnv,
    /// Device tree passed to the local firmware, if not the default one.
    pub dtb: Option<PathBuf>,
    pub use_dtb: bool,
    /// Extra arguments for the local firmware.
    pub extra_flags: Vec<String>,
    /// Run the local firmware under gdbserver listening on this channel.
    /// Console waits then have no time limit.
    pub gdbserver: Option<String>,
    /// Attach to firmware that has already booted instead of waiting for
    /// its signon.
    pub use_running_system: bool,
    pub helpers: Helpers,
    /// Default timeout for a single wait on the console.
    pub timeout: Duration,
    /// Overrides the backend's FIFO fill budget.
    pub max_fifo_fill: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let build_dir = PathBuf::from("build-sandbox");
        Self {
            board_type: "sandbox".into(),
            board_identity: "na".into(),
            source_dir: PathBuf::from("."),
            result_dir: build_dir.clone(),
            persistent_data_dir: build_dir.join("persistent-data"),
            build_dir,
            prompt: DEFAULT_PROMPT.into(),
            buildconfig: BTreeMap::new(),
            env: BoardEnv::default(),
            dtb: None,
            use_dtb: true,
            extra_flags: vec![],
            gdbserver: None,
            use_running_system: false,
            helpers: Helpers::default(),
            timeout: DEFAULT_TIMEOUT,
            max_fifo_fill: None,
        }
    }
}

/// Optional settings from a session file or the command line.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Overrides {
    pub board_type: Option<String>,
    pub board_identity: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub result_dir: Option<PathBuf>,
    pub persistent_data_dir: Option<PathBuf>,
    pub prompt: Option<String>,
    pub dtb: Option<PathBuf>,
    pub use_dtb: Option<bool>,
    pub flags: Option<Vec<String>>,
    pub gdbserver: Option<String>,
    pub use_running_system: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub max_fifo_fill: Option<usize>,
    #[serde(default)]
    pub env: EnvOverrides,
    #[serde(default)]
    pub helpers: HelperOverrides,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct EnvOverrides {
    pub spl_skipped: Option<bool>,
    pub spl_banner_times: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct HelperOverrides {
    pub flash: Option<PathBuf>,
    pub reset: Option<PathBuf>,
    pub console: Option<PathBuf>,
}

impl Overrides {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read session file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse session file {}", path.display()))
    }

    /// Combine two sets of overrides; values in `other` win.
    pub fn merge(self, other: Overrides) -> Overrides {
        Overrides {
            board_type: other.board_type.or(self.board_type),
            board_identity: other.board_identity.or(self.board_identity),
            source_dir: other.source_dir.or(self.source_dir),
            build_dir: other.build_dir.or(self.build_dir),
            result_dir: other.result_dir.or(self.result_dir),
            persistent_data_dir: other.persistent_data_dir.or(self.persistent_data_dir),
            prompt: other.prompt.or(self.prompt),
            dtb: other.dtb.or(self.dtb),
            use_dtb: other.use_dtb.or(self.use_dtb),
            flags: other.flags.or(self.flags),
            gdbserver: other.gdbserver.or(self.gdbserver),
            use_running_system: other.use_running_system.or(self.use_running_system),
            timeout_ms: other.timeout_ms.or(self.timeout_ms),
            max_fifo_fill: other.max_fifo_fill.or(self.max_fifo_fill),
            env: EnvOverrides {
                spl_skipped: other.env.spl_skipped.or(self.env.spl_skipped),
                spl_banner_times: other.env.spl_banner_times.or(self.env.spl_banner_times),
            },
            helpers: HelperOverrides {
                flash: other.helpers.flash.or(self.helpers.flash),
                reset: other.helpers.reset.or(self.helpers.reset),
                console: other.helpers.console.or(self.helpers.console),
            },
        }
    }
}

impl SessionConfig {
    /// Build the configuration of a session and read the firmware's build
    /// configuration from its build directory.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let defaults = SessionConfig::default();
        let board_type = overrides
            .board_type
            .clone()
            .unwrap_or(defaults.board_type);
        let source_dir = overrides
            .source_dir
            .clone()
            .unwrap_or(defaults.source_dir);
        let build_dir = overrides
            .build_dir
            .clone()
            .unwrap_or_else(|| source_dir.join(format!("build-{board_type}")));
        let result_dir = overrides
            .result_dir
            .clone()
            .unwrap_or_else(|| build_dir.clone());
        let persistent_data_dir = overrides
            .persistent_data_dir
            .clone()
            .unwrap_or_else(|| build_dir.join("persistent-data"));

        let buildconfig = load_buildconfig(&build_dir)?;
        let prompt = resolve_prompt(overrides.prompt.as_deref(), &buildconfig);

        let o = overrides.clone();
        Ok(Self {
            board_type,
            board_identity: o.board_identity.unwrap_or(defaults.board_identity),
            source_dir,
            build_dir,
            result_dir,
            persistent_data_dir,
            prompt,
            buildconfig,
            env: BoardEnv {
                spl_skipped: o.env.spl_skipped.unwrap_or(defaults.env.spl_skipped),
                spl_banner_times: o
                    .env
                    .spl_banner_times
                    .unwrap_or(defaults.env.spl_banner_times),
            },
            dtb: o.dtb,
            use_dtb: o.use_dtb.unwrap_or(defaults.use_dtb),
            extra_flags: o.flags.unwrap_or_default(),
            gdbserver: o.gdbserver,
            use_running_system: o.use_running_system.unwrap_or(defaults.use_running_system),
            helpers: Helpers {
                flash: o.helpers.flash.unwrap_or(defaults.helpers.flash),
                reset: o.helpers.reset.unwrap_or(defaults.helpers.reset),
                console: o.helpers.console.unwrap_or(defaults.helpers.console),
            },
            timeout: o
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            max_fifo_fill: o.max_fifo_fill,
        })
    }

    /// Value of a build option, given without the `CONFIG_` prefix in any
    /// case.
    pub fn buildconfig_value(&self, opt: &str) -> Option<&str> {
        self.buildconfig
            .get(&format!("config_{}", opt.to_lowercase()))
            .map(String::as_str)
    }

    /// Returns true if a build option is set to anything other than `n` or
    /// an empty value.
    pub fn buildconfig_enabled(&self, opt: &str) -> bool {
        matches!(self.buildconfig_value(opt), Some(v) if !v.is_empty() && v != "n")
    }

    /// Device tree used by the local firmware unless one is configured.
    pub fn default_dtb(&self) -> PathBuf {
        self.build_dir.join("arch/sandbox/dts/test.dtb")
    }

    pub fn log_path(&self) -> PathBuf {
        self.persistent_data_dir.join("results").join("test-log.html")
    }

    /// Environment passed to helper programs.
    pub fn helper_envs(&self) -> HashMap<String, String> {
        let mut envs = HashMap::new();
        envs.insert("UBOOT_BOARD_TYPE".into(), self.board_type.clone());
        envs.insert("UBOOT_BOARD_IDENTITY".into(), self.board_identity.clone());
        for (name, dir) in [
            ("UBOOT_SOURCE_DIR", &self.source_dir),
            ("UBOOT_BUILD_DIR", &self.build_dir),
            ("UBOOT_RESULT_DIR", &self.result_dir),
            ("UBOOT_PERSISTENT_DATA_DIR", &self.persistent_data_dir),
        ] {
            envs.insert(name.into(), dir.display().to_string());
        }
        envs
    }
}

/// Read `.config` (required) and `include/autoconf.mk` (optional) from a
/// build directory. Keys are lower-cased.
pub fn load_buildconfig(build_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut buildconfig = BTreeMap::new();
    let dot_config = build_dir.join(".config");
    if !dot_config.exists() {
        bail!(
            "{} does not exist; is the firmware built in {}?",
            dot_config.display(),
            build_dir.display()
        );
    }
    for path in [dot_config, build_dir.join("include/autoconf.mk")] {
        if !path.exists() {
            continue;
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        parse_config_lines(&text, &mut buildconfig);
    }
    Ok(buildconfig)
}

fn parse_config_lines(text: &str, out: &mut BTreeMap<String, String>) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
}

/// Pick the prompt: an explicit value, else `CONFIG_SYS_PROMPT`, else the
/// default.
pub fn resolve_prompt(explicit: Option<&str>, buildconfig: &BTreeMap<String, String>) -> String {
    if let Some(prompt) = explicit {
        return prompt.to_string();
    }
    match buildconfig.get("config_sys_prompt") {
        Some(v) => v.trim_matches('"').to_string(),
        None => DEFAULT_PROMPT.to_string(),
    }
}
