// Licensed under the Apache-2.0 license

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console_harness::{Overrides, Session, SessionConfig, Signal, TestMarkers, TestOutcome};
use log::LevelFilter;
use nix::unistd::Pid;
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the firmware and run console commands, each as one logged test
    Run {
        #[command(flatten)]
        session: SessionArgs,

        /// Command to run at the prompt; may be repeated
        #[arg(short = 'c', long = "command")]
        commands: Vec<String>,

        /// File with one command per line; `#` starts a comment
        #[arg(long)]
        script: Option<PathBuf>,

        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
    /// Print the build configuration read from the build directory
    Buildconfig {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Board to test; `sandbox` runs the firmware built for the host
    #[arg(short = 'B', long)]
    board_type: Option<String>,

    /// Identity of the board, passed to the helper programs
    #[arg(long)]
    board_identity: Option<String>,

    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Defaults to `<source-dir>/build-<board-type>`
    #[arg(long)]
    build_dir: Option<PathBuf>,

    #[arg(long)]
    result_dir: Option<PathBuf>,

    /// Where the test log and filesystem images are kept
    #[arg(long)]
    persistent_data_dir: Option<PathBuf>,

    /// Prompt printed by the firmware; defaults to CONFIG_SYS_PROMPT
    #[arg(long)]
    prompt: Option<String>,

    /// TOML file with session settings; the command line wins over it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra argument for the sandbox firmware; may be repeated
    #[arg(long = "flag", allow_hyphen_values = true)]
    flags: Vec<String>,

    #[arg(long)]
    dtb: Option<PathBuf>,

    /// Start the sandbox without a device tree
    #[arg(long, default_value_t = false)]
    no_dtb: bool,

    /// Run the sandbox under gdbserver on this channel, e.g. localhost:1234;
    /// console waits then never time out
    #[arg(long)]
    gdbserver: Option<String>,

    /// Attach to firmware that is already running instead of booting it
    #[arg(long, default_value_t = false)]
    use_running_system: bool,

    /// Timeout for each wait on the console, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl SessionArgs {
    fn overrides(&self) -> Result<Overrides> {
        let file = match &self.config {
            Some(path) => Overrides::from_file(path)?,
            None => Overrides::default(),
        };
        Ok(file.merge(Overrides {
            board_type: self.board_type.clone(),
            board_identity: self.board_identity.clone(),
            source_dir: self.source_dir.clone(),
            build_dir: self.build_dir.clone(),
            result_dir: self.result_dir.clone(),
            persistent_data_dir: self.persistent_data_dir.clone(),
            prompt: self.prompt.clone(),
            dtb: self.dtb.clone(),
            use_dtb: self.no_dtb.then_some(false),
            flags: (!self.flags.is_empty()).then(|| self.flags.clone()),
            gdbserver: self.gdbserver.clone(),
            use_running_system: self.use_running_system.then_some(true),
            timeout_ms: self.timeout_ms,
            ..Default::default()
        }))
    }

    fn load(&self) -> Result<SessionConfig> {
        SessionConfig::load(&self.overrides()?)
    }
}

fn read_script(path: &PathBuf) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

fn run(config: SessionConfig, commands: Vec<String>) -> Result<i32> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let dut_pid = Arc::new(AtomicI32::new(0));
    {
        let interrupted = interrupted.clone();
        let dut_pid = dut_pid.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            let pid = dut_pid.load(Ordering::SeqCst);
            if pid > 0 {
                let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGINT);
            }
        })
        .context("failed to install the SIGINT handler")?;
    }

    let mut session = Session::new(config)?;
    let markers = TestMarkers::default();
    let names: Vec<String> = (0..commands.len()).map(|i| format!("command_{i}")).collect();
    session.collect(names.iter().cloned());
    for (name, cmd) in names.iter().zip(&commands) {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        let outcome = session.run_test(name, &markers, |console| {
            if let Some(pid) = console.pid() {
                dut_pid.store(pid as i32, Ordering::SeqCst);
            }
            let output = console.run_command(cmd)?;
            println!("{output}");
            Ok(())
        });
        if let TestOutcome::Failed(reason) = outcome {
            eprintln!("{cmd}: {reason}");
        }
        if !session.connection_ok() {
            break;
        }
    }

    if interrupted.load(Ordering::SeqCst) {
        log::info!("Interrupted, stopping the DUT");
        let console = session.console();
        if console.pid().is_some() {
            console.kill(Signal::SIGINT)?;
            if !console.validate_exited()? {
                log::warn!("DUT did not exit after SIGINT");
            }
        }
        session.finish()?;
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(session.finish()?.exit_code())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            session,
            commands,
            script,
            verbose,
        } => {
            let level = if verbose {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            };
            let _ = SimpleLogger::new().with_level(level).init();
            let mut commands = commands;
            if let Some(script) = &script {
                commands.extend(read_script(script)?);
            }
            run(session.load()?, commands)?
        }
        Commands::Buildconfig { session } => {
            let config = session.load()?;
            for (key, value) in &config.buildconfig {
                println!("{key}={value}");
            }
            println!("prompt={:?}", config.prompt);
            0
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
