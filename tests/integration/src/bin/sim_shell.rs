// Licensed under the Apache-2.0 license

//! A stand-in for the sandbox firmware: prints a signon banner and runs a
//! small command shell on stdio with character echo.

use clap::Parser;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

const BANNER: &str = "U-Boot Concept 2025.01-sim (Jan 01 2025 - 00:00:00 +0000)";
const PROMPT: &str = "=> ";
const CTRL_C: u8 = 0x03;
/// Time taken to process one input byte when the input FIFO is bounded.
const BYTE_TIME: Duration = Duration::from_millis(1);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Verbose console output
    #[arg(short = 'v', default_value_t = false)]
    verbose: bool,

    /// Device tree; only reported
    #[arg(short = 'd')]
    dtb: Option<PathBuf>,

    /// RAM size; only reported
    #[arg(short = 'm')]
    memory: Option<String>,

    /// Write a UPL handoff before the banner
    #[arg(long, default_value_t = false)]
    upl: bool,

    /// Fault during boot instead of reaching the prompt
    #[arg(long, default_value_t = false)]
    boot_exception: bool,

    /// Print the banner this many times, as after a reset in SPL
    #[arg(long, default_value_t = 1)]
    banner_times: usize,

    /// Depth of the input FIFO; bytes arriving while it is full are lost
    #[arg(long)]
    fifo: Option<usize>,

    /// Start as an already booted system: no banner and no prompt until
    /// the first line arrives
    #[arg(long, default_value_t = false)]
    running: bool,
}

struct Shell {
    out: io::Stdout,
    env: HashMap<String, String>,
    mem: HashMap<u64, u32>,
    line: Vec<u8>,
    /// Most input bytes ever waiting at once.
    fifo_peak: usize,
}

impl Shell {
    fn print(&mut self, text: &str) {
        self.write_raw(text.as_bytes());
    }

    fn write_raw(&mut self, data: &[u8]) {
        let mut out = self.out.lock();
        // Nothing to do if the harness went away.
        let _ = out.write_all(data);
        let _ = out.flush();
    }

    fn input(&mut self, byte: u8) {
        match byte {
            b'\r' | b'\n' => {
                self.print("\r\n");
                let cmd = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                self.run_line(&cmd);
                self.print(PROMPT);
            }
            CTRL_C => {
                self.line.clear();
                self.print("<INTERRUPT>\n");
                self.print(PROMPT);
            }
            _ => {
                self.line.push(byte);
                self.write_raw(&[byte]);
            }
        }
    }

    fn expand(&self, cmd: &str) -> String {
        let mut out = String::new();
        let mut chars = cmd.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut name = String::new();
            if chars.peek() == Some(&'{') {
                chars.next();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if !(c.is_ascii_alphanumeric() || c == '_') {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
            }
            if let Some(value) = self.env.get(&name) {
                out.push_str(value);
            }
        }
        out
    }

    fn run_line(&mut self, line: &str) {
        for cmd in line.split(';') {
            let cmd = self.expand(cmd);
            let argv: Vec<&str> = cmd.split_whitespace().collect();
            if let Some((name, args)) = argv.split_first() {
                self.run(name, args);
            }
        }
    }

    fn run(&mut self, name: &str, args: &[&str]) {
        match name {
            "echo" => {
                let text = format!("{}\n", args.join(" "));
                self.print(&text);
            }
            "setenv" => match args.split_first() {
                Some((key, [])) => {
                    self.env.remove(*key);
                }
                Some((key, value)) => {
                    self.env.insert(key.to_string(), value.join(" "));
                }
                None => self.print("Usage: setenv name [value]\n"),
            },
            "printenv" => {
                let mut text = String::new();
                match args.first() {
                    Some(key) => match self.env.get(*key) {
                        Some(value) => text = format!("{key}={value}\n"),
                        None => text = format!("## Error: \"{key}\" not defined\n"),
                    },
                    None => {
                        let mut vars: Vec<_> = self.env.iter().collect();
                        vars.sort();
                        for (key, value) in vars {
                            text.push_str(&format!("{key}={value}\n"));
                        }
                    }
                }
                self.print(&text);
            }
            "version" => self.print(&format!("{BANNER}\n")),
            "bdinfo" => self.print(
                "boot_params = 0x00000000\n\
                 DRAM bank   = 0x00000000\n\
                 -> start    = 0x00000000\n\
                 -> size     = 0x08000000\n",
            ),
            "mw" | "mw.l" => self.mw(args),
            "md" | "md.l" => self.md(args),
            "sleep" => {
                let secs = args.first().and_then(|s| s.parse::<f64>().ok()).unwrap_or(1.0);
                std::thread::sleep(Duration::from_secs_f64(secs));
            }
            "reset" => {
                self.print("resetting ...\n");
                exit(0);
            }
            "host" => match args {
                ["bind", _, path] if std::path::Path::new(path).is_file() => {}
                ["bind", _, path] => self.print(&format!("## Error: cannot open {path}\n")),
                _ => self.print("Usage: host bind dev file\n"),
            },
            "fifo" => self.print(&format!("fifo peak {}\n", self.fifo_peak)),
            "crash" => {
                self.print("Unhandled exception: Illegal instruction\n");
                exit(1);
            }
            "help" => self.print(
                "bdinfo crash echo fifo help host md mw printenv reset setenv sleep version\n",
            ),
            _ => self.print(&format!("Unknown command '{name}' - try 'help'\n")),
        }
    }

    fn mw(&mut self, args: &[&str]) {
        let (Some(addr), Some(value)) = (
            args.first().and_then(|a| parse_hex(a)),
            args.get(1).and_then(|v| parse_hex(v)),
        ) else {
            self.print("Usage: mw address value [count]\n");
            return;
        };
        let count = args.get(2).and_then(|c| parse_hex(c)).unwrap_or(1);
        for i in 0..count {
            self.mem.insert(addr + i * 4, value as u32);
        }
    }

    fn md(&mut self, args: &[&str]) {
        let Some(addr) = args.first().and_then(|a| parse_hex(a)) else {
            self.print("Usage: md address [count]\n");
            return;
        };
        let count = args.get(1).and_then(|c| parse_hex(c)).unwrap_or(0x40);
        let mut text = String::new();
        for line in 0..count.div_ceil(4) {
            let base = addr + line * 16;
            text.push_str(&format!("{base:08x}:"));
            for i in 0..(count - line * 4).min(4) {
                let word = self.mem.get(&(base + i * 4)).copied().unwrap_or(0);
                text.push_str(&format!(" {word:08x}"));
            }
            text.push_str("    ................\n");
        }
        self.print(&text);
    }
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn main() {
    let args = Args::parse();
    let mut shell = Shell {
        out: io::stdout(),
        env: HashMap::new(),
        mem: HashMap::new(),
        line: Vec::new(),
        fifo_peak: 0,
    };

    if !args.running {
        boot(&mut shell, &args);
    }

    let mut stdin = io::stdin().lock();
    // At least the size of the stdin buffer, so reads go straight to the
    // terminal and show how much input was waiting.
    let mut buf = [0u8; 8192];
    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        shell.fifo_peak = shell.fifo_peak.max(n);
        let accepted = args.fifo.map_or(n, |depth| n.min(depth));
        for &byte in &buf[..accepted] {
            if args.fifo.is_some() {
                std::thread::sleep(BYTE_TIME);
            }
            shell.input(byte);
        }
    }
}

fn boot(shell: &mut Shell, args: &Args) {
    if args.upl {
        shell.print("Writing UPL handoff\n");
    }
    for _ in 0..args.banner_times {
        shell.print(&format!("\n{BANNER}\n\n"));
    }
    if args.verbose {
        let dtb = args
            .dtb
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "none".into());
        shell.print(&format!("Model: sandbox\nDT: {dtb}\n"));
    }
    if let Some(memory) = &args.memory {
        shell.print(&format!("DRAM:  {memory}\n"));
    }
    if args.boot_exception {
        shell.print("Unhandled exception: Segmentation fault\n");
        exit(1);
    }
    shell.print(PROMPT);
}
