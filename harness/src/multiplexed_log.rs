// Licensed under the Apache-2.0 license

//! HTML log that multiplexes DUT output, harness actions and helper program
//! runs into one document.
//!
//! The log is organised as nested sections. Within a section, consecutive
//! writes to the same stream are grouped into one block; a write to another
//! stream (or any note) terminates the current block.

use crate::error::{ConsoleError, Result};
use chrono::{DateTime, Local};
use std::backtrace::Backtrace;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

const CSS_NAME: &str = "multiplexed_log.css";
const CSS: &str = include_str!("multiplexed_log.css");

/// Writer that receives a copy of everything logged to a stream, e.g. stdout.
pub type ChainedFile = Arc<Mutex<dyn Write + Send>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Normal,
    /// Text the harness inserted itself, e.g. a repeated prompt.
    Implicit,
    /// Bytes transmitted to the DUT.
    Tx,
}

struct LogfileInner {
    f: BufWriter<File>,
    last_stream: Option<String>,
    blocks: Vec<String>,
    cur_evt: u64,
    closed: bool,
    last_timestamp: DateTime<Local>,
}

/// Handle to a session log. Clones share the same underlying file.
#[derive(Clone)]
pub struct Logfile {
    inner: Arc<Mutex<LogfileInner>>,
}

impl Logfile {
    /// Create the log file at `path` and write the stylesheet next to it.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            std::fs::write(dir.join(CSS_NAME), CSS)?;
        }
        let mut f = BufWriter::new(File::create(path)?);
        write!(
            f,
            "<html>\n<head>\n<link rel=\"stylesheet\" type=\"text/css\" href=\"{CSS_NAME}\">\n</head>\n<body>\n<tt>\n"
        )?;
        Ok(Self {
            inner: Arc::new(Mutex::new(LogfileInner {
                f,
                last_stream: None,
                blocks: vec![],
                cur_evt: 1,
                closed: false,
                last_timestamp: Local::now(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogfileInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<MutexGuard<'_, LogfileInner>> {
        let inner = self.lock();
        if inner.closed {
            return Err(ConsoleError::Protocol("write to closed log".into()));
        }
        Ok(inner)
    }

    /// Finalize the document. Any later write fails.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.open()?;
        inner.terminate_stream()?;
        if !inner.blocks.is_empty() {
            log::warn!("closing log with open sections: {}", inner.blocks.join("/"));
        }
        inner.f.write_all(b"</tt>\n</body>\n</html>\n")?;
        inner.f.flush()?;
        inner.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Event counter, bumped each time a stream block is terminated.
    pub fn cur_evt(&self) -> u64 {
        self.lock().cur_evt
    }

    pub fn start_section(&self, marker: &str) -> Result<()> {
        let mut inner = self.open()?;
        inner.terminate_stream()?;
        inner.blocks.push(marker.to_string());
        let blk_path = escape(inner.blocks.join("/").as_bytes());
        let now = Local::now().format("%Y/%m/%d %H:%M:%S%.3f");
        write!(
            inner.f,
            "<div class=\"section\" id=\"{blk_path}\">\n<div class=\"section-header\" id=\"{blk_path}\">Section: {blk_path} <span class=\"timestamp\">{now}</span></div>\n"
        )?;
        Ok(())
    }

    pub fn end_section(&self, marker: &str) -> Result<()> {
        let mut inner = self.open()?;
        if inner.blocks.last().map(String::as_str) != Some(marker) {
            return Err(ConsoleError::Protocol(format!(
                "block nesting mismatch: \"{marker}\" \"{}\"",
                inner.blocks.join("/")
            )));
        }
        inner.terminate_stream()?;
        let blk_path = escape(inner.blocks.join("/").as_bytes());
        write!(
            inner.f,
            "<div class=\"section-trailer\" id=\"section-trailer-{blk_path}\">End section: {blk_path}</div>\n</div>\n"
        )?;
        inner.blocks.pop();
        Ok(())
    }

    /// Open a section that is closed when the returned guard is dropped.
    pub fn section(&self, marker: &str) -> Result<Section> {
        self.start_section(marker)?;
        Ok(Section {
            log: self.clone(),
            marker: marker.to_string(),
        })
    }

    fn note(&self, note_type: &str, msg: &str) -> Result<()> {
        let mut inner = self.open()?;
        inner.terminate_stream()?;
        writeln!(
            inner.f,
            "<div class=\"{note_type}\">\n{}\n</div>",
            escape(msg.as_bytes())
        )?;
        Ok(())
    }

    pub fn error(&self, msg: &str) -> Result<()> {
        self.note("error", msg)
    }

    /// Log an error together with the backtrace of the caller.
    pub fn exception(&self, err: &dyn Display) -> Result<()> {
        let backtrace = Backtrace::force_capture();
        self.note("error", &format!("{err}\n{backtrace}"))
    }

    pub fn warning(&self, msg: &str) -> Result<()> {
        self.note("warning", msg)
    }

    pub fn info(&self, msg: &str) -> Result<()> {
        self.note("info", msg)
    }

    pub fn action(&self, msg: &str) -> Result<()> {
        self.note("action", msg)
    }

    pub fn status_pass(&self, msg: &str) -> Result<()> {
        self.note("status-pass", msg)
    }

    pub fn status_skipped(&self, msg: &str) -> Result<()> {
        self.note("status-skipped", msg)
    }

    pub fn status_fail(&self, msg: &str) -> Result<()> {
        self.note("status-fail", msg)
    }

    /// Write the current time and the time elapsed since the previous
    /// timestamp.
    pub fn timestamp(&self) -> Result<()> {
        let now = Local::now();
        let delta = {
            let mut inner = self.open()?;
            let delta = now - inner.last_timestamp;
            inner.last_timestamp = now;
            delta
        };
        let secs = delta.num_milliseconds() as f64 / 1000.0;
        self.note(
            "timestamp",
            &format!("Time: {} (+{secs:.3}s)", now.format("%Y/%m/%d %H:%M:%S%.3f")),
        )
    }

    pub fn get_stream(&self, name: &str, chained_file: Option<ChainedFile>) -> LogStream {
        LogStream {
            logfile: self.clone(),
            name: name.to_string(),
            chained_file,
        }
    }

    pub fn get_runner(&self, name: &str, chained_file: Option<ChainedFile>) -> RunAndLog {
        RunAndLog {
            logfile: self.clone(),
            name: name.to_string(),
            chained_file,
        }
    }

    fn write(&self, stream: &str, data: &[u8], kind: WriteKind) -> Result<()> {
        let mut inner = self.open()?;
        if inner.last_stream.as_deref() != Some(stream) {
            inner.terminate_stream()?;
            let name = escape(stream.as_bytes());
            write!(
                inner.f,
                "<div class=\"stream\" id=\"{name}\">\n<div class=\"stream-header\" id=\"{name}\">Stream: {name}</div>\n<pre>"
            )?;
        }
        let data = escape(data);
        match kind {
            WriteKind::Normal => inner.f.write_all(data.as_bytes())?,
            WriteKind::Implicit => write!(inner.f, "<span class=\"implicit\">{data}</span>")?,
            WriteKind::Tx => write!(inner.f, "<span class=\"tx\">{data}</span>")?,
        }
        inner.last_stream = Some(stream.to_string());
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.closed {
            inner.f.flush()?;
        }
        Ok(())
    }
}

impl LogfileInner {
    fn terminate_stream(&mut self) -> Result<()> {
        self.cur_evt += 1;
        let Some(name) = self.last_stream.take() else {
            return Ok(());
        };
        let name = escape(name.as_bytes());
        write!(
            self.f,
            "</pre>\n<div class=\"stream-trailer\" id=\"{name}\">End stream: {name}</div>\n</div>\n"
        )?;
        Ok(())
    }
}

/// Escape raw bytes for inclusion in the HTML document.
///
/// Carriage returns are dropped, other control characters and non-ASCII bytes
/// are shown as `%xx`.
fn escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\r' => {}
            b'\t' | b'\n' => out.push(b as char),
            b'%' | 0..=31 | 127..=255 => out.push_str(&format!("%{b:02x}")),
            b'&' => out.push_str("&amp;"),
            b'<' => out.push_str("&lt;"),
            b'>' => out.push_str("&gt;"),
            b'"' => out.push_str("&quot;"),
            _ => out.push(b as char),
        }
    }
    out
}

/// Guard returned by [`Logfile::section`].
pub struct Section {
    log: Logfile,
    marker: String,
}

impl Drop for Section {
    fn drop(&mut self) {
        if self.log.is_closed() {
            return;
        }
        if let Err(err) = self.log.end_section(&self.marker) {
            log::error!("failed to end log section '{}': {err}", self.marker);
        }
    }
}

/// A named stream of raw data within the log, optionally mirrored to another
/// writer.
#[derive(Clone)]
pub struct LogStream {
    logfile: Logfile,
    name: String,
    chained_file: Option<ChainedFile>,
}

impl LogStream {
    pub fn logfile(&self) -> &Logfile {
        &self.logfile
    }

    fn write_kind(&mut self, data: &[u8], kind: WriteKind) -> Result<()> {
        self.logfile.write(&self.name, data, kind)?;
        if let Some(chained) = &self.chained_file {
            if kind != WriteKind::Tx {
                chained
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write_all(data)?;
            }
        }
        Ok(())
    }

    /// Write text the DUT did not send at this point, such as the prompt
    /// shown again at the start of a new log block.
    pub fn write_implicit(&mut self, data: &[u8]) -> Result<()> {
        self.write_kind(data, WriteKind::Implicit)
    }

    /// Record bytes transmitted to the DUT.
    pub fn write_tx(&mut self, data: &[u8]) -> Result<()> {
        self.write_kind(data, WriteKind::Tx)
    }
}

impl Write for LogStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_kind(buf, WriteKind::Normal)
            .map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.logfile.flush().map_err(std::io::Error::other)?;
        if let Some(chained) = &self.chained_file {
            chained
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .flush()?;
        }
        Ok(())
    }
}

/// Runs external programs and logs their command line and output.
pub struct RunAndLog {
    logfile: Logfile,
    name: String,
    chained_file: Option<ChainedFile>,
}

impl RunAndLog {
    /// Run `cmd` to completion, logging stdout and stderr.
    ///
    /// Returns the combined output, or [`ConsoleError::ExternalCommand`] if
    /// the program exits with a non-zero status.
    pub fn run(&self, cmd: &mut Command) -> Result<String> {
        self.run_with_stdin(cmd, None)
    }

    /// As [`RunAndLog::run`], feeding `input` to the program's stdin.
    pub fn run_with_stdin(&self, cmd: &mut Command, input: Option<&[u8]>) -> Result<String> {
        let cmdline = command_line(cmd);
        let msg = format!("+{cmdline}\n");
        self.logfile
            .write(&self.name, msg.as_bytes(), WriteKind::Normal)?;
        self.chain(msg.as_bytes())?;

        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        // Fed from its own thread so a child filling its stdout pipe cannot
        // stall the write.
        let writer = match (input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let input = input.to_vec();
                Some(thread::spawn(move || stdin.write_all(&input)))
            }
            _ => None,
        };
        let output = child.wait_with_output()?;
        if let Some(Ok(written)) = writer.map(JoinHandle::join) {
            written?;
        }

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        self.logfile.timestamp()?;
        self.logfile
            .write(&self.name, &combined, WriteKind::Normal)?;
        let text = String::from_utf8_lossy(&combined).into_owned();
        if !output.status.success() {
            self.chain(&combined)?;
            return Err(ConsoleError::ExternalCommand {
                command: cmdline,
                status: output.status,
                output: text,
            });
        }
        Ok(text)
    }

    fn chain(&self, data: &[u8]) -> Result<()> {
        if let Some(chained) = &self.chained_file {
            chained
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(data)?;
        }
        Ok(())
    }
}

/// Render a command as a shell-like line for logs and error messages.
pub fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
