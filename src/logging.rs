use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Set to `1` to include debug lines.
const DEBUG_ENV: &str = "PEERCALL_DEBUG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Opens (and truncates) the process log. Later calls keep the first file.
pub fn init_log_file(path: &Path) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let debug = std::env::var(DEBUG_ENV).ok().as_deref() == Some("1");
    let _ = LOGGER.set(Logger::open(path, true, debug)?);
    Ok(())
}

pub fn info(msg: impl AsRef<str>) {
    emit(Level::Info, msg.as_ref(), &[]);
}

pub fn warn(msg: impl AsRef<str>) {
    emit(Level::Warn, msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    emit(Level::Error, msg.as_ref(), &[]);
}

pub fn debug(msg: impl AsRef<str>) {
    emit(Level::Debug, msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, kv: &[(&str, &str)]) {
    emit(Level::Info, msg, kv);
}

fn emit(level: Level, msg: &str, kv: &[(&str, &str)]) {
    if let Some(logger) = LOGGER.get() {
        logger.write(level, msg, kv);
    }
}

struct Logger {
    file: Mutex<File>,
    stdout: bool,
    debug: bool,
}

impl Logger {
    fn open(path: &Path, stdout: bool, debug: bool) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("open log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            stdout,
            debug,
        })
    }

    fn write(&self, level: Level, msg: &str, kv: &[(&str, &str)]) {
        if level == Level::Debug && !self.debug {
            return;
        }
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(file_line(&ts, level, msg, kv).as_bytes());
        }
        if self.stdout {
            let _ = std::io::stdout().write_all(console_line(&ts, level, msg, kv).as_bytes());
        }
    }
}

/// `time=.. level=.. msg=".." k=v ...`; values with spaces or quotes are quoted.
fn file_line(ts: &str, level: Level, msg: &str, kv: &[(&str, &str)]) -> String {
    let mut line = format!("time={ts} level={} msg={}", level.as_str(), quoted(msg));
    for (k, v) in kv {
        let _ = write!(line, " {k}={}", slog_value(v));
    }
    line.push('\n');
    line
}

fn console_line(ts: &str, level: Level, msg: &str, kv: &[(&str, &str)]) -> String {
    let mut line = format!("{ts} {:<5} {msg}", level.as_str());
    for (k, v) in kv {
        let _ = write!(line, " {k}={v}");
    }
    line.push('\n');
    line
}

fn slog_value(v: &str) -> String {
    if v.is_empty() || v.contains(|c: char| c.is_whitespace() || c == '"' || c == '=') {
        quoted(v)
    } else {
        v.to_string()
    }
}

fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
