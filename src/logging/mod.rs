//! Dual-channel structured logging.
//!
//! Every entry is always appended to the durable sink; it additionally
//! reaches the user-facing console only if its level meets the configured
//! minimum and it survives the noise filter. A small rewrite table shortens
//! recognizable technical messages for display. Verbose mode shows
//! everything, raw.
//!
//! The logger is shared (`Arc<Logger>`) between the detector, migrator and
//! lifecycle manager, and between the concurrent subprocess stream readers;
//! one mutex guards the recent-entry buffer and the rewritable progress
//! line, so interleaved writers are serialized.

mod filter;
mod stream;

pub use filter::{NoiseFilter, RewriteRules};
pub use stream::StreamTasks;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Lines of recent history kept in memory for status rendering.
const RECENT_BUFFER_LINES: usize = 1000;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Transient single-line status, redrawn in place.
    Progress,
}

impl LogLevel {
    /// Rank used for minimum-level comparison. Progress redraws rank like
    /// Info: hidden in quiet modes, shown by default.
    fn rank(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info | LogLevel::Progress => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
        }
    }
}

/// One structured log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Component tag: "detect", "migrate", "compose", ...
    pub source: String,
    /// Whether the entry was shown to the user, decided at write time.
    pub user_visible: bool,
}

/// Durable destination for every entry, filtered or not.
///
/// Implementations must never fail loudly — logging is not allowed to be
/// the reason an operation fails.
pub trait DurableSink: Send + Sync {
    fn append(&self, entry: &LogEntry);
}

/// Appends JSON lines to a log file. Open and write failures are swallowed.
pub struct FileSink {
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new().create(true).append(true).open(path).ok();
        Self {
            file: Mutex::new(file),
        }
    }
}

impl DurableSink for FileSink {
    fn append(&self, entry: &LogEntry) {
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            if let Ok(json) = serde_json::to_string(entry) {
                let _ = writeln!(file, "{}", json);
            }
        }
    }
}

/// In-memory durable sink, for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }
}

impl DurableSink for MemorySink {
    fn append(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

/// User-facing channel.
///
/// The calling layer picks the implementation: a real terminal, a silent
/// console under a TUI, or a capture buffer in tests.
pub trait UserConsole: Send + Sync {
    /// A finished line at the given level.
    fn line(&self, level: LogLevel, message: &str);

    /// Redraw the transient progress line in place.
    fn progress(&self, message: &str);

    /// Terminate the progress line with a final message.
    fn progress_done(&self, message: &str);

    /// Break out of an active progress line before printing regular lines.
    fn progress_break(&self);
}

/// Writes to the controlling terminal with carriage-return progress redraw.
pub struct TerminalConsole;

impl UserConsole for TerminalConsole {
    fn line(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => eprintln!("\x1b[31m{}\x1b[0m", message),
            LogLevel::Warning => eprintln!("\x1b[33m{}\x1b[0m", message),
            _ => println!("{}", message),
        }
    }

    fn progress(&self, message: &str) {
        print!("\r\x1b[2K{}", message);
        let _ = std::io::stdout().flush();
    }

    fn progress_done(&self, message: &str) {
        println!("\r\x1b[2K{}", message);
    }

    fn progress_break(&self) {
        println!();
    }
}

/// Suppresses all user-facing output (TUI mode renders its own UI).
pub struct SilentConsole;

impl UserConsole for SilentConsole {
    fn line(&self, _level: LogLevel, _message: &str) {}
    fn progress(&self, _message: &str) {}
    fn progress_done(&self, _message: &str) {}
    fn progress_break(&self) {}
}

/// Captures user-facing lines for assertions.
#[derive(Default)]
pub struct MemoryConsole {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().clone()
    }
}

impl UserConsole for MemoryConsole {
    fn line(&self, level: LogLevel, message: &str) {
        self.lines.lock().push((level, message.to_string()));
    }

    fn progress(&self, message: &str) {
        self.lines
            .lock()
            .push((LogLevel::Progress, message.to_string()));
    }

    fn progress_done(&self, message: &str) {
        self.lines
            .lock()
            .push((LogLevel::Progress, message.to_string()));
    }

    fn progress_break(&self) {}
}

struct LoggerState {
    recent: VecDeque<LogEntry>,
    progress_active: bool,
}

/// The engine's logger. Shared as `Arc<Logger>`.
pub struct Logger {
    durable: Box<dyn DurableSink>,
    console: Box<dyn UserConsole>,
    noise: NoiseFilter,
    rewrites: RewriteRules,
    min_level: LogLevel,
    verbose: bool,
    state: Mutex<LoggerState>,
}

impl Logger {
    /// Standard logger: JSON-lines file sink plus terminal console.
    pub fn new(log_file: &Path, verbose: bool) -> Self {
        Self::with_sinks(
            Box::new(FileSink::open(log_file)),
            Box::new(TerminalConsole),
            verbose,
        )
    }

    /// Logger over custom sinks, used by tests and by callers embedding the
    /// engine under their own UI.
    pub fn with_sinks(
        durable: Box<dyn DurableSink>,
        console: Box<dyn UserConsole>,
        verbose: bool,
    ) -> Self {
        Self {
            durable,
            console,
            noise: NoiseFilter::default(),
            rewrites: RewriteRules::default(),
            // Verbose shows everything, down to debug.
            min_level: if verbose {
                LogLevel::Debug
            } else {
                LogLevel::Info
            },
            verbose,
            state: Mutex::new(LoggerState {
                recent: VecDeque::new(),
                progress_active: false,
            }),
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Write one entry to both channels according to the filtering rules.
    pub fn log(&self, level: LogLevel, source: &str, message: &str) {
        let meets_minimum = level.rank() >= self.min_level.rank();
        let user_visible = if self.verbose {
            true
        } else {
            meets_minimum && !self.noise.is_noise(message)
        };

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            source: source.to_string(),
            user_visible,
        };

        let mut state = self.state.lock();
        self.durable.append(&entry);
        state.recent.push_back(entry);
        if state.recent.len() > RECENT_BUFFER_LINES {
            state.recent.pop_front();
        }

        if user_visible {
            if state.progress_active {
                self.console.progress_break();
                state.progress_active = false;
            }
            let display = if self.verbose {
                message.to_string()
            } else {
                self.rewrites.apply(message)
            };
            self.console.line(level, &display);
        }
    }

    pub fn debug(&self, source: &str, message: &str) {
        self.log(LogLevel::Debug, source, message);
    }

    pub fn info(&self, source: &str, message: &str) {
        self.log(LogLevel::Info, source, message);
    }

    pub fn warning(&self, source: &str, message: &str) {
        self.log(LogLevel::Warning, source, message);
    }

    pub fn error(&self, source: &str, message: &str) {
        self.log(LogLevel::Error, source, message);
    }

    /// Redraw the single transient status line.
    pub fn progress(&self, source: &str, message: &str) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Progress,
            message: message.to_string(),
            source: source.to_string(),
            user_visible: true,
        };
        let mut state = self.state.lock();
        self.durable.append(&entry);
        state.recent.push_back(entry);
        if state.recent.len() > RECENT_BUFFER_LINES {
            state.recent.pop_front();
        }
        self.console.progress(message);
        state.progress_active = true;
    }

    /// Terminate the progress line and return to line-based output.
    pub fn progress_done(&self, source: &str, message: &str) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Progress,
            message: message.to_string(),
            source: source.to_string(),
            user_visible: true,
        };
        let mut state = self.state.lock();
        self.durable.append(&entry);
        state.recent.push_back(entry);
        if state.recent.len() > RECENT_BUFFER_LINES {
            state.recent.pop_front();
        }
        self.console.progress_done(message);
        state.progress_active = false;
    }

    /// The most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let state = self.state.lock();
        state
            .recent
            .iter()
            .rev()
            .take(n)
            .rev()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn capture_logger(verbose: bool) -> (Arc<Logger>, Arc<MemorySink>, Arc<MemoryConsole>) {
        // The sinks are shared out-of-band so tests can inspect them after
        // handing ownership to the logger.
        struct Tee(Arc<MemorySink>);
        impl DurableSink for Tee {
            fn append(&self, entry: &LogEntry) {
                self.0.append(entry);
            }
        }
        struct TeeConsole(Arc<MemoryConsole>);
        impl UserConsole for TeeConsole {
            fn line(&self, level: LogLevel, message: &str) {
                self.0.line(level, message);
            }
            fn progress(&self, message: &str) {
                self.0.progress(message);
            }
            fn progress_done(&self, message: &str) {
                self.0.progress_done(message);
            }
            fn progress_break(&self) {}
        }

        let sink = Arc::new(MemorySink::new());
        let console = Arc::new(MemoryConsole::new());
        let logger = Arc::new(Logger::with_sinks(
            Box::new(Tee(sink.clone())),
            Box::new(TeeConsole(console.clone())),
            verbose,
        ));
        (logger, sink, console)
    }

    #[test]
    fn noise_reaches_durable_sink_but_not_console() {
        let (logger, sink, console) = capture_logger(false);
        logger.info("compose", "a3ed95caeb02: Downloading [==>] 5MB/12MB");

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].user_visible);
        assert!(console.lines().is_empty());
    }

    #[test]
    fn debug_hidden_below_minimum_but_persisted() {
        let (logger, sink, console) = capture_logger(false);
        logger.debug("detect", "probing port 8443");

        assert_eq!(sink.entries().len(), 1);
        assert!(console.lines().is_empty());
    }

    #[test]
    fn verbose_shows_noise_and_debug_untransformed() {
        let (logger, _sink, console) = capture_logger(true);
        logger.debug("detect", "probing port 8443");
        logger.info("compose", "Container deckhand-code  Started");

        let lines = console.lines();
        assert_eq!(lines.len(), 2);
        // No rewrite in verbose mode.
        assert_eq!(lines[1].1, "Container deckhand-code  Started");
    }

    #[test]
    fn rewrite_applies_on_user_channel_only() {
        let (logger, sink, console) = capture_logger(false);
        logger.info("compose", "Container deckhand-code  Started");

        assert_eq!(console.lines()[0].1, "Starting deckhand-code");
        // Durable sink keeps the original message.
        assert_eq!(sink.entries()[0].message, "Container deckhand-code  Started");
    }

    #[test]
    fn recent_buffer_returns_tail() {
        let (logger, _sink, _console) = capture_logger(false);
        for i in 0..20 {
            logger.info("test", &format!("line {}", i));
        }
        let tail = logger.recent(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[2].message, "line 19");
    }

    #[test]
    fn errors_always_visible() {
        let (logger, _sink, console) = capture_logger(false);
        logger.error("migrate", "backup failed: disk full");
        assert_eq!(console.lines().len(), 1);
    }
}
