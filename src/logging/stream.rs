//! Live filtering of subprocess output streams.
//!
//! Compose pull/up output arrives on two streams at once. Each stream gets
//! its own reader task; both classify lines and write through the shared
//! [`Logger`](super::Logger), so ordering between streams is unspecified but
//! writes never race. Per-layer pull chatter is coalesced into a single
//! rewritable counter instead of one line per layer.

use super::Logger;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use regex::Regex;

/// How one line of subprocess output should be surfaced.
#[derive(Debug, PartialEq, Eq)]
enum LineClass {
    /// Per-layer pull progress; the captured id keys the coalescing set.
    PullLayer(String),
    /// Marker that an image finished pulling.
    PullDone,
    /// Container create/start/stop lines, always surfaced.
    Lifecycle,
    ErrorLine,
    WarningLine,
    Other,
}

fn pull_layer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?P<layer>[0-9a-f]{10,64}):\s+(pulling fs layer|downloading|verifying checksum|download complete|extracting|pull complete|waiting|already exists)",
        )
        .expect("static regex pattern is valid")
    })
}

fn pull_done_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(^\s*\S+\s+Pulled\b|^Status:\s+(downloaded newer image|image is up to date))")
            .expect("static regex pattern is valid")
    })
}

fn lifecycle_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*Container\s+\S+\s+(creating|created|starting|started|stopping|stopped|removing|removed|running|healthy)")
            .expect("static regex pattern is valid")
    })
}

fn classify(line: &str) -> LineClass {
    if let Some(captures) = pull_layer_regex().captures(line) {
        return LineClass::PullLayer(captures["layer"].to_string());
    }
    if pull_done_regex().is_match(line) {
        return LineClass::PullDone;
    }
    if lifecycle_regex().is_match(line) {
        return LineClass::Lifecycle;
    }
    let lower = line.to_lowercase();
    if lower.contains("error") || lower.contains("failed") {
        return LineClass::ErrorLine;
    }
    if lower.contains("warning") {
        return LineClass::WarningLine;
    }
    LineClass::Other
}

/// Shared pull-coalescing state between the two stream readers.
#[derive(Default)]
struct PullCounter {
    layers: HashSet<String>,
    active: bool,
}

/// Handles to the reader tasks draining one subprocess's output.
///
/// Await [`StreamTasks::join`] after the child exits so trailing lines are
/// flushed; dropping unjoined aborts the readers.
pub struct StreamTasks {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<Notify>,
    joined: AtomicBool,
}

impl StreamTasks {
    /// Wait for both readers to drain their streams to EOF.
    pub async fn join(mut self) {
        self.joined.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Drop for StreamTasks {
    fn drop(&mut self) {
        if !self.joined.load(Ordering::Relaxed) {
            self.shutdown.notify_waiters();
            for handle in self.handles.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Logger {
    /// Spawn reader tasks that classify and relay a child's stdout/stderr
    /// through this logger.
    pub fn filter_child_streams(
        self: &Arc<Self>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        source: &str,
    ) -> StreamTasks {
        let shutdown = Arc::new(Notify::new());
        let counter = Arc::new(Mutex::new(PullCounter::default()));
        let mut handles = Vec::new();

        if let Some(stdout) = stdout {
            handles.push(spawn_reader(
                BufReader::new(stdout),
                self.clone(),
                counter.clone(),
                shutdown.clone(),
                source.to_string(),
            ));
        }
        if let Some(stderr) = stderr {
            handles.push(spawn_reader(
                BufReader::new(stderr),
                self.clone(),
                counter.clone(),
                shutdown.clone(),
                source.to_string(),
            ));
        }

        StreamTasks {
            handles,
            shutdown,
            joined: AtomicBool::new(false),
        }
    }
}

fn spawn_reader<R>(
    reader: BufReader<R>,
    logger: Arc<Logger>,
    counter: Arc<Mutex<PullCounter>>,
    shutdown: Arc<Notify>,
    source: String,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => relay_line(&logger, &counter, &source, &line),
                        _ => break,
                    }
                }
            }
        }
    })
}

fn relay_line(logger: &Logger, counter: &Mutex<PullCounter>, source: &str, line: &str) {
    match classify(line) {
        LineClass::PullLayer(layer) => {
            // The raw line still lands in the durable sink at debug level.
            logger.debug(source, line);
            let seen = {
                let mut counter = counter.lock();
                counter.layers.insert(layer);
                counter.active = true;
                counter.layers.len()
            };
            logger.progress(source, &format!("Pulling image layers ({} seen)", seen));
        }
        LineClass::PullDone => {
            logger.debug(source, line);
            let finished = {
                let mut counter = counter.lock();
                let was_active = counter.active;
                counter.active = false;
                was_active.then_some(counter.layers.len())
            };
            if let Some(layers) = finished {
                logger.progress_done(source, &format!("Images pulled ({} layers)", layers));
            }
        }
        LineClass::Lifecycle => logger.info(source, line),
        LineClass::ErrorLine => logger.error(source, line),
        LineClass::WarningLine => logger.warning(source, line),
        LineClass::Other => logger.debug(source, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_pull_layers() {
        assert_eq!(
            classify("a3ed95caeb02: Pulling fs layer"),
            LineClass::PullLayer("a3ed95caeb02".to_string())
        );
        assert_eq!(
            classify("f1b5933fe4b5: Downloading [=====>  ]  10MB/17MB"),
            LineClass::PullLayer("f1b5933fe4b5".to_string())
        );
    }

    #[test]
    fn classifies_completion_markers() {
        assert_eq!(classify("code Pulled"), LineClass::PullDone);
        assert_eq!(
            classify("Status: Downloaded newer image for tailscale/tailscale:latest"),
            LineClass::PullDone
        );
        assert_eq!(
            classify("Status: Image is up to date for codercom/code-server:latest"),
            LineClass::PullDone
        );
    }

    #[test]
    fn classifies_lifecycle_and_severity() {
        assert_eq!(
            classify("Container deckhand-code  Started"),
            LineClass::Lifecycle
        );
        assert_eq!(
            classify("error: port 8443 already allocated"),
            LineClass::ErrorLine
        );
        assert_eq!(
            classify("WARNING: no swap limit support"),
            LineClass::WarningLine
        );
        assert_eq!(classify("some unrelated chatter"), LineClass::Other);
    }

    #[tokio::test]
    async fn readers_coalesce_layers_into_one_counter() {
        use crate::logging::{LogLevel, MemoryConsole, MemorySink, UserConsole};

        struct Tee(Arc<MemoryConsole>);
        impl UserConsole for Tee {
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

        let console = Arc::new(MemoryConsole::new());
        let logger = Arc::new(Logger::with_sinks(
            Box::new(MemorySink::new()),
            Box::new(Tee(console.clone())),
            false,
        ));
        let counter = Mutex::new(PullCounter::default());

        relay_line(&logger, &counter, "compose", "aaaaaaaaaaaa: Pulling fs layer");
        relay_line(&logger, &counter, "compose", "bbbbbbbbbbbb: Downloading 1MB/2MB");
        relay_line(&logger, &counter, "compose", "aaaaaaaaaaaa: Pull complete");
        relay_line(&logger, &counter, "compose", "code Pulled");

        let lines = console.lines();
        // Three progress redraws (layer a, layer b, layer a again) plus the
        // final completion line; distinct layers counted once.
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1].1, "Pulling image layers (2 seen)");
        assert_eq!(lines[2].1, "Pulling image layers (2 seen)");
        assert_eq!(lines[3].1, "Images pulled (2 layers)");
    }

    #[tokio::test]
    async fn second_pull_done_marker_is_quiet() {
        let logger = Arc::new(Logger::with_sinks(
            Box::new(crate::logging::MemorySink::new()),
            Box::new(crate::logging::SilentConsole),
            false,
        ));
        let counter = Mutex::new(PullCounter::default());
        relay_line(&logger, &counter, "compose", "cccccccccccc: Extracting 1MB/2MB");
        relay_line(&logger, &counter, "compose", "code Pulled");
        // A trailing status line must not re-trigger the completion message.
        relay_line(&logger, &counter, "compose", "Status: Image is up to date for x");
        assert!(!counter.lock().active);
    }
}
