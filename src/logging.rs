//! Keeps the most recent log lines in memory so the settings page can show
//! them without shell access to the host.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing_subscriber::{EnvFilter, fmt::writer::MakeWriter};

const DEFAULT_CAPACITY: usize = 500;

static RECENT_LOGS: OnceLock<RecentLogs> = OnceLock::new();

#[derive(Clone)]
pub struct RecentLogs {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl RecentLogs {
    fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn record(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        for raw in text.lines() {
            let line = strip_csi(raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
    }

    pub fn tail(&self, limit: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }
}

pub fn recent_logs() -> Option<RecentLogs> {
    RECENT_LOGS.get().cloned()
}

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`),
/// compact output on stderr, mirrored into [`RecentLogs`].
pub fn init(capacity: usize) {
    let logs = RECENT_LOGS.get_or_init(|| RecentLogs::new(capacity)).clone();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .with_writer(MirrorMakeWriter { logs })
        .init();
}

#[derive(Clone)]
struct MirrorMakeWriter {
    logs: RecentLogs,
}

struct MirrorWriter {
    logs: RecentLogs,
    stderr: io::Stderr,
}

impl<'a> MakeWriter<'a> for MirrorMakeWriter {
    type Writer = MirrorWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MirrorWriter {
            logs: self.logs.clone(),
            stderr: io::stderr(),
        }
    }
}

impl Write for MirrorWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.stderr.write(buf)?;
        self.logs.record(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stderr.flush()
    }
}

/// Removes `ESC [ ... <final byte>` colour sequences and other control
/// characters except tabs.
fn strip_csi(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for terminal in chars.by_ref() {
                    if ('@'..='~').contains(&terminal) {
                        break;
                    }
                }
            }
            continue;
        }
        if !c.is_control() || c == '\t' {
            output.push(c);
        }
    }
    output
}
