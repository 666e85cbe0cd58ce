//! Process-wide diagnostics destination.
//!
//! Every component logs through `tracing`; the fmt layer installed by
//! [`init`] hands each formatted event to the [`DiagnosticsSink`], which
//! writes it whole to the current destination. Swapping the destination
//! and writing an event take the same lock, so an event never lands
//! half in one file and half in another.

use crate::{DeviceError, ManagerConfig};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const FALLBACK_CAPACITY: usize = 64;

static SINK: OnceLock<DiagnosticsSink> = OnceLock::new();

/// The process-wide sink, created on first use with stderr as destination.
pub fn sink() -> &'static DiagnosticsSink {
    SINK.get_or_init(DiagnosticsSink::new)
}

/// Install the tracing subscriber and apply the configured log file.
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init(config: &ManagerConfig) -> Result<(), DeviceError> {
    let sink = sink();
    if let Some(path) = &config.log_file {
        sink.configure(path)?;
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter).map_err(|e| {
            DeviceError::Configuration(format!("invalid log filter '{}': {}", config.log_filter, e))
        })?,
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(SinkMakeWriter::global())
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(destination = ?sink.destination(), "diagnostics initialized");
    }

    Ok(())
}

#[derive(Debug)]
enum Destination {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Recorded when a write to the destination failed.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackEntry {
    pub timestamp: DateTime<Local>,
    pub destination: Option<PathBuf>,
    pub error: String,
}

#[derive(Debug)]
pub struct DiagnosticsSink {
    destination: Mutex<Destination>,
    fallback: Mutex<VecDeque<FallbackEntry>>,
    failing: AtomicBool,
}

impl Default for DiagnosticsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsSink {
    pub fn new() -> Self {
        Self {
            destination: Mutex::new(Destination::Stderr),
            fallback: Mutex::new(VecDeque::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Send subsequent events to `path`, created if absent and appended
    /// to if present. A file that cannot be opened is reported and the
    /// previous destination stays active.
    pub fn configure(&self, path: &Path) -> Result<(), DeviceError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let previous = {
            let mut destination = self.lock_destination();
            std::mem::replace(
                &mut *destination,
                Destination::File {
                    path: path.to_path_buf(),
                    file,
                },
            )
        };
        self.failing.store(false, Ordering::Release);

        if let Destination::File { file, .. } = previous {
            let _ = file.sync_all();
        }
        tracing::info!(log_file = %path.display(), "diagnostics destination changed");
        Ok(())
    }

    pub fn reset_to_stderr(&self) {
        *self.lock_destination() = Destination::Stderr;
        self.failing.store(false, Ordering::Release);
    }

    /// `None` while writing to stderr.
    pub fn destination(&self) -> Option<PathBuf> {
        match &*self.lock_destination() {
            Destination::Stderr => None,
            Destination::File { path, .. } => Some(path.clone()),
        }
    }

    /// Write one formatted event. Never fails: a broken destination is
    /// noted once in the fallback and the event is dropped.
    pub fn emit(&self, event: &[u8]) {
        let mut destination = self.lock_destination();
        let (written, path) = match &mut *destination {
            Destination::Stderr => (io::stderr().lock().write_all(event), None),
            Destination::File { path, file } => (file.write_all(event), Some(path.clone())),
        };
        drop(destination);

        match written {
            Ok(()) => self.failing.store(false, Ordering::Release),
            Err(err) => {
                if !self.failing.swap(true, Ordering::AcqRel) {
                    self.record_failure(path, err);
                }
            }
        }
    }

    pub fn fallback_entries(&self) -> Vec<FallbackEntry> {
        self.fallback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn record_failure(&self, destination: Option<PathBuf>, err: io::Error) {
        let mut fallback = self
            .fallback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fallback.len() == FALLBACK_CAPACITY {
            fallback.pop_front();
        }
        fallback.push_back(FallbackEntry {
            timestamp: Local::now(),
            destination,
            error: err.to_string(),
        });
    }

    fn lock_destination(&self) -> MutexGuard<'_, Destination> {
        self.destination
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Buffers one event and hands it to the sink when dropped.
pub struct SinkWriter {
    sink: &'static DiagnosticsSink,
    buffer: Vec<u8>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            self.sink.emit(&self.buffer);
        }
    }
}

#[derive(Clone, Copy)]
pub struct SinkMakeWriter {
    sink: &'static DiagnosticsSink,
}

impl SinkMakeWriter {
    pub fn global() -> Self {
        Self { sink: sink() }
    }
}

impl<'a> MakeWriter<'a> for SinkMakeWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sink: self.sink,
            buffer: Vec::with_capacity(256),
        }
    }
}
