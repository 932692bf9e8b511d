// src/logging.rs
//
// Result sinks for training and evaluation.
// - ScalarSink: trait used by the trainer for per-epoch scalars
// - NoopScalarSink: discards all scalars
// - JsonlScalarSink: one `{"tag","step","value"}` object per line
// - ResultsLog: append-only human-readable results file
//
// The JSONL sink never aborts training: an I/O failure disables it, keeps the
// cause and prints one `[sink]` warning on stderr.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Abstract sink for scalar summaries.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, step: u64, value: f64);

    fn flush(&mut self) {}
}

/// Sink that discards all scalars.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScalarSink;

impl ScalarSink for NoopScalarSink {
    fn add_scalar(&mut self, _tag: &str, _step: u64, _value: f64) {
        // intentionally no-op
    }
}

#[derive(Debug, Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    step: u64,
    value: f64,
}

/// JSONL scalar sink. The file is opened lazily in append mode and parent
/// directories are created on first write.
#[derive(Debug)]
pub struct JsonlScalarSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    disabled: Option<String>,
}

impl JsonlScalarSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            disabled: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled.is_none()
    }

    /// Why the sink stopped writing, if it did.
    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled.as_deref()
    }

    fn disable(&mut self, reason: String) {
        eprintln!(
            "[sink] WARN scalars for {} are no longer written: {reason}",
            self.path.display()
        );
        self.writer = None;
        self.disabled = Some(reason);
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if self.disabled.is_some() {
            return None;
        }

        if self.writer.is_none() {
            let dir_error = self.path.parent().and_then(|parent| {
                std::fs::create_dir_all(parent)
                    .err()
                    .map(|e| format!("cannot create {}: {e}", parent.display()))
            });
            if let Some(reason) = dir_error {
                self.disable(reason);
                return None;
            }

            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(file) => self.writer = Some(BufWriter::new(file)),
                Err(e) => {
                    self.disable(format!("cannot open: {e}"));
                    return None;
                }
            }
        }

        self.writer.as_mut()
    }
}

impl ScalarSink for JsonlScalarSink {
    fn add_scalar(&mut self, tag: &str, step: u64, value: f64) {
        let line = match serde_json::to_string(&ScalarRecord { tag, step, value }) {
            Ok(line) => line,
            Err(e) => {
                self.disable(format!("cannot encode {tag}: {e}"));
                return;
            }
        };
        let Some(writer) = self.ensure_writer() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{}", line) {
            self.disable(format!("write failed: {e}"));
        }
    }

    fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                self.disable(format!("flush failed: {e}"));
            }
        }
    }
}

impl Drop for JsonlScalarSink {
    fn drop(&mut self) {
        ScalarSink::flush(self);
    }
}

/// Append-only text log of per-epoch and per-iteration results.
#[derive(Debug, Clone)]
pub struct ResultsLog {
    path: PathBuf,
}

impl ResultsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line.
    pub fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create results dir: {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open results log: {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("Failed to append to results log: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs/iter_0/scalars.jsonl");
        {
            let mut sink = JsonlScalarSink::new(&path);
            sink.add_scalar("Running_loss", 0, 1.5);
            sink.add_scalar("Train_error", 0, 0.25);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["tag"], "Running_loss");
        assert_eq!(lines[1]["value"], 0.25);
    }

    #[test]
    fn jsonl_sink_disables_itself_on_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a file.
        let mut sink = JsonlScalarSink::new(dir.path());
        sink.add_scalar("x", 0, 1.0);
        assert!(!sink.is_enabled());
        assert!(sink.disabled_reason().unwrap().starts_with("cannot open"));
    }

    #[test]
    fn jsonl_sink_reports_uncreatable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("runs");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut sink = JsonlScalarSink::new(blocker.join("iteration_0/scalars.jsonl"));
        sink.add_scalar("Reward", 0, 1.0);
        assert!(!sink.is_enabled());
        assert!(sink.disabled_reason().unwrap().starts_with("cannot create"));
        // Later scalars are dropped without retrying.
        sink.add_scalar("Reward", 1, 2.0);
        assert!(!blocker.join("iteration_0").exists());
    }

    #[test]
    fn results_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResultsLog::new(dir.path().join("results/run_results.txt"));
        log.append("first").unwrap();
        log.append("second").unwrap();
        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(text, "first\nsecond\n");
    }
}
