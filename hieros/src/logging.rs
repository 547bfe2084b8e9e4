// src/logging.rs
//
// Metrics sinks.
// - MetricsSink: trait used by the trainer
// - NoopSink:    discards all records
// - JsonlSink:   one JSON object per line, flushed on every write
// - MemorySink:  keeps records in memory (tests, determinism checks)

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::metrics::MetricsRecord;

/// Abstract sink for per-step metric records.
pub trait MetricsSink: Send {
    fn write(&mut self, record: &MetricsRecord) -> Result<()>;
}

/// Sink that discards all records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn write(&mut self, _record: &MetricsRecord) -> Result<()> {
        Ok(())
    }
}

/// JSONL file sink.
///
/// The file is created (and truncated) on the first write; parent
/// directories are created as needed. Every record is flushed before
/// `write` returns.
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_writer(&mut self) -> Result<&mut BufWriter<File>> {
        let writer = match self.writer.take() {
            Some(w) => w,
            None => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&self.path)?;
                BufWriter::new(file)
            }
        };
        Ok(self.writer.insert(writer))
    }
}

impl MetricsSink for JsonlSink {
    fn write(&mut self, record: &MetricsRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let writer = self.ensure_writer()?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.flush();
        }
    }
}

/// In-memory sink. Clones share the same record buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<MetricsRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricsRecord> {
        match self.records.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsSink for MemorySink {
    fn write(&mut self, record: &MetricsRecord) -> Result<()> {
        match self.records.lock() {
            Ok(mut r) => r.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(step: u64, v: f64) -> MetricsRecord {
        let mut values = BTreeMap::new();
        values.insert("x".to_string(), v);
        MetricsRecord { step, values }
    }

    #[test]
    fn test_jsonl_sink_creates_parent_dirs_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics.jsonl");
        let mut sink = JsonlSink::new(&path);
        sink.write(&record(1, 0.5)).unwrap();
        sink.write(&record(2, 1.5)).unwrap();
        // Readable before the sink is dropped.
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: MetricsRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back, record(2, 1.5));
    }

    #[test]
    fn test_noop_sink_accepts_everything() {
        let mut sink = NoopSink;
        sink.write(&record(0, 0.0)).unwrap();
    }
}
