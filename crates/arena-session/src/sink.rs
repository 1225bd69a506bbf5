use crate::report::SessionReport;
use anyhow::Result;
use arena_core::{atomic_write_json_pretty, ensure_dir, session_host_paths, SessionHostPaths};
use arena_schemas::{validate_value, SESSION_REPORT_SCHEMA};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventRecord {
    pub seq: u64,
    pub ts: String,
    pub session_id: String,
    pub event_type: String,
    pub stage: String,
    pub payload: Value,
}

pub trait SessionSink: Send {
    fn append_event(&mut self, event: &SessionEventRecord) -> Result<()>;
    fn write_report(&mut self, report: &SessionReport) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Writes `events.jsonl` and `report.json` under one session directory.
pub struct JsonlSessionSink {
    paths: SessionHostPaths,
    events_writer: BufWriter<File>,
}

impl JsonlSessionSink {
    pub fn new(session_dir: &Path) -> Result<Self> {
        ensure_dir(session_dir)?;
        let paths = session_host_paths(session_dir);
        let events_writer = open_append(paths.events.clone())?;
        Ok(Self {
            paths,
            events_writer,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.paths.session_dir
    }
}

impl SessionSink for JsonlSessionSink {
    fn append_event(&mut self, event: &SessionEventRecord) -> Result<()> {
        serde_json::to_writer(&mut self.events_writer, event)?;
        self.events_writer.write_all(b"\n")?;
        Ok(())
    }

    fn write_report(&mut self, report: &SessionReport) -> Result<()> {
        let value = serde_json::to_value(report)?;
        validate_value(SESSION_REPORT_SCHEMA, &value)?;
        atomic_write_json_pretty(&self.paths.report, &value)
    }

    fn flush(&mut self) -> Result<()> {
        self.events_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}
