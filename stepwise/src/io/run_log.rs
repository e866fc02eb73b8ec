//! Execution reports written after a plan run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::core::types::PlanSummary;
use crate::io::detached::ProcessHandle;

/// Everything recorded about one `stepwise run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport<'a> {
    pub plan: PathBuf,
    pub workdir: PathBuf,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub summary: &'a PlanSummary,
    /// Detached processes still tracked when the plan finished.
    pub detached: Vec<ProcessHandle>,
}

impl RunReport<'_> {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Write the report as pretty JSON, creating parent directories.
pub fn write_report(path: &Path, report: &RunReport<'_>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    write_json(path, report)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize report")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write report {}", path.display()))
}
