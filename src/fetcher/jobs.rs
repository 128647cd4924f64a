//! Declarative fetch jobs.
//!
//! Jobs are loaded once at process start from a TOML file. A malformed job
//! disables that job only; the rest of the set still runs.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;
use tracing::{info, warn};

use crate::bus::stream_for;
use crate::models::{is_valid_symbol, DataType};

#[derive(Debug, Clone, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 6-field cron expression, seconds first.
    pub schedule: String,
    pub provider: ProviderRef,
    pub params: JobParams,
    #[serde(default)]
    pub output: OutputSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobParams {
    pub symbols: Vec<String>,
    /// Override of the decorator's pacing floor, milliseconds.
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub stream: String,
}

fn default_enabled() -> bool {
    true
}

impl JobSpec {
    /// Target stream: the explicit output descriptor, or the conventional
    /// name derived from the data type.
    pub fn output_stream(&self) -> String {
        if self.output.stream.is_empty() {
            stream_for(self.provider.data_type.as_str())
        } else {
            self.output.stream.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("job has no name");
        }
        cron::Schedule::from_str(&self.schedule)
            .with_context(|| format!("bad cron expression '{}'", self.schedule))?;
        for symbol in &self.params.symbols {
            if !is_valid_symbol(symbol) {
                anyhow::bail!("symbol '{}' is not a 6-digit code", symbol);
            }
        }
        Ok(())
    }
}

/// Load the job set, dropping disabled and malformed entries.
pub fn load_jobs(path: &str) -> Result<Vec<JobSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading jobs file {}", path))?;
    parse_jobs(&text)
}

pub fn parse_jobs(text: &str) -> Result<Vec<JobSpec>> {
    let file: JobsFile = toml::from_str(text).context("parsing jobs file")?;
    let mut jobs = Vec::with_capacity(file.jobs.len());
    for job in file.jobs {
        if !job.enabled {
            info!(job = %job.name, "job disabled, skipping");
            continue;
        }
        match job.validate() {
            Ok(()) => jobs.push(job),
            Err(e) => warn!(job = %job.name, error = %e, "invalid job spec, skipping"),
        }
    }
    Ok(jobs)
}
