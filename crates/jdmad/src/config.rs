//! TOML configuration for the JDMA daemon.
//!
//! Every section is optional; a missing file yields a single on-disk backend
//! under the data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use jdma_types::{BackendKind, OrchestratorConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Data and staging locations.
    pub node: NodeSection,
    /// Scheduler timing.
    pub scheduler: SchedulerSection,
    /// Archive part layout.
    pub packing: PackingSection,
    /// Storage backends (`[[backend]]` tables).
    #[serde(rename = "backend")]
    pub backends: Vec<BackendSection>,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for the metadata store and default backend roots.
    pub data_dir: PathBuf,
    /// Staging area for packed and restored parts. Defaults to `<data_dir>/staging`.
    pub staging_dir: Option<PathBuf>,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".jdma"))
            .unwrap_or_else(|| PathBuf::from(".jdma"));
        Self {
            data_dir,
            staging_dir: None,
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Time between scans of the state index (e.g. `"5s"`).
    pub poll_interval: Option<String>,
    /// How long one step may run before the request counts as stalled (e.g. `"6h"`).
    pub staleness_window: Option<String>,
    /// Identity written into claims. Defaults to `jdmad`.
    pub id: Option<String>,
}

/// `[packing]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PackingSection {
    /// Maximum payload per archive part (e.g. `"256MB"`).
    pub part_ceiling: Option<String>,
    /// Check every retrieved part before unpacking anything. Defaults to true.
    pub verify_before_unpack: Option<bool>,
}

/// One `[[backend]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// Identifier stored on batches.
    pub name: String,
    /// `object_store`, `tape` or `disk`.
    pub kind: BackendKind,
    /// Directory for `disk` and `tape`. Defaults to `<data_dir>/<name>`.
    pub root: Option<PathBuf>,
    /// Bucket name for `object_store`. Defaults to the backend name.
    pub bucket: Option<String>,
    /// Capacity limit for `object_store` (e.g. `"10TB"`).
    pub capacity: Option<String>,
    /// Volume label for `tape`. Defaults to the backend name.
    pub volume: Option<String>,
    /// Drive count for `tape`.
    pub drives: Option<usize>,
    /// Delay before each tape read (e.g. `"90s"`).
    pub recall_latency: Option<String>,
    /// Worker pool size. Defaults per kind.
    pub concurrency: Option<usize>,
    /// Retry overrides.
    pub max_attempts: Option<u32>,
    pub min_backoff: Option<String>,
    pub max_backoff: Option<String>,
}

impl BackendSection {
    /// Directory used by `disk` and `tape` backends.
    pub fn root_in(&self, data_dir: &Path) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| data_dir.join(&self.name))
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"jdma_engine=trace"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("cannot read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Location of the orchestrator store.
    pub fn meta_dir(&self) -> PathBuf {
        self.node.data_dir.join("meta")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.node
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("staging"))
    }

    /// Configured backends, or a single `disk` backend when none are listed.
    pub fn backend_sections(&self) -> Vec<BackendSection> {
        if !self.backends.is_empty() {
            return self.backends.clone();
        }
        vec![BackendSection {
            name: "disk".to_string(),
            kind: BackendKind::Disk,
            root: None,
            bucket: None,
            capacity: None,
            volume: None,
            drives: None,
            recall_latency: None,
            concurrency: None,
            max_attempts: None,
            min_backoff: None,
            max_backoff: None,
        }]
    }

    /// Effective state machine and scheduler settings.
    pub fn orchestrator_config(&self) -> anyhow::Result<OrchestratorConfig> {
        let defaults = OrchestratorConfig::default();
        Ok(OrchestratorConfig {
            staging_dir: self.staging_dir(),
            part_ceiling: match &self.packing.part_ceiling {
                Some(s) => parse_size(s).context("invalid [packing] part_ceiling")?,
                None => defaults.part_ceiling,
            },
            verify_before_unpack: self
                .packing
                .verify_before_unpack
                .unwrap_or(defaults.verify_before_unpack),
            staleness_window: match &self.scheduler.staleness_window {
                Some(s) => parse_duration(s).context("invalid [scheduler] staleness_window")?,
                None => defaults.staleness_window,
            },
            poll_interval: match &self.scheduler.poll_interval {
                Some(s) => parse_duration(s).context("invalid [scheduler] poll_interval")?,
                None => defaults.poll_interval,
            },
            scheduler_id: self
                .scheduler
                .id
                .clone()
                .unwrap_or(defaults.scheduler_id),
        })
    }
}

/// Parse a human-readable size into bytes.
///
/// Supports: `"256MB"`, `"1GB"`, `"512KB"`, `"2TB"`, `"1048576"` (raw bytes).
/// Units are powers of 1024.
pub fn parse_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(num) = s.strip_suffix("TB") {
        (num, 1u64 << 40)
    } else if let Some(num) = s.strip_suffix("GB") {
        (num, 1 << 30)
    } else if let Some(num) = s.strip_suffix("MB") {
        (num, 1 << 20)
    } else if let Some(num) = s.strip_suffix("KB") {
        (num, 1 << 10)
    } else if let Some(num) = s.strip_suffix('B') {
        (num, 1)
    } else {
        (s, 1)
    };
    let value: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("not a size: {s:?}"))?;
    value
        .checked_mul(multiplier)
        .with_context(|| format!("size out of range: {s:?}"))
}

/// Parse a human-readable duration.
///
/// Supports: `"200ms"`, `"30s"`, `"15m"`, `"6h"`, `"45"` (raw seconds).
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let parse = |num: &str| -> anyhow::Result<u64> {
        num.trim()
            .parse()
            .with_context(|| format!("not a duration: {s:?}"))
    };
    let duration = if let Some(num) = s.strip_suffix("ms") {
        Duration::from_millis(parse(num)?)
    } else if let Some(num) = s.strip_suffix('s') {
        Duration::from_secs(parse(num)?)
    } else if let Some(num) = s.strip_suffix('m') {
        Duration::from_secs(parse(num)? * 60)
    } else if let Some(num) = s.strip_suffix('h') {
        Duration::from_secs(parse(num)? * 3600)
    } else {
        Duration::from_secs(parse(s)?)
    };
    if duration.is_zero() {
        bail!("duration must be positive: {s:?}");
    }
    Ok(duration)
}
