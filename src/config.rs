use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    adapters::outbound::simulator::SimulationProfile,
    application::PipelineSettings,
    core::{config::FsmConfig, domain::StageName},
    paths,
};

pub const DEFAULT_LINE: &str = "Line-07";

/// Process-level configuration loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    pub lines: BTreeMap<String, LineConfig>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            queue_capacity: default_queue_capacity(),
            worker_poll_ms: default_worker_poll_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            lines: BTreeMap::from([(DEFAULT_LINE.to_string(), LineConfig::default())]),
        }
    }
}

impl SentinelConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read config file at {}", path_ref.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("Invalid configuration in {}", path_ref.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Unable to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.lines.is_empty(),
            "Configuration must contain at least one line"
        );
        ensure!(self.queue_capacity > 0, "queue_capacity must be > 0");
        ensure!(self.worker_poll_ms > 0, "worker_poll_ms must be > 0");
        for (name, line) in &self.lines {
            line.validate(name)
                .with_context(|| format!("Line '{name}' failed validation"))?;
        }
        Ok(())
    }

    pub fn line(&self, name: &str) -> Option<&LineConfig> {
        self.lines.get(name)
    }

    /// Lines to run: the requested ones, or every configured line.
    pub fn select_lines(&self, requested: &[String]) -> Result<Vec<(String, LineConfig)>> {
        if requested.is_empty() {
            return Ok(self
                .lines
                .iter()
                .map(|(name, line)| (name.clone(), line.clone()))
                .collect());
        }
        requested
            .iter()
            .map(|name| {
                self.line(name)
                    .map(|line| (name.clone(), line.clone()))
                    .ok_or_else(|| anyhow!("Line '{name}' is not configured"))
            })
            .collect()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(paths::data_dir)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            queue_capacity: self.queue_capacity,
            worker_poll: Duration::from_millis(self.worker_poll_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }
}

impl FromStr for SentinelConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_yaml_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(default = "default_zones")]
    pub zones: Vec<String>,
    /// Seed parameters, stored as version 1 the first time the line runs.
    #[serde(default)]
    pub fsm: FsmConfig,
    #[serde(default)]
    pub simulation: SimulationProfile,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            zones: default_zones(),
            fsm: FsmConfig::default(),
            simulation: SimulationProfile::default(),
        }
    }
}

impl LineConfig {
    fn validate(&self, line: &str) -> Result<()> {
        ensure!(!self.zones.is_empty(), "Line '{line}' must enable at least one zone");
        let mut seen = BTreeSet::new();
        for zone in &self.zones {
            ensure!(
                StageName::from_zone(zone).is_some(),
                "Line '{line}' references unknown zone '{zone}'"
            );
            ensure!(seen.insert(zone), "Line '{line}' lists zone '{zone}' twice");
        }
        self.fsm.validate().context("Invalid FSM parameters")?;
        self.simulation
            .validate()
            .context("Invalid simulation profile")?;
        Ok(())
    }
}

fn default_zones() -> Vec<String> {
    StageName::ALL
        .iter()
        .map(|stage| stage.zone().to_string())
        .collect()
}

fn default_queue_capacity() -> usize {
    300
}

fn default_worker_poll_ms() -> u64 {
    1000
}

fn default_join_timeout_ms() -> u64 {
    5000
}
