use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    config::VersionedConfig,
    domain::{EventEntry, ReachedFlags, RunRecord, RuntimeState, StageRecord},
};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StatusExport {
    pub lines: Vec<LineStatusExport>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LineStatusExport {
    pub line_id: String,
    pub state: String,
    pub stage: Option<String>,
    pub run_id: Option<String>,
    pub stage_entered_at: Option<DateTime<Utc>>,
    pub sp_ref: Option<f64>,
    pub config_version: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub open_run: Option<RunExport>,
}

impl LineStatusExport {
    /// Status of a line; a line that never checkpointed reports `IDLE`.
    pub fn new(
        line_id: &str,
        checkpoint: Option<&RuntimeState>,
        config: Option<&VersionedConfig>,
        open_run: Option<&RunRecord>,
    ) -> Self {
        Self {
            line_id: line_id.to_string(),
            state: checkpoint
                .map(|c| c.state.to_string())
                .unwrap_or_else(|| "IDLE".to_string()),
            stage: checkpoint
                .and_then(|c| c.stage)
                .map(|stage| stage.as_str().to_string()),
            run_id: checkpoint.and_then(|c| c.run_id.clone()),
            stage_entered_at: checkpoint.and_then(|c| c.stage_entered_at),
            sp_ref: checkpoint.and_then(|c| c.sp_ref),
            config_version: config
                .map(|c| c.version)
                .or(checkpoint.map(|c| c.config_version)),
            updated_at: checkpoint.map(|c| c.updated_at),
            open_run: open_run.map(RunExport::from),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunListExport {
    pub line_id: String,
    pub runs: Vec<RunExport>,
}

impl RunListExport {
    pub fn from_runs(line_id: &str, runs: &[RunRecord]) -> Self {
        Self {
            line_id: line_id.to_string(),
            runs: runs.iter().map(RunExport::from).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunExport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub reached: ReachedFlags,
    pub complete: bool,
    pub stages: Vec<StageRecord>,
}

impl From<&RunRecord> for RunExport {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id.clone(),
            started_at: run.started_at,
            ended_at: run.ended_at,
            end_reason: run.end_reason.map(|reason| reason.as_str().to_string()),
            reached: run.reached,
            complete: run.reached.all(),
            stages: run.stages.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventListExport {
    pub events: Vec<EventEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfigExport {
    pub line_id: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub config: crate::core::config::FsmConfig,
}

impl From<&VersionedConfig> for ConfigExport {
    fn from(value: &VersionedConfig) -> Self {
        Self {
            line_id: value.line_id.clone(),
            version: value.version,
            created_at: value.created_at,
            config: value.config.clone(),
        }
    }
}
