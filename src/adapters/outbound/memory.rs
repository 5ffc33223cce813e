//! In-process store used by `run --dry-run` and by tests.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};

use crate::core::{
    config::{FsmConfig, VersionedConfig},
    domain::{EndReason, EventEntry, ReachedFlags, RunRecord, RuntimeState, Severity, StageRecord},
    error::{Error, Result},
    ports::{CheckpointStore, ConfigStore, EventLog, RunStore},
};

#[derive(Default)]
struct MemoryState {
    configs: Vec<VersionedConfig>,
    runs: Vec<RunRecord>,
    checkpoints: BTreeMap<String, RuntimeState>,
    events: Vec<EventEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::System("memory store lock poisoned".into()))
    }
}

impl ConfigStore for MemoryStore {
    fn get_latest(&self, line_id: &str) -> Result<Option<VersionedConfig>> {
        Ok(self
            .lock()?
            .configs
            .iter()
            .filter(|c| c.line_id == line_id)
            .max_by_key(|c| c.version)
            .cloned())
    }

    fn append(&self, line_id: &str, config: &FsmConfig) -> Result<VersionedConfig> {
        config.validate()?;
        let mut state = self.lock()?;
        let version = state
            .configs
            .iter()
            .filter(|c| c.line_id == line_id)
            .map(|c| c.version)
            .max()
            .unwrap_or(0)
            + 1;
        let stored = VersionedConfig {
            line_id: line_id.to_string(),
            version,
            config: config.clone(),
            created_at: Utc::now(),
        };
        state.configs.push(stored.clone());
        Ok(stored)
    }
}

impl RunStore for MemoryStore {
    fn create_run(&self, run_id: &str, line_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        if !state.runs.iter().any(|r| r.run_id == run_id) {
            state.runs.push(RunRecord::open(run_id, line_id, started_at));
        }
        Ok(())
    }

    fn end_run(
        &self,
        run_id: &str,
        ended_at: DateTime<Utc>,
        end_reason: EndReason,
        reached: ReachedFlags,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| Error::Persistence(format!("run {run_id} not found")))?;
        run.ended_at = Some(ended_at);
        run.end_reason = Some(end_reason);
        run.reached = reached;
        Ok(())
    }

    fn add_stage(&self, run_id: &str, record: &StageRecord) -> Result<()> {
        let mut state = self.lock()?;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| Error::Persistence(format!("run {run_id} not found")))?;
        run.reached.mark(record.stage);
        run.stages.push(record.clone());
        Ok(())
    }

    fn list_runs(&self, line_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let state = self.lock()?;
        let mut runs: Vec<RunRecord> = state
            .runs
            .iter()
            .filter(|r| r.line_id == line_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn open_run(&self, line_id: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .lock()?
            .runs
            .iter()
            .filter(|r| r.line_id == line_id && r.is_open())
            .max_by_key(|r| r.started_at)
            .cloned())
    }
}

impl CheckpointStore for MemoryStore {
    fn get(&self, line_id: &str) -> Result<Option<RuntimeState>> {
        Ok(self.lock()?.checkpoints.get(line_id).cloned())
    }

    fn put(&self, line_id: &str, state: &RuntimeState) -> Result<()> {
        self.lock()?
            .checkpoints
            .insert(line_id.to_string(), state.clone());
        Ok(())
    }
}

impl EventLog for MemoryStore {
    fn log(&self, kind: &str, message: &str, severity: Severity, zone: Option<&str>) -> Result<()> {
        let mut state = self.lock()?;
        let id = state.events.len() as i64 + 1;
        state.events.push(EventEntry {
            id,
            timestamp: Utc::now(),
            kind: kind.to_string(),
            message: message.to_string(),
            severity,
            zone: zone.map(str::to_string),
        });
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<EventEntry>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
