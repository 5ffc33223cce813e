use chrono::{DateTime, Utc};

use crate::core::{
    config::{FsmConfig, VersionedConfig},
    domain::{
        EndReason, EventEntry, ReachedFlags, RunRecord, RuntimeState, Severity, StageRecord,
        ZoneSnapshot,
    },
    error::Result,
};

/// Abstraction over the device (or simulator) that reports zone readings.
pub trait ZoneSource: Send + Sync {
    /// Read the current snapshot for a zone. `Ok(None)` means "no data".
    fn read(&self, zone: &str) -> Result<Option<ZoneSnapshot>>;
}

/// Append-only store of FSM parameter versions.
pub trait ConfigStore: Send + Sync {
    /// Latest stored version for a line, if any.
    fn get_latest(&self, line_id: &str) -> Result<Option<VersionedConfig>>;
    /// Store a new version and return it.
    fn append(&self, line_id: &str, config: &FsmConfig) -> Result<VersionedConfig>;
}

/// Durable run and stage records.
pub trait RunStore: Send + Sync {
    fn create_run(&self, run_id: &str, line_id: &str, started_at: DateTime<Utc>) -> Result<()>;
    fn end_run(
        &self,
        run_id: &str,
        ended_at: DateTime<Utc>,
        end_reason: EndReason,
        reached: ReachedFlags,
    ) -> Result<()>;
    fn add_stage(&self, run_id: &str, record: &StageRecord) -> Result<()>;
    /// Most recent runs first, each with its stages.
    fn list_runs(&self, line_id: &str, limit: usize) -> Result<Vec<RunRecord>>;
    /// The run of this line that has not been ended yet, if any.
    fn open_run(&self, line_id: &str) -> Result<Option<RunRecord>>;
}

/// Single-row-per-line runtime checkpoint.
pub trait CheckpointStore: Send + Sync {
    fn get(&self, line_id: &str) -> Result<Option<RuntimeState>>;
    fn put(&self, line_id: &str, state: &RuntimeState) -> Result<()>;
}

/// Downstream report generation, notified when a run closes.
pub trait ReportTrigger: Send + Sync {
    /// Best effort and non-blocking; failures stay inside the implementation.
    fn notify(&self, run: &RunRecord);
}

/// Operator-facing event log.
pub trait EventLog: Send + Sync {
    fn log(&self, kind: &str, message: &str, severity: Severity, zone: Option<&str>) -> Result<()>;
    /// Newest entries first.
    fn recent(&self, limit: usize) -> Result<Vec<EventEntry>>;
}

/// Abstraction for getting the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
