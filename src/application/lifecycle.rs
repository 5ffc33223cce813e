//! Turns FSM events into durable run and stage records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::{
    domain::{EndReason, EventPayload, FsmEvent, ReachedFlags, RunRecord},
    error::{Error, Result},
    ports::{ReportTrigger, RunStore},
};

pub struct RunLifecycle {
    line_id: String,
    runs: Arc<dyn RunStore>,
    reports: Arc<dyn ReportTrigger>,
    open: Option<RunRecord>,
}

impl RunLifecycle {
    pub fn new(
        line_id: impl Into<String>,
        runs: Arc<dyn RunStore>,
        reports: Arc<dyn ReportTrigger>,
    ) -> Self {
        Self {
            line_id: line_id.into(),
            runs,
            reports,
            open: None,
        }
    }

    /// Pick up the run a previous process left open for this line.
    pub fn resume(
        line_id: impl Into<String>,
        runs: Arc<dyn RunStore>,
        reports: Arc<dyn ReportTrigger>,
    ) -> Result<Self> {
        let mut lifecycle = Self::new(line_id, runs, reports);
        lifecycle.open = lifecycle.runs.open_run(&lifecycle.line_id)?;
        if let Some(run) = &lifecycle.open {
            info!(
                line_id = %lifecycle.line_id,
                run_id = %run.run_id,
                stages = run.stages.len(),
                "resumed open run"
            );
        }
        Ok(lifecycle)
    }

    pub fn open_run(&self) -> Option<&RunRecord> {
        self.open.as_ref()
    }

    pub fn handle(&mut self, event: &FsmEvent) -> Result<()> {
        match &event.payload {
            EventPayload::StageStart { .. } => {
                let run_id = required_run_id(event)?;
                self.ensure_open(run_id, event.timestamp)?;
            }
            EventPayload::StageStable => {}
            EventPayload::StageEnd { record, .. } => {
                let run_id = required_run_id(event)?;
                self.ensure_open(run_id, record.started_at)?;
                self.runs.add_stage(run_id, record)?;
                if let Some(run) = self.open.as_mut() {
                    run.reached.mark(record.stage);
                    run.stages.push(record.clone());
                }
            }
            EventPayload::FullReport {
                end_reason,
                reached,
            }
            | EventPayload::PartialReport {
                end_reason,
                reached,
            } => {
                let run_id = required_run_id(event)?;
                self.close(run_id, event.timestamp, *end_reason, *reached)?;
            }
            EventPayload::Error { detail } => {
                if let Some(run) = &self.open {
                    warn!(
                        line_id = %self.line_id,
                        run_id = %run.run_id,
                        %detail,
                        "closing run after FSM error"
                    );
                    self.runs
                        .end_run(&run.run_id, event.timestamp, EndReason::Fault, run.reached)?;
                    self.open = None;
                }
            }
        }
        Ok(())
    }

    /// Make `run_id` the open run. The in-memory run is only replaced once
    /// the store has ended it, so a failed write leaves it to be superseded
    /// again by the next run.
    fn ensure_open(&mut self, run_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        if let Some(stale) = &self.open {
            if stale.run_id == run_id {
                return Ok(());
            }
            warn!(
                line_id = %self.line_id,
                stale = %stale.run_id,
                replacement = %run_id,
                "superseding unfinished run"
            );
            self.runs.end_run(&stale.run_id, started_at, EndReason::Fault, stale.reached)?;
            self.open = None;
        }
        self.runs.create_run(run_id, &self.line_id, started_at)?;
        info!(line_id = %self.line_id, %run_id, "run opened");
        self.open = Some(RunRecord::open(run_id, self.line_id.as_str(), started_at));
        Ok(())
    }

    fn close(
        &mut self,
        run_id: &str,
        ended_at: DateTime<Utc>,
        end_reason: EndReason,
        reached: ReachedFlags,
    ) -> Result<()> {
        self.ensure_open(run_id, ended_at)?;
        let Some(open) = &self.open else {
            return Ok(());
        };
        let reached = reached.union(open.reached);
        self.runs.end_run(&open.run_id, ended_at, end_reason, reached)?;
        let Some(mut run) = self.open.take() else {
            return Ok(());
        };
        run.reached = reached;
        run.ended_at = Some(ended_at);
        run.end_reason = Some(end_reason);
        info!(
            line_id = %self.line_id,
            run_id = %run.run_id,
            end_reason = end_reason.as_str(),
            stages = run.stages.len(),
            "run closed"
        );
        self.reports.notify(&run);
        Ok(())
    }
}

fn required_run_id(event: &FsmEvent) -> Result<&str> {
    event.run_id.as_deref().ok_or_else(|| {
        Error::InvalidState(format!("{} event carries no run id", event.kind()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::outbound::memory::MemoryStore,
        core::domain::{StageName, StageRecord, StageStatus},
    };
    use chrono::{Duration, TimeZone};
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    /// Run store whose next `end_run` calls fail.
    struct FlakyRuns {
        inner: MemoryStore,
        failing_ends: AtomicUsize,
    }

    impl FlakyRuns {
        fn failing(times: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failing_ends: AtomicUsize::new(times),
            }
        }

        fn open_rows(&self) -> usize {
            self.inner
                .list_runs("L1", 10)
                .unwrap()
                .iter()
                .filter(|run| run.is_open())
                .count()
        }
    }

    impl RunStore for FlakyRuns {
        fn create_run(&self, run_id: &str, line_id: &str, started_at: DateTime<Utc>) -> Result<()> {
            self.inner.create_run(run_id, line_id, started_at)
        }

        fn end_run(
            &self,
            run_id: &str,
            ended_at: DateTime<Utc>,
            end_reason: EndReason,
            reached: ReachedFlags,
        ) -> Result<()> {
            let remaining = self.failing_ends.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_ends.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Persistence("database is locked".into()));
            }
            self.inner.end_run(run_id, ended_at, end_reason, reached)
        }

        fn add_stage(&self, run_id: &str, record: &StageRecord) -> Result<()> {
            self.inner.add_stage(run_id, record)
        }

        fn list_runs(&self, line_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
            self.inner.list_runs(line_id, limit)
        }

        fn open_run(&self, line_id: &str) -> Result<Option<RunRecord>> {
            self.inner.open_run(line_id)
        }
    }

    #[derive(Default)]
    struct RecordingTrigger {
        runs: Mutex<Vec<RunRecord>>,
    }

    impl ReportTrigger for RecordingTrigger {
        fn notify(&self, run: &RunRecord) {
            self.runs.lock().unwrap().push(run.clone());
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn event(run_id: &str, secs: i64, payload: EventPayload) -> FsmEvent {
        FsmEvent {
            run_id: Some(run_id.to_string()),
            stage: "preheat".into(),
            timestamp: at(secs),
            payload,
        }
    }

    fn stage_end(stage: StageName, start: i64, end: i64) -> EventPayload {
        EventPayload::StageEnd {
            record: StageRecord {
                stage,
                started_at: at(start),
                ended_at: at(end),
                sp_start: Some(300.0),
                sp_end: Some(300.0),
                t_min: Some(290.0),
                t_max: Some(301.0),
                t_mean: 296.0,
                t_std: 3.0,
                samples: 10,
                status: StageStatus::Normal,
            },
            reason: None,
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<RecordingTrigger>) {
        (Arc::new(MemoryStore::new()), Arc::new(RecordingTrigger::default()))
    }

    #[test]
    fn full_run_is_recorded_and_reported_once() {
        let (store, trigger) = setup();
        let mut lifecycle = RunLifecycle::new("L1", store.clone(), trigger.clone());

        lifecycle
            .handle(&event("RUN_A", 0, EventPayload::StageStart { sp_ref: 300.0 }))
            .unwrap();
        lifecycle
            .handle(&event("RUN_A", 20, stage_end(StageName::Preheat, 0, 20)))
            .unwrap();
        lifecycle
            .handle(&event("RUN_A", 22, EventPayload::StageStart { sp_ref: 400.0 }))
            .unwrap();
        lifecycle
            .handle(&event("RUN_A", 40, stage_end(StageName::Main, 22, 40)))
            .unwrap();
        let mut reached = ReachedFlags::default();
        reached.mark(StageName::Main);
        lifecycle
            .handle(&event(
                "RUN_A",
                800,
                EventPayload::PartialReport {
                    end_reason: EndReason::QuietTimeout,
                    reached,
                },
            ))
            .unwrap();

        let runs = store.list_runs("L1", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].stages.len(), 2);
        assert_eq!(runs[0].end_reason, Some(EndReason::QuietTimeout));
        assert!(runs[0].reached.preheat_ok && runs[0].reached.main_ok);
        assert!(lifecycle.open_run().is_none());

        let reported = trigger.runs.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].stages.len(), 2);
        assert_eq!(reported[0].ended_at, Some(at(800)));
    }

    #[test]
    fn fsm_error_closes_run_as_fault_without_report() {
        let (store, trigger) = setup();
        let mut lifecycle = RunLifecycle::new("L1", store.clone(), trigger.clone());
        lifecycle
            .handle(&event("RUN_A", 0, EventPayload::StageStart { sp_ref: 300.0 }))
            .unwrap();
        lifecycle
            .handle(&event(
                "RUN_A",
                4,
                EventPayload::Error {
                    detail: "bad reading".into(),
                },
            ))
            .unwrap();

        let runs = store.list_runs("L1", 10).unwrap();
        assert_eq!(runs[0].end_reason, Some(EndReason::Fault));
        assert!(trigger.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn new_run_supersedes_unfinished_one() {
        let (store, trigger) = setup();
        let mut lifecycle = RunLifecycle::new("L1", store.clone(), trigger);
        lifecycle
            .handle(&event("RUN_A", 0, EventPayload::StageStart { sp_ref: 300.0 }))
            .unwrap();
        lifecycle
            .handle(&event("RUN_B", 50, EventPayload::StageStart { sp_ref: 300.0 }))
            .unwrap();

        let runs = store.list_runs("L1", 10).unwrap();
        assert_eq!(runs.len(), 2);
        let stale = runs.iter().find(|r| r.run_id == "RUN_A").unwrap();
        assert_eq!(stale.end_reason, Some(EndReason::Fault));
        assert_eq!(lifecycle.open_run().unwrap().run_id, "RUN_B");
    }

    #[test]
    fn failed_close_keeps_run_open_until_superseded() {
        let runs = Arc::new(FlakyRuns::failing(1));
        let trigger = Arc::new(RecordingTrigger::default());
        let mut lifecycle = RunLifecycle::new("L1", runs.clone(), trigger.clone());
        lifecycle
            .handle(&event("RUN_A", 0, EventPayload::StageStart { sp_ref: 300.0 }))
            .unwrap();
        let report = EventPayload::FullReport {
            end_reason: EndReason::Normal,
            reached: ReachedFlags::default(),
        };
        assert!(lifecycle.handle(&event("RUN_A", 30, report)).is_err());
        assert_eq!(lifecycle.open_run().unwrap().run_id, "RUN_A");
        assert!(trigger.runs.lock().unwrap().is_empty());

        lifecycle
            .handle(&event("RUN_B", 60, EventPayload::StageStart { sp_ref: 300.0 }))
            .unwrap();
        assert_eq!(runs.open_rows(), 1, "only one open run per line");
        let stale = runs
            .list_runs("L1", 10)
            .unwrap()
            .into_iter()
            .find(|run| run.run_id == "RUN_A")
            .unwrap();
        assert_eq!(stale.end_reason, Some(EndReason::Fault));
        assert_eq!(lifecycle.open_run().unwrap().run_id, "RUN_B");
    }

    #[test]
    fn failed_fault_close_keeps_run_open() {
        let runs = Arc::new(FlakyRuns::failing(1));
        let mut lifecycle =
            RunLifecycle::new("L1", runs.clone(), Arc::new(RecordingTrigger::default()));
        lifecycle
            .handle(&event("RUN_A", 0, EventPayload::StageStart { sp_ref: 300.0 }))
            .unwrap();
        let error = EventPayload::Error {
            detail: "bad reading".into(),
        };
        assert!(lifecycle.handle(&event("RUN_A", 4, error.clone())).is_err());
        assert_eq!(lifecycle.open_run().unwrap().run_id, "RUN_A");

        lifecycle.handle(&event("RUN_A", 6, error)).unwrap();
        assert!(lifecycle.open_run().is_none());
        assert_eq!(runs.open_rows(), 0);
    }

    #[test]
    fn resumed_run_keeps_reached_flags_from_before_restart() {
        let (store, trigger) = setup();
        store.create_run("RUN_A", "L1", at(0)).unwrap();
        let EventPayload::StageEnd { record, .. } = stage_end(StageName::Preheat, 0, 20) else {
            unreachable!()
        };
        store.add_stage("RUN_A", &record).unwrap();

        let mut lifecycle = RunLifecycle::resume("L1", store.clone(), trigger.clone()).unwrap();
        assert_eq!(lifecycle.open_run().unwrap().run_id, "RUN_A");
        lifecycle
            .handle(&event(
                "RUN_A",
                900,
                EventPayload::FullReport {
                    end_reason: EndReason::Normal,
                    reached: ReachedFlags::default(),
                },
            ))
            .unwrap();

        let reported = trigger.runs.lock().unwrap();
        assert!(reported[0].reached.preheat_ok);
        assert_eq!(reported[0].stages.len(), 1);
    }
}
