//! Stage-detection state machine.
//!
//! One machine per line classifies each [`Tick`] into the stage graph
//! `IDLE -> s_RAMP -> s_STABLE -> s_END -> (next_RAMP | IDLE)` for the stages
//! preheat, main and rib. The three stages share one set of transition rules,
//! driven by the [`STAGES`] descriptor table.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{
    config::FsmConfig,
    domain::{
        EndReason, EventPayload, FsmEvent, FsmState, Phase, ReachedFlags, RunRecord,
        RuntimeState, StageName, StageRecord, StageStatus, Tick, ZoneSnapshot,
    },
    error::{Error, Result},
    stats::StageStats,
};

/// Stage label used on events raised while no stage is known.
pub const UNKNOWN_STAGE: &str = "unknown";
/// Stage label used on partial reports raised by the quiet timer.
pub const QUIET_TIMEOUT_STAGE: &str = "quiet_timeout";

#[derive(Debug, Clone, Copy)]
struct StageDescriptor {
    name: StageName,
    next: Option<StageName>,
}

const STAGES: [StageDescriptor; 3] = [
    StageDescriptor {
        name: StageName::Preheat,
        next: Some(StageName::Main),
    },
    StageDescriptor {
        name: StageName::Main,
        next: Some(StageName::Rib),
    },
    StageDescriptor {
        name: StageName::Rib,
        next: None,
    },
];

fn descriptor(stage: StageName) -> StageDescriptor {
    STAGES[stage.index()]
}

pub struct StageMachine {
    line_id: String,
    config: FsmConfig,
    config_version: i64,
    state: FsmState,
    run_id: Option<String>,
    stage_entered_at: Option<DateTime<Utc>>,
    sp_ref: Option<f64>,
    /// Per-zone setpoint references an IDLE machine compares against.
    idle_refs: [Option<f64>; 3],
    quiet_started_at: Option<DateTime<Utc>>,
    last_status: Option<StageStatus>,
    reached: ReachedFlags,
    stats: [StageStats; 3],
}

impl StageMachine {
    pub fn new(line_id: impl Into<String>, config: FsmConfig, config_version: i64) -> Self {
        let line_id = line_id.into();
        info!(%line_id, config_version, "FSM initialized in IDLE");
        Self {
            line_id,
            config,
            config_version,
            state: FsmState::Idle,
            run_id: None,
            stage_entered_at: None,
            sp_ref: None,
            idle_refs: [None; 3],
            quiet_started_at: None,
            last_status: None,
            reached: ReachedFlags::default(),
            stats: [StageStats::default(); 3],
        }
    }

    /// Rebuild a machine from a checkpoint. Statistics for a stage in
    /// progress are not part of the checkpoint and start empty. An IDLE
    /// checkpoint's `sp_ref` is the preheat zone's reference.
    pub fn restore(
        line_id: impl Into<String>,
        config: FsmConfig,
        config_version: i64,
        checkpoint: &RuntimeState,
    ) -> Self {
        let mut machine = Self::new(line_id, config, config_version);
        machine.state = checkpoint.state;
        machine.run_id = checkpoint.run_id.clone();
        machine.stage_entered_at = checkpoint.stage_entered_at;
        machine.sp_ref = checkpoint.sp_ref;
        if machine.state == FsmState::Idle {
            machine.idle_refs[StageName::Preheat.index()] = checkpoint.sp_ref;
        }
        info!(
            line_id = %machine.line_id,
            state = %machine.state,
            run_id = ?machine.run_id,
            "FSM state restored from checkpoint"
        );
        machine
    }

    pub fn line_id(&self) -> &str {
        &self.line_id
    }

    pub fn config_version(&self) -> i64 {
        self.config_version
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn sp_ref(&self) -> Option<f64> {
        self.sp_ref
    }

    pub fn quiet_started_at(&self) -> Option<DateTime<Utc>> {
        self.quiet_started_at
    }

    pub fn reached(&self) -> ReachedFlags {
        self.reached
    }

    pub fn stage_stats(&self, stage: StageName) -> &StageStats {
        &self.stats[stage.index()]
    }

    /// Carry over what the open run recorded before a restart: the stages
    /// already reached and, while waiting in END, the status the last stage
    /// ended with.
    pub fn resume_run(&mut self, run: &RunRecord) {
        if self.run_id.as_deref() != Some(run.run_id.as_str()) {
            return;
        }
        self.reached = run
            .stages
            .iter()
            .fold(self.reached.union(run.reached), |mut reached, record| {
                reached.mark(record.stage);
                reached
            });
        if let FsmState::Stage(stage, Phase::End) = self.state {
            self.last_status = run
                .stages
                .last()
                .filter(|record| record.stage == stage)
                .map(|record| record.status);
        }
        debug!(
            line_id = %self.line_id,
            run_id = %run.run_id,
            reached = ?self.reached,
            last_status = ?self.last_status,
            "open run carried into restored machine"
        );
    }

    pub fn runtime_state(&self, updated_at: DateTime<Utc>) -> RuntimeState {
        RuntimeState {
            state: self.state,
            stage: self.state.active_stage(),
            run_id: self.run_id.clone(),
            stage_entered_at: self.stage_entered_at,
            sp_ref: self.sp_ref,
            config_version: self.config_version,
            updated_at,
        }
    }

    /// Return to IDLE, dropping the run, the stage, the quiet timer and all
    /// accumulated statistics.
    pub fn reset(&mut self) {
        self.state = FsmState::Idle;
        self.run_id = None;
        self.stage_entered_at = None;
        self.sp_ref = None;
        self.idle_refs = [None; 3];
        self.quiet_started_at = None;
        self.last_status = None;
        self.reached = ReachedFlags::default();
        for stats in &mut self.stats {
            stats.reset();
        }
    }

    /// Advance the machine by one tick and return the events it produced.
    ///
    /// Any unexpected failure yields a single `FSM_ERROR` event and leaves the
    /// machine in IDLE.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<FsmEvent> {
        let mut events = Vec::new();
        if let Err(err) = self.evaluate(tick, &mut events) {
            error!(
                line_id = %self.line_id,
                state = %self.state,
                error = %err,
                "FSM evaluation failed; resetting to IDLE"
            );
            let stage = self
                .state
                .stage()
                .map(StageName::as_str)
                .unwrap_or(UNKNOWN_STAGE);
            events.push(self.event(
                stage,
                tick.timestamp,
                EventPayload::Error {
                    detail: err.to_string(),
                },
            ));
            self.reset();
        }
        events
    }

    fn evaluate(&mut self, tick: &Tick, events: &mut Vec<FsmEvent>) -> Result<()> {
        if let Some(stage) = self.state.active_stage()
            && let Some(snapshot) = tick.zone(stage.zone()).filter(|s| s.valid)
        {
            ensure_finite(stage, snapshot)?;
            self.stats[stage.index()].update(snapshot.temperature);
        }

        match self.state {
            FsmState::Idle => self.process_idle(tick, events)?,
            FsmState::Stage(stage, Phase::End) => {
                self.process_end(descriptor(stage), tick, events)?
            }
            FsmState::Stage(stage, phase) => {
                self.process_active(descriptor(stage), phase, tick, events)?
            }
        }

        self.check_quiet_timeout(tick.timestamp, events);
        Ok(())
    }

    fn process_idle(&mut self, tick: &Tick, events: &mut Vec<FsmEvent>) -> Result<()> {
        let candidates: &[StageName] = if self.config.allow_main_without_preheat {
            &StageName::ALL
        } else {
            &[StageName::Preheat]
        };
        for &stage in candidates {
            if self.start_condition(stage, self.idle_refs[stage.index()], tick)? {
                return self.start_stage(stage, tick, events);
            }
        }
        for &stage in candidates {
            if let Some(sp) = watched_setpoint(tick, stage) {
                self.idle_refs[stage.index()] = Some(sp);
            }
        }
        self.sp_ref = self.idle_refs[StageName::Preheat.index()];
        Ok(())
    }

    fn process_active(
        &mut self,
        stage: StageDescriptor,
        phase: Phase,
        tick: &Tick,
        events: &mut Vec<FsmEvent>,
    ) -> Result<()> {
        let entered_at = self.stage_entered_at.ok_or_else(|| {
            Error::InvalidState(format!("{} has no stage-entry timestamp", self.state))
        })?;
        self.require_run_id()?;

        let snapshot = tick.zone(stage.name.zone());
        if snapshot.is_some_and(|s| !s.valid) {
            self.finish_stage(
                stage,
                StageStatus::Fault,
                Some("sensor reported invalid reading".into()),
                tick,
                events,
            );
            return Ok(());
        }

        if let Some(limit) = self.exceeded_limit(phase, entered_at, tick.timestamp) {
            self.finish_stage(
                stage,
                StageStatus::Timeout,
                Some(format!("{limit} exceeded")),
                tick,
                events,
            );
            return Ok(());
        }

        let Some(snapshot) = snapshot else {
            debug!(
                line_id = %self.line_id,
                zone = stage.name.zone(),
                "zone missing from tick; holding state"
            );
            return Ok(());
        };
        ensure_finite(stage.name, snapshot)?;

        let in_band = (snapshot.temperature - snapshot.sp_active).abs() <= self.config.tol_f;
        match phase {
            Phase::Ramp if in_band => {
                self.state = FsmState::Stage(stage.name, Phase::Stable);
                info!(
                    line_id = %self.line_id,
                    stage = %stage.name,
                    temperature = snapshot.temperature,
                    "stage reached stable band"
                );
                events.push(self.event(
                    stage.name.as_str(),
                    tick.timestamp,
                    EventPayload::StageStable,
                ));
            }
            Phase::Stable if !in_band => {
                self.finish_stage(stage, StageStatus::Normal, None, tick, events);
            }
            _ => {}
        }
        Ok(())
    }

    fn process_end(
        &mut self,
        stage: StageDescriptor,
        tick: &Tick,
        events: &mut Vec<FsmEvent>,
    ) -> Result<()> {
        self.require_run_id()?;

        let Some(next) = stage.next else {
            let end_reason = self
                .last_status
                .map(EndReason::from)
                .unwrap_or(EndReason::Normal);
            info!(
                line_id = %self.line_id,
                run_id = ?self.run_id,
                end_reason = end_reason.as_str(),
                "run complete; emitting full report"
            );
            events.push(self.event(
                stage.name.as_str(),
                tick.timestamp,
                EventPayload::FullReport {
                    end_reason,
                    reached: self.reached,
                },
            ));
            self.reset();
            return Ok(());
        };

        let halted = self.last_status == Some(StageStatus::Fault)
            && !self.config.continue_after_fault_if_next_stage_ramps;
        if !halted {
            if self.start_condition(next, self.sp_ref, tick)? {
                return self.start_stage(next, tick, events);
            }
            self.sp_ref = watched_setpoint(tick, next).or(self.sp_ref);
        }

        if self.quiet_started_at.is_none() {
            debug!(
                line_id = %self.line_id,
                after = %stage.name,
                "next stage not started; quiet timer running"
            );
            self.quiet_started_at = Some(tick.timestamp);
        }
        Ok(())
    }

    fn check_quiet_timeout(&mut self, now: DateTime<Utc>, events: &mut Vec<FsmEvent>) {
        let Some(started) = self.quiet_started_at else {
            return;
        };
        if !matches!(self.state, FsmState::Stage(_, Phase::End)) {
            self.quiet_started_at = None;
            return;
        }
        if elapsed_secs(started, now) >= self.config.quiet_window_s {
            warn!(
                line_id = %self.line_id,
                run_id = ?self.run_id,
                state = %self.state,
                "quiet window elapsed; closing run with partial report"
            );
            events.push(self.event(
                QUIET_TIMEOUT_STAGE,
                now,
                EventPayload::PartialReport {
                    end_reason: EndReason::QuietTimeout,
                    reached: self.reached,
                },
            ));
            self.reset();
        }
    }

    fn start_condition(
        &self,
        stage: StageName,
        reference: Option<f64>,
        tick: &Tick,
    ) -> Result<bool> {
        let Some(snapshot) = tick.zone(stage.zone()) else {
            return Ok(false);
        };
        if !snapshot.valid {
            return Ok(false);
        }
        ensure_finite(stage, snapshot)?;

        let jump = reference
            .is_some_and(|sp_ref| (snapshot.sp_active - sp_ref).abs() >= self.config.s_min_f);
        let ramping = snapshot.temperature >= snapshot.sp_active + self.config.delta_ramp_f;
        Ok(jump || ramping)
    }

    fn start_stage(
        &mut self,
        stage: StageName,
        tick: &Tick,
        events: &mut Vec<FsmEvent>,
    ) -> Result<()> {
        let snapshot = tick.zone(stage.zone()).ok_or_else(|| {
            Error::Processing(format!("zone {} vanished while starting", stage.zone()))
        })?;
        let now = tick.timestamp;
        let run_id = self
            .run_id
            .get_or_insert_with(|| new_run_id(now))
            .clone();

        self.stats[stage.index()].reset();
        self.state = FsmState::Stage(stage, Phase::Ramp);
        self.stage_entered_at = Some(now);
        self.sp_ref = Some(snapshot.sp_active);
        self.quiet_started_at = None;
        self.last_status = None;

        info!(
            line_id = %self.line_id,
            %run_id,
            %stage,
            sp_ref = snapshot.sp_active,
            "stage started"
        );
        events.push(self.event(
            stage.as_str(),
            now,
            EventPayload::StageStart {
                sp_ref: snapshot.sp_active,
            },
        ));
        Ok(())
    }

    fn finish_stage(
        &mut self,
        stage: StageDescriptor,
        status: StageStatus,
        reason: Option<String>,
        tick: &Tick,
        events: &mut Vec<FsmEvent>,
    ) {
        let now = tick.timestamp;
        let name = stage.name;
        let stats = &self.stats[name.index()];
        let sp_end = tick
            .zone(name.zone())
            .filter(|s| s.valid && s.sp_active.is_finite())
            .map(|s| s.sp_active)
            .or(self.sp_ref);
        let record = StageRecord {
            stage: name,
            started_at: self.stage_entered_at.unwrap_or(now),
            ended_at: now,
            sp_start: self.sp_ref,
            sp_end,
            t_min: stats.min(),
            t_max: stats.max(),
            t_mean: stats.mean(),
            t_std: stats.std_dev(),
            samples: stats.count(),
            status,
        };

        self.reached.mark(name);
        self.last_status = Some(status);
        self.state = FsmState::Stage(name, Phase::End);
        self.stage_entered_at = None;
        self.quiet_started_at = None;
        self.sp_ref = stage.next.and_then(|next| watched_setpoint(tick, next));

        if status == StageStatus::Normal {
            info!(line_id = %self.line_id, stage = %name, samples = record.samples, "stage ended");
        } else {
            warn!(
                line_id = %self.line_id,
                stage = %name,
                status = status.as_str(),
                reason = ?reason,
                "stage ended abnormally"
            );
        }
        events.push(self.event(
            name.as_str(),
            now,
            EventPayload::StageEnd { record, reason },
        ));
    }

    fn exceeded_limit(
        &self,
        phase: Phase,
        entered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<&'static str> {
        let elapsed = elapsed_secs(entered_at, now);
        if phase == Phase::Ramp && elapsed > self.config.max_ramp_s {
            Some("max_ramp_s")
        } else if elapsed > self.config.max_stage_s {
            Some("max_stage_s")
        } else {
            None
        }
    }

    fn require_run_id(&self) -> Result<&str> {
        self.run_id
            .as_deref()
            .ok_or_else(|| Error::InvalidState(format!("{} has no run id", self.state)))
    }

    fn event(&self, stage: &str, timestamp: DateTime<Utc>, payload: EventPayload) -> FsmEvent {
        FsmEvent {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            timestamp,
            payload,
        }
    }
}

/// Setpoint of the zone a waiting machine watches, used to re-arm `sp_ref`.
fn watched_setpoint(tick: &Tick, stage: StageName) -> Option<f64> {
    tick.zone(stage.zone())
        .filter(|s| s.valid && s.sp_active.is_finite())
        .map(|s| s.sp_active)
}

fn ensure_finite(stage: StageName, snapshot: &ZoneSnapshot) -> Result<()> {
    if snapshot.is_finite() {
        Ok(())
    } else {
        Err(Error::Processing(format!(
            "non-finite reading for zone {} (T={}, SP={})",
            stage.zone(),
            snapshot.temperature,
            snapshot.sp_active
        )))
    }
}

fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds() as f64 / 1000.0
}

fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("RUN_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}
