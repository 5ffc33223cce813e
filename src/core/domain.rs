use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::Error;

/// One zone's reading at one sampling instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub temperature: f64,
    pub sp_active: f64,
    pub sp_cmd: f64,
    pub sp_idle: f64,
    pub valid: bool,
    pub captured_at: DateTime<Utc>,
}

impl ZoneSnapshot {
    /// Snapshot whose commanded and idle setpoints mirror the active one.
    pub fn reading(temperature: f64, sp_active: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            temperature,
            sp_active,
            sp_cmd: sp_active,
            sp_idle: sp_active,
            valid: true,
            captured_at,
        }
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    pub fn is_finite(&self) -> bool {
        self.temperature.is_finite() && self.sp_active.is_finite()
    }
}

/// All zone snapshots captured during one sampling period. Zones without a
/// reading are absent from the map.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub zones: BTreeMap<String, ZoneSnapshot>,
}

impl Tick {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            zones: BTreeMap::new(),
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>, snapshot: ZoneSnapshot) -> Self {
        self.zones.insert(zone.into(), snapshot);
        self
    }

    pub fn insert(&mut self, zone: impl Into<String>, snapshot: ZoneSnapshot) {
        self.zones.insert(zone.into(), snapshot);
    }

    pub fn zone(&self, name: &str) -> Option<&ZoneSnapshot> {
        self.zones.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Preheat,
    Main,
    Rib,
}

impl StageName {
    pub const ALL: [StageName; 3] = [StageName::Preheat, StageName::Main, StageName::Rib];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Preheat => "preheat",
            StageName::Main => "main",
            StageName::Rib => "rib",
        }
    }

    /// Name of the heating zone whose sensor drives this stage.
    pub fn zone(self) -> &'static str {
        match self {
            StageName::Preheat => "preheat",
            StageName::Main => "main_heat",
            StageName::Rib => "rib_heat",
        }
    }

    pub fn index(self) -> usize {
        match self {
            StageName::Preheat => 0,
            StageName::Main => 1,
            StageName::Rib => 2,
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "preheat" => Some(StageName::Preheat),
            "main" | "main_heat" => Some(StageName::Main),
            "rib" | "rib_heat" => Some(StageName::Rib),
            _ => None,
        }
    }

    pub fn from_zone(zone: &str) -> Option<Self> {
        StageName::ALL.into_iter().find(|stage| stage.zone() == zone)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Ramp,
    Stable,
    End,
}

impl Phase {
    fn suffix(self) -> &'static str {
        match self {
            Phase::Ramp => "RAMP",
            Phase::Stable => "STABLE",
            Phase::End => "END",
        }
    }
}

/// Position of a line in the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FsmState {
    #[default]
    Idle,
    Stage(StageName, Phase),
}

impl FsmState {
    /// The stage currently accumulating samples (RAMP or STABLE).
    pub fn active_stage(self) -> Option<StageName> {
        match self {
            FsmState::Stage(stage, Phase::Ramp | Phase::Stable) => Some(stage),
            _ => None,
        }
    }

    pub fn stage(self) -> Option<StageName> {
        match self {
            FsmState::Idle => None,
            FsmState::Stage(stage, _) => Some(stage),
        }
    }

    pub fn all() -> Vec<FsmState> {
        let mut states = vec![FsmState::Idle];
        for stage in StageName::ALL {
            for phase in [Phase::Ramp, Phase::Stable, Phase::End] {
                states.push(FsmState::Stage(stage, phase));
            }
        }
        states
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsmState::Idle => f.write_str("IDLE"),
            FsmState::Stage(stage, phase) => write!(f, "{}_{}", stage.as_str(), phase.suffix()),
        }
    }
}

impl FromStr for FsmState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("IDLE") {
            return Ok(FsmState::Idle);
        }
        let invalid = || Error::InvalidState(format!("unknown FSM state '{s}'"));
        let (stage, phase) = s.rsplit_once('_').ok_or_else(invalid)?;
        let stage = StageName::from_name(&stage.to_ascii_lowercase()).ok_or_else(invalid)?;
        let phase = match phase.to_ascii_uppercase().as_str() {
            "RAMP" => Phase::Ramp,
            "STABLE" => Phase::Stable,
            "END" => Phase::End,
            _ => return Err(invalid()),
        };
        Ok(FsmState::Stage(stage, phase))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Normal,
    Fault,
    Timeout,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Normal => "normal",
            StageStatus::Fault => "fault",
            StageStatus::Timeout => "timeout",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(StageStatus::Normal),
            "fault" => Some(StageStatus::Fault),
            "timeout" => Some(StageStatus::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Normal,
    Fault,
    Timeout,
    QuietTimeout,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Normal => "normal",
            EndReason::Fault => "fault",
            EndReason::Timeout => "timeout",
            EndReason::QuietTimeout => "quiet_timeout",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(EndReason::Normal),
            "fault" => Some(EndReason::Fault),
            "timeout" => Some(EndReason::Timeout),
            "quiet_timeout" => Some(EndReason::QuietTimeout),
            _ => None,
        }
    }
}

impl From<StageStatus> for EndReason {
    fn from(value: StageStatus) -> Self {
        match value {
            StageStatus::Normal => EndReason::Normal,
            StageStatus::Fault => EndReason::Fault,
            StageStatus::Timeout => EndReason::Timeout,
        }
    }
}

/// Which stages were recorded during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReachedFlags {
    pub preheat_ok: bool,
    pub main_ok: bool,
    pub rib_ok: bool,
}

impl ReachedFlags {
    pub fn mark(&mut self, stage: StageName) {
        match stage {
            StageName::Preheat => self.preheat_ok = true,
            StageName::Main => self.main_ok = true,
            StageName::Rib => self.rib_ok = true,
        }
    }

    pub fn contains(&self, stage: StageName) -> bool {
        match stage {
            StageName::Preheat => self.preheat_ok,
            StageName::Main => self.main_ok,
            StageName::Rib => self.rib_ok,
        }
    }

    pub fn union(self, other: ReachedFlags) -> ReachedFlags {
        ReachedFlags {
            preheat_ok: self.preheat_ok || other.preheat_ok,
            main_ok: self.main_ok || other.main_ok,
            rib_ok: self.rib_ok || other.rib_ok,
        }
    }

    pub fn all(&self) -> bool {
        StageName::ALL.iter().all(|stage| self.contains(*stage))
    }
}

/// Finalized summary of one completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageName,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub sp_start: Option<f64>,
    pub sp_end: Option<f64>,
    pub t_min: Option<f64>,
    pub t_max: Option<f64>,
    pub t_mean: f64,
    pub t_std: f64,
    pub samples: u64,
    pub status: StageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub line_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub reached: ReachedFlags,
    pub stages: Vec<StageRecord>,
}

impl RunRecord {
    pub fn open(
        run_id: impl Into<String>,
        line_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            line_id: line_id.into(),
            started_at,
            ended_at: None,
            end_reason: None,
            reached: ReachedFlags::default(),
            stages: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Durable per-line checkpoint used for warm restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeState {
    pub state: FsmState,
    pub stage: Option<StageName>,
    pub run_id: Option<String>,
    pub stage_entered_at: Option<DateTime<Utc>>,
    pub sp_ref: Option<f64>,
    pub config_version: i64,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeState {
    pub fn idle(config_version: i64, updated_at: DateTime<Utc>) -> Self {
        Self {
            state: FsmState::Idle,
            stage: None,
            run_id: None,
            stage_entered_at: None,
            sp_ref: None,
            config_version,
            updated_at,
        }
    }

    /// A stage state needs a run, and RAMP/STABLE also need an entry time.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            FsmState::Idle => true,
            FsmState::Stage(stage, phase) => {
                self.run_id.is_some()
                    && self.stage.is_none_or(|recorded| recorded == stage)
                    && (phase == Phase::End || self.stage_entered_at.is_some())
            }
        }
    }
}

/// Kind-specific data carried by an [`FsmEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    StageStart { sp_ref: f64 },
    StageStable,
    StageEnd {
        record: StageRecord,
        reason: Option<String>,
    },
    FullReport {
        end_reason: EndReason,
        reached: ReachedFlags,
    },
    PartialReport {
        end_reason: EndReason,
        reached: ReachedFlags,
    },
    Error { detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FsmEvent {
    pub run_id: Option<String>,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl FsmEvent {
    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::StageStart { .. } => "STAGE_START",
            EventPayload::StageStable => "STAGE_STABLE",
            EventPayload::StageEnd { .. } => "STAGE_END",
            EventPayload::FullReport { .. } => "FULL_REPORT",
            EventPayload::PartialReport { .. } => "PARTIAL_REPORT",
            EventPayload::Error { .. } => "FSM_ERROR",
        }
    }

    pub fn severity(&self) -> Severity {
        match &self.payload {
            EventPayload::StageEnd { record, .. } if record.status != StageStatus::Normal => {
                Severity::Warning
            }
            EventPayload::PartialReport { .. } => Severity::Warning,
            EventPayload::Error { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }

    /// Zone associated with the event's stage, if the label names a stage.
    pub fn zone(&self) -> Option<&'static str> {
        StageName::from_name(&self.stage).map(StageName::zone)
    }
}

impl fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run = self.run_id.as_deref().unwrap_or("unknown");
        match &self.payload {
            EventPayload::StageStart { sp_ref } => {
                write!(f, "{} started in run {run} (sp_ref {sp_ref:.1})", self.stage)
            }
            EventPayload::StageStable => write!(f, "{} stable in run {run}", self.stage),
            EventPayload::StageEnd { record, reason } => {
                write!(
                    f,
                    "{} ended {} in run {run} ({} samples)",
                    self.stage,
                    record.status.as_str(),
                    record.samples
                )?;
                if let Some(reason) = reason {
                    write!(f, ": {reason}")?;
                }
                Ok(())
            }
            EventPayload::FullReport { end_reason, .. } => {
                write!(f, "run {run} complete ({})", end_reason.as_str())
            }
            EventPayload::PartialReport { end_reason, reached } => write!(
                f,
                "run {run} closed partially ({}; preheat={} main={} rib={})",
                end_reason.as_str(),
                reached.preheat_ok,
                reached.main_ok,
                reached.rib_ok
            ),
            EventPayload::Error { detail } => write!(f, "FSM error in run {run}: {detail}"),
        }
    }
}

/// One row of the operator-facing event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub severity: Severity,
    pub zone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "INFO" => Some(Severity::Info),
            "WARNING" => Some(Severity::Warning),
            "ERROR" => Some(Severity::Error),
            _ => None,
        }
    }
}
