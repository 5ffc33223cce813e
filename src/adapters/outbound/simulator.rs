//! Deterministic stand-in for the plant's zone controllers.
//!
//! Each cycle idles for `lead_in_s`, then runs preheat, main and rib back to
//! back. A stage raises its setpoint, ramps linearly for `ramp_s`, holds for
//! `hold_s`, drops its setpoint and cools back to idle over `cool_s`. Stages
//! are separated by `gap_s`; cycles by `cycle_pause_s`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    domain::{StageName, ZoneSnapshot},
    error::{Error, Result},
    ports::{Clock, ZoneSource},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationProfile {
    pub idle_f: f64,
    pub lead_in_s: f64,
    pub ramp_s: f64,
    pub hold_s: f64,
    pub cool_s: f64,
    pub gap_s: f64,
    pub cycle_pause_s: f64,
    pub preheat_sp_f: f64,
    pub main_sp_f: f64,
    pub rib_sp_f: f64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            idle_f: 75.0,
            lead_in_s: 10.0,
            ramp_s: 60.0,
            hold_s: 120.0,
            cool_s: 4.0,
            gap_s: 30.0,
            cycle_pause_s: 120.0,
            preheat_sp_f: 300.0,
            main_sp_f: 400.0,
            rib_sp_f: 350.0,
        }
    }
}

impl SimulationProfile {
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("ramp_s", self.ramp_s),
            ("hold_s", self.hold_s),
            ("cool_s", self.cool_s),
        ];
        for (name, value) in durations {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::Config(format!("simulation.{name} must be > 0")));
            }
        }
        if self.gap_s < self.cool_s {
            return Err(Error::Config("simulation.gap_s must be >= cool_s".into()));
        }
        if self.lead_in_s < 0.0 || self.cycle_pause_s < 0.0 {
            return Err(Error::Config(
                "simulation lead-in and pause must be >= 0".into(),
            ));
        }
        Ok(())
    }

    fn setpoint(&self, stage: StageName) -> f64 {
        match stage {
            StageName::Preheat => self.preheat_sp_f,
            StageName::Main => self.main_sp_f,
            StageName::Rib => self.rib_sp_f,
        }
    }

    fn slot(&self) -> f64 {
        self.ramp_s + self.hold_s + self.gap_s
    }

    fn cycle(&self) -> f64 {
        self.lead_in_s + 3.0 * self.slot() + self.cycle_pause_s
    }

    /// `(temperature, active setpoint)` of `stage` at `offset` seconds into
    /// the cycle.
    pub fn reading_at(&self, stage: StageName, offset: f64) -> (f64, f64) {
        let idle = self.idle_f;
        let target = self.setpoint(stage);
        let t = offset - (self.lead_in_s + stage.index() as f64 * self.slot());
        let heated_until = self.ramp_s + self.hold_s;

        if t < 0.0 {
            (idle, idle)
        } else if t < self.ramp_s {
            (idle + (target - idle) * t / self.ramp_s, target)
        } else if t < heated_until {
            (target, target)
        } else if t < heated_until + self.cool_s {
            let cooled = (t - heated_until) / self.cool_s;
            (target - (target - idle) * cooled, idle)
        } else {
            (idle, idle)
        }
    }
}

pub struct SimulatedZoneSource {
    profile: SimulationProfile,
    clock: Arc<dyn Clock>,
    origin: DateTime<Utc>,
}

impl SimulatedZoneSource {
    pub fn new(profile: SimulationProfile, clock: Arc<dyn Clock>) -> Self {
        let origin = clock.now();
        Self {
            profile,
            clock,
            origin,
        }
    }
}

impl ZoneSource for SimulatedZoneSource {
    fn read(&self, zone: &str) -> Result<Option<ZoneSnapshot>> {
        let Some(stage) = StageName::from_zone(zone) else {
            return Ok(None);
        };
        let now = self.clock.now();
        let elapsed = (now - self.origin).num_milliseconds() as f64 / 1000.0;
        let offset = elapsed.max(0.0) % self.profile.cycle();
        let (temperature, sp_active) = self.profile.reading_at(stage, offset);
        Ok(Some(ZoneSnapshot {
            temperature,
            sp_active,
            sp_cmd: sp_active,
            sp_idle: self.profile.idle_f,
            valid: true,
            captured_at: now,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        config::FsmConfig,
        domain::{EventPayload, Tick},
        fsm::StageMachine,
    };

    #[test]
    fn stage_profile_ramps_holds_and_cools() {
        let profile = SimulationProfile::default();
        assert_eq!(profile.reading_at(StageName::Preheat, 0.0), (75.0, 75.0));
        assert_eq!(profile.reading_at(StageName::Preheat, 40.0), (187.5, 300.0));
        assert_eq!(profile.reading_at(StageName::Preheat, 100.0), (300.0, 300.0));
        assert_eq!(profile.reading_at(StageName::Preheat, 192.0), (187.5, 75.0));
        assert_eq!(profile.reading_at(StageName::Main, 100.0), (75.0, 75.0));
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn unknown_zone_has_no_reading() {
        let source = SimulatedZoneSource::new(
            SimulationProfile::default(),
            Arc::new(crate::adapters::outbound::clock::SystemClock::new()),
        );
        assert!(source.read("cooling_tunnel").unwrap().is_none());
        assert!(source.read("rib_heat").unwrap().is_some());
    }

    #[test]
    fn machine_detects_one_full_cycle() {
        let profile = SimulationProfile::default();
        let config = FsmConfig::default();
        let mut machine = StageMachine::new("SIM", config, 1);
        let origin = DateTime::<Utc>::UNIX_EPOCH;

        let mut kinds = Vec::new();
        let mut offset = 0.0;
        while offset < profile.cycle() {
            let timestamp = origin + chrono::Duration::milliseconds((offset * 1000.0) as i64);
            let mut tick = Tick::new(timestamp);
            for stage in StageName::ALL {
                let (t, sp) = profile.reading_at(stage, offset);
                tick.insert(stage.zone(), ZoneSnapshot::reading(t, sp, timestamp));
            }
            for event in machine.on_tick(&tick) {
                if let EventPayload::FullReport { reached, .. } = &event.payload {
                    assert!(reached.all());
                }
                kinds.push(event.kind());
            }
            offset += 2.0;
        }

        assert_eq!(kinds.iter().filter(|k| **k == "STAGE_START").count(), 3);
        assert_eq!(kinds.iter().filter(|k| **k == "STAGE_STABLE").count(), 3);
        assert_eq!(kinds.iter().filter(|k| **k == "STAGE_END").count(), 3);
        assert_eq!(kinds.last(), Some(&"FULL_REPORT"));
    }
}
