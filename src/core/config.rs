use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Detection parameters for one line. Stored as append-only versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsmConfig {
    pub sampling_period_s: f64,
    /// Half-width of the "in band" window around the active setpoint (°F).
    #[serde(alias = "Tol_F")]
    pub tol_f: f64,
    /// Temperature above setpoint that counts as an already-ramping zone (°F).
    #[serde(alias = "DeltaRamp_F")]
    pub delta_ramp_f: f64,
    /// Minimum setpoint change treated as a jump (°F).
    #[serde(alias = "S_min_F")]
    pub s_min_f: f64,
    #[serde(alias = "Max_ramp_s")]
    pub max_ramp_s: f64,
    #[serde(alias = "Max_stage_s")]
    pub max_stage_s: f64,
    pub quiet_window_s: f64,
    pub allow_main_without_preheat: bool,
    pub continue_after_fault_if_next_stage_ramps: bool,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            sampling_period_s: 2.0,
            tol_f: 8.0,
            delta_ramp_f: 20.0,
            s_min_f: 20.0,
            max_ramp_s: 900.0,
            max_stage_s: 7200.0,
            quiet_window_s: 720.0,
            allow_main_without_preheat: true,
            continue_after_fault_if_next_stage_ramps: true,
        }
    }
}

impl FsmConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sampling_period_s", self.sampling_period_s),
            ("tol_f", self.tol_f),
            ("s_min_f", self.s_min_f),
            ("max_ramp_s", self.max_ramp_s),
            ("max_stage_s", self.max_stage_s),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::Config(format!("{name} must be > 0 (got {value})")));
            }
        }
        if !(self.delta_ramp_f.is_finite() && self.delta_ramp_f >= 0.0) {
            return Err(Error::Config(format!(
                "delta_ramp_f must be >= 0 (got {})",
                self.delta_ramp_f
            )));
        }
        if !(self.quiet_window_s.is_finite() && self.quiet_window_s >= 0.0) {
            return Err(Error::Config(format!(
                "quiet_window_s must be >= 0 (got {})",
                self.quiet_window_s
            )));
        }
        Ok(())
    }

    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs_f64(self.sampling_period_s)
    }
}

/// One stored version of a line's [`FsmConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedConfig {
    pub line_id: String,
    pub version: i64,
    pub config: FsmConfig,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_legacy_parameter_names() {
        let json = r#"{"Tol_F": 5, "S_min_F": 30, "Max_ramp_s": 60, "quiet_window_s": 10}"#;
        let config: FsmConfig = serde_json::from_str(json).expect("legacy keys parse");
        assert_eq!(config.tol_f, 5.0);
        assert_eq!(config.s_min_f, 30.0);
        assert_eq!(config.max_ramp_s, 60.0);
        assert_eq!(config.quiet_window_s, 10.0);
        assert_eq!(config.delta_ramp_f, 20.0, "unspecified keys keep defaults");
    }

    #[test]
    fn rejects_non_positive_tolerance() {
        let config = FsmConfig {
            tol_f: 0.0,
            ..FsmConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tol_f"));
    }
}
