use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{config::DEFAULT_LINE, core::config::FsmConfig};

/// Vulcan Sentinel command line.
#[derive(Debug, Parser)]
#[command(name = "vulcan-sentinel")]
#[command(about = "Heating-stage detection for industrial lines", version)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Verbose console logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit console logs as JSON")]
    pub log_json: bool,

    #[arg(
        long,
        global = true,
        help = "Data directory (defaults to ~/.vulcan-sentinel or $VULCAN_HOME/.vulcan-sentinel)"
    )]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sample the configured lines and detect heating stages until stopped.
    Run(RunArgs),
    /// Show the checkpointed FSM state and open run of each line.
    Status(StatusArgs),
    /// List recent runs of a line with their stages.
    Runs(RunsArgs),
    /// Show the most recent entries of the event log.
    Events(EventsArgs),
    /// Inspect or update a line's versioned FSM parameters.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Force a line back to IDLE and close its open run.
    Reset(ResetArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct RunArgs {
    #[arg(long, help = "Path to the YAML configuration (built-in defaults if omitted)")]
    pub config: Option<PathBuf>,

    #[arg(long = "line", help = "Line to run; repeat for several (default: all configured)")]
    pub lines: Vec<String>,

    #[arg(long, help = "Stop after this many seconds instead of waiting for Ctrl-C")]
    pub duration_s: Option<u64>,

    #[arg(long, help = "Keep all state in memory and write no reports")]
    pub dry_run: bool,
}

#[derive(Debug, Args, Clone, Default)]
pub struct StatusArgs {
    #[arg(long, help = "Only show this line")]
    pub line: Option<String>,

    #[arg(long, help = "Emit JSON instead of text")]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct RunsArgs {
    #[arg(long, default_value = DEFAULT_LINE)]
    pub line: String,

    #[arg(long, default_value_t = 10, help = "Maximum number of runs to list")]
    pub limit: usize,

    #[arg(long, help = "Emit JSON instead of text")]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct EventsArgs {
    #[arg(long, default_value_t = 20, help = "Maximum number of events to list")]
    pub limit: usize,

    #[arg(long, help = "Emit JSON instead of text")]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the latest stored parameters of a line.
    Show(ConfigShowArgs),
    /// Store a new parameter version; unspecified values carry over.
    Set(ConfigSetArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ConfigShowArgs {
    #[arg(long, default_value = DEFAULT_LINE)]
    pub line: String,

    #[arg(long, help = "Emit JSON instead of text")]
    pub json: bool,
}

#[derive(Debug, Args, Clone, Default)]
pub struct ConfigSetArgs {
    #[arg(long, default_value = DEFAULT_LINE)]
    pub line: String,

    #[arg(long)]
    pub sampling_period_s: Option<f64>,
    #[arg(long)]
    pub tol_f: Option<f64>,
    #[arg(long)]
    pub delta_ramp_f: Option<f64>,
    #[arg(long)]
    pub s_min_f: Option<f64>,
    #[arg(long)]
    pub max_ramp_s: Option<f64>,
    #[arg(long)]
    pub max_stage_s: Option<f64>,
    #[arg(long)]
    pub quiet_window_s: Option<f64>,
    #[arg(long)]
    pub allow_main_without_preheat: Option<bool>,
    #[arg(long)]
    pub continue_after_fault_if_next_stage_ramps: Option<bool>,
}

impl ConfigSetArgs {
    pub fn is_empty(&self) -> bool {
        self.sampling_period_s.is_none()
            && self.tol_f.is_none()
            && self.delta_ramp_f.is_none()
            && self.s_min_f.is_none()
            && self.max_ramp_s.is_none()
            && self.max_stage_s.is_none()
            && self.quiet_window_s.is_none()
            && self.allow_main_without_preheat.is_none()
            && self.continue_after_fault_if_next_stage_ramps.is_none()
    }

    /// Overlay the given values on `base`.
    pub fn apply(&self, base: FsmConfig) -> FsmConfig {
        FsmConfig {
            sampling_period_s: self.sampling_period_s.unwrap_or(base.sampling_period_s),
            tol_f: self.tol_f.unwrap_or(base.tol_f),
            delta_ramp_f: self.delta_ramp_f.unwrap_or(base.delta_ramp_f),
            s_min_f: self.s_min_f.unwrap_or(base.s_min_f),
            max_ramp_s: self.max_ramp_s.unwrap_or(base.max_ramp_s),
            max_stage_s: self.max_stage_s.unwrap_or(base.max_stage_s),
            quiet_window_s: self.quiet_window_s.unwrap_or(base.quiet_window_s),
            allow_main_without_preheat: self
                .allow_main_without_preheat
                .unwrap_or(base.allow_main_without_preheat),
            continue_after_fault_if_next_stage_ramps: self
                .continue_after_fault_if_next_stage_ramps
                .unwrap_or(base.continue_after_fault_if_next_stage_ramps),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ResetArgs {
    #[arg(long, default_value = DEFAULT_LINE)]
    pub line: String,
}
