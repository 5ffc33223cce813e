//! Application layer: wires the state machine to its ports and runs each
//! line as a sampler/worker pair.

pub mod lifecycle;
pub mod pipeline;
pub mod queue;
pub mod sampler;
pub mod worker;

use std::sync::Arc;

use crate::core::ports::{
    CheckpointStore, Clock, ConfigStore, EventLog, ReportTrigger, RunStore, ZoneSource,
};

pub use lifecycle::RunLifecycle;
pub use pipeline::{LinePipeline, PipelineSettings, PipelineStats, PipelineStatsSnapshot};
pub use queue::{PushOutcome, SampleQueue};
pub use sampler::Sampler;
pub use worker::StageWorker;

/// Everything a line pipeline talks to.
#[derive(Clone)]
pub struct LinePorts {
    pub source: Arc<dyn ZoneSource>,
    pub configs: Arc<dyn ConfigStore>,
    pub runs: Arc<dyn RunStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub events: Arc<dyn EventLog>,
    pub reports: Arc<dyn ReportTrigger>,
    pub clock: Arc<dyn Clock>,
}
