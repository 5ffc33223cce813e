//! The single consumer of a line's tick queue. Owns the state machine.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    application::{LinePorts, lifecycle::RunLifecycle, pipeline::PipelineStats, queue::SampleQueue},
    core::{
        config::VersionedConfig,
        domain::{FsmEvent, Tick},
        error::Result,
        fsm::StageMachine,
        ports::{CheckpointStore, EventLog},
    },
};

pub struct StageWorker {
    machine: StageMachine,
    lifecycle: RunLifecycle,
    checkpoints: Arc<dyn CheckpointStore>,
    event_log: Arc<dyn EventLog>,
    stats: Arc<PipelineStats>,
}

impl StageWorker {
    pub fn new(
        machine: StageMachine,
        lifecycle: RunLifecycle,
        checkpoints: Arc<dyn CheckpointStore>,
        event_log: Arc<dyn EventLog>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            machine,
            lifecycle,
            checkpoints,
            event_log,
            stats,
        }
    }

    /// Build a worker from the stored checkpoint and open run of `line_id`.
    /// Unreadable or inconsistent checkpoints fall back to IDLE. A restored
    /// machine picks up the reached stages and last stage status of the open
    /// run it belongs to.
    pub fn bootstrap(
        line_id: &str,
        config: &VersionedConfig,
        ports: &LinePorts,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let fresh = || StageMachine::new(line_id, config.config.clone(), config.version);
        let mut machine = match ports.checkpoints.get(line_id) {
            Ok(Some(checkpoint)) if checkpoint.is_consistent() => {
                if checkpoint.config_version != config.version {
                    info!(
                        line_id,
                        checkpoint_version = checkpoint.config_version,
                        config_version = config.version,
                        "configuration changed since last checkpoint"
                    );
                }
                StageMachine::restore(line_id, config.config.clone(), config.version, &checkpoint)
            }
            Ok(Some(checkpoint)) => {
                warn!(
                    line_id,
                    state = %checkpoint.state,
                    run_id = ?checkpoint.run_id,
                    "inconsistent checkpoint; starting in IDLE"
                );
                fresh()
            }
            Ok(None) => fresh(),
            Err(err) => {
                warn!(line_id, error = %err, "checkpoint unreadable; starting in IDLE");
                fresh()
            }
        };
        let lifecycle = RunLifecycle::resume(line_id, ports.runs.clone(), ports.reports.clone())?;
        if let Some(run) = lifecycle.open_run() {
            machine.resume_run(run);
        }
        Ok(Self::new(
            machine,
            lifecycle,
            ports.checkpoints.clone(),
            ports.events.clone(),
            stats,
        ))
    }

    pub fn machine(&self) -> &StageMachine {
        &self.machine
    }

    pub fn lifecycle(&self) -> &RunLifecycle {
        &self.lifecycle
    }

    /// Run one tick through the machine, persist what it produced and
    /// checkpoint the resulting state. Storage failures are logged, never
    /// propagated.
    pub fn process(&mut self, tick: &Tick) -> Vec<FsmEvent> {
        let events = self.machine.on_tick(tick);
        let line_id = self.machine.line_id();

        for event in &events {
            if let Err(err) = self.lifecycle.handle(event) {
                error!(line_id, kind = event.kind(), error = %err, "run bookkeeping failed");
            }
            let message = event.to_string();
            if let Err(err) =
                self.event_log
                    .log(event.kind(), &message, event.severity(), event.zone())
            {
                warn!(line_id, kind = event.kind(), error = %err, "event log write failed");
            }
        }

        let checkpoint = self.machine.runtime_state(tick.timestamp);
        if let Err(err) = self.checkpoints.put(line_id, &checkpoint) {
            self.stats.record_checkpoint_failure();
            error!(line_id, state = %checkpoint.state, error = %err, "checkpoint write failed");
        }
        self.stats.record_processed(events.len());
        events
    }

    pub fn run(mut self, queue: SampleQueue, running: Arc<AtomicBool>, poll: Duration) {
        info!(line_id = self.machine.line_id(), state = %self.machine.state(), "worker started");
        while running.load(Ordering::SeqCst) {
            if let Some(tick) = queue.recv_timeout(poll) {
                self.process(&tick);
            }
        }
        info!(line_id = self.machine.line_id(), state = %self.machine.state(), "worker stopped");
    }
}
