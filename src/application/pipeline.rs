//! Per-line sampler and worker threads joined by a bounded queue.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    application::{
        LinePorts,
        queue::{PushOutcome, SampleQueue},
        sampler::Sampler,
        worker::StageWorker,
    },
    core::{
        config::{FsmConfig, VersionedConfig},
        error::{Error, Result},
    },
};

#[derive(Debug, Default)]
pub struct PipelineStats {
    ticks_sampled: AtomicU64,
    ticks_evicted: AtomicU64,
    ticks_dropped: AtomicU64,
    ticks_processed: AtomicU64,
    events_emitted: AtomicU64,
    checkpoint_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PipelineStatsSnapshot {
    pub ticks_sampled: u64,
    pub ticks_evicted: u64,
    pub ticks_dropped: u64,
    pub ticks_processed: u64,
    pub events_emitted: u64,
    pub checkpoint_failures: u64,
}

impl PipelineStats {
    pub fn record_push(&self, outcome: PushOutcome) {
        self.ticks_sampled.fetch_add(1, Ordering::Relaxed);
        match outcome {
            PushOutcome::Enqueued => {}
            PushOutcome::EvictedOldest => {
                self.ticks_evicted.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Dropped => {
                self.ticks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_processed(&self, events: usize) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        self.events_emitted
            .fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_checkpoint_failure(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            ticks_sampled: self.ticks_sampled.load(Ordering::Relaxed),
            ticks_evicted: self.ticks_evicted.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub worker_poll: Duration,
    pub join_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 300,
            worker_poll: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Latest stored parameters for `line_id`, seeding the store with `seed` on
/// first use.
pub fn resolve_config(
    ports: &LinePorts,
    line_id: &str,
    seed: &FsmConfig,
) -> Result<VersionedConfig> {
    match ports.configs.get_latest(line_id)? {
        Some(stored) => {
            stored.config.validate()?;
            Ok(stored)
        }
        None => {
            let stored = ports.configs.append(line_id, seed)?;
            info!(line_id, version = stored.version, "seeded FSM configuration");
            Ok(stored)
        }
    }
}

pub struct LinePipeline {
    line_id: String,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    config_version: i64,
    join_timeout: Duration,
    sampler: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LinePipeline {
    pub fn start(
        line_id: &str,
        zones: Vec<String>,
        seed: &FsmConfig,
        ports: LinePorts,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let config = resolve_config(&ports, line_id, seed)?;
        let stats = Arc::new(PipelineStats::default());
        let queue = SampleQueue::bounded(settings.queue_capacity);
        let running = Arc::new(AtomicBool::new(true));

        let worker = StageWorker::bootstrap(line_id, &config, &ports, stats.clone())?;
        let sampler = Sampler::new(
            line_id,
            zones,
            ports.source.clone(),
            ports.clock.clone(),
            queue.clone(),
            stats.clone(),
            config.config.sampling_period(),
        );

        let mut pipeline = Self {
            line_id: line_id.to_string(),
            running: running.clone(),
            stats,
            config_version: config.version,
            join_timeout: settings.join_timeout,
            sampler: None,
            worker: None,
        };

        let worker_running = running.clone();
        let poll = settings.worker_poll;
        pipeline.worker = Some(spawn(format!("{line_id}-worker"), move || {
            worker.run(queue, worker_running, poll)
        })?);
        pipeline.sampler = Some(spawn(format!("{line_id}-sampler"), move || {
            sampler.run(running)
        })?);

        info!(
            line_id,
            config_version = config.version,
            queue_capacity = settings.queue_capacity,
            "line pipeline started"
        );
        Ok(pipeline)
    }

    pub fn line_id(&self) -> &str {
        &self.line_id
    }

    pub fn config_version(&self) -> i64 {
        self.config_version
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal both threads and wait for them, giving up after the join
    /// timeout. Threads still running at the deadline are detached.
    pub fn stop(&mut self) -> PipelineStatsSnapshot {
        self.running.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + self.join_timeout;
        for (role, handle) in [("sampler", self.sampler.take()), ("worker", self.worker.take())] {
            if let Some(handle) = handle {
                join_until(&self.line_id, role, handle, deadline);
            }
        }
        let stats = self.stats.snapshot();
        info!(line_id = %self.line_id, ?stats, "line pipeline stopped");
        stats
    }
}

impl Drop for LinePipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn spawn<F>(name: String, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|err| Error::System(format!("failed to spawn {name}: {err}")))
}

fn join_until(line_id: &str, role: &str, handle: JoinHandle<()>, deadline: Instant) {
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if !handle.is_finished() {
        warn!(line_id, role, "thread did not stop before join timeout; detaching");
        return;
    }
    if handle.join().is_err() {
        warn!(line_id, role, "thread panicked");
    }
}
