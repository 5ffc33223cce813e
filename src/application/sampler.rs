use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    application::{
        pipeline::PipelineStats,
        queue::{PushOutcome, SampleQueue},
    },
    core::{
        domain::Tick,
        ports::{Clock, ZoneSource},
    },
};

const STOP_POLL: Duration = Duration::from_millis(50);

/// Reads every enabled zone once per sampling period and queues the result.
pub struct Sampler {
    line_id: String,
    zones: Vec<String>,
    source: Arc<dyn ZoneSource>,
    clock: Arc<dyn Clock>,
    queue: SampleQueue,
    stats: Arc<PipelineStats>,
    period: Duration,
}

impl Sampler {
    pub fn new(
        line_id: impl Into<String>,
        zones: Vec<String>,
        source: Arc<dyn ZoneSource>,
        clock: Arc<dyn Clock>,
        queue: SampleQueue,
        stats: Arc<PipelineStats>,
        period: Duration,
    ) -> Self {
        Self {
            line_id: line_id.into(),
            zones,
            source,
            clock,
            queue,
            stats,
            period,
        }
    }

    /// Capture one tick. Zones that fail to read or report nothing are left
    /// out of the tick.
    pub fn sample(&self) -> Tick {
        let mut tick = Tick::new(self.clock.now());
        for zone in &self.zones {
            match self.source.read(zone) {
                Ok(Some(snapshot)) => tick.insert(zone.as_str(), snapshot),
                Ok(None) => debug!(line_id = %self.line_id, zone, "no reading"),
                Err(err) => warn!(line_id = %self.line_id, zone, error = %err, "zone read failed"),
            }
        }
        tick
    }

    /// Sample and enqueue. Empty ticks are queued too so the machine keeps
    /// evaluating its timers.
    pub fn sample_once(&self) -> PushOutcome {
        let outcome = self.queue.push(self.sample());
        self.stats.record_push(outcome);
        outcome
    }

    pub fn run(self, running: Arc<AtomicBool>) {
        info!(
            line_id = %self.line_id,
            zones = ?self.zones,
            period_ms = self.period.as_millis() as u64,
            "sampler started"
        );
        while running.load(Ordering::SeqCst) {
            self.sample_once();
            pause(self.period, &running);
        }
        info!(line_id = %self.line_id, "sampler stopped");
    }
}

/// Sleep for `period`, waking early once `running` is cleared.
fn pause(period: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + period;
    loop {
        let now = Instant::now();
        if now >= deadline || !running.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}
