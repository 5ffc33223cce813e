use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use vulcan_sentinel::{
    adapters::MemoryStore,
    application::{LinePipeline, LinePorts, PipelineSettings},
    core::{
        FsmConfig,
        domain::{EndReason, RunRecord, StageName, StageStatus, ZoneSnapshot},
        error::Result as CoreResult,
        ports::{Clock, EventLog, ReportTrigger, RunStore, ZoneSource},
    },
};

/// Shared simulated time. Only the sampler asks for `now`, once per tick,
/// so every tick lands exactly two seconds after the previous one.
#[derive(Clone)]
struct TickClock {
    origin: DateTime<Utc>,
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TickClock {
    fn new() -> Self {
        let origin = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
        Self {
            origin,
            now: Arc::new(Mutex::new(origin)),
        }
    }

    fn elapsed(&self) -> i64 {
        (*self.now.lock().unwrap() - self.origin).num_seconds()
    }
}

impl Clock for TickClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock().unwrap();
        *now += ChronoDuration::seconds(2);
        *now
    }
}

/// Piecewise readings for one full preheat, main and rib cycle, after which
/// every zone settles back to its idle setpoint.
struct ScriptedSource {
    clock: TickClock,
}

impl ScriptedSource {
    fn reading(zone: &str, elapsed: i64) -> Option<(f64, f64)> {
        if elapsed >= 302 {
            return Self::known(zone).then_some((80.0, 100.0));
        }
        let reading = match zone {
            "preheat" => match elapsed {
                ..20 => (80.0, 100.0),
                20..60 => (150.0, 300.0),
                60..100 => (300.0, 300.0),
                _ => (200.0, 300.0),
            },
            "main_heat" => match elapsed {
                ..110 => (80.0, 100.0),
                110..150 => (250.0, 400.0),
                150..200 => (400.0, 400.0),
                _ => (200.0, 400.0),
            },
            "rib_heat" => match elapsed {
                ..210 => (80.0, 100.0),
                210..250 => (200.0, 350.0),
                250..300 => (350.0, 350.0),
                _ => (150.0, 350.0),
            },
            _ => return None,
        };
        Some(reading)
    }

    fn known(zone: &str) -> bool {
        matches!(zone, "preheat" | "main_heat" | "rib_heat")
    }
}

impl ZoneSource for ScriptedSource {
    fn read(&self, zone: &str) -> CoreResult<Option<ZoneSnapshot>> {
        let elapsed = self.clock.elapsed();
        let at = self.clock.origin + ChronoDuration::seconds(elapsed);
        Ok(Self::reading(zone, elapsed).map(|(t, sp)| ZoneSnapshot::reading(t, sp, at)))
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

fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn threaded_pipeline_records_a_complete_run() -> Result<()> {
    let clock = TickClock::new();
    let store = Arc::new(MemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    let ports = LinePorts {
        source: Arc::new(ScriptedSource {
            clock: clock.clone(),
        }),
        configs: store.clone(),
        runs: store.clone(),
        checkpoints: store.clone(),
        events: store.clone(),
        reports: trigger.clone(),
        clock: Arc::new(clock.clone()),
    };
    let seed = FsmConfig {
        sampling_period_s: 0.005,
        ..FsmConfig::default()
    };
    let settings = PipelineSettings {
        queue_capacity: 500,
        worker_poll: Duration::from_millis(20),
        join_timeout: Duration::from_secs(5),
    };

    let zones = vec![
        "preheat".to_string(),
        "main_heat".to_string(),
        "rib_heat".to_string(),
    ];
    let mut pipeline = LinePipeline::start("Line-07", zones, &seed, ports, settings)?;
    let reported = wait_for(Duration::from_secs(20), || {
        !trigger.runs.lock().unwrap().is_empty()
    });
    let stats = pipeline.stop();
    assert!(reported, "run report triggered");
    assert!(!pipeline.is_running());
    assert_eq!(stats.ticks_evicted, 0);
    assert_eq!(stats.ticks_dropped, 0);

    let runs = store.list_runs("Line-07", 5)?;
    assert_eq!(runs.len(), 1, "exactly one run recorded");
    let run = &runs[0];
    assert_eq!(run.end_reason, Some(EndReason::Normal));
    assert!(run.reached.all());
    let stages: Vec<StageName> = run.stages.iter().map(|s| s.stage).collect();
    assert_eq!(
        stages,
        vec![StageName::Preheat, StageName::Main, StageName::Rib]
    );
    for stage in &run.stages {
        assert_eq!(stage.status, StageStatus::Normal);
        assert!(stage.samples > 0);
        assert!(stage.ended_at > stage.started_at);
    }
    assert_eq!(run.stages[1].sp_start, Some(400.0));

    let reported_runs = trigger.runs.lock().unwrap();
    assert_eq!(reported_runs.len(), 1, "report triggered once");
    assert_eq!(reported_runs[0].run_id, run.run_id);

    let kinds: Vec<String> = store
        .recent(100)?
        .into_iter()
        .rev()
        .map(|entry| entry.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            "STAGE_START",
            "STAGE_STABLE",
            "STAGE_END",
            "STAGE_START",
            "STAGE_STABLE",
            "STAGE_END",
            "STAGE_START",
            "STAGE_STABLE",
            "STAGE_END",
            "FULL_REPORT",
        ]
    );
    Ok(())
}
