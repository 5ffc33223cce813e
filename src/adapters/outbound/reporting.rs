use std::{fs, path::PathBuf, thread};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::{domain::RunRecord, ports::ReportTrigger};

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    generated_at: DateTime<Utc>,
    complete: bool,
    run: &'a RunRecord,
}

/// Writes `<dir>/<run_id>.json` for every closed run on a detached thread.
#[derive(Debug, Clone)]
pub struct JsonReportTrigger {
    dir: PathBuf,
}

impl JsonReportTrigger {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn report_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn write(&self, run: &RunRecord) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let report = RunReport {
            generated_at: Utc::now(),
            complete: run.reached.all(),
            run,
        };
        let path = self.report_path(&run.run_id);
        fs::write(&path, serde_json::to_vec_pretty(&report)?)?;
        Ok(path)
    }
}

impl ReportTrigger for JsonReportTrigger {
    fn notify(&self, run: &RunRecord) {
        let trigger = self.clone();
        let run = run.clone();
        let spawned = thread::Builder::new()
            .name("report-writer".into())
            .spawn(move || match trigger.write(&run) {
                Ok(path) => {
                    info!(run_id = %run.run_id, path = %path.display(), "run report written")
                }
                Err(err) => warn!(run_id = %run.run_id, error = %err, "run report failed"),
            });
        if let Err(err) = spawned {
            warn!(error = %err, "could not start report writer");
        }
    }
}

/// Drops every notification. Used by dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReportTrigger;

impl ReportTrigger for NoopReportTrigger {
    fn notify(&self, run: &RunRecord) {
        debug!(run_id = %run.run_id, "report trigger disabled");
    }
}
