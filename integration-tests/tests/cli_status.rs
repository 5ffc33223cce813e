use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use chrono::{DateTime, Duration, TimeZone, Utc};
use predicates::prelude::*;
use tempfile::tempdir;
use vulcan_sentinel::{
    adapters::SqliteStore,
    core::{
        FsmConfig,
        domain::{
            EndReason, FsmState, Phase, ReachedFlags, RuntimeState, Severity, StageName,
            StageRecord, StageStatus,
        },
        ports::{CheckpointStore, ConfigStore, EventLog, RunStore},
    },
    status_export::{EventListExport, RunListExport, StatusExport},
};

fn sentinel(home: &Path) -> Command {
    let mut cmd = Command::new("cargo");
    cmd.arg("run")
        .arg("--quiet")
        .arg("-p")
        .arg("vulcan-sentinel")
        .arg("--bin")
        .arg("vulcan-sentinel")
        .arg("--")
        .env("VULCAN_HOME", home)
        .env("NO_COLOR", "1");
    cmd
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
}

fn stage(stage: StageName, start: i64, end: i64, sp: f64) -> StageRecord {
    StageRecord {
        stage,
        started_at: at(start),
        ended_at: at(end),
        sp_start: Some(sp),
        sp_end: Some(sp),
        t_min: Some(sp - 40.0),
        t_max: Some(sp + 2.0),
        t_mean: sp - 5.0,
        t_std: 3.5,
        samples: ((end - start) / 2) as u64,
        status: StageStatus::Normal,
    }
}

/// One completed run, one open run in `main_RAMP`, and a few log entries.
fn seed_line(home: &Path) -> Result<SqliteStore> {
    let store = SqliteStore::open(Some(home.join(".vulcan-sentinel")))?;
    store.append("Line-07", &FsmConfig::default())?;

    store.create_run("RUN_DONE", "Line-07", at(0))?;
    store.add_stage("RUN_DONE", &stage(StageName::Preheat, 0, 600, 300.0))?;
    store.add_stage("RUN_DONE", &stage(StageName::Main, 620, 1800, 400.0))?;
    store.add_stage("RUN_DONE", &stage(StageName::Rib, 1820, 2400, 350.0))?;
    store.end_run(
        "RUN_DONE",
        at(2402),
        EndReason::Normal,
        ReachedFlags {
            preheat_ok: true,
            main_ok: true,
            rib_ok: true,
        },
    )?;

    store.create_run("RUN_OPEN", "Line-07", at(5000))?;
    store.add_stage("RUN_OPEN", &stage(StageName::Preheat, 5000, 5600, 300.0))?;
    store.put(
        "Line-07",
        &RuntimeState {
            state: FsmState::Stage(StageName::Main, Phase::Ramp),
            stage: Some(StageName::Main),
            run_id: Some("RUN_OPEN".into()),
            stage_entered_at: Some(at(5620)),
            sp_ref: Some(400.0),
            config_version: 1,
            updated_at: at(5700),
        },
    )?;

    store.log("STAGE_START", "preheat started", Severity::Info, Some("preheat"))?;
    store.log("STAGE_END", "preheat ended (normal)", Severity::Info, Some("preheat"))?;
    store.log("STAGE_START", "main started", Severity::Info, Some("main_heat"))?;
    Ok(store)
}

#[test]
fn status_json_reports_checkpoint_and_open_run() -> Result<()> {
    let temp = tempdir()?;
    seed_line(temp.path())?;

    let assert = sentinel(temp.path())
        .arg("status")
        .arg("--json")
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;
    let export: StatusExport = serde_json::from_str(&stdout)?;
    assert_eq!(export.lines.len(), 1);
    let line = &export.lines[0];
    assert_eq!(line.line_id, "Line-07");
    assert_eq!(line.state, "main_RAMP");
    assert_eq!(line.run_id.as_deref(), Some("RUN_OPEN"));
    assert_eq!(line.config_version, Some(1));
    let open = line.open_run.as_ref().expect("open run exported");
    assert_eq!(open.run_id, "RUN_OPEN");
    assert!(open.reached.preheat_ok);
    assert!(!open.reached.main_ok);
    assert!(!open.complete);

    Ok(())
}

#[test]
fn status_text_for_unknown_home_is_empty() -> Result<()> {
    let temp = tempdir()?;
    sentinel(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No lines recorded yet."));
    Ok(())
}

#[test]
fn runs_lists_newest_first_with_stages() -> Result<()> {
    let temp = tempdir()?;
    seed_line(temp.path())?;

    let assert = sentinel(temp.path())
        .args(["runs", "--line", "Line-07", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;
    let export: RunListExport = serde_json::from_str(&stdout)?;
    let ids: Vec<&str> = export.runs.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec!["RUN_OPEN", "RUN_DONE"]);
    assert!(export.runs[1].complete);
    assert_eq!(export.runs[1].end_reason.as_deref(), Some("normal"));
    assert_eq!(export.runs[1].stages.len(), 3);
    assert!(export.runs[0].end_reason.is_none());

    sentinel(temp.path())
        .args(["runs", "--line", "Line-07"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recent runs for Line-07:"))
        .stdout(predicate::str::contains("RUN_DONE"))
        .stdout(predicate::str::contains("complete=true"));
    Ok(())
}

#[test]
fn events_are_listed_newest_first() -> Result<()> {
    let temp = tempdir()?;
    seed_line(temp.path())?;

    let assert = sentinel(temp.path())
        .args(["events", "--limit", "2", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;
    let export: EventListExport = serde_json::from_str(&stdout)?;
    assert_eq!(export.events.len(), 2);
    assert_eq!(export.events[0].message, "main started");
    assert_eq!(export.events[0].zone.as_deref(), Some("main_heat"));
    assert_eq!(export.events[1].kind, "STAGE_END");

    sentinel(temp.path())
        .arg("events")
        .assert()
        .success()
        .stdout(predicate::str::contains("[INFO] STAGE_START: main started (main_heat)"));
    Ok(())
}
