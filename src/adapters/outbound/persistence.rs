use std::{fs, path::PathBuf, time::Duration};

use anyhow::Context as AnyhowContext;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{
    core::{
        config::{FsmConfig, VersionedConfig},
        domain::{
            EndReason, EventEntry, FsmState, ReachedFlags, RunRecord, RuntimeState, Severity,
            StageName, StageRecord, StageStatus,
        },
        error::{Error as CoreError, Result},
        ports::{CheckpointStore, ConfigStore, EventLog, RunStore},
    },
    paths::data_dir,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store for configuration versions, runs, checkpoints and the
/// event log. Each call opens its own connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(custom_root: Option<PathBuf>) -> anyhow::Result<Self> {
        let base = custom_root.unwrap_or_else(data_dir);
        if !base.exists() {
            fs::create_dir_all(&base)
                .with_context(|| format!("Failed to create data directory {}", base.display()))?;
        }
        let db_path = base.join("sentinel.sqlite3");
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Every line that has a stored configuration or checkpoint.
    pub fn known_lines(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT line_id FROM fsm_config
                UNION
                SELECT line_id FROM fsm_runtime_state
                ORDER BY line_id
                "#,
            )
            .map_err(db)?;
        let lines = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(lines)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            CoreError::Persistence(format!("open {}: {e}", self.db_path.display()))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db)?;
        conn.pragma_update(None, "foreign_keys", true).map_err(db)?;
        Ok(conn)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.connect()?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        tracing::debug!(db = %self.db_path.display(), journal_mode = %mode, "schema check");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS fsm_config (
                line_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                config_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (line_id, version)
            );
            CREATE TABLE IF NOT EXISTS fsm_runs (
                run_id TEXT PRIMARY KEY,
                line_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                end_reason TEXT,
                preheat_ok INTEGER NOT NULL DEFAULT 0,
                main_ok INTEGER NOT NULL DEFAULT 0,
                rib_ok INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_fsm_runs_line ON fsm_runs (line_id, started_at);
            CREATE TABLE IF NOT EXISTS fsm_stages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES fsm_runs (run_id),
                stage TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                sp_start REAL,
                sp_end REAL,
                t_min REAL,
                t_max REAL,
                t_mean REAL NOT NULL,
                t_std REAL NOT NULL,
                samples INTEGER NOT NULL,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS fsm_runtime_state (
                line_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                stage TEXT,
                run_id TEXT,
                stage_entered_at TEXT,
                sp_ref REAL,
                config_version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                zone TEXT
            );
            "#,
        )?;
        Ok(())
    }
}

fn db(err: rusqlite::Error) -> CoreError {
    CoreError::Persistence(err.to_string())
}

fn corrupt(what: &str, value: &str) -> CoreError {
    CoreError::Persistence(format!("Invalid {what} '{value}' in store"))
}

struct RunRow {
    run_id: String,
    line_id: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<String>,
    reached: ReachedFlags,
}

const RUN_COLUMNS: &str =
    "run_id, line_id, started_at, ended_at, end_reason, preheat_ok, main_ok, rib_ok";

fn run_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        line_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        end_reason: row.get(4)?,
        reached: ReachedFlags {
            preheat_ok: row.get(5)?,
            main_ok: row.get(6)?,
            rib_ok: row.get(7)?,
        },
    })
}

fn load_run(conn: &Connection, row: RunRow) -> Result<RunRecord> {
    let end_reason = row
        .end_reason
        .map(|raw| EndReason::from_name(&raw).ok_or_else(|| corrupt("end reason", &raw)))
        .transpose()?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT stage, started_at, ended_at, sp_start, sp_end, t_min, t_max,
                   t_mean, t_std, samples, status
            FROM fsm_stages
            WHERE run_id = ?1
            ORDER BY id
            "#,
        )
        .map_err(db)?;
    let rows = stmt
        .query_map(params![row.run_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, DateTime<Utc>>(1)?,
                r.get::<_, DateTime<Utc>>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, Option<f64>>(4)?,
                r.get::<_, Option<f64>>(5)?,
                r.get::<_, Option<f64>>(6)?,
                r.get::<_, f64>(7)?,
                r.get::<_, f64>(8)?,
                r.get::<_, i64>(9)?,
                r.get::<_, String>(10)?,
            ))
        })
        .map_err(db)?;

    let mut stages = Vec::new();
    for stage_row in rows {
        let (
            stage,
            started_at,
            ended_at,
            sp_start,
            sp_end,
            t_min,
            t_max,
            t_mean,
            t_std,
            samples,
            status,
        ) = stage_row.map_err(db)?;
        stages.push(StageRecord {
            stage: StageName::from_name(&stage).ok_or_else(|| corrupt("stage", &stage))?,
            started_at,
            ended_at,
            sp_start,
            sp_end,
            t_min,
            t_max,
            t_mean,
            t_std,
            samples: samples.max(0) as u64,
            status: StageStatus::from_name(&status).ok_or_else(|| corrupt("status", &status))?,
        });
    }

    Ok(RunRecord {
        run_id: row.run_id,
        line_id: row.line_id,
        started_at: row.started_at,
        ended_at: row.ended_at,
        end_reason,
        reached: row.reached,
        stages,
    })
}

impl ConfigStore for SqliteStore {
    fn get_latest(&self, line_id: &str) -> Result<Option<VersionedConfig>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                r#"
                SELECT version, config_json, created_at
                FROM fsm_config
                WHERE line_id = ?1
                ORDER BY version DESC
                LIMIT 1
                "#,
                params![line_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, DateTime<Utc>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db)?;
        row.map(|(version, json, created_at)| {
            let config: FsmConfig = serde_json::from_str(&json)
                .map_err(|e| CoreError::Persistence(format!("config v{version}: {e}")))?;
            Ok(VersionedConfig {
                line_id: line_id.to_string(),
                version,
                config,
                created_at,
            })
        })
        .transpose()
    }

    fn append(&self, line_id: &str, config: &FsmConfig) -> Result<VersionedConfig> {
        config.validate()?;
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(db)?;
        let version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM fsm_config WHERE line_id = ?1",
                params![line_id],
                |row| row.get(0),
            )
            .map_err(db)?;
        let json = serde_json::to_string(config)
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO fsm_config (line_id, version, config_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![line_id, version, json, created_at],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(VersionedConfig {
            line_id: line_id.to_string(),
            version,
            config: config.clone(),
            created_at,
        })
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, run_id: &str, line_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO fsm_runs (run_id, line_id, started_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(run_id) DO NOTHING
            "#,
            params![run_id, line_id, started_at],
        )
        .map_err(db)?;
        Ok(())
    }

    fn end_run(
        &self,
        run_id: &str,
        ended_at: DateTime<Utc>,
        end_reason: EndReason,
        reached: ReachedFlags,
    ) -> Result<()> {
        let conn = self.connect()?;
        let updated = conn
            .execute(
                r#"
                UPDATE fsm_runs
                SET ended_at = ?2, end_reason = ?3, preheat_ok = ?4, main_ok = ?5, rib_ok = ?6
                WHERE run_id = ?1
                "#,
                params![
                    run_id,
                    ended_at,
                    end_reason.as_str(),
                    reached.preheat_ok,
                    reached.main_ok,
                    reached.rib_ok
                ],
            )
            .map_err(db)?;
        if updated == 0 {
            return Err(CoreError::Persistence(format!("run {run_id} not found")));
        }
        Ok(())
    }

    fn add_stage(&self, run_id: &str, record: &StageRecord) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            r#"
            INSERT INTO fsm_stages (run_id, stage, started_at, ended_at, sp_start, sp_end,
                                    t_min, t_max, t_mean, t_std, samples, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                run_id,
                record.stage.as_str(),
                record.started_at,
                record.ended_at,
                record.sp_start,
                record.sp_end,
                record.t_min,
                record.t_max,
                record.t_mean,
                record.t_std,
                record.samples as i64,
                record.status.as_str()
            ],
        )
        .map_err(db)?;
        let column = match record.stage {
            StageName::Preheat => "preheat_ok",
            StageName::Main => "main_ok",
            StageName::Rib => "rib_ok",
        };
        tx.execute(
            &format!("UPDATE fsm_runs SET {column} = 1 WHERE run_id = ?1"),
            params![run_id],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(())
    }

    fn list_runs(&self, line_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM fsm_runs
                 WHERE line_id = ?1 ORDER BY started_at DESC LIMIT ?2"
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![line_id, limit as i64], run_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        rows.into_iter().map(|row| load_run(&conn, row)).collect()
    }

    fn open_run(&self, line_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM fsm_runs \
                     WHERE line_id = ?1 AND ended_at IS NULL \
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![line_id],
                run_row,
            )
            .optional()
            .map_err(db)?;
        row.map(|row| load_run(&conn, row)).transpose()
    }
}

impl CheckpointStore for SqliteStore {
    fn get(&self, line_id: &str) -> Result<Option<RuntimeState>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                r#"
                SELECT state, stage, run_id, stage_entered_at, sp_ref, config_version, updated_at
                FROM fsm_runtime_state
                WHERE line_id = ?1
                "#,
                params![line_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<DateTime<Utc>>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, DateTime<Utc>>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(db)?;

        let Some((state, stage, run_id, stage_entered_at, sp_ref, config_version, updated_at)) = row
        else {
            return Ok(None);
        };
        let state: FsmState = state.parse()?;
        let stage = stage
            .map(|raw| StageName::from_name(&raw).ok_or_else(|| corrupt("stage", &raw)))
            .transpose()?;
        Ok(Some(RuntimeState {
            state,
            stage,
            run_id,
            stage_entered_at,
            sp_ref,
            config_version,
            updated_at,
        }))
    }

    fn put(&self, line_id: &str, state: &RuntimeState) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO fsm_runtime_state
                (line_id, state, stage, run_id, stage_entered_at, sp_ref,
                 config_version, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(line_id)
            DO UPDATE SET
                state=excluded.state,
                stage=excluded.stage,
                run_id=excluded.run_id,
                stage_entered_at=excluded.stage_entered_at,
                sp_ref=excluded.sp_ref,
                config_version=excluded.config_version,
                updated_at=excluded.updated_at
            "#,
            params![
                line_id,
                state.state.to_string(),
                state.stage.map(StageName::as_str),
                state.run_id,
                state.stage_entered_at,
                state.sp_ref,
                state.config_version,
                state.updated_at
            ],
        )
        .map_err(db)?;
        Ok(())
    }
}

impl EventLog for SqliteStore {
    fn log(&self, kind: &str, message: &str, severity: Severity, zone: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO events (ts, event_type, message, severity, zone)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Utc::now(), kind, message, severity.as_str(), zone],
        )
        .map_err(db)?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<EventEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, ts, event_type, message, severity, zone
                FROM events
                ORDER BY id DESC
                LIMIT ?1
                "#,
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, DateTime<Utc>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(db)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, timestamp, kind, message, severity, zone) = row.map_err(db)?;
            entries.push(EventEntry {
                id,
                timestamp,
                kind,
                message,
                severity: Severity::from_name(&severity)
                    .ok_or_else(|| corrupt("severity", &severity))?,
                zone,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn record(stage: StageName, status: StageStatus) -> StageRecord {
        StageRecord {
            stage,
            started_at: at(0),
            ended_at: at(200),
            sp_start: Some(300.0),
            sp_end: None,
            t_min: Some(280.5),
            t_max: Some(302.0),
            t_mean: 297.25,
            t_std: 4.5,
            samples: 100,
            status,
        }
    }

    #[test]
    fn config_versions_are_append_only() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        assert!(store.get_latest("Line-07").unwrap().is_none());

        let first = store.append("Line-07", &FsmConfig::default()).unwrap();
        let tuned = FsmConfig {
            tol_f: 5.0,
            ..FsmConfig::default()
        };
        let second = store.append("Line-07", &tuned).unwrap();
        assert_eq!((first.version, second.version), (1, 2));

        let latest = store.get_latest("Line-07").unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.config, tuned);

        let invalid = FsmConfig {
            max_stage_s: 0.0,
            ..FsmConfig::default()
        };
        assert!(store.append("Line-07", &invalid).is_err());
    }

    #[test]
    fn runs_round_trip_with_stages() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        store.create_run("RUN_A", "Line-07", at(0)).unwrap();
        store.create_run("RUN_A", "Line-07", at(5)).unwrap();
        store
            .add_stage("RUN_A", &record(StageName::Preheat, StageStatus::Normal))
            .unwrap();

        let open = store.open_run("Line-07").unwrap().expect("run is open");
        assert_eq!(open.started_at, at(0));
        assert!(open.reached.preheat_ok);
        assert_eq!(open.stages, vec![record(StageName::Preheat, StageStatus::Normal)]);

        store
            .add_stage("RUN_A", &record(StageName::Main, StageStatus::Timeout))
            .unwrap();
        store
            .end_run("RUN_A", at(900), EndReason::Timeout, open.reached)
            .unwrap();
        assert!(store.open_run("Line-07").unwrap().is_none());

        let runs = store.list_runs("Line-07", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].end_reason, Some(EndReason::Timeout));
        assert_eq!(runs[0].stages.len(), 2);
        assert_eq!(runs[0].stages[1].status, StageStatus::Timeout);
        assert!(store.end_run("RUN_X", at(1), EndReason::Normal, open.reached).is_err());
    }

    #[test]
    fn checkpoint_upserts_single_row() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        assert!(store.get("Line-07").unwrap().is_none());

        store.put("Line-07", &RuntimeState::idle(1, at(0))).unwrap();
        store.append("Line-09", &FsmConfig::default()).unwrap();
        assert_eq!(store.known_lines().unwrap(), vec!["Line-07", "Line-09"]);
        let active = RuntimeState {
            state: "main_STABLE".parse().unwrap(),
            stage: Some(StageName::Main),
            run_id: Some("RUN_A".into()),
            stage_entered_at: Some(at(10)),
            sp_ref: Some(400.0),
            config_version: 2,
            updated_at: at(30),
        };
        store.put("Line-07", &active).unwrap();
        assert_eq!(store.get("Line-07").unwrap(), Some(active));
    }

    #[test]
    fn event_log_lists_newest_first() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        store
            .log("STAGE_START", "preheat started", Severity::Info, Some("preheat"))
            .unwrap();
        store
            .log("FSM_ERROR", "bad reading", Severity::Error, None)
            .unwrap();

        let entries = store.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "FSM_ERROR");
        assert_eq!(entries[0].severity, Severity::Error);
        assert_eq!(entries[1].zone.as_deref(), Some("preheat"));
        assert_eq!(store.recent(1).unwrap().len(), 1);
    }
}
