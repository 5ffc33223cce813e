mod tracing_setup;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context as AnyhowContext, Result, bail};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use vulcan_sentinel::{
    adapters::{
        JsonReportTrigger, MemoryStore, NoopReportTrigger, SimulatedZoneSource, SqliteStore,
        SystemClock,
    },
    application::{LinePipeline, LinePorts, PipelineStatsSnapshot},
    cli::{
        Cli, Commands, ConfigCommand, ConfigSetArgs, ConfigShowArgs, EventsArgs, ResetArgs,
        RunArgs, RunsArgs, StatusArgs,
    },
    config::SentinelConfig,
    core::{
        FsmConfig,
        domain::{EndReason, RuntimeState, Severity},
        ports::{
            CheckpointStore, Clock, ConfigStore, EventLog, ReportTrigger, RunStore, ZoneSource,
        },
    },
    paths,
    status_export::{
        ConfigExport, EventListExport, LineStatusExport, RunListExport, StatusExport,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = match &cli.command {
        Commands::Run(_) => None,
        _ => tracing_setup::init(cli.verbose, cli.log_json, None),
    };
    match cli.command {
        Commands::Run(args) => {
            let config = load_config(args.config.as_ref())?;
            let data_dir = cli.data_dir.unwrap_or_else(|| config.data_dir());
            let log_dir = paths::logs_dir(&data_dir);
            let log_name = format!("run-{}.log", Utc::now().format("%Y%m%d_%H%M%S"));
            let _run_guard = tracing_setup::init(
                cli.verbose,
                cli.log_json,
                (!args.dry_run).then_some((log_dir.as_path(), log_name.as_str())),
            );
            run_command(args, config, data_dir).await?
        }
        Commands::Status(args) => status_command(&SqliteStore::open(cli.data_dir)?, args)?,
        Commands::Runs(args) => runs_command(&SqliteStore::open(cli.data_dir)?, args)?,
        Commands::Events(args) => events_command(&SqliteStore::open(cli.data_dir)?, args)?,
        Commands::Config(ConfigCommand::Show(args)) => {
            config_show_command(&SqliteStore::open(cli.data_dir)?, args)?
        }
        Commands::Config(ConfigCommand::Set(args)) => {
            config_set_command(&SqliteStore::open(cli.data_dir)?, args)?
        }
        Commands::Reset(args) => reset_command(&SqliteStore::open(cli.data_dir)?, args)?,
    }
    Ok(())
}

/// Store handles shared by every line of one `run`.
struct Stores {
    configs: Arc<dyn ConfigStore>,
    runs: Arc<dyn RunStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventLog>,
    reports: Arc<dyn ReportTrigger>,
}

impl Stores {
    fn new<S>(store: Arc<S>, reports: Arc<dyn ReportTrigger>) -> Self
    where
        S: ConfigStore + RunStore + CheckpointStore + EventLog + 'static,
    {
        Self {
            configs: store.clone(),
            runs: store.clone(),
            checkpoints: store.clone(),
            events: store,
            reports,
        }
    }

    fn ports(&self, source: Arc<dyn ZoneSource>, clock: Arc<dyn Clock>) -> LinePorts {
        LinePorts {
            source,
            configs: self.configs.clone(),
            runs: self.runs.clone(),
            checkpoints: self.checkpoints.clone(),
            events: self.events.clone(),
            reports: self.reports.clone(),
            clock,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SentinelConfig> {
    match path {
        Some(path) => SentinelConfig::from_path(path),
        None => Ok(SentinelConfig::default()),
    }
}

async fn run_command(args: RunArgs, config: SentinelConfig, data_dir: PathBuf) -> Result<()> {
    let lines = config.select_lines(&args.lines)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let stores = if args.dry_run {
        Stores::new(Arc::new(MemoryStore::new()), Arc::new(NoopReportTrigger))
    } else {
        let store = Arc::new(SqliteStore::open(Some(data_dir.clone()))?);
        info!(db = %store.db_path().display(), "using SQLite store");
        Stores::new(
            store,
            Arc::new(JsonReportTrigger::new(paths::reports_dir(&data_dir))),
        )
    };

    let settings = config.pipeline_settings();
    let mut pipelines = Vec::with_capacity(lines.len());
    for (line_id, line) in lines {
        let source = Arc::new(SimulatedZoneSource::new(line.simulation.clone(), clock.clone()));
        let ports = stores.ports(source, clock.clone());
        let pipeline =
            LinePipeline::start(&line_id, line.zones.clone(), &line.fsm, ports, settings.clone())
                .with_context(|| format!("Failed to start line {line_id}"))?;
        println!(
            "Line {} running with configuration v{}",
            pipeline.line_id(),
            pipeline.config_version()
        );
        pipelines.push(pipeline);
    }

    match args.duration_s {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                    info!(seconds, "run duration elapsed")
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("interrupt received");
        }
    }

    let stopped = tokio::task::spawn_blocking(move || {
        pipelines
            .iter_mut()
            .map(|pipeline| (pipeline.line_id().to_string(), pipeline.stop()))
            .collect::<Vec<_>>()
    })
    .await
    .context("Pipeline shutdown task failed")?;

    for (line_id, stats) in stopped {
        print_counters(&line_id, &stats);
    }
    Ok(())
}

fn print_counters(line_id: &str, stats: &PipelineStatsSnapshot) {
    println!(
        "{line_id}: sampled={} processed={} events={} evicted={} dropped={} checkpoint_failures={}",
        stats.ticks_sampled,
        stats.ticks_processed,
        stats.events_emitted,
        stats.ticks_evicted,
        stats.ticks_dropped,
        stats.checkpoint_failures
    );
}

fn status_command(store: &SqliteStore, args: StatusArgs) -> Result<()> {
    let lines = match args.line {
        Some(line) => vec![line],
        None => store.known_lines()?,
    };

    let mut export = StatusExport { lines: Vec::new() };
    for line_id in &lines {
        let checkpoint = store.get(line_id)?;
        let config = store.get_latest(line_id)?;
        let open_run = store.open_run(line_id)?;
        export.lines.push(LineStatusExport::new(
            line_id,
            checkpoint.as_ref(),
            config.as_ref(),
            open_run.as_ref(),
        ));
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&export)?);
        return Ok(());
    }
    if export.lines.is_empty() {
        println!("No lines recorded yet.");
        return Ok(());
    }
    for line in &export.lines {
        println!("Line: {}", line.line_id);
        println!("  State: {}", line.state);
        if let Some(run_id) = &line.run_id {
            println!("  Run: {run_id}");
        }
        if let Some(entered) = line.stage_entered_at {
            println!("  Stage entered: {entered}");
        }
        if let Some(sp_ref) = line.sp_ref {
            println!("  SP reference: {sp_ref:.1}");
        }
        if let Some(version) = line.config_version {
            println!("  Config: v{version}");
        }
        if let Some(updated) = line.updated_at {
            println!("  Updated: {updated}");
        }
        if let Some(run) = &line.open_run {
            println!(
                "  Open run: {} (stages recorded: {}, preheat={} main={} rib={})",
                run.run_id,
                run.stages.len(),
                run.reached.preheat_ok,
                run.reached.main_ok,
                run.reached.rib_ok
            );
        }
    }
    Ok(())
}

fn runs_command(store: &SqliteStore, args: RunsArgs) -> Result<()> {
    let runs = store.list_runs(&args.line, args.limit)?;
    if args.json {
        let payload = RunListExport::from_runs(&args.line, &runs);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs recorded for line {}.", args.line);
        return Ok(());
    }
    println!("Recent runs for {}:", args.line);
    for run in &runs {
        let reason = run
            .end_reason
            .map(|reason| reason.as_str())
            .unwrap_or("open");
        println!(
            "- {} | started {} | {} | complete={}",
            run.run_id,
            run.started_at,
            reason,
            run.reached.all()
        );
        for stage in &run.stages {
            println!(
                "    {:<8} {} -> {} | mean {:.1} std {:.2} | n={} | {}",
                stage.stage.as_str(),
                stage.started_at.format("%H:%M:%S"),
                stage.ended_at.format("%H:%M:%S"),
                stage.t_mean,
                stage.t_std,
                stage.samples,
                stage.status.as_str()
            );
        }
    }
    Ok(())
}

fn events_command(store: &SqliteStore, args: EventsArgs) -> Result<()> {
    let events = store.recent(args.limit)?;
    if args.json {
        let payload = EventListExport { events };
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    if events.is_empty() {
        println!("No events recorded yet.");
        return Ok(());
    }
    for event in &events {
        println!(
            "{} [{}] {}: {}{}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.severity.as_str(),
            event.kind,
            event.message,
            event
                .zone
                .as_deref()
                .map(|zone| format!(" ({zone})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn config_show_command(store: &SqliteStore, args: ConfigShowArgs) -> Result<()> {
    let Some(stored) = store.get_latest(&args.line)? else {
        if args.json {
            println!("null");
        } else {
            println!(
                "No configuration stored for line {}; defaults apply until it first runs.",
                args.line
            );
        }
        return Ok(());
    };

    let export = ConfigExport::from(&stored);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&export)?);
    } else {
        println!(
            "Line {} configuration v{} (stored {})",
            export.line_id, export.version, export.created_at
        );
        print!("{}", serde_yaml::to_string(&export.config)?);
    }
    Ok(())
}

fn config_set_command(store: &SqliteStore, args: ConfigSetArgs) -> Result<()> {
    if args.is_empty() {
        bail!("No parameters given; pass at least one value to change");
    }
    let base = store
        .get_latest(&args.line)?
        .map(|stored| stored.config)
        .unwrap_or_else(FsmConfig::default);
    let updated = args.apply(base);
    updated.validate().context("Rejected FSM parameters")?;

    let stored = store.append(&args.line, &updated)?;
    store.log(
        "CONFIG_UPDATED",
        &format!("Stored configuration v{} for {}", stored.version, args.line),
        Severity::Info,
        None,
    )?;
    println!(
        "Stored configuration v{} for line {}; running pipelines pick it up on restart.",
        stored.version, args.line
    );
    Ok(())
}

fn reset_command(store: &SqliteStore, args: ResetArgs) -> Result<()> {
    let now = Utc::now();
    let version = store
        .get_latest(&args.line)?
        .map(|stored| stored.version)
        .or(store.get(&args.line)?.map(|state| state.config_version))
        .unwrap_or(0);

    if let Some(run) = store.open_run(&args.line)? {
        store.end_run(&run.run_id, now, EndReason::Fault, run.reached)?;
        warn!(line_id = %args.line, run_id = %run.run_id, "open run closed by operator reset");
        println!("Closed open run {} as fault.", run.run_id);
    }

    store.put(&args.line, &RuntimeState::idle(version, now))?;
    store.log(
        "OPERATOR_RESET",
        &format!("{} reset to IDLE by operator", args.line),
        Severity::Warning,
        None,
    )?;
    println!("Line {} reset to IDLE.", args.line);
    Ok(())
}
