//! `siteflow` command line.
//!
//! ```bash
//! # run every stage for every site, four jobs at a time
//! siteflow run
//!
//! # stop after validation, two job slots
//! siteflow run --until validate --max-parallel 2
//!
//! # re-offer one failed pair and its downstream stages
//! siteflow retry luth preprocess
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use siteflow::observability::{init_tracing, LogFormat, DEFAULT_LOG_FILTER};
use siteflow::prelude::*;
use siteflow::scheduler::JobRequest;
use siteflow::settings::DEFAULT_SETTINGS_FILE;
use siteflow::tables::{self, Table, DEFAULT_LABEL};
use siteflow::tracker::{self, write_missing_report, MISSING_REPORT_FILE};
use siteflow::utils::FileLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(
    name = "siteflow",
    version = env!("CARGO_PKG_VERSION"),
    about = "Multi-site histopathology pipeline orchestrator"
)]
struct Cli {
    /// Settings file.
    #[arg(long, global = true, env = "SITEFLOW_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// Storage root; overrides the settings file.
    #[arg(long, global = true, env = "SITEFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered sites and their paths.
    Sites,

    /// Print the configuration document for one (target, stage) pair.
    Config {
        /// Site code, or `all`.
        target: Target,
        /// Stage name.
        stage: Stage,
        /// Check inputs and write the document to the target's cache.
        #[arg(long)]
        write: bool,
    },

    /// Run the pipeline until nothing more can be submitted.
    Run {
        /// Only run this stage and what it requires.
        #[arg(long)]
        until: Option<Stage>,
        /// Concurrent job slots.
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Show the persisted state table.
    Status,

    /// Reopen a failed pair and everything downstream of it.
    Retry {
        /// Site code, or `all`.
        target: Target,
        /// Stage name.
        stage: Stage,
    },

    /// Remove a site from the consolidation barrier.
    Exclude {
        /// Site code.
        site: String,
        /// Put the site back instead.
        #[arg(long)]
        undo: bool,
    },

    /// Compare every site's features against its slide manifest.
    Validate {
        /// Write missing slides to `missing_slides.csv` under the root.
        #[arg(long)]
        report: bool,
    },

    /// Merge every participating site's features into the shared namespace.
    Consolidate {
        /// Merge even if the barrier is not met or consolidation already ran.
        #[arg(long)]
        force: bool,
    },

    /// Clinical and slide table utilities.
    Tables {
        #[command(subcommand)]
        action: TablesCommand,
    },
}

#[derive(Subcommand)]
enum TablesCommand {
    /// Drop unlabeled patients, orphan slides and patients without slides.
    Clean {
        /// Clinical table.
        clinical: PathBuf,
        /// Slide table.
        slides: PathBuf,
        /// Label column.
        #[arg(long, default_value = DEFAULT_LABEL)]
        label: String,
        /// Output directory.
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Split combined tables by the `SITE` column.
    Split {
        /// Clinical table.
        clinical: PathBuf,
        /// Slide table with a `SITE` column.
        slides: PathBuf,
        /// Output directory.
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Replace label values, e.g. `--map MSS=nonMSIH`.
    Relabel {
        /// Table to rewrite.
        table: PathBuf,
        /// Label column.
        #[arg(long, default_value = DEFAULT_LABEL)]
        label: String,
        /// `OLD=NEW` pairs.
        #[arg(long = "map", value_parser = parse_mapping, required = true)]
        mappings: Vec<(String, String)>,
        /// Output path; defaults to rewriting the input.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_mapping(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(old, new)| (old.trim().to_string(), new.trim().to_string()))
        .filter(|(old, _)| !old.is_empty())
        .ok_or_else(|| format!("expected OLD=NEW, got `{raw}`"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(format, DEFAULT_LOG_FILTER);

    let mut settings = Settings::load(&cli.settings)
        .with_context(|| format!("loading settings from {}", cli.settings.display()))?;
    if let Some(root) = cli.root {
        settings = settings.with_root(root);
    }

    match cli.command {
        Command::Sites => list_sites(&settings),
        Command::Config {
            target,
            stage,
            write,
        } => show_config(&settings, &target, stage, write),
        Command::Run {
            until,
            max_parallel,
        } => run(&settings, until, max_parallel).await,
        Command::Status => show_status(&settings),
        Command::Retry { target, stage } => retry(&settings, &target, stage),
        Command::Exclude { site, undo } => exclude(&settings, &site, undo),
        Command::Validate { report } => validate_sites(&settings, report),
        Command::Consolidate { force } => consolidate(&settings, force).await,
        Command::Tables { action } => run_tables(action),
    }
}

fn site_codes(registry: &SiteRegistry) -> Vec<SiteCode> {
    registry.codes().into_iter().cloned().collect()
}

fn lock_state(settings: &Settings) -> Result<FileLock> {
    let path = settings.layout().lock_file();
    FileLock::acquire(&path).with_context(|| {
        format!(
            "another siteflow command is using the state file; remove {} if no siteflow process is running",
            path.display()
        )
    })
}

fn load_state(settings: &Settings, registry: &SiteRegistry) -> Result<(StateTable, PathBuf)> {
    let path = settings.layout().state_file();
    let state = StateTable::load(&path, site_codes(registry))
        .with_context(|| format!("loading state from {}", path.display()))?;
    Ok((state, path))
}

fn list_sites(settings: &Settings) -> Result<ExitCode> {
    let registry = settings.registry().context("building site registry")?;
    for site in registry.sites() {
        println!(
            "{:>2}  {:<8} {:<12} {:<8} {}",
            site.index,
            site.code,
            site.extractor,
            site.device,
            site.raw_dir.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn show_config(settings: &Settings, target: &Target, stage: Stage, write: bool) -> Result<ExitCode> {
    let generator = settings.generator().context("building site registry")?;
    let config = if write {
        generator.materialize(target, stage)?
    } else {
        generator.build(target, stage)?
    };
    print!("{}", config.document.render()?);
    if write {
        let path = generator.write(&config)?;
        info!(path = %path.display(), "Wrote stage config");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(settings: &Settings, until: Option<Stage>, max_parallel: Option<usize>) -> Result<ExitCode> {
    let generator = Arc::new(settings.generator().context("building site registry")?);
    let _lock = lock_state(settings)?;
    let (mut state, state_file) = load_state(settings, generator.registry())?;

    let runner = StageRunner::new(Arc::new(ExternalTool), settings.tool.clone());
    let executor = Arc::new(PipelineExecutor::new(generator.clone(), runner));
    let mut scheduler = Scheduler::new(executor)
        .with_retry(settings.scheduler.retry.clone())
        .with_max_parallel(max_parallel.unwrap_or(settings.scheduler.max_parallel))
        .with_event_sink(Arc::new(LoggingEventSink::new(Level::DEBUG)))
        .with_state_file(state_file);
    if let Some(stage) = until {
        scheduler = scheduler.with_until(stage);
    }

    let cancel = Arc::new(CancellationToken::new());
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for running jobs to stop");
            signal_token.cancel("interrupted by operator");
        }
    });

    let summary = scheduler.run(&mut state, cancel).await?;
    for failure in &summary.failures {
        println!(
            "FAILED  {}/{} attempt {} at {} [{}]{}",
            failure.target,
            failure.stage,
            failure.attempt,
            failure.at.to_rfc3339(),
            failure.code,
            if failure.will_retry { " (retried)" } else { "" }
        );
    }
    for blocked in &summary.blocked {
        println!(
            "BLOCKED {}/{} waiting on {}",
            blocked.target,
            blocked.stage,
            blocked.waiting_on.join(", ")
        );
    }
    println!(
        "{} completed, {} unresolved, {} blocked in {:.1}s",
        summary.completed.len(),
        summary.unresolved.len(),
        summary.blocked.len(),
        summary.duration_ms / 1000.0
    );

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn show_status(settings: &Settings) -> Result<ExitCode> {
    let registry = settings.registry().context("building site registry")?;
    let (state, _) = load_state(settings, &registry)?;
    for (target, stage, entry) in state.iter() {
        let excluded = target.site().is_some_and(|s| state.excluded().contains(s));
        println!(
            "{:<8} {:<12} {:<10} {:>2}{}{}",
            target.to_string(),
            stage.as_str(),
            entry.status.to_string(),
            entry.attempt,
            if excluded { "  excluded" } else { "" },
            entry
                .last_error
                .as_deref()
                .and_then(|e| e.lines().next())
                .map(|e| format!("  {e}"))
                .unwrap_or_default()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn retry(settings: &Settings, target: &Target, stage: Stage) -> Result<ExitCode> {
    let registry = settings.registry().context("building site registry")?;
    let _lock = lock_state(settings)?;
    let (mut state, path) = load_state(settings, &registry)?;
    let reopened = state.reopen(target, stage)?;
    state.save(&path)?;
    for (t, s) in &reopened {
        println!("reopened {t}/{s}");
    }
    Ok(ExitCode::SUCCESS)
}

fn exclude(settings: &Settings, site: &str, undo: bool) -> Result<ExitCode> {
    let registry = settings.registry().context("building site registry")?;
    let _lock = lock_state(settings)?;
    let (mut state, path) = load_state(settings, &registry)?;
    let code = SiteCode::new(site)?;
    if undo {
        if !state.include(&code)? {
            println!("{code} was not excluded");
        }
    } else {
        state.exclude(&code)?;
    }
    state.save(&path)?;
    Ok(ExitCode::SUCCESS)
}

fn validate_sites(settings: &Settings, write_report: bool) -> Result<ExitCode> {
    let registry = settings.registry().context("building site registry")?;
    let mut reports = Vec::with_capacity(registry.len());
    for site in registry.sites() {
        let report = tracker::validate(site).with_context(|| format!("validating {}", site.code))?;
        let summary = report.summary();
        println!(
            "{:<8} {:>5}/{:<5} {:>6.1}%  missing {}  unexpected {}  log errors {}",
            site.code,
            summary.processed,
            summary.total,
            summary.percentage(),
            report.missing.len(),
            report.unexpected.len(),
            report.log_errors.len()
        );
        reports.push(report);
    }

    if write_report {
        let path = settings.layout().root().join(MISSING_REPORT_FILE);
        let rows = write_missing_report(&reports, &path)?;
        info!(path = %path.display(), rows, "Wrote missing slide report");
    }

    Ok(if reports.iter().all(|r| r.is_complete()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn consolidate(settings: &Settings, force: bool) -> Result<ExitCode> {
    let generator = Arc::new(settings.generator().context("building site registry")?);
    let _lock = lock_state(settings)?;
    let (mut state, path) = load_state(settings, generator.registry())?;

    state.promote_ready();
    if !force {
        let waiting = state.barrier_waiting_on();
        if !waiting.is_empty() {
            bail!(
                "consolidation is waiting on {}; exclude those sites or pass --force",
                waiting.join(", ")
            );
        }
    }
    let attempt = state
        .claim(&Target::Aggregate, Stage::Consolidate, force)
        .context("consolidation is not ready; use `siteflow retry all consolidate` or --force")?;
    if force {
        warn!(attempt, "Consolidating without the barrier");
    }
    state.save(&path)?;

    let participants: Arc<[SiteCode]> = state.participants().into();
    let runner = StageRunner::new(Arc::new(ExternalTool), settings.tool.clone());
    let executor = PipelineExecutor::new(generator, runner);
    let request = JobRequest {
        target: Target::Aggregate,
        stage: Stage::Consolidate,
        attempt,
        participants: participants.clone(),
    };
    let outcome = executor.execute(request, Arc::new(CancellationToken::new())).await;
    state.record(&outcome.job)?;
    state.save(&path)?;

    if let Some(error) = outcome.error {
        println!("FAILED  all/consolidate attempt {attempt}: {error}");
        return Ok(ExitCode::FAILURE);
    }
    println!(
        "consolidated {} sites into {}",
        participants.len(),
        settings.layout().aggregate_features_dir().display()
    );
    Ok(ExitCode::SUCCESS)
}

fn read_table(path: &Path) -> Result<Table> {
    Table::read(path).with_context(|| format!("reading {}", path.display()))
}

fn write_table(table: &Table, path: &Path) -> Result<()> {
    table
        .write(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), rows = table.len(), "Wrote table");
    Ok(())
}

fn run_tables(action: TablesCommand) -> Result<ExitCode> {
    match action {
        TablesCommand::Clean {
            clinical,
            slides,
            label,
            out_dir,
        } => {
            let cleaned = tables::clean_tables(&read_table(&clinical)?, &read_table(&slides)?, &label)?;
            write_table(&cleaned.clinical, &out_dir.join("clinical_table.csv"))?;
            write_table(&cleaned.slides, &out_dir.join("slide_table.csv"))?;
            println!("{}", serde_json::to_string_pretty(&cleaned.report)?);
        }
        TablesCommand::Split {
            clinical,
            slides,
            out_dir,
        } => {
            for part in tables::split_by_site(&read_table(&clinical)?, &read_table(&slides)?)? {
                let site = part.site.to_lowercase();
                write_table(&part.clinical, &out_dir.join(format!("{site}_clinical_table.csv")))?;
                write_table(&part.slides, &out_dir.join(format!("{site}_slide_table.csv")))?;
            }
        }
        TablesCommand::Relabel {
            table,
            label,
            mappings,
            output,
        } => {
            let mut data = read_table(&table)?;
            let mapping: BTreeMap<String, String> = mappings.into_iter().collect();
            let changed = tables::remap_labels(&mut data, &label, &mapping)?;
            write_table(&data, output.as_deref().unwrap_or(&table))?;
            println!("{changed} values relabeled");
        }
    }
    Ok(ExitCode::SUCCESS)
}
