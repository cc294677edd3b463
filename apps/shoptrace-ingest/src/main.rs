mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, CliCommand, IngestArgs, ListArgs, OutputFormat, ReconcileArgs};
use serde::Serialize;
use shoptrace_config::AppConfig;
use shoptrace_ingest_core::{IngestPipeline, ReconcileReport};
use shoptrace_store::{InteractionEvent, Page, PageRequest, SqliteStore};
use std::io::Read;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct IngestSummary {
    created: usize,
    ids: Vec<String>,
    dropped: usize,
    skipped_lines: usize,
    sessions: usize,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_plain_table(title: &str, headers: &[&str], rows: &[Vec<String>]) {
    println!("{title}");
    println!("{}", headers.join(" | "));
    let divider = headers.iter().map(|_| "---").collect::<Vec<_>>().join("+");
    println!("{divider}");
    for row in rows {
        println!("{}", row.join(" | "));
    }
}

async fn open_store(cfg: &AppConfig) -> Result<SqliteStore> {
    let store = SqliteStore::open(&cfg.store)
        .await
        .with_context(|| format!("failed to open store {}", cfg.store.path))?;
    store
        .run_migrations()
        .await
        .context("failed to apply migrations")?;
    Ok(store)
}

fn read_input(args: &IngestArgs) -> Result<String> {
    if args.reads_stdin() {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read events from stdin")?;
        return Ok(text);
    }

    std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read events from {}", args.input))
}

async fn run_migrate(cfg: &AppConfig, output: OutputFormat) -> Result<()> {
    let store = SqliteStore::open(&cfg.store)
        .await
        .with_context(|| format!("failed to open store {}", cfg.store.path))?;
    let applied = store
        .run_migrations()
        .await
        .context("failed to apply migrations")?;

    match output {
        OutputFormat::Json => print_json(&serde_json::json!({
            "store": cfg.store.path,
            "applied": applied,
        })),
        OutputFormat::Plain => {
            if applied.is_empty() {
                println!("schema up to date at {}", cfg.store.path);
            } else {
                println!("applied {} migrations: {}", applied.len(), applied.join(", "));
            }
            Ok(())
        }
    }
}

async fn run_ingest(pipeline: &IngestPipeline, args: &IngestArgs, output: OutputFormat) -> Result<()> {
    let text = read_input(args)?;
    let (events, skipped_lines) = cli::parse_jsonl(&text);
    let report = pipeline
        .log_interactions(&events)
        .await
        .context("failed to log interactions")?;

    let summary = IngestSummary {
        created: report.created(),
        ids: report.ids(),
        dropped: report.dropped,
        skipped_lines,
        sessions: report.sessions,
    };
    match output {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Plain => {
            println!(
                "created {} events across {} sessions ({} dropped, {} unreadable lines)",
                summary.created, summary.sessions, summary.dropped, summary.skipped_lines
            );
            Ok(())
        }
    }
}

fn render_events(page: &Page<InteractionEvent>, output: OutputFormat) -> Result<()> {
    if output == OutputFormat::Json {
        return print_json(page);
    }

    let rows = page
        .items
        .iter()
        .map(|event| {
            vec![
                event.occurred_at.to_rfc3339(),
                event.session_id.clone().unwrap_or_else(|| "-".to_string()),
                event.step_number.to_string(),
                event.event_type.to_string(),
                event.product_id.clone().unwrap_or_else(|| "-".to_string()),
                format!("{:.3}", event.reward),
                event.done.to_string(),
            ]
        })
        .collect::<Vec<_>>();
    print_plain_table(
        &format!("Interaction Events ({} of {})", page.items.len(), page.total),
        &["occurred_at", "session", "step", "type", "product", "reward", "done"],
        &rows,
    );
    if let Some(cursor) = &page.next_cursor {
        println!("next cursor: {cursor}");
    }
    Ok(())
}

async fn run_list(pipeline: &IngestPipeline, args: &ListArgs, output: OutputFormat) -> Result<()> {
    let page = pipeline
        .list_interactions(PageRequest {
            limit: args.limit,
            offset: args.offset,
            cursor: args.cursor.clone(),
        })
        .await
        .context("failed to list interactions")?;
    render_events(&page, output)
}

async fn run_reconcile(
    pipeline: &IngestPipeline,
    args: &ReconcileArgs,
    output: OutputFormat,
) -> Result<()> {
    let report: ReconcileReport = match &args.session {
        Some(session_id) => pipeline
            .reconcile_session(session_id)
            .await
            .with_context(|| format!("failed to reconcile session {session_id}"))?,
        None => pipeline
            .reconcile_all()
            .await
            .context("failed to reconcile sessions")?,
    };

    match output {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Plain => {
            println!(
                "reconciled {} sessions: {} repaired, {} events, {} episode steps",
                report.sessions, report.repaired, report.events, report.episode_steps
            );
            Ok(())
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = shoptrace_config::resolve_config_path(cli.config.clone());
    let config = shoptrace_config::load_config_or_default(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    info!("using store {}", config.store.path);

    if matches!(cli.command, CliCommand::Migrate) {
        return run_migrate(&config, cli.output).await;
    }

    let store = open_store(&config).await?;
    let pipeline = IngestPipeline::new(Arc::new(store), config.ingest.clone());

    match &cli.command {
        CliCommand::Migrate => Ok(()),
        CliCommand::Ingest(args) => run_ingest(&pipeline, args, cli.output).await,
        CliCommand::List(args) => run_list(&pipeline, args, cli.output).await,
        CliCommand::Reconcile(args) => run_reconcile(&pipeline, args, cli.output).await,
    }
}
