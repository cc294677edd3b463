use clap::{Args, Parser, Subcommand, ValueEnum};
use shoptrace_ingest_core::RawInteraction;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "shoptrace-ingest",
    about = "Feed storefront interaction events into the shoptrace event log"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    pub output: OutputFormat,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Apply bundled schema migrations.
    Migrate,
    /// Ingest newline-delimited JSON events.
    Ingest(IngestArgs),
    /// List logged events, newest first.
    List(ListArgs),
    /// Rebuild session rollups and episode steps from the event log.
    Reconcile(ReconcileArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// JSONL file, or `-` for stdin.
    #[arg(value_name = "FILE")]
    pub input: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    pub limit: Option<u16>,
    #[arg(long, default_value_t = 0)]
    pub offset: u64,
    #[arg(long)]
    pub cursor: Option<String>,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    #[arg(long, value_name = "ID")]
    pub session: Option<String>,
}

impl IngestArgs {
    pub fn reads_stdin(&self) -> bool {
        self.input == "-"
    }
}

/// Parses one event per non-blank line; lines that fail to deserialize are
/// skipped and counted.
pub fn parse_jsonl(text: &str) -> (Vec<RawInteraction>, usize) {
    let mut events = Vec::new();
    let mut skipped = 0;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawInteraction>(line) {
            Ok(event) => events.push(event),
            Err(err) => {
                skipped += 1;
                warn!("skipping line {}: {err}", index + 1);
            }
        }
    }

    (events, skipped)
}
