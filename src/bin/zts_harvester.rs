//! CLI entry point (C12): loads the layered TOML configuration, builds a
//! [`Harvester`], runs every configured journal, and prints the end-of-run
//! summary (§7).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use zts_harvester::config::{Config, OutputFormat};
use zts_harvester::Harvester;

#[derive(Parser, Debug)]
#[command(name = "zts_harvester", about = "Harvests bibliographic metadata from configured journal sources")]
struct Cli {
    /// Minimum log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    min_log_level: String,

    /// Ignore every robots.txt restriction and crawl-delay directive.
    #[arg(long, default_value_t = false)]
    ignore_robots_dot_txt: bool,

    /// Path to the TOML configuration document.
    #[arg(long)]
    config_file: PathBuf,

    /// Override the configured resumable progress file path.
    #[arg(long)]
    progress_file: Option<PathBuf>,

    /// Override the configured output format (marcxml, marc21, json).
    #[arg(long)]
    output_format: Option<String>,
}

fn parse_output_format(raw: &str) -> Option<OutputFormat> {
    match raw.to_ascii_lowercase().as_str() {
        "marcxml" => Some(OutputFormat::Marcxml),
        "marc21" => Some(OutputFormat::Marc21),
        "json" => Some(OutputFormat::Json),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.min_log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match Config::load(&cli.config_file) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, path = %cli.config_file.display(), "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    if cli.ignore_robots_dot_txt {
        config.global.ignore_robots_dot_txt = true;
    }
    if let Some(path) = cli.progress_file {
        config.global.progress_file = Some(path);
    }
    if let Some(raw) = cli.output_format.as_deref() {
        match parse_output_format(raw) {
            Some(format) => config.global.output_format = format,
            None => {
                tracing::error!(value = raw, "unrecognized --output-format, expected marcxml, marc21, or json");
                return ExitCode::from(1);
            }
        }
    }

    let harvester = match Harvester::new(config) {
        Ok(harvester) => harvester,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize harvester");
            return ExitCode::from(1);
        }
    };

    let mut stdout = std::io::stdout();
    let report = match harvester.run(&mut stdout).await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = %err, "harvest run aborted");
            return ExitCode::from(1);
        }
    };

    let total_failed: u64 = report.journals.iter().map(|j| j.items_failed).sum();
    tracing::info!(
        journals = report.journals.len(),
        records_emitted = report.records_emitted,
        total_failed,
        "harvest run complete"
    );
    for journal in &report.journals {
        tracing::info!(
            journal = %journal.name,
            visited = journal.items_visited,
            translated = journal.items_translated,
            failed = journal.items_failed,
            "journal summary"
        );
    }
    for (kind, count) in &report.error_counts {
        tracing::info!(kind = %kind, count, "error summary");
    }

    if total_failed > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
