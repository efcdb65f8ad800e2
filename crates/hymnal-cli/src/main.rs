use anyhow::Result;
use clap::{Parser, Subcommand};
use hymnal_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hymnal-cli")]
#[command(about = "Merge hymn snapshots from every source into one catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reduce the latest snapshots into a new run directory.
    Sync,
    /// Summarize recent run directories as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed arguments");
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = hymnal_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} records={} canonical={} errors={} output={}",
                summary.run_id,
                summary.enabled_sources,
                summary.stats.input_records,
                summary.stats.canonical_hymns,
                summary.error_counts.values().sum::<usize>(),
                summary.output_dir
            );
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            let markdown = hymnal_sync::report_runs_markdown(runs, &config.output_dir).await?;
            println!("{markdown}");
        }
    }

    Ok(())
}
