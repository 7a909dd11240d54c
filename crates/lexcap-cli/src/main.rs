use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use lexcap_capture::{
    partition_stale, report_digest_markdown, write_reports, CaptureConfig, CaptureEngine,
};
use lexcap_core::render_field_errors;
use lexcap_source::{CaseHandle, FixtureSource};
use lexcap_store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "lexcap-cli")]
#[command(about = "Legal case party capture command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture one case's parties from a fixture bundle into the reference store.
    Capture {
        #[arg(long)]
        case: String,
        #[arg(long, default_value = "fixtures")]
        fixtures: PathBuf,
        #[arg(long, default_value = "reports")]
        reports_dir: PathBuf,
        /// Skip writing run reports to disk.
        #[arg(long)]
        no_reports: bool,
    },
    /// Print a digest of recent capture runs.
    Report {
        #[arg(long, default_value = "reports")]
        reports_dir: PathBuf,
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Capture {
            case,
            fixtures,
            reports_dir,
            no_reports,
        } => {
            let config = CaptureConfig::from_env();
            if let Err(errors) = config.validate() {
                bail!("invalid configuration: {}", render_field_errors(&errors));
            }

            let source = FixtureSource::new(fixtures);
            let handle = CaseHandle::new(case);
            let bundle = source.load_bundle(&handle)?;
            let acting = bundle
                .acting_representative
                .clone()
                .context("fixture bundle has no acting representative")?;

            let store = Arc::new(MemoryStore::new());
            let engine = CaptureEngine::new(config, store.clone());

            let partition = partition_stale(
                store.as_ref(),
                std::slice::from_ref(&handle.external_case_id),
                engine.config().freshness_window(),
                Utc::now(),
            )
            .await?;
            if partition.refetch.is_empty() {
                println!(
                    "case {} captured within the last {}h; nothing to do",
                    handle.external_case_id,
                    engine.config().recapture_freshness_hours
                );
                return Ok(());
            }

            let report = engine
                .capture_case(&handle.external_case_id, &acting, bundle.records)
                .await?;

            println!(
                "capture complete: run_id={} parties={} clients={} opposing={} third={} links={} representatives={} failures={}",
                report.run_id,
                report.total,
                report.clients,
                report.opposing,
                report.third,
                report.links,
                report.representatives_saved,
                report.errors.len() + report.errors_truncated
            );
            for entry in &report.errors {
                eprintln!("  [{}] {}: {}", entry.index, entry.party, entry.message);
            }

            if !no_reports {
                let run_dir =
                    write_reports(&reports_dir, &report, engine.config(), &bundle.raw_payload)
                        .await?;
                println!("reports written to {}", run_dir.display());
            }
        }
        Commands::Report { reports_dir, runs } => {
            print!("{}", report_digest_markdown(runs, &reports_dir)?);
        }
    }

    Ok(())
}
