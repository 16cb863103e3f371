mod config;
mod dataset;
mod enrich;
mod error;
mod extract;
mod limiter;
mod model;
mod normalize;
mod pipeline;
mod session;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use crate::dataset::Dataset;
use crate::enrich::HttpSegmentApi;
use crate::limiter::RateLimiter;
use crate::pipeline::{Phase, PipelineOrchestrator, RunSummary};
use crate::session::HttpRecordPage;

#[derive(Parser)]
#[command(name = "cr_pipeline", about = "Course Record extraction and enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, normalize, and enrich in one pass (resumes prior state)
    Run {
        /// Target athlete id whose Course Records to harvest
        #[arg(short, long)]
        athlete_id: String,
        /// API bearer token (or STRAVA_API_TOKEN)
        #[arg(short, long)]
        token: Option<String>,
        /// Authenticated session cookie (or STRAVA_SESSION_COOKIE)
        #[arg(short, long)]
        session_cookie: Option<String>,
        /// Skip the pipeline and point consumers at the last persisted
        /// complemented dataset
        #[arg(long)]
        use_existing: bool,
    },
    /// Extract and normalize only; writes the raw dataset
    Extract {
        #[arg(short, long)]
        athlete_id: String,
        /// Authenticated session cookie (or STRAVA_SESSION_COOKIE)
        #[arg(short, long)]
        session_cookie: Option<String>,
    },
    /// Enrich pending records in the persisted dataset
    Enrich {
        /// API bearer token (or STRAVA_API_TOKEN)
        #[arg(short, long)]
        token: Option<String>,
    },
    /// Dataset counts by enrichment status
    Stats,
    /// Requeue failed records as pending so the next run retries them
    ResetFailed,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let raw_path = Path::new(config::RAW_DATA_PATH);
    let enriched_path = Path::new(config::ENRICHED_DATA_PATH);

    let result = match cli.command {
        Commands::Run {
            athlete_id,
            token,
            session_cookie,
            use_existing,
        } => {
            if use_existing {
                if !enriched_path.exists() {
                    bail!(
                        "no persisted dataset at {}; run the pipeline first",
                        enriched_path.display()
                    );
                }
                let ds = Dataset::load_or_empty(enriched_path)?;
                print_counts(&ds);
                println!("Complemented dataset: {}", enriched_path.display());
                return Ok(());
            }

            let token = required(token, "STRAVA_API_TOKEN", "--token")?;
            let cookie = required(session_cookie, "STRAVA_SESSION_COOKIE", "--session-cookie")?;

            let mut page = HttpRecordPage::new(&athlete_id, &cookie)?;
            let api = Arc::new(HttpSegmentApi::new(&token)?);
            let limiter = Arc::new(RateLimiter::from_config());

            let mut orch = PipelineOrchestrator::new(raw_path, enriched_path);
            let summary = orch.run(&mut page, api, limiter).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Extract {
            athlete_id,
            session_cookie,
        } => {
            let cookie = required(session_cookie, "STRAVA_SESSION_COOKIE", "--session-cookie")?;
            let mut page = HttpRecordPage::new(&athlete_id, &cookie)?;

            let mut orch = PipelineOrchestrator::new(raw_path, enriched_path);
            let summary = orch.run_extraction(&mut page).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Enrich { token } => {
            let token = required(token, "STRAVA_API_TOKEN", "--token")?;
            let api = Arc::new(HttpSegmentApi::new(&token)?);
            let limiter = Arc::new(RateLimiter::from_config());

            let mut orch = PipelineOrchestrator::new(raw_path, enriched_path);
            let summary = orch.run_enrichment_only(api, limiter).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Stats => {
            let orch = PipelineOrchestrator::new(raw_path, enriched_path);
            let ds = orch.load_dataset()?;
            if ds.is_empty() {
                println!("No persisted dataset yet. Run 'extract' or 'run' first.");
                return Ok(());
            }
            print_counts(&ds);
            Ok(())
        }
        Commands::ResetFailed => {
            let orch = PipelineOrchestrator::new(raw_path, enriched_path);
            let mut ds = orch.load_dataset()?;
            let reset = ds.reset_failed();
            if reset > 0 {
                ds.save(enriched_path)?;
            }
            println!("Requeued {} failed records as pending.", reset);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Flag value, else environment variable, else a usage error.
fn required(arg: Option<String>, env_var: &str, flag: &str) -> Result<String> {
    if let Some(v) = arg {
        return Ok(v);
    }
    match std::env::var(env_var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => bail!("missing credential: pass {flag} or set {env_var}"),
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Extracted {} records ({} rows skipped)",
        summary.extracted, summary.skipped_rows
    );
    println!(
        "Normalized: {} new, {} updated, {} skipped",
        summary.new_records, summary.updated_records, summary.skipped_entries
    );
    println!(
        "Enriched: {} ok, {} failed, {} still pending",
        summary.enriched, summary.enrich_failed, summary.still_pending
    );
    match summary.final_phase {
        Phase::Persisted => {
            println!("Dataset: {}", summary.dataset_path.display());
        }
        Phase::PartiallyEnriched | Phase::Failed => {
            if let Some(reason) = &summary.failure {
                println!("Run stopped in {}: {}", summary.final_phase, reason);
            }
            println!("Partial dataset: {}", summary.dataset_path.display());
        }
        _ => {}
    }
}

fn print_counts(ds: &Dataset) {
    let c = ds.status_counts();
    println!("Total:    {}", c.total);
    println!("Enriched: {}", c.enriched);
    println!("Failed:   {}", c.failed);
    println!("Pending:  {}", c.pending);
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
