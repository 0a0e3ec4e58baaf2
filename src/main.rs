mod auth;
mod config;
mod db;
mod extract;
mod orchestrator;
mod record;
mod session;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::db::UpsertStore;
use crate::extract::ExtractionPipeline;
use crate::orchestrator::{Orchestrator, RunOptions, RunReport};
use crate::session::{BrowserSession, HttpSession};

#[derive(Parser)]
#[command(name = "pricewatch", about = "Daily product price monitor")]
struct Cli {
    /// Config file (default: ./pricewatch.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and price table
    Init,
    /// Scrape every task in the task file and save today's prices
    Run {
        /// Task sheet (.xlsx or CSV) with Platform, URL and optional SKU columns
        #[arg(short, long)]
        tasks: Option<PathBuf>,
        /// Only run tasks for this platform
        #[arg(short, long)]
        platform: Option<String>,
        /// Pages loaded in parallel
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
        /// Max tasks to run
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Extract the price from a single page without saving it
    Probe {
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }

    let result = match cli.command {
        Commands::Init => {
            let store = UpsertStore::open(&settings.db_path)?;
            println!(
                "Database ready: {:?} ({} price rows)",
                settings.db_path,
                store.row_count()?
            );
            Ok(())
        }
        Commands::Run {
            tasks,
            platform,
            concurrency,
            limit,
        } => {
            if let Some(t) = tasks {
                settings.tasks_path = t;
            }
            if platform.is_some() {
                settings.platform = platform;
            }
            if let Some(c) = concurrency {
                settings.concurrency = c.max(1);
            }
            run(&settings, limit).await
        }
        Commands::Probe { url } => probe(&settings, &url).await,
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run(settings: &Settings, limit: Option<usize>) -> anyhow::Result<()> {
    let mut store = UpsertStore::open(&settings.db_path)?;
    info!("Database {:?} ready", settings.db_path);

    let mut task_list = tasks::load_tasks(&settings.tasks_path, settings.platform.as_deref())?;
    if let Some(n) = limit {
        task_list.truncate(n);
    }
    if task_list.is_empty() {
        match &settings.platform {
            Some(p) => println!("No tasks for platform '{}' in {:?}.", p, settings.tasks_path),
            None => println!("No tasks in {:?}.", settings.tasks_path),
        }
    }

    let session: Arc<dyn BrowserSession> = Arc::new(HttpSession::from_settings(settings)?);
    let pipeline = Arc::new(ExtractionPipeline::from_settings(settings)?);
    let orchestrator = Orchestrator::new(session, pipeline, RunOptions::from_settings(settings));

    let pb = ProgressBar::new(task_list.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} (eta {eta})")?
            .progress_chars("=> "),
    );

    let today = chrono::Local::now().date_naive();
    println!("Checking {} products (date: {})...", task_list.len(), today);
    let report = orchestrator.run(task_list, today, &mut store, &pb).await;
    finish(settings, report)
}

/// Print the run summary; on a failed write, park the records for a retry.
fn finish(settings: &Settings, report: RunReport) -> anyhow::Result<()> {
    if let Some(reason) = &report.aborted {
        warn!("Run stopped early: {}", reason);
    }
    println!(
        "Done: {} ok, {} failed, {} invalid, {} not attempted.",
        report.succeeded, report.failed, report.invalid, report.not_attempted
    );

    match report.persisted {
        Ok(rows) => {
            println!(
                "Saved {} records to {:?} ({} rows inserted or updated).",
                report.records.len(),
                settings.db_path,
                rows
            );
            Ok(())
        }
        Err(e) => {
            error!("Saving results failed: {:#}", e);
            let pending = settings.pending_path();
            let json = serde_json::to_string_pretty(&report.records)?;
            std::fs::write(&pending, json)
                .with_context(|| format!("Failed to write pending records to {:?}", pending))?;
            println!(
                "{} records kept in {:?}; nothing was written to the database.",
                report.records.len(),
                pending
            );
            Err(e.context("final save failed"))
        }
    }
}

async fn probe(settings: &Settings, url: &str) -> anyhow::Result<()> {
    let task = tasks::Task::new("probe", url);
    task.validate()?;

    let session = HttpSession::from_settings(settings)?;
    let pipeline = ExtractionPipeline::from_settings(settings)?;
    let page = session
        .navigate(url, settings.navigation_timeout())
        .await
        .with_context(|| format!("Failed to load {}", url))?;

    let price = pipeline.extract(page.as_ref(), &task).await;
    println!("Price: {}", price);
    if let Some(image) = pipeline.extract_image(page.as_ref()).await {
        println!("Image: {}", image);
    }
    Ok(())
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
