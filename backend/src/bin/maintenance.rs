use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use spends_tracker::{
    config::AppConfig,
    db,
    store::{AttachmentStore, SweepOptions},
};

const USAGE: &str = "Usage: maintenance <verify | sweep-orphans [--dry-run]>\n  sweep-orphans should run while the server is stopped";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("verify") => verify().await,
        Some("sweep-orphans") => {
            let dry_run = match args.next().as_deref() {
                None => false,
                Some("--dry-run") => true,
                Some(other) => {
                    eprintln!("Unknown option: {other}\n{USAGE}");
                    return Ok(ExitCode::FAILURE);
                }
            };
            sweep_orphans(dry_run).await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            Ok(ExitCode::FAILURE)
        }
        None => {
            eprintln!("{USAGE}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn open_store() -> Result<AttachmentStore> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.database_url,
        pool_size = config.database_max_pool_size,
        uploads_dir = %config.uploads_dir.display(),
        "loaded backend configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    db::run_migrations(&pool)?;
    AttachmentStore::from_config(pool, &config).context("failed to open uploads directory")
}

async fn verify() -> Result<ExitCode> {
    let store = open_store()?;
    let issues = store
        .verify_ledger()
        .await
        .context("failed to verify attachment ledger")?;

    if issues.is_empty() {
        println!("Ledger is consistent.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Found {} ledger issue(s):", issues.len());
    for issue in &issues {
        println!("  {issue}");
    }
    Ok(ExitCode::FAILURE)
}

async fn sweep_orphans(dry_run: bool) -> Result<ExitCode> {
    let store = open_store()?;
    let report = store
        .sweep_orphans(SweepOptions {
            dry_run,
            ..SweepOptions::default()
        })
        .await
        .context("failed to sweep orphan blobs")?;

    for name in &report.orphans {
        println!("{} {name}", if dry_run { "would remove" } else { "orphan" });
    }
    println!(
        "Scanned {} blob(s): {} orphan(s), {} removed, {} bytes reclaimed.",
        report.scanned,
        report.orphans.len(),
        report.removed,
        report.bytes_reclaimed
    );
    Ok(ExitCode::SUCCESS)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
