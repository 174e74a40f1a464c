use std::env;

use anyhow::{Context, Result};
use chrono::Duration;

use docvault::{
    config::AppConfig,
    db,
    storage::{ObjectStorage, S3Storage},
    store::PgDatabase,
    utils::now_utc,
};

const USAGE: &str = "Usage: maintenance purge-tokens | purge-deleted <days>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt().with_target(false).compact().init();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("purge-tokens") => purge_tokens()?,
        Some("purge-deleted") => {
            let days: i64 = args
                .next()
                .context("purge-deleted requires a number of days")?
                .parse()
                .context("days must be a whole number")?;
            purge_deleted(days).await?
        }
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn connect(config: &AppConfig) -> Result<PgDatabase> {
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        s3_bucket = %config.s3_bucket,
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    Ok(PgDatabase::new(pool))
}

fn purge_tokens() -> Result<()> {
    let config = AppConfig::from_env()?;
    let database = connect(&config)?;

    let removed = database
        .purge_refresh_tokens(now_utc())
        .context("failed to purge refresh tokens")?;
    println!("Removed {removed} used or expired refresh tokens.");
    Ok(())
}

async fn purge_deleted(days: i64) -> Result<()> {
    let config = AppConfig::from_env()?;
    let database = connect(&config)?;
    let storage = S3Storage::from_config(&config).await?;

    let cutoff = now_utc() - Duration::days(days.max(0));
    let deleted = database
        .deleted_documents_before(cutoff)
        .context("failed to load deleted documents")?;

    if deleted.is_empty() {
        println!("No deleted documents older than {days} days.");
        return Ok(());
    }

    println!("Purging {} documents…", deleted.len());

    let mut purged = Vec::with_capacity(deleted.len());
    for (id, key) in deleted {
        match storage.delete_object(&key).await {
            Ok(()) => purged.push(id),
            Err(err) => eprintln!("Failed to delete object {key} from storage: {err}"),
        }
    }

    let removed = database
        .hard_delete_documents(&purged)
        .context("failed to remove document records")?;
    println!("Removed {removed} document records.");
    Ok(())
}
