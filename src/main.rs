use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use docvault::{
    auth::password::SecretHasher,
    cache::{LruMetadataCache, MetadataCache},
    config::AppConfig,
    db,
    notifier::{IpChangeNotifier, WebhookNotifier},
    routes,
    state::AppState,
    storage::{ObjectStorage, S3Storage},
    store::PgDatabase,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        cache_ttl_secs = config.cache_ttl_secs,
        webhook_enabled = config.webhook_url.is_some(),
        admin_token_enabled = config.admin_token.is_some(),
        s3_bucket = %config.s3_bucket,
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let migrations_pool = pool.clone();
    let applied = tokio::task::spawn_blocking(move || db::run_migrations(&migrations_pool))
        .await
        .context("migration task panicked")??;
    tracing::info!(applied, "database migrations up to date");

    let storage: Arc<dyn ObjectStorage> = Arc::new(S3Storage::from_config(&config).await?);
    let cache: Arc<dyn MetadataCache> = Arc::new(LruMetadataCache::new(
        config.cache_capacity,
        config.cache_ttl(),
    ));
    let notifier: Arc<dyn IpChangeNotifier> = Arc::new(WebhookNotifier::from_config(&config)?);
    let hasher = SecretHasher::from_config(&config)?;

    let listen_addr: SocketAddr =
        format!("{}:{}", config.server_host, config.server_port).parse()?;
    let state = AppState::new(
        config,
        PgDatabase::new(pool),
        storage,
        cache,
        notifier,
        hasher,
    );
    let router = routes::create_router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
