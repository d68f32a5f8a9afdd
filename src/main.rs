//! Solofed binary entry point

use solofed::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired peer keys are dropped from the cache
const KEY_CACHE_PRUNE_INTERVAL_SECS: u64 = 600;

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start HTTP server
/// 6. Start background tasks (key cache pruning)
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_format =
        std::env::var("SOLOFED__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "solofed=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "solofed=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Solofed...");

    solofed::metrics::init_metrics();

    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        actor = %config.actor.identifier,
        "Configuration loaded"
    );

    let state = AppState::new(config.clone()).await?;

    // Generate the actor key up front rather than on the first request.
    let key_pairs = state
        .keys
        .get_or_create_key_pairs(&config.actor.identifier)
        .await?;
    tracing::info!(count = key_pairs.len(), "Actor key pairs ready");

    let app = solofed::build_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!(
        "Follow {} from any ActivityPub server",
        state.dispatcher.webfinger_subject(&config.actor.identifier)
    );

    spawn_key_cache_prune_task(state.clone());

    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_key_cache_prune_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            KEY_CACHE_PRUNE_INTERVAL_SECS,
        ));
        // First tick fires immediately; nothing is cached yet.
        interval.tick().await;

        loop {
            interval.tick().await;
            state.key_cache.prune_expired().await;
        }
    });

    tracing::info!("Key cache prune task spawned");
}
