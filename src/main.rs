use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use contextual_chat::{
    ai::{AiClient, ContextualClient},
    api::{create_router, AppState},
    config::Config,
    crypto::MessageCipher,
    db::ConversationStore,
    error::AppError,
    rate_limit::RateLimiter,
    session::SessionAuthenticator,
    transient::TransientStore,
};

/// How often the transient store is swept for entries no read has touched.
const TRANSIENT_SWEEP_SECS: u64 = 300;
/// How often old conversations are checked against the retention window.
const RETENTION_SWEEP_SECS: u64 = 6 * 3600;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,contextual_chat=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "🚀 Starting Contextual Chat server v{}...",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    tracing::info!("✅ Configuration loaded");

    // Setup database with proper connection pooling
    let db = SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    tracing::info!("✅ Database connected: {}", config.database_url);

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .map_err(|e| AppError::Internal(format!("Migration failed: {}", e)))?;

    tracing::info!("✅ Database migrations completed");

    // At-rest encryption: the key is optional, but refusing to start beats
    // silently writing plaintext when encryption was asked for.
    let cipher = match &config.encryption_key {
        Some(key) => Some(Arc::new(MessageCipher::new(key)?)),
        None => None,
    };
    let store = Arc::new(ConversationStore::new(
        db.clone(),
        cipher,
        config.encryption_at_rest,
    )?);
    if config.encryption_at_rest {
        tracing::info!("✅ At-rest message encryption enabled");
    } else {
        tracing::warn!("⚠️  At-rest message encryption disabled - messages stored as plaintext");
    }

    // Shared expiring store backing sessions and rate-limit buckets
    let transients = Arc::new(TransientStore::new());

    let limiter = Arc::new(RateLimiter::new(
        Arc::clone(&transients),
        config.rate_limit_capacity,
        config.rate_limit_window_secs,
    ));
    tracing::info!(
        "✅ Rate limiter configured ({} req / {}s per client)",
        config.rate_limit_capacity,
        config.rate_limit_window_secs
    );

    let sessions = Arc::new(SessionAuthenticator::new(
        Arc::clone(&transients),
        config.auth_secret.clone(),
        config.session_ttl_secs,
    ));
    tracing::info!(
        "✅ Session tokens configured (TTL {}s)",
        config.session_ttl_secs
    );

    // AI client, if the key is configured; without it chat requests fail
    // with a configuration error rather than the whole server refusing boot.
    let ai: Option<Arc<dyn AiClient>> = match &config.contextual_api_key {
        Some(api_key) => {
            let client = ContextualClient::new(
                api_key.clone(),
                config.contextual_api_base.clone(),
                config.ai_timeout_secs,
            )?;
            tracing::info!("✅ AI client configured ({})", config.contextual_api_base);
            Some(Arc::new(client))
        }
        None => {
            tracing::warn!("⚠️  CONTEXTUAL_API_KEY not set - chat requests will be rejected");
            None
        }
    };
    if config.contextual_datastore_id.is_none() {
        tracing::warn!("⚠️  CONTEXTUAL_DATASTORE_ID not set - chat requests will be rejected");
    }

    // Create shared application state
    let state = AppState {
        store: Arc::clone(&store),
        sessions,
        limiter,
        ai,
        config: config.clone(),
    };

    // Spawn background task sweeping expired sessions and rate buckets
    {
        let transients = Arc::clone(&transients);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(TRANSIENT_SWEEP_SECS));
            loop {
                interval.tick().await;
                let removed = transients.cleanup().await;
                tracing::debug!("🧹 Transient sweep removed {} entries", removed);
            }
        });
        tracing::info!("✅ Transient cleanup task started");
    }

    // Spawn background task enforcing conversation retention
    {
        let store = Arc::clone(&store);
        let days = config.retention_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_SECS));
            loop {
                interval.tick().await;
                match store.cleanup_old_conversations(days).await {
                    Ok(deleted) => {
                        tracing::debug!("🧹 Retention sweep removed {} conversations", deleted)
                    }
                    Err(e) => tracing::error!("❌ Retention cleanup failed: {}", e),
                }
            }
        });
        tracing::info!(
            "✅ Retention cleanup task started ({} day window)",
            config.retention_days
        );
    }

    // Build router
    let app = create_router(state);

    // Bind and serve
    let addr = config.server_address();
    tracing::info!("🌐 Server listening on http://{}", addr);
    tracing::info!("🏥 Health check: http://{}/api/health", addr);
    tracing::info!("");
    tracing::info!("📚 API Endpoints:");
    tracing::info!("  GET  /api/token         - Issue a session token");
    tracing::info!("  POST /api/token/revoke  - Revoke a session token");
    tracing::info!("  POST /api/chat          - Send a chat message");
    tracing::info!("  GET  /api/chat/history  - Fetch conversation history");
    tracing::info!("  GET  /api/conversations - List recent conversations");
    tracing::info!("");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| AppError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
