use crate::error::AppError;

#[derive(Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub request_timeout_secs: u64,
    /// Key for at-rest message encryption. Must be at least 32 bytes when set.
    pub encryption_key: Option<String>,
    /// Whether new messages are written encrypted. Rows remember their own
    /// encryption state, so flipping this never breaks existing history.
    pub encryption_at_rest: bool,
    /// Secret the session-token proofs are keyed with.
    pub auth_secret: String,
    pub session_ttl_secs: i64,
    pub rate_limit_capacity: f64,
    pub rate_limit_window_secs: f64,
    pub max_message_chars: usize,
    pub retention_days: i64,
    pub contextual_api_key: Option<String>,
    pub contextual_datastore_id: Option<String>,
    pub contextual_api_base: String,
    pub ai_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Config {
            server_host: std::env::var("SERVER_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid SERVER_PORT: {}", e)))?,
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://contextual_chat.db".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid DB_MAX_CONNECTIONS: {}", e)))?,
            db_min_connections: std::env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid DB_MIN_CONNECTIONS: {}", e)))?,
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid REQUEST_TIMEOUT_SECS: {}", e)))?,
            encryption_key: std::env::var("ENCRYPTION_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            encryption_at_rest: std::env::var("ENCRYPTION_AT_REST")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid ENCRYPTION_AT_REST: {}", e)))?,
            auth_secret: match std::env::var("AUTH_SECRET") {
                Ok(secret) if !secret.is_empty() => secret,
                _ => generated_auth_secret(),
            },
            session_ttl_secs: std::env::var("SESSION_TTL_SECS")
                .unwrap_or_else(|_| "900".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid SESSION_TTL_SECS: {}", e)))?,
            rate_limit_capacity: std::env::var("RATE_LIMIT_CAPACITY")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid RATE_LIMIT_CAPACITY: {}", e)))?,
            rate_limit_window_secs: std::env::var("RATE_LIMIT_WINDOW_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid RATE_LIMIT_WINDOW_SECS: {}", e)))?,
            max_message_chars: std::env::var("MAX_MESSAGE_CHARS")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid MAX_MESSAGE_CHARS: {}", e)))?,
            retention_days: std::env::var("RETENTION_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid RETENTION_DAYS: {}", e)))?,
            contextual_api_key: std::env::var("CONTEXTUAL_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            contextual_datastore_id: std::env::var("CONTEXTUAL_DATASTORE_ID")
                .ok()
                .filter(|id| !id.is_empty()),
            contextual_api_base: std::env::var("CONTEXTUAL_API_BASE")
                .unwrap_or_else(|_| "https://api.contextual.ai/v1".to_string()),
            ai_timeout_secs: std::env::var("AI_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid AI_TIMEOUT_SECS: {}", e)))?,
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// Fallback when AUTH_SECRET is unset: tokens still work, but none of them
/// survive a restart. Loud on purpose.
fn generated_auth_secret() -> String {
    use rand::Rng;

    let secret: [u8; 32] = rand::thread_rng().gen();
    tracing::warn!("AUTH_SECRET not set; using an ephemeral secret for this process");
    hex::encode(secret)
}
