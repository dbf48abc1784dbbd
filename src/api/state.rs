use std::sync::Arc;

use crate::ai::AiClient;
use crate::config::Config;
use crate::db::ConversationStore;
use crate::rate_limit::RateLimiter;
use crate::session::SessionAuthenticator;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConversationStore>,
    pub sessions: Arc<SessionAuthenticator>,
    pub limiter: Arc<RateLimiter>,
    /// Absent when no API key is configured; chat requests then fail with a
    /// configuration error instead of at startup.
    pub ai: Option<Arc<dyn AiClient>>,
    pub config: Arc<Config>,
}
