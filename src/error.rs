use axum::http::StatusCode;
use thiserror::Error;

/// Application error space. The first group maps one-to-one onto wire codes
/// the widget understands; the second group is internal detail that always
/// surfaces as a generic `chat_failed`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,

    #[error("Invalid or expired session token")]
    InvalidToken,

    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Message exceeds the maximum length of {0} characters")]
    MessageTooLong(usize),

    #[error("Conversation not found")]
    ConversationNotFound,

    #[error("No datastore is configured for this assistant")]
    DatastoreNotConfigured,

    #[error("No API key is configured for this assistant")]
    ApiNotConfigured,

    #[error("The AI service returned an empty response")]
    AiResponseEmpty,

    #[error("The AI service returned an unreadable response")]
    AiResponseInvalid,

    #[error("Chat request failed: {0}")]
    ChatFailed(String),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code carried in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::RateLimited => "rate_limit_exceeded",
            AppError::InvalidToken => "invalid_token",
            AppError::EmptyMessage => "invalid_message",
            AppError::MessageTooLong(_) => "message_too_long",
            AppError::ConversationNotFound => "conversation_not_found",
            AppError::DatastoreNotConfigured => "datastore_not_configured",
            AppError::ApiNotConfigured => "api_not_configured",
            AppError::AiResponseEmpty => "ai_response_empty",
            AppError::AiResponseInvalid => "ai_response_invalid",
            AppError::ChatFailed(_)
            | AppError::Crypto(_)
            | AppError::Database(_)
            | AppError::Config(_)
            | AppError::Internal(_) => "chat_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidToken => StatusCode::UNAUTHORIZED,
            AppError::EmptyMessage | AppError::MessageTooLong(_) => StatusCode::BAD_REQUEST,
            AppError::ConversationNotFound => StatusCode::NOT_FOUND,
            AppError::AiResponseEmpty | AppError::AiResponseInvalid => StatusCode::BAD_GATEWAY,
            AppError::DatastoreNotConfigured
            | AppError::ApiNotConfigured
            | AppError::ChatFailed(_)
            | AppError::Crypto(_)
            | AppError::Database(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for variants whose Display text is internal detail that must not
    /// reach the client.
    fn is_internal(&self) -> bool {
        matches!(
            self,
            AppError::ChatFailed(_)
                | AppError::Crypto(_)
                | AppError::Database(_)
                | AppError::Config(_)
                | AppError::Internal(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

// Axum IntoResponse implementation for HTTP errors
impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let code = self.code();

        let message = if self.is_internal() {
            // Full detail goes to the log, never to the wire.
            tracing::error!(code, error = %self, "request failed");
            "The request could not be completed. Please try again.".to_string()
        } else {
            self.to_string()
        };

        let body = serde_json::json!({
            "code": code,
            "message": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_and_statuses_line_up() {
        assert_eq!(AppError::RateLimited.code(), "rate_limit_exceeded");
        assert_eq!(AppError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);

        assert_eq!(AppError::InvalidToken.code(), "invalid_token");
        assert_eq!(AppError::InvalidToken.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(AppError::MessageTooLong(4000).code(), "message_too_long");
        assert_eq!(AppError::MessageTooLong(4000).status(), StatusCode::BAD_REQUEST);

        assert_eq!(AppError::ConversationNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::AiResponseEmpty.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_detail_collapses_to_chat_failed() {
        let err = AppError::Internal("pool exhausted".to_string());
        assert_eq!(err.code(), "chat_failed");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_internal());

        let err = AppError::Crypto("bad key length".to_string());
        assert_eq!(err.code(), "chat_failed");
        assert!(err.is_internal());
    }
}
