//! Boundary to the hosted AI service.
//!
//! The orchestration layer only sees [`AiClient`]; the HTTP implementation
//! lives in [`contextual`] and tests substitute their own.

pub mod contextual;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::MessageRole;

pub use contextual::ContextualClient;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("request to AI service failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("AI service returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("AI service returned an empty response")]
    EmptyResponse,

    #[error("AI service response had no recognizable reply field")]
    MalformedResponse,
}

/// Prior turn handed to the service for conversational context.
#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub content: String,
}

/// What a successful query yields.
#[derive(Debug, Clone)]
pub struct AiReply {
    pub text: String,
    pub token_count: i64,
}

#[async_trait]
pub trait AiClient: Send + Sync {
    async fn send_message(
        &self,
        datastore_id: &str,
        content: &str,
        context: &[ContextMessage],
    ) -> Result<AiReply, AiError>;
}

/// Empty and malformed replies keep their own wire codes; transport and API
/// failures collapse into the generic chat failure, detail going to the log.
impl From<AiError> for crate::error::AppError {
    fn from(err: AiError) -> Self {
        use crate::error::AppError;

        match err {
            AiError::EmptyResponse => AppError::AiResponseEmpty,
            AiError::MalformedResponse => AppError::AiResponseInvalid,
            other => AppError::ChatFailed(other.to_string()),
        }
    }
}
