use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ai::ContextMessage;
use crate::api::middleware;
use crate::api::state::AppState;
use crate::db::conversations::{DEFAULT_MESSAGE_LIMIT, DEFAULT_RECENT_LIMIT};
use crate::db::{Conversation, Message, MessageRole};
use crate::error::AppError;
use crate::session::{SessionRecord, ANONYMOUS_USER};

/// How many prior turns are replayed to the AI service for context.
const CONTEXT_MESSAGES: i64 = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub conversation_id: String,
    pub message_id: String,
    pub response: String,
    pub token_count: i64,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub conversation_id: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentQuery {
    pub session_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub conversations: Vec<Conversation>,
}

/// POST /api/chat
///
/// The request pipeline, in order: authenticate (optional bearer), validate
/// the message, resolve or create the conversation, persist the user turn,
/// query the AI service, persist the assistant turn, respond. Rate limiting
/// has already happened in the router layer. Side effects keep that order;
/// a failure after the user turn is stored leaves it stored.
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let auth = authenticate(&state, &headers).await?;

    let message = req.message.trim();
    if message.is_empty() {
        return Err(AppError::EmptyMessage);
    }
    let max_chars = state.config.max_message_chars;
    if message.chars().count() > max_chars {
        return Err(AppError::MessageTooLong(max_chars));
    }

    let session_key = resolve_session_key(&auth, req.session_id);
    let conversation = match &req.conversation_id {
        Some(id) => state
            .store
            .get_conversation(id)
            .await?
            .ok_or(AppError::ConversationNotFound)?,
        None => {
            let owner = auth
                .as_ref()
                .map(|record| record.user_id)
                .filter(|uid| *uid != ANONYMOUS_USER);
            let conversation = state
                .store
                .create_conversation(owner, &session_key, None)
                .await?;
            tracing::info!(
                target: "analytics",
                conversation_id = %conversation.id,
                "conversation started"
            );
            conversation
        }
    };

    // Context is whatever was in the conversation before this turn.
    let stats = state.store.get_conversation_stats(&conversation.id).await?;
    let context_offset = (stats.message_count - CONTEXT_MESSAGES).max(0);
    let context: Vec<ContextMessage> = state
        .store
        .get_messages(&conversation.id, CONTEXT_MESSAGES, context_offset)
        .await?
        .into_iter()
        .map(|m| ContextMessage {
            role: m.role,
            content: m.content,
        })
        .collect();

    state
        .store
        .add_message(&conversation.id, MessageRole::User, message, None, 0)
        .await?;

    let datastore_id = state
        .config
        .contextual_datastore_id
        .as_deref()
        .ok_or(AppError::DatastoreNotConfigured)?;
    let ai = state.ai.as_ref().ok_or(AppError::ApiNotConfigured)?;
    let reply = ai.send_message(datastore_id, message, &context).await?;

    let assistant_message = state
        .store
        .add_message(
            &conversation.id,
            MessageRole::Assistant,
            &reply.text,
            None,
            reply.token_count,
        )
        .await?;

    Ok(Json(ChatResponse {
        conversation_id: conversation.id,
        message_id: assistant_message.id,
        response: reply.text,
        token_count: reply.token_count,
        session_id: session_key,
    }))
}

/// GET /api/chat/history
///
/// Decrypted transcript for a conversation, or for the session's current
/// conversation when no id is given. A session with no conversation yet is
/// an empty transcript, not an error.
pub async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let auth = authenticate(&state, &headers).await?;

    let conversation = match &query.conversation_id {
        Some(id) => Some(
            state
                .store
                .get_conversation(id)
                .await?
                .ok_or(AppError::ConversationNotFound)?,
        ),
        None => {
            let session_key = resolve_session_key(&auth, query.session_id);
            state.store.get_conversation_by_session(&session_key).await?
        }
    };

    let Some(conversation) = conversation else {
        return Ok(Json(HistoryResponse {
            conversation_id: None,
            messages: Vec::new(),
        }));
    };

    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);
    let messages = state
        .store
        .get_messages(&conversation.id, limit, offset)
        .await?;

    Ok(Json(HistoryResponse {
        conversation_id: Some(conversation.id),
        messages,
    }))
}

/// GET /api/conversations
///
/// Recent conversations for the widget's list view, newest activity first.
/// Signed-in users see their own; anonymous sessions see the session's.
pub async fn get_recent_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentResponse>, AppError> {
    let auth = authenticate(&state, &headers).await?;

    let owner = auth
        .as_ref()
        .map(|record| record.user_id)
        .filter(|uid| *uid != ANONYMOUS_USER);
    let session_key = resolve_session_key(&auth, query.session_id);
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, 50);

    let conversations = state
        .store
        .get_recent_conversations(owner, &session_key, limit)
        .await?;

    Ok(Json(RecentResponse { conversations }))
}

/// Verifies the bearer token when one is present. All verification failures
/// collapse into the same invalid-token error.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<SessionRecord>, AppError> {
    match middleware::bearer_token(headers)? {
        Some(token) => state
            .sessions
            .verify(token)
            .await
            .map(Some)
            .ok_or(AppError::InvalidToken),
        None => Ok(None),
    }
}

/// A verified token pins the session; otherwise the caller may name one, and
/// failing that a fresh session key is minted.
fn resolve_session_key(auth: &Option<SessionRecord>, requested: Option<String>) -> String {
    auth.as_ref()
        .map(|record| record.session_id.clone())
        .or(requested)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
