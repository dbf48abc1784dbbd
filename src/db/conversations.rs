use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{FromRow, Pool, Sqlite};
use uuid::Uuid;

use crate::crypto::MessageCipher;
use crate::db::models::{
    format_timestamp, parse_timestamp, Conversation, ConversationStats, ConversationStatus,
    Message, MessageRole,
};
use crate::error::AppError;

pub const DEFAULT_MESSAGE_LIMIT: i64 = 50;
pub const DEFAULT_RECENT_LIMIT: i64 = 10;
const DEFAULT_TITLE: &str = "New Conversation";

#[derive(FromRow)]
struct ConversationRow {
    id: String,
    owner_user: Option<i64>,
    session_key: String,
    title: String,
    status: String,
    created_at: String,
    updated_at: String,
}

#[derive(FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    encrypted: bool,
    metadata: Option<String>,
    token_count: i64,
    created_at: String,
}

/// Optional fields for [`ConversationStore::update_conversation`]. Anything
/// left as `None` keeps its current value; `updated_at` is stamped either way.
#[derive(Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub status: Option<ConversationStatus>,
}

/// Conversation and message persistence, with transparent at-rest encryption.
///
/// Whether a message body is encrypted is decided at write time and recorded
/// on the row, so reads never depend on today's configuration.
pub struct ConversationStore {
    pool: Pool<Sqlite>,
    cipher: Option<Arc<MessageCipher>>,
    encrypt_at_rest: bool,
}

impl ConversationStore {
    pub fn new(
        pool: Pool<Sqlite>,
        cipher: Option<Arc<MessageCipher>>,
        encrypt_at_rest: bool,
    ) -> Result<Self, AppError> {
        if encrypt_at_rest && cipher.is_none() {
            return Err(AppError::Config(
                "at-rest encryption is enabled but no encryption key is configured".to_string(),
            ));
        }
        Ok(ConversationStore {
            pool,
            cipher,
            encrypt_at_rest,
        })
    }

    pub async fn create_conversation(
        &self,
        owner_user: Option<i64>,
        session_key: &str,
        title: Option<&str>,
    ) -> Result<Conversation, AppError> {
        let id = Uuid::new_v4().to_string();
        let stamp = format_timestamp(Utc::now());
        let title = match title {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => DEFAULT_TITLE.to_string(),
        };

        sqlx::query(
            r#"
INSERT INTO conversations (id, owner_user, session_key, title, status, created_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(owner_user)
        .bind(session_key)
        .bind(&title)
        .bind(ConversationStatus::Active.as_str())
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await?;

        let created_at = parse_timestamp(&stamp)?;
        Ok(Conversation {
            id,
            owner_user,
            session_key: session_key.to_string(),
            title,
            status: ConversationStatus::Active,
            created_at,
            updated_at: created_at,
        })
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
SELECT id, owner_user, session_key, title, status, created_at, updated_at
FROM conversations
WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    /// The most recently touched active conversation for a widget session.
    pub async fn get_conversation_by_session(
        &self,
        session_key: &str,
    ) -> Result<Option<Conversation>, AppError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
SELECT id, owner_user, session_key, title, status, created_at, updated_at
FROM conversations
WHERE session_key = ? AND status = ?
ORDER BY updated_at DESC
LIMIT 1
            "#,
        )
        .bind(session_key)
        .bind(ConversationStatus::Active.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    /// Applies a patch and stamps `updated_at` whether or not any field
    /// changed. An empty patch is the idiom for touching a conversation.
    pub async fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
UPDATE conversations
SET title = COALESCE(?, title),
    status = COALESCE(?, status),
    updated_at = ?
WHERE id = ?
            "#,
        )
        .bind(patch.title)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Removes a conversation and every message in it, atomically. This path
    /// never raises: failures are logged and reported as `false`, which is
    /// what the cleanup jobs that call it want.
    pub async fn delete_conversation(&self, id: &str) -> bool {
        match self.delete_conversation_inner(id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::error!(conversation_id = %id, error = %e, "Failed to delete conversation");
                false
            }
        }
    }

    async fn delete_conversation_inner(&self, id: &str) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Appends a message and bumps the conversation's `updated_at` in one
    /// transaction. Content is encrypted when the store is configured for it,
    /// and the row remembers which way it was written.
    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        metadata: Option<Value>,
        token_count: i64,
    ) -> Result<Message, AppError> {
        let id = Uuid::new_v4().to_string();
        let stamp = format_timestamp(Utc::now());

        let encrypted = self.encrypt_at_rest;
        let stored_content = if encrypted {
            match &self.cipher {
                Some(cipher) => cipher.encrypt(content)?,
                None => {
                    return Err(AppError::Config(
                        "at-rest encryption is enabled but no encryption key is configured"
                            .to_string(),
                    ))
                }
            }
        } else {
            content.to_string()
        };

        let stored_metadata = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(format!("failed to serialize metadata: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO messages (id, conversation_id, role, content, encrypted, metadata, token_count, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(&stored_content)
        .bind(encrypted)
        .bind(&stored_metadata)
        .bind(token_count)
        .bind(&stamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&stamp)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let created_at = parse_timestamp(&stamp)?;
        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            metadata,
            token_count,
            created_at,
        })
    }

    /// Messages in chronological order, decrypted per the flag each row was
    /// written with.
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
SELECT id, conversation_id, role, content, encrypted, metadata, token_count, created_at
FROM messages
WHERE conversation_id = ?
ORDER BY created_at ASC, rowid ASC
LIMIT ? OFFSET ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.message_from_row(row)).collect()
    }

    pub async fn get_recent_conversations(
        &self,
        owner_user: Option<i64>,
        session_key: &str,
        limit: i64,
    ) -> Result<Vec<Conversation>, AppError> {
        let rows = if let Some(owner) = owner_user {
            sqlx::query_as::<_, ConversationRow>(
                r#"
SELECT id, owner_user, session_key, title, status, created_at, updated_at
FROM conversations
WHERE owner_user = ?
ORDER BY updated_at DESC
LIMIT ?
                "#,
            )
            .bind(owner)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, ConversationRow>(
                r#"
SELECT id, owner_user, session_key, title, status, created_at, updated_at
FROM conversations
WHERE session_key = ?
ORDER BY updated_at DESC
LIMIT ?
                "#,
            )
            .bind(session_key)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(conversation_from_row).collect()
    }

    pub async fn get_conversation_stats(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationStats, AppError> {
        let (message_count, total_tokens, first_at, last_at) =
            sqlx::query_as::<_, (i64, i64, Option<String>, Option<String>)>(
                r#"
SELECT COUNT(*), COALESCE(SUM(token_count), 0), MIN(created_at), MAX(created_at)
FROM messages
WHERE conversation_id = ?
                "#,
            )
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(ConversationStats {
            message_count,
            total_tokens,
            first_message_at: first_at.as_deref().map(parse_timestamp).transpose()?,
            last_message_at: last_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    /// Deletes conversations untouched for longer than `days_to_keep`. One
    /// stubborn conversation does not stop the batch; the count reflects what
    /// actually went away.
    pub async fn cleanup_old_conversations(&self, days_to_keep: i64) -> Result<u64, AppError> {
        let cutoff = format_timestamp(Utc::now() - Duration::days(days_to_keep));

        let stale: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE updated_at < ?")
                .bind(&cutoff)
                .fetch_all(&self.pool)
                .await?;

        let mut deleted = 0u64;
        for (id,) in stale {
            if self.delete_conversation(&id).await {
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::info!("Cleaned up {} conversations past retention", deleted);
        }
        Ok(deleted)
    }

    fn message_from_row(&self, row: MessageRow) -> Result<Message, AppError> {
        let role = MessageRole::parse(&row.role)
            .ok_or_else(|| AppError::Internal(format!("unknown message role {:?}", row.role)))?;

        let content = if row.encrypted {
            match &self.cipher {
                Some(cipher) => cipher.decrypt(&row.content)?,
                None => {
                    return Err(AppError::Crypto(
                        "encrypted message on disk but no encryption key is configured"
                            .to_string(),
                    ))
                }
            }
        } else {
            row.content
        };

        let metadata = row
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Internal(format!("invalid stored metadata: {}", e)))?;

        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            role,
            content,
            metadata,
            token_count: row.token_count,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

fn conversation_from_row(row: ConversationRow) -> Result<Conversation, AppError> {
    let status = ConversationStatus::parse(&row.status)
        .ok_or_else(|| AppError::Internal(format!("unknown conversation status {:?}", row.status)))?;

    Ok(Conversation {
        id: row.id,
        owner_user: row.owner_user,
        session_key: row.session_key,
        title: row.title,
        status,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}
