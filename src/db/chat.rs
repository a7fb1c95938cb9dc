use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::*;
use crate::util::{new_id, now_rfc3339};

const CONVERSATION_COLUMNS: &str = "id, user_id, contact_name, contact_phone, contact_avatar, \
     platform, platform_contact_id, last_message, last_message_time, unread_count, status, \
     contact_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, user_id, conversation_id, content, sender_type, sender_name, \
     sender_id, message_type, platform, platform_message_id, metadata, read, created_at";

fn conversation_from_row(row: &Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        contact_name: row.get(2)?,
        contact_phone: row.get(3)?,
        contact_avatar: row.get(4)?,
        platform: row.get(5)?,
        platform_contact_id: row.get(6)?,
        last_message: row.get(7)?,
        last_message_time: row.get(8)?,
        unread_count: row.get(9)?,
        status: row.get(10)?,
        contact_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<ChatMessage> {
    let metadata: String = row.get(10)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        content: row.get(3)?,
        sender_type: row.get(4)?,
        sender_name: row.get(5)?,
        sender_id: row.get(6)?,
        message_type: row.get(7)?,
        platform: row.get(8)?,
        platform_message_id: row.get(9)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        read: row.get::<_, i32>(11)? != 0,
        created_at: row.get(12)?,
    })
}

impl CrmDb {
    // =========================================================================
    // Conversations
    // =========================================================================

    pub fn create_conversation(
        &self,
        user_id: &str,
        input: &NewConversation,
    ) -> Result<Conversation, DbError> {
        input.validate()?;
        let id = new_id();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO conversations (id, user_id, contact_name, contact_phone, contact_avatar,
                                        platform, platform_contact_id, status, contact_id,
                                        created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                user_id,
                input.contact_name.trim(),
                input.contact_phone.trim(),
                input.contact_avatar,
                input.platform,
                input.platform_contact_id,
                input.status.unwrap_or(ConversationStatus::Active),
                input.contact_id,
                now,
            ],
        )?;
        self.get_conversation(user_id, &id)
    }

    pub fn get_conversation(&self, user_id: &str, id: &str) -> Result<Conversation, DbError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations WHERE id = ?1 AND user_id = ?2",
                    CONVERSATION_COLUMNS
                ),
                params![id, user_id],
                conversation_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::not_found("Conversation", id))
    }

    /// The conversation an inbound platform message belongs to, if any.
    pub fn find_conversation(
        &self,
        user_id: &str,
        platform: ChatPlatform,
        platform_contact_id: &str,
    ) -> Result<Option<Conversation>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations
                     WHERE user_id = ?1 AND platform = ?2 AND platform_contact_id = ?3",
                    CONVERSATION_COLUMNS
                ),
                params![user_id, platform, platform_contact_id],
                conversation_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent activity first; conversations without messages last.
    pub fn list_conversations(
        &self,
        user_id: &str,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, DbError> {
        let mut sql = format!(
            "SELECT {} FROM conversations WHERE user_id = ?",
            CONVERSATION_COLUMNS
        );
        let mut args = vec![Value::Text(user_id.to_string())];
        if let Some(platform) = filter.platform {
            sql.push_str(" AND platform = ?");
            args.push(Value::Text(platform.as_str().to_string()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(term) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            sql.push_str(
                " AND (LOWER(contact_name) LIKE ? OR LOWER(COALESCE(last_message, '')) LIKE ?)",
            );
            let pattern = like_pattern(term);
            args.push(Value::Text(pattern.clone()));
            args.push(Value::Text(pattern));
        }
        sql.push_str(" ORDER BY last_message_time IS NULL, last_message_time DESC, created_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), conversation_from_row)?;
        collect_rows(rows)
    }

    pub fn set_conversation_status(
        &self,
        user_id: &str,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, DbError> {
        let changed = self.conn.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
            params![status, now_rfc3339(), id, user_id],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Conversation", id));
        }
        self.get_conversation(user_id, id)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Store a message and bump the conversation's last-message fields.
    ///
    /// Messages from the user are stored read; messages from the contact
    /// count towards `unread_count`. Returns `None` when a message with the
    /// same `platform_message_id` was already stored.
    pub fn insert_chat_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        input: &NewChatMessage,
    ) -> Result<Option<ChatMessage>, DbError> {
        input.validate()?;
        self.with_transaction(|db| {
            let conversation = db.get_conversation(user_id, conversation_id)?;
            if let Some(platform_id) = input.platform_message_id.as_deref() {
                if db.chat_message_exists(conversation.platform, platform_id)? {
                    return Ok(None);
                }
            }

            let id = new_id();
            let now = now_rfc3339();
            let from_user = input.sender_type == SenderType::User;
            db.conn.execute(
                "INSERT INTO chat_messages (id, user_id, conversation_id, content, sender_type,
                                            sender_name, sender_id, message_type, platform,
                                            platform_message_id, metadata, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id,
                    user_id,
                    conversation_id,
                    input.content,
                    input.sender_type,
                    input.sender_name.trim(),
                    input.sender_id,
                    input.message_type.unwrap_or(MessageType::Text),
                    conversation.platform,
                    input.platform_message_id,
                    serde_json::to_string(&input.metadata)?,
                    from_user,
                    now,
                ],
            )?;
            db.conn.execute(
                "UPDATE conversations
                 SET last_message = ?1, last_message_time = ?2, updated_at = ?2,
                     unread_count = unread_count + ?3
                 WHERE id = ?4",
                params![input.content, now, if from_user { 0 } else { 1 }, conversation_id],
            )?;
            db.get_chat_message(user_id, &id).map(Some)
        })
    }

    pub fn get_chat_message(&self, user_id: &str, id: &str) -> Result<ChatMessage, DbError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM chat_messages WHERE id = ?1 AND user_id = ?2",
                    MESSAGE_COLUMNS
                ),
                params![id, user_id],
                message_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::not_found("Message", id))
    }

    fn chat_message_exists(
        &self,
        platform: ChatPlatform,
        platform_message_id: &str,
    ) -> Result<bool, DbError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM chat_messages
                           WHERE platform = ?1 AND platform_message_id = ?2)",
            params![platform, platform_message_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Oldest first.
    pub fn list_chat_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, DbError> {
        // Surfaces NotFound for a conversation owned by someone else.
        self.get_conversation(user_id, conversation_id)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM chat_messages WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![conversation_id], message_from_row)?;
        collect_rows(rows)
    }

    /// Mark one message read. Returns false when it already was.
    pub fn mark_chat_message_read(&self, user_id: &str, id: &str) -> Result<bool, DbError> {
        self.with_transaction(|db| {
            let message = db.get_chat_message(user_id, id)?;
            if message.read {
                return Ok(false);
            }
            db.conn.execute(
                "UPDATE chat_messages SET read = 1 WHERE id = ?1",
                params![id],
            )?;
            db.conn.execute(
                "UPDATE conversations SET unread_count = MAX(unread_count - 1, 0)
                 WHERE id = ?1",
                params![message.conversation_id],
            )?;
            Ok(true)
        })
    }

    /// Mark every message in the conversation read and reset its counter.
    pub fn mark_conversation_read(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<usize, DbError> {
        self.with_transaction(|db| {
            db.get_conversation(user_id, conversation_id)?;
            let changed = db.conn.execute(
                "UPDATE chat_messages SET read = 1 WHERE conversation_id = ?1 AND read = 0",
                params![conversation_id],
            )?;
            db.conn.execute(
                "UPDATE conversations SET unread_count = 0 WHERE id = ?1",
                params![conversation_id],
            )?;
            Ok(changed)
        })
    }

    /// Unread messages across every conversation of `user_id`.
    pub fn unread_chat_count(&self, user_id: &str) -> Result<u64, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(unread_count), 0) FROM conversations WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
