//! Chat inbox: outbound replies and inbound WhatsApp deliveries.
//!
//! A reply is stored first and then handed to the platform channel. A failed
//! send is logged by the dispatcher and leaves the stored message in place.
//! Inbound messages are deduplicated on the platform message id, so a
//! redelivered webhook is harmless.

use serde::Serialize;
use serde_json::Value;

use crate::db::{
    ChatMessage, ChatPlatform, DbError, IntegrationKind, IntegrationStatus, MessageType,
    NewChatMessage, NewConversation, SenderType, SharedDb,
};
use crate::integrations::IntegrationDispatcher;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message: ChatMessage,
    /// Whether the platform channel accepted the message.
    pub delivered: bool,
}

/// Store a reply from `sender_name` and deliver it on the conversation's
/// platform. Only WhatsApp has an outbound channel; internal conversations
/// never leave the store.
pub async fn send_message(
    db: &SharedDb,
    dispatcher: &IntegrationDispatcher,
    user_id: &str,
    conversation_id: &str,
    sender_name: &str,
    content: &str,
) -> Result<SentMessage, DbError> {
    let (conversation, message, channel) = {
        let db = db.lock();
        let conversation = db.get_conversation(user_id, conversation_id)?;
        let message = db
            .insert_chat_message(
                user_id,
                conversation_id,
                &NewChatMessage::new(content, SenderType::User, sender_name),
            )?
            .ok_or_else(|| DbError::Validation("Duplicate message".to_string()))?;
        let channel = match conversation.platform {
            ChatPlatform::Whatsapp => db
                .list_integrations(
                    user_id,
                    Some(IntegrationKind::Whatsapp),
                    Some(IntegrationStatus::Active),
                )?
                .into_iter()
                .next(),
            _ => None,
        };
        (conversation, message, channel)
    };

    let delivered = match (conversation.platform, channel) {
        (ChatPlatform::Internal, _) => true,
        (ChatPlatform::Whatsapp, Some(integration)) => dispatcher
            .send_whatsapp(&integration.id, &conversation.contact_phone, content)
            .await
            .is_ok(),
        (platform, _) => {
            log::warn!(
                "No active {} channel for user {}; message {} stored only",
                platform,
                user_id,
                message.id
            );
            false
        }
    };
    Ok(SentMessage { message, delivered })
}

/// One message pulled out of a WhatsApp webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Sender's WhatsApp id (their phone number).
    pub wa_id: String,
    pub contact_name: Option<String>,
    pub platform_message_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub metadata: Value,
}

/// Messages in a WhatsApp Cloud API delivery. Status updates and malformed
/// entries are skipped.
pub fn parse_whatsapp_delivery(payload: &Value) -> Vec<InboundMessage> {
    let mut found = Vec::new();
    let changes = payload["entry"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|entry| entry["changes"].as_array().into_iter().flatten());

    for change in changes {
        let value = &change["value"];
        let contacts = value["contacts"].as_array();
        for message in value["messages"].as_array().into_iter().flatten() {
            let (Some(from), Some(id)) = (message["from"].as_str(), message["id"].as_str()) else {
                continue;
            };
            let contact_name = contacts
                .into_iter()
                .flatten()
                .find(|c| c["wa_id"].as_str() == Some(from))
                .and_then(|c| c["profile"]["name"].as_str())
                .map(str::to_string);
            let kind = message["type"].as_str().unwrap_or("text");
            let (message_type, content) = message_body(kind, message);
            found.push(InboundMessage {
                wa_id: from.to_string(),
                contact_name,
                platform_message_id: id.to_string(),
                message_type,
                content,
                metadata: serde_json::json!({
                    "whatsapp_type": kind,
                    "timestamp": message["timestamp"],
                }),
            });
        }
    }
    found
}

fn message_body(kind: &str, message: &Value) -> (MessageType, String) {
    let message_type = match kind {
        "image" | "sticker" => MessageType::Image,
        "audio" | "voice" => MessageType::Audio,
        "video" => MessageType::Video,
        "document" => MessageType::File,
        _ => MessageType::Text,
    };
    let text = message["text"]["body"]
        .as_str()
        .or_else(|| message[kind]["caption"].as_str())
        .filter(|s| !s.trim().is_empty());
    let content = match text {
        Some(text) => text.to_string(),
        None => format!("[{}]", kind),
    };
    (message_type, content)
}

/// Store an inbound message for `user_id`, opening a conversation for a new
/// sender. Returns `None` for a message already stored.
pub fn record_inbound(
    db: &SharedDb,
    user_id: &str,
    inbound: &InboundMessage,
) -> Result<Option<ChatMessage>, DbError> {
    let db = db.lock();
    let conversation = match db.find_conversation(user_id, ChatPlatform::Whatsapp, &inbound.wa_id)? {
        Some(conversation) => conversation,
        None => {
            let name = inbound.contact_name.as_deref().unwrap_or(&inbound.wa_id);
            let mut input = NewConversation::new(name, &inbound.wa_id, ChatPlatform::Whatsapp);
            input.platform_contact_id = Some(inbound.wa_id.clone());
            let created = db.create_conversation(user_id, &input)?;
            log::info!("New WhatsApp conversation {} for user {}", created.id, user_id);
            created
        }
    };

    let mut message = NewChatMessage::new(
        &inbound.content,
        SenderType::Contact,
        &conversation.contact_name,
    );
    message.sender_id = Some(inbound.wa_id.clone());
    message.message_type = Some(inbound.message_type);
    message.platform_message_id = Some(inbound.platform_message_id.clone());
    message.metadata = inbound.metadata.clone();
    db.insert_chat_message(user_id, &conversation.id, &message)
}
