use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message kinds reported by the messaging client. Only plain chat text is relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    #[serde(untagged)]
    Other(String),
}

impl MessageKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "chat" => Self::Chat,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Who sent an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderMeta {
    /// Sender address, e.g. `4912345@c.us`.
    pub id: String,
    /// Push name or contact name, when the client knows one.
    pub display_name: Option<String>,
}

/// A message received from the messaging connection. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: String,
    pub from_self: bool,
    pub kind: MessageKind,
    pub body: String,
    pub sender: SenderMeta,
    pub is_group: bool,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Plain text message from another user in a one-to-one chat.
    pub fn text(id: impl Into<String>, chat_id: impl Into<String>, body: impl Into<String>) -> Self {
        let chat_id = chat_id.into();
        Self {
            id: id.into(),
            sender: SenderMeta {
                id: chat_id.clone(),
                display_name: None,
            },
            chat_id,
            from_self: false,
            kind: MessageKind::Chat,
            body: body.into(),
            is_group: false,
            timestamp: Utc::now(),
        }
    }
}

/// A reply on its way back to a chat, quoting the message it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub chat_id: String,
    pub quoted_message_id: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Delivers replies through whatever connection is currently live.
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    async fn send_reply(&self, reply: &OutboundReply) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_parses_chat_and_keeps_others() {
        assert_eq!(MessageKind::parse("chat"), MessageKind::Chat);
        assert_eq!(
            MessageKind::parse("image"),
            MessageKind::Other("image".into())
        );
    }

    #[test]
    fn text_constructor_defaults_sender_to_chat() {
        let msg = InboundMessage::text("m1", "4912345@c.us", "hello");
        assert_eq!(msg.sender.id, "4912345@c.us");
        assert_eq!(msg.kind, MessageKind::Chat);
        assert!(!msg.from_self);
        assert!(!msg.is_group);
    }
}
