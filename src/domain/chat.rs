use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a chat message.
///
/// `Proposal` messages carry a structured offer card in their payload;
/// `System` messages announce engine transitions to both parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Proposal,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Proposal => "proposal",
            MessageKind::System => "system",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MessageKind {
    type Error = String;

    fn try_from(raw: &str) -> std::result::Result<Self, Self::Error> {
        match raw {
            "text" => Ok(MessageKind::Text),
            "proposal" => Ok(MessageKind::Proposal),
            "system" => Ok(MessageKind::System),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// A persisted chat message, as read back through the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub room_id: i64,
    pub sender_id: i64,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
