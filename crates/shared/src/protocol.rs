use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ChatId, MessageId, UserId},
    error::EnvelopeError,
};

pub const SUBSYSTEM_AUTH: &str = "auth";
pub const SUBSYSTEM_CHAT: &str = "chat";

pub const ACTION_AUTH: &str = "auth";
/// Outbound: deliver a chat message to the server (the server "receives" it).
pub const ACTION_RECEIVE_MESSAGE: &str = "receive_message";
pub const ACTION_READ_MESSAGE: &str = "read_message";
pub const ACTION_NEW_MESSAGE: &str = "new_message";

/// The structured unit exchanged over the shared socket. Every frame is one
/// JSON envelope tagged with a `(subsystem, action)` pair; `headers` carries
/// the access credential on outbound frames and is absent on inbound ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub subsystem: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<EnvelopeHeaders>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub jwt_access: String,
}

impl Envelope {
    pub fn auth(jwt_access: impl Into<String>) -> Self {
        Self {
            subsystem: SUBSYSTEM_AUTH.to_string(),
            action: ACTION_AUTH.to_string(),
            headers: Some(EnvelopeHeaders {
                jwt_access: jwt_access.into(),
            }),
            data: None,
        }
    }

    pub fn chat_message(jwt_access: impl Into<String>, user_id: UserId, text: &str) -> Self {
        Self {
            subsystem: SUBSYSTEM_CHAT.to_string(),
            action: ACTION_RECEIVE_MESSAGE.to_string(),
            headers: Some(EnvelopeHeaders {
                jwt_access: jwt_access.into(),
            }),
            data: serde_json::to_value(SendMessageData {
                user_id,
                message_text: text.to_string(),
            })
            .ok(),
        }
    }

    pub fn chat_read_receipt(
        jwt_access: impl Into<String>,
        user_id: UserId,
        message_id: MessageId,
    ) -> Self {
        Self {
            subsystem: SUBSYSTEM_CHAT.to_string(),
            action: ACTION_READ_MESSAGE.to_string(),
            headers: Some(EnvelopeHeaders {
                jwt_access: jwt_access.into(),
            }),
            data: serde_json::to_value(ReadMessageData {
                user_id,
                message_id,
            })
            .ok(),
        }
    }

    pub fn is(&self, subsystem: &str, action: &str) -> bool {
        self.subsystem == subsystem && self.action == action
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let data = self.data.as_ref().ok_or(EnvelopeError::MissingData)?;
        Ok(serde_json::from_value(data.clone())?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageData {
    pub user_id: UserId,
    pub message_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMessageData {
    pub user_id: UserId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAuthor {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Payload of the inbound `chat`/`new_message` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessageData {
    pub message_id: MessageId,
    pub message_text: String,
    pub created_at: DateTime<Utc>,
    pub author: MessageAuthor,
}

impl NewMessageData {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, EnvelopeError> {
        envelope.decode_data()
    }
}

/// One page of a cursor-paginated backend listing. `next` is an opaque
/// absolute URL; a `None` cursor means the listing is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// One entry of the conversation listing, named from the viewer's
/// perspective: the other party's id, display name and avatar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub user_id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub has_unread_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageDto {
    pub id: MessageId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub user: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
}
