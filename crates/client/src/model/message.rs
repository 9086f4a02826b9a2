//! Transient messages: built per inbound frame or outbound send, never cached.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use super::{Flow, User};
use crate::cache::EntityCache;
use crate::error::{ClientError, ClientResult};
use crate::ids::{FlowId, MessageId, OrganizationId, UserId};

/// Event tag carried in the `event` field of every frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Message,
    Comment,
    Status,
    Action,
    TagChange,
    MessageEdit,
    UserActivity,
    File,
    Discussion,
    UserEdit,
    FlowChange,
    EmojiReaction,
    ThreadChange,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Comment => "comment",
            Self::Status => "status",
            Self::Action => "action",
            Self::TagChange => "tag-change",
            Self::MessageEdit => "message-edit",
            Self::UserActivity => "activity.user",
            Self::File => "file",
            Self::Discussion => "discussion",
            Self::UserEdit => "user-edit",
            Self::FlowChange => "flow-change",
            Self::EmojiReaction => "emoji-reaction",
            Self::ThreadChange => "thread-change",
            Self::Other(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "message" => Self::Message,
            "comment" => Self::Comment,
            "status" => Self::Status,
            "action" => Self::Action,
            "tag-change" => Self::TagChange,
            "message-edit" => Self::MessageEdit,
            "activity.user" => Self::UserActivity,
            "file" => Self::File,
            "discussion" => Self::Discussion,
            "user-edit" => Self::UserEdit,
            "flow-change" => Self::FlowChange,
            "emoji-reaction" => Self::EmojiReaction,
            "thread-change" => Self::ThreadChange,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag))
    }
}

/// Raw inbound frame fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub event: MessageKind,
    #[serde(default)]
    pub content: Value,
    /// Parent message id for comments and threaded replies
    #[serde(default, rename = "message", deserialize_with = "lenient_id")]
    pub parent: Option<MessageId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub sent: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub user: Option<UserId>,
    #[serde(default)]
    pub flow: Option<FlowId>,
    #[serde(default)]
    pub external_user_name: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub external_thread_id: Option<String>,
    #[serde(default)]
    pub thread: Option<Value>,
    #[serde(default)]
    pub app: Option<String>,
}

/// Ids that fail to parse (e.g. `message` holding an object on some event
/// types) are treated as absent instead of rejecting the frame.
fn lenient_id<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: de::DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub kind: MessageKind,
    pub content: Value,
    pub parent: Option<MessageId>,
    pub tags: Vec<String>,
    pub attachments: Vec<Value>,
    pub sent: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub user_id: Option<UserId>,
    /// Sender snapshot, when the id resolved through the user cache
    pub user: Option<User>,
    pub flow_id: Option<FlowId>,
    /// Target flow snapshot, when the id resolved through the flow cache
    pub flow: Option<Flow>,
    pub external_user_name: Option<String>,
    pub uuid: Option<String>,
    pub thread_id: Option<String>,
    pub external_thread_id: Option<String>,
    pub thread: Option<Value>,
    pub app: Option<String>,
}

impl Message {
    /// Build a message from a stream frame, resolving sender and flow.
    pub fn from_frame(cache: &EntityCache, raw: &Value) -> Result<Self, serde_json::Error> {
        let record = MessageRecord::deserialize(raw)?;
        Ok(Self::from_record(cache, record))
    }

    pub fn from_record(cache: &EntityCache, record: MessageRecord) -> Self {
        let user = record.user.and_then(|id| cache.user(id).cloned());
        let flow = record
            .flow
            .as_ref()
            .and_then(|id| cache.flow(id).cloned());

        Self {
            id: record.id,
            kind: record.event,
            content: record.content,
            parent: record.parent,
            tags: record.tags,
            attachments: record.attachments,
            sent: record.sent.and_then(DateTime::<Utc>::from_timestamp_millis),
            created_at: record
                .created_at
                .as_deref()
                .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
                .map(|stamp| stamp.with_timezone(&Utc)),
            user_id: record.user,
            user,
            flow_id: record.flow,
            flow,
            external_user_name: record.external_user_name,
            uuid: record.uuid,
            thread_id: record.thread_id,
            external_thread_id: record.external_thread_id,
            thread: record.thread,
            app: record.app,
        }
    }

    /// A new chat message addressed to `flow_id`.
    pub fn chat(flow_id: impl Into<FlowId>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: MessageKind::Message,
            content: Value::String(content.into()),
            parent: None,
            tags: Vec::new(),
            attachments: Vec::new(),
            sent: None,
            created_at: None,
            user_id: None,
            user: None,
            flow_id: Some(flow_id.into()),
            flow: None,
            external_user_name: None,
            uuid: Some(Uuid::new_v4().to_string()),
            thread_id: None,
            external_thread_id: None,
            thread: None,
            app: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_chat(&self) -> bool {
        self.kind == MessageKind::Message
    }

    pub fn content_text(&self) -> Option<&str> {
        self.content.as_str()
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.flow.as_ref().map(|flow| flow.organization_id)
    }

    /// POST body for `/messages`.
    pub fn outbound(&self) -> ClientResult<OutboundMessage> {
        let flow = self.flow_id.clone().ok_or(ClientError::MissingFlow)?;
        Ok(OutboundMessage {
            flow,
            event: self.kind.clone(),
            content: self.content.clone(),
            message: self.parent,
            tags: self.tags.clone(),
            external_user_name: self.external_user_name.clone(),
            thread_id: self.thread_id.clone(),
            external_thread_id: self.external_thread_id.clone(),
            thread: self.thread.clone(),
            attachments: self.attachments.clone(),
            uuid: self.uuid.clone(),
        })
    }

    /// `/flows/{organization}/{flow}/messages/{id}`, resolved through the cache.
    pub fn api_path(&self, cache: &EntityCache) -> ClientResult<String> {
        let id = self.id.ok_or(ClientError::MissingMessageId)?;
        let flow_id = self.flow_id.as_ref().ok_or(ClientError::MissingFlow)?;
        let flow = cache
            .flow(flow_id)
            .ok_or_else(|| ClientError::UnknownFlow(flow_id.clone()))?;
        let organization = cache.organization(flow.organization_id).ok_or_else(|| {
            ClientError::UnknownOrganization {
                flow: flow_id.clone(),
                organization: Some(flow.organization_id),
            }
        })?;

        Ok(format!(
            "/flows/{}/{}/messages/{}",
            organization.parameterized_name, flow.parameterized_name, id
        ))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutboundMessage {
    pub flow: FlowId,
    pub event: MessageKind,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageId>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<Value>,
    pub attachments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kinds_round_trip_through_tags() {
        assert_eq!(MessageKind::parse("activity.user"), MessageKind::UserActivity);
        assert_eq!(MessageKind::TagChange.as_str(), "tag-change");
        assert_eq!(
            MessageKind::parse("something-new"),
            MessageKind::Other("something-new".into())
        );
    }

    #[test]
    fn frame_with_unknown_references_keeps_raw_ids() {
        let cache = EntityCache::default();
        let message = Message::from_frame(
            &cache,
            &json!({
                "id": 10,
                "event": "message",
                "content": "hi",
                "flow": "missing",
                "user": "77",
                "sent": 1_500_000_000_000i64,
                "created_at": "2017-07-14T02:40:00.000Z"
            }),
        )
        .unwrap();

        assert!(message.is_chat());
        assert_eq!(message.user_id, Some(UserId(77)));
        assert!(message.user.is_none());
        assert_eq!(message.flow_id, Some(FlowId::from("missing")));
        assert!(message.flow.is_none());
        assert_eq!(message.sent.map(|s| s.timestamp_millis()), Some(1_500_000_000_000));
        assert!(message.created_at.is_some());
    }

    #[test]
    fn outbound_requires_a_flow() {
        let mut message = Message::chat("f1", "hello");
        assert!(message.uuid.is_some());

        let body = serde_json::to_value(message.outbound().unwrap()).unwrap();
        assert_eq!(body["flow"], "f1");
        assert_eq!(body["event"], "message");
        assert_eq!(body["content"], "hello");
        assert!(body.get("message").is_none());

        message.flow_id = None;
        assert!(matches!(message.outbound(), Err(ClientError::MissingFlow)));
    }
}
