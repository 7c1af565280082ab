use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation flavor. Only `Direct` and `Group` are general purpose;
/// `Support` bypasses the messaging rules and `Announcement` is reserved
/// for an administrative pathway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Direct,
    Group,
    Support,
    Announcement,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "DIRECT",
            Self::Group => "GROUP",
            Self::Support => "SUPPORT",
            Self::Announcement => "ANNOUNCEMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DIRECT" => Some(Self::Direct),
            "GROUP" => Some(Self::Group),
            "SUPPORT" => Some(Self::Support),
            "ANNOUNCEMENT" => Some(Self::Announcement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Admin => "ADMIN",
            Self::Member => "MEMBER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OWNER" => Some(Self::Owner),
            "ADMIN" => Some(Self::Admin),
            "MEMBER" => Some(Self::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    System,
    Attachment,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::System => "SYSTEM",
            Self::Attachment => "ATTACHMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(Self::Text),
            "SYSTEM" => Some(Self::System),
            "ATTACHMENT" => Some(Self::Attachment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Declined => "DECLINED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ACCEPTED" => Some(Self::Accepted),
            "DECLINED" => Some(Self::Declined),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Which side of the org boundary a rule clause addresses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Tenant,
    Platform,
}

impl RuleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tenant => "tenant",
            Self::Platform => "platform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tenant" => Some(Self::Tenant),
            "platform" => Some(Self::Platform),
            _ => None,
        }
    }
}

/// An authenticated principal as the identity provider describes it.
///
/// User and tenant ids are opaque strings issued by the provider; the core
/// never interprets them. The same shape is used for recipients resolved
/// from the user cache (email and display name may be absent there).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: None,
            tenant_role: None,
            platform_role: None,
            email: None,
            display_name: None,
        }
    }

    pub fn in_tenant(user_id: impl Into<String>, tenant_id: impl Into<String>, role: &str) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            tenant_role: Some(role.to_string()),
            ..Self::new(user_id)
        }
    }
}

// ---------------------------------------------------------------------------
// Enriched views (what the API and the socket hand to clients)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderView {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: SenderView,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user_id: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub participants: Vec<ParticipantView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageView>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestView {
    pub id: Uuid,
    pub from_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_tenant_id: Option<String>,
    pub to_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_tenant_id: Option<String>,
    pub rule_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockView {
    pub user_id: String,
    pub blocked_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            ConversationKind::Direct,
            ConversationKind::Group,
            ConversationKind::Support,
            ConversationKind::Announcement,
        ] {
            assert_eq!(ConversationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ConversationKind::parse("VOICE"), None);
    }

    #[test]
    fn role_serializes_screaming() {
        let json = serde_json::to_string(&ParticipantRole::Owner).unwrap();
        assert_eq!(json, "\"OWNER\"");
    }

    #[test]
    fn actor_optional_fields_default() {
        let actor: Actor = serde_json::from_str(r#"{"userId":"u1"}"#).unwrap();
        assert_eq!(actor.user_id, "u1");
        assert!(actor.tenant_id.is_none());
    }

    #[test]
    fn message_view_uses_wire_field_names() {
        let view = MessageView {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender: SenderView {
                id: "u1".into(),
                display_name: "Ada".into(),
                avatar_url: None,
            },
            content: "hello".into(),
            kind: MessageKind::Text,
            attachment_url: None,
            attachment_type: None,
            attachment_name: None,
            reply_to_id: None,
            created_at: Utc::now(),
            edited_at: None,
        };
        let json = serde_json::to_string(&view).unwrap();
        assert!(json.contains("\"conversationId\""));
        assert!(json.contains("\"type\":\"TEXT\""));
        assert!(!json.contains("attachmentUrl"));
    }
}
