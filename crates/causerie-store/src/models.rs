use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use causerie_shared::types::{
    ConversationKind, MessageKind, ParticipantRole, RequestStatus, RuleScope,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub attachment_url: Option<String>,
    pub attachment_type: Option<String>,
    pub attachment_name: Option<String>,
    pub reply_to_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagingRule {
    pub id: String,
    pub name: String,
    pub source_scope: RuleScope,
    pub source_roles: Vec<String>,
    pub target_scope: RuleScope,
    pub target_roles: Vec<String>,
    pub require_approval: bool,
    pub max_messages_per_day: Option<i64>,
    pub is_active: bool,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRequest {
    pub id: Uuid,
    pub from_user_id: String,
    pub from_tenant_id: Option<String>,
    pub to_user_id: String,
    pub to_tenant_id: Option<String>,
    pub rule_id: String,
    pub message: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl ContactRequest {
    /// A PENDING request past its expiry reads back as EXPIRED.
    pub fn effective_status(&self, now: DateTime<Utc>) -> RequestStatus {
        if self.status == RequestStatus::Pending && self.expires_at <= now {
            RequestStatus::Expired
        } else {
            self.status
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedUser {
    pub user_id: String,
    pub blocked_user_id: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Read-only denormalized user record, populated by an external sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserCacheEntry {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub tenant_id: Option<String>,
    pub tenant_role: Option<String>,
    pub platform_role: Option<String>,
    pub synced_at: DateTime<Utc>,
}

impl UserCacheEntry {
    /// Display name with the documented fallbacks: full name, else email,
    /// else the literal "Unknown".
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => self
                .email
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry() -> UserCacheEntry {
        UserCacheEntry {
            id: "u1".into(),
            email: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
            tenant_id: None,
            tenant_role: None,
            platform_role: None,
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn display_name_fallbacks() {
        let mut e = entry();
        assert_eq!(e.display_name(), "Unknown");

        e.email = Some("ada@example.com".into());
        assert_eq!(e.display_name(), "ada@example.com");

        e.first_name = Some("Ada".into());
        assert_eq!(e.display_name(), "Ada");

        e.last_name = Some("Lovelace".into());
        assert_eq!(e.display_name(), "Ada Lovelace");
    }

    #[test]
    fn pending_request_expires_on_read() {
        let req = ContactRequest {
            id: Uuid::new_v4(),
            from_user_id: "u1".into(),
            from_tenant_id: None,
            to_user_id: "u2".into(),
            to_tenant_id: None,
            rule_id: "cross-org-managers".into(),
            message: None,
            status: RequestStatus::Pending,
            created_at: Utc::now() - Duration::days(8),
            responded_at: None,
            expires_at: Utc::now() - Duration::days(1),
        };
        assert_eq!(req.effective_status(Utc::now()), RequestStatus::Expired);

        let fresh = ContactRequest {
            expires_at: Utc::now() + Duration::days(6),
            ..req
        };
        assert_eq!(fresh.effective_status(Utc::now()), RequestStatus::Pending);
    }
}
