//! Duplex socket protocol.
//!
//! The service speaks JSON-over-WebSocket with a `type` discriminator on
//! every frame. Event names are stable wire contract; both sides must treat
//! unknown events as ignorable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{MessageKind, MessageView};

/// Topic carrying events for everyone in one conversation.
pub fn conversation_topic(id: Uuid) -> String {
    format!("conversation:{id}")
}

/// Topic for direct delivery to every session of one user.
pub fn user_topic(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Topic for tenant-wide events (presence).
pub fn tenant_topic(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}")
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "message:send")]
    #[serde(rename_all = "camelCase")]
    MessageSend {
        conversation_id: Uuid,
        content: String,
        #[serde(default, rename = "messageType")]
        message_type: Option<MessageKind>,
        #[serde(default)]
        reply_to_id: Option<Uuid>,
        #[serde(default)]
        attachment_url: Option<String>,
        #[serde(default)]
        attachment_type: Option<String>,
        #[serde(default)]
        attachment_name: Option<String>,
    },

    #[serde(rename = "typing:start")]
    #[serde(rename_all = "camelCase")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing:stop")]
    #[serde(rename_all = "camelCase")]
    TypingStop { conversation_id: Uuid },

    #[serde(rename = "messages:read")]
    #[serde(rename_all = "camelCase")]
    MessagesRead { conversation_id: Uuid },

    #[serde(rename = "conversation:join")]
    #[serde(rename_all = "camelCase")]
    ConversationJoin { conversation_id: Uuid },

    #[serde(rename = "conversation:leave")]
    #[serde(rename_all = "camelCase")]
    ConversationLeave { conversation_id: Uuid },

    #[serde(rename = "presence:get")]
    PresenceGet,
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    #[serde(rename_all = "camelCase")]
    MessageNew { message: MessageView },

    #[serde(rename = "message:sent")]
    #[serde(rename_all = "camelCase")]
    MessageSent {
        message_id: Uuid,
        conversation_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "message:error")]
    #[serde(rename_all = "camelCase")]
    MessageError {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
    },

    #[serde(rename = "typing:update")]
    #[serde(rename_all = "camelCase")]
    TypingUpdate {
        user_id: String,
        conversation_id: Uuid,
        is_typing: bool,
    },

    #[serde(rename = "messages:read")]
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        user_id: String,
        conversation_id: Uuid,
        read_at: DateTime<Utc>,
    },

    #[serde(rename = "presence:online")]
    #[serde(rename_all = "camelCase")]
    PresenceOnline {
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
    },

    #[serde(rename = "presence:offline")]
    #[serde(rename_all = "camelCase")]
    PresenceOffline {
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
        last_seen: i64,
    },

    #[serde(rename = "presence:list")]
    #[serde(rename_all = "camelCase")]
    PresenceList {
        #[serde(skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
        online_users: Vec<String>,
    },

    #[serde(rename = "conversation:joined")]
    #[serde(rename_all = "camelCase")]
    ConversationJoined { conversation_id: Uuid },

    #[serde(rename = "conversation:left")]
    #[serde(rename_all = "camelCase")]
    ConversationLeft { conversation_id: Uuid },

    #[serde(rename = "conversation:error")]
    #[serde(rename_all = "camelCase")]
    ConversationError {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_names_carry_colons() {
        let ev = ClientEvent::MessageSend {
            conversation_id: Uuid::new_v4(),
            content: "hi".into(),
            message_type: None,
            reply_to_id: None,
            attachment_url: None,
            attachment_type: None,
            attachment_name: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"message:send\""));
        assert!(json.contains("\"conversationId\""));
    }

    #[test]
    fn typing_start_parses() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"type":"typing:start","conversationId":"{id}"}}"#);
        match serde_json::from_str::<ClientEvent>(&json).unwrap() {
            ClientEvent::TypingStart { conversation_id } => assert_eq!(conversation_id, id),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn presence_get_has_no_payload() {
        let parsed: ClientEvent = serde_json::from_str(r#"{"type":"presence:get"}"#).unwrap();
        assert!(matches!(parsed, ClientEvent::PresenceGet));
    }

    #[test]
    fn unknown_event_fails_to_parse() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"call:start"}"#).is_err());
    }

    #[test]
    fn server_event_round_trip() {
        let ev = ServerEvent::TypingUpdate {
            user_id: "u1".into(),
            conversation_id: Uuid::new_v4(),
            is_typing: true,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"typing:update\""));
        assert!(json.contains("\"isTyping\":true"));
        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn both_directions_own_messages_read() {
        let client: ClientEvent = serde_json::from_str(&format!(
            r#"{{"type":"messages:read","conversationId":"{}"}}"#,
            Uuid::new_v4()
        ))
        .unwrap();
        assert!(matches!(client, ClientEvent::MessagesRead { .. }));

        let server = ServerEvent::MessagesRead {
            user_id: "u1".into(),
            conversation_id: Uuid::new_v4(),
            read_at: Utc::now(),
        };
        let json = serde_json::to_string(&server).unwrap();
        assert!(json.contains("\"type\":\"messages:read\""));
        assert!(json.contains("\"readAt\""));
    }

    #[test]
    fn topic_names() {
        let id = Uuid::nil();
        assert_eq!(
            conversation_topic(id),
            "conversation:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(user_topic("u1"), "user:u1");
        assert_eq!(tenant_topic("t1"), "tenant:t1");
    }
}
