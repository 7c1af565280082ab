//! Conversation and message service.
//!
//! Everything here goes through the store gateway; fanout is the session
//! layer's job and the bus is never touched from this module, which keeps
//! the whole service testable against an in-memory store.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use causerie_shared::constants::{MAX_CONTENT_LEN, MAX_PAGE_SIZE, MAX_PARTICIPANTS};
use causerie_shared::types::{
    Actor, ConversationKind, ConversationView, MessageKind, MessageView, ParticipantView,
    SenderView,
};
use causerie_store::{Database, Message, Participant, StoreError};

use crate::error::ServiceError;
use crate::permissions::PermissionEngine;
use crate::presence::Presence;

#[derive(Debug, Clone)]
pub struct CreateConversationInput {
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SendMessageInput {
    pub conversation_id: Uuid,
    pub content: String,
    pub kind: Option<MessageKind>,
    pub reply_to_id: Option<Uuid>,
    pub attachment_url: Option<String>,
    pub attachment_type: Option<String>,
    pub attachment_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

pub fn create_conversation(
    db: &mut Database,
    presence: &Presence,
    engine: &PermissionEngine,
    creator: &Actor,
    input: CreateConversationInput,
) -> Result<ConversationView, ServiceError> {
    let mut others: Vec<String> = input
        .participant_ids
        .iter()
        .filter(|id| **id != creator.user_id)
        .cloned()
        .collect();
    others.sort();
    others.dedup();

    if others.is_empty() {
        return Err(ServiceError::Validation(
            "at least one other participant is required".into(),
        ));
    }
    if others.len() > MAX_PARTICIPANTS {
        return Err(ServiceError::Validation(format!(
            "too many participants (max {MAX_PARTICIPANTS})"
        )));
    }
    if input.kind == ConversationKind::Direct && others.len() != 1 {
        return Err(ServiceError::Validation(
            "a direct conversation has exactly one other participant".into(),
        ));
    }

    let decision = engine.can_create_conversation(db, creator, &others, input.kind)?;
    if !decision.allowed {
        if decision.requires_approval {
            let target = decision
                .target_user_id
                .or_else(|| others.first().cloned())
                .unwrap_or_default();
            return Err(ServiceError::ContactRequestRequired {
                target_user_id: target,
            });
        }
        return Err(ServiceError::PermissionDenied(decision.reason));
    }

    // Participants carry their tenant for presence scoping.
    let others_with_tenants: Vec<(String, Option<String>)> = others
        .iter()
        .map(|id| {
            let tenant = db
                .user_cache_get(id)?
                .and_then(|entry| entry.tenant_id);
            Ok((id.clone(), tenant))
        })
        .collect::<Result<_, StoreError>>()?;

    let (conversation, _created) = db.create_conversation_with_participants(
        input.kind,
        input.name.as_deref(),
        input.description.as_deref(),
        None,
        (&creator.user_id, creator.tenant_id.as_deref()),
        &others_with_tenants,
        Utc::now(),
    )?;

    conversation_view(db, presence, &conversation.id, &creator.user_id)
}

pub fn send_message(
    db: &mut Database,
    sender: &Actor,
    input: SendMessageInput,
) -> Result<MessageView, ServiceError> {
    if !db.is_participant(input.conversation_id, &sender.user_id)? {
        return Err(ServiceError::NotParticipant);
    }

    let content = input.content;
    if content.trim().is_empty() {
        return Err(ServiceError::Validation("message content is empty".into()));
    }
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(ServiceError::Validation(format!(
            "message content exceeds {MAX_CONTENT_LEN} characters"
        )));
    }

    if let Some(reply_to) = input.reply_to_id {
        let parent = match db.get_message(reply_to) {
            Ok(m) => m,
            Err(StoreError::NotFound) => {
                return Err(ServiceError::Validation(
                    "replied-to message does not exist".into(),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        if parent.conversation_id != input.conversation_id {
            return Err(ServiceError::Validation(
                "replied-to message belongs to another conversation".into(),
            ));
        }
    }

    let kind = input.kind.unwrap_or(MessageKind::Text);
    if kind == MessageKind::Attachment && input.attachment_url.is_none() {
        return Err(ServiceError::Validation(
            "attachment messages need an attachment URL".into(),
        ));
    }

    let message = Message {
        id: Uuid::new_v4(),
        conversation_id: input.conversation_id,
        sender_id: sender.user_id.clone(),
        content,
        kind,
        attachment_url: input.attachment_url,
        attachment_type: input.attachment_type,
        attachment_name: input.attachment_name,
        reply_to_id: input.reply_to_id,
        created_at: Utc::now(),
        edited_at: None,
        deleted_at: None,
    };

    db.record_message(&message)?;
    Ok(message_view(db, &message)?)
}

pub fn get_conversations(
    db: &Database,
    presence: &Presence,
    user_id: &str,
    limit: u32,
    cursor: Option<DateTime<Utc>>,
) -> Result<(Page<ConversationView>, i64), ServiceError> {
    let limit = clamp_limit(limit);
    let mut rows = db.conversations_for_user(user_id, limit + 1, cursor)?;

    let has_more = rows.len() as u32 > limit;
    rows.truncate(limit as usize);
    let next_cursor = has_more
        .then(|| rows.last().map(|c| c.updated_at.to_rfc3339()))
        .flatten();

    let mut items = Vec::with_capacity(rows.len());
    for conversation in &rows {
        items.push(assemble_view(db, presence, conversation, user_id)?);
    }

    let total_unread = db.total_unread(user_id)?;
    Ok((
        Page {
            items,
            has_more,
            next_cursor,
        },
        total_unread,
    ))
}

pub fn get_conversation(
    db: &Database,
    presence: &Presence,
    user_id: &str,
    conversation_id: Uuid,
) -> Result<ConversationView, ServiceError> {
    conversation_view(db, presence, &conversation_id, user_id)
}

pub fn get_messages(
    db: &Database,
    user_id: &str,
    conversation_id: Uuid,
    limit: u32,
    cursor: Option<DateTime<Utc>>,
) -> Result<Page<MessageView>, ServiceError> {
    require_participant(db, conversation_id, user_id)?;

    let limit = clamp_limit(limit);
    let mut rows = db.messages_in(conversation_id, limit + 1, cursor)?;

    let has_more = rows.len() as u32 > limit;
    rows.truncate(limit as usize);
    let next_cursor = has_more
        .then(|| rows.last().map(|m| m.created_at.to_rfc3339()))
        .flatten();

    let items = rows
        .iter()
        .map(|m| message_view(db, m))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Page {
        items,
        has_more,
        next_cursor,
    })
}

pub fn get_message(
    db: &Database,
    user_id: &str,
    conversation_id: Uuid,
    message_id: Uuid,
) -> Result<MessageView, ServiceError> {
    require_participant(db, conversation_id, user_id)?;

    let message = match db.get_message(message_id) {
        Ok(m) => m,
        Err(StoreError::NotFound) => return Err(ServiceError::NotFound("message")),
        Err(e) => return Err(e.into()),
    };
    if message.conversation_id != conversation_id || message.deleted_at.is_some() {
        return Err(ServiceError::NotFound("message"));
    }
    Ok(message_view(db, &message)?)
}

/// Advance the caller's read watermark. Idempotent.
pub fn mark_as_read(
    db: &Database,
    user_id: &str,
    conversation_id: Uuid,
) -> Result<DateTime<Utc>, ServiceError> {
    require_participant(db, conversation_id, user_id)?;
    let now = Utc::now();
    db.set_last_read(conversation_id, user_id, now)?;
    Ok(now)
}

pub fn get_unread_count(db: &Database, user_id: &str) -> Result<i64, ServiceError> {
    Ok(db.total_unread(user_id)?)
}

pub fn get_participants(
    db: &Database,
    presence: &Presence,
    user_id: &str,
    conversation_id: Uuid,
) -> Result<Vec<ParticipantView>, ServiceError> {
    require_participant(db, conversation_id, user_id)?;
    db.participants_of(conversation_id)?
        .iter()
        .map(|p| participant_view(db, presence, p))
        .collect()
}

fn require_participant(
    db: &Database,
    conversation_id: Uuid,
    user_id: &str,
) -> Result<(), ServiceError> {
    // Membership is probed directly; a conversation the caller is not in
    // is indistinguishable from one that does not exist.
    if !db.is_participant(conversation_id, user_id)? {
        return Err(ServiceError::NotFound("conversation"));
    }
    Ok(())
}

fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_PAGE_SIZE)
}

// -- enrichment --------------------------------------------------------

pub fn sender_view(db: &Database, user_id: &str) -> Result<SenderView, StoreError> {
    Ok(match db.user_cache_get(user_id)? {
        Some(entry) => SenderView {
            id: entry.id.clone(),
            display_name: entry.display_name(),
            avatar_url: entry.avatar_url,
        },
        None => SenderView {
            id: user_id.to_string(),
            display_name: "Unknown".to_string(),
            avatar_url: None,
        },
    })
}

pub fn message_view(db: &Database, message: &Message) -> Result<MessageView, StoreError> {
    Ok(MessageView {
        id: message.id,
        conversation_id: message.conversation_id,
        sender: sender_view(db, &message.sender_id)?,
        content: message.content.clone(),
        kind: message.kind,
        attachment_url: message.attachment_url.clone(),
        attachment_type: message.attachment_type.clone(),
        attachment_name: message.attachment_name.clone(),
        reply_to_id: message.reply_to_id,
        created_at: message.created_at,
        edited_at: message.edited_at,
    })
}

fn participant_view(
    db: &Database,
    presence: &Presence,
    participant: &Participant,
) -> Result<ParticipantView, ServiceError> {
    let enriched = sender_view(db, &participant.user_id)?;
    Ok(ParticipantView {
        user_id: participant.user_id.clone(),
        role: participant.role,
        joined_at: participant.joined_at,
        last_read_at: participant.last_read_at,
        display_name: enriched.display_name,
        avatar_url: enriched.avatar_url,
        is_online: presence.is_online(&participant.user_id, participant.tenant_id.as_deref()),
        last_seen: presence.last_seen(&participant.user_id),
    })
}

fn conversation_view(
    db: &Database,
    presence: &Presence,
    conversation_id: &Uuid,
    viewer: &str,
) -> Result<ConversationView, ServiceError> {
    require_participant(db, *conversation_id, viewer)?;
    let conversation = db.get_conversation(*conversation_id)?;
    assemble_view(db, presence, &conversation, viewer)
}

fn assemble_view(
    db: &Database,
    presence: &Presence,
    conversation: &causerie_store::Conversation,
    viewer: &str,
) -> Result<ConversationView, ServiceError> {
    let participants = db
        .participants_of(conversation.id)?
        .iter()
        .map(|p| participant_view(db, presence, p))
        .collect::<Result<Vec<_>, _>>()?;

    let last_message = match db.last_message_in(conversation.id)? {
        Some(m) => Some(message_view(db, &m)?),
        None => None,
    };

    let watermark = db
        .get_participant(conversation.id, viewer)
        .map(|p| p.last_read_at)
        .unwrap_or(None);
    let unread_count = db.count_unread(conversation.id, viewer, watermark)?;

    Ok(ConversationView {
        id: conversation.id,
        kind: conversation.kind,
        name: conversation.name.clone(),
        description: conversation.description.clone(),
        avatar_url: conversation.avatar_url.clone(),
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
        participants,
        last_message,
        unread_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::RuleWindow;
    use causerie_shared::types::ParticipantRole;
    use std::sync::Arc;

    struct Fixture {
        db: Database,
        presence: Presence,
        engine: PermissionEngine,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        db.seed_default_rules().unwrap();
        Fixture {
            db,
            presence: Presence::new(Arc::new(Bus::new("test-node"))),
            engine: PermissionEngine::new(RuleWindow::Rolling24h),
        }
    }

    fn direct_input(other: &str) -> CreateConversationInput {
        CreateConversationInput {
            kind: ConversationKind::Direct,
            name: None,
            description: None,
            participant_ids: vec![other.to_string()],
        }
    }

    fn text(conversation_id: Uuid, content: &str) -> SendMessageInput {
        SendMessageInput {
            conversation_id,
            content: content.to_string(),
            kind: None,
            reply_to_id: None,
            attachment_url: None,
            attachment_type: None,
            attachment_name: None,
        }
    }

    #[test]
    fn direct_creation_is_idempotent_with_roles() {
        let mut f = fixture();
        let u1 = Actor::in_tenant("u1", "t1", "owner");
        // u2 shares the tenant via the cache.
        f.db.user_cache_upsert(&causerie_store::UserCacheEntry {
            id: "u2".into(),
            email: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
            tenant_id: Some("t1".into()),
            tenant_role: Some("member".into()),
            platform_role: None,
            synced_at: Utc::now(),
        })
        .unwrap();

        let first =
            create_conversation(&mut f.db, &f.presence, &f.engine, &u1, direct_input("u2"))
                .unwrap();
        let second =
            create_conversation(&mut f.db, &f.presence, &f.engine, &u1, direct_input("u2"))
                .unwrap();
        assert_eq!(first.id, second.id);

        let mut roles: Vec<(String, ParticipantRole)> = first
            .participants
            .iter()
            .map(|p| (p.user_id.clone(), p.role))
            .collect();
        roles.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            roles,
            vec![
                ("u1".to_string(), ParticipantRole::Owner),
                ("u2".to_string(), ParticipantRole::Member)
            ]
        );
        assert_eq!(first.unread_count, 0);
    }

    #[test]
    fn creation_denied_without_rule() {
        let mut f = fixture();
        // Unknown recipient: no tenant, no rule matches.
        let err = create_conversation(
            &mut f.db,
            &f.presence,
            &f.engine,
            &Actor::in_tenant("u1", "t1", "member"),
            direct_input("stranger"),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::PermissionDenied(_)));
    }

    #[test]
    fn cross_tenant_direct_requires_contact_request() {
        let mut f = fixture();
        f.db.user_cache_upsert(&causerie_store::UserCacheEntry {
            id: "u2".into(),
            email: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
            tenant_id: Some("t2".into()),
            tenant_role: Some("owner".into()),
            platform_role: None,
            synced_at: Utc::now(),
        })
        .unwrap();

        let err = create_conversation(
            &mut f.db,
            &f.presence,
            &f.engine,
            &Actor::in_tenant("u1", "t1", "owner"),
            direct_input("u2"),
        )
        .unwrap_err();
        match err {
            ServiceError::ContactRequestRequired { target_user_id } => {
                assert_eq!(target_user_id, "u2")
            }
            other => panic!("expected approval requirement, got {other:?}"),
        }
    }

    fn seeded_direct(f: &mut Fixture) -> Uuid {
        let (conv, _) = f
            .db
            .create_conversation_with_participants(
                ConversationKind::Direct,
                None,
                None,
                None,
                ("u1", Some("t1")),
                &[("u2".to_string(), Some("t1".to_string()))],
                Utc::now(),
            )
            .unwrap();
        conv.id
    }

    #[test]
    fn outsider_cannot_send() {
        let mut f = fixture();
        let conv = seeded_direct(&mut f);

        let before = f.db.messages_in(conv, 10, None).unwrap().len();
        let err = send_message(&mut f.db, &Actor::new("intruder"), text(conv, "hi"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotParticipant));
        // No state change.
        assert_eq!(f.db.messages_in(conv, 10, None).unwrap().len(), before);
    }

    #[test]
    fn content_bounds_are_enforced() {
        let mut f = fixture();
        let conv = seeded_direct(&mut f);
        let u1 = Actor::new("u1");

        assert!(matches!(
            send_message(&mut f.db, &u1, text(conv, "   ")),
            Err(ServiceError::Validation(_))
        ));

        let too_long = "x".repeat(MAX_CONTENT_LEN + 1);
        assert!(matches!(
            send_message(&mut f.db, &u1, text(conv, &too_long)),
            Err(ServiceError::Validation(_))
        ));

        let exactly = "x".repeat(MAX_CONTENT_LEN);
        assert!(send_message(&mut f.db, &u1, text(conv, &exactly)).is_ok());
    }

    #[test]
    fn reply_must_stay_in_conversation() {
        let mut f = fixture();
        let conv_a = seeded_direct(&mut f);
        let (conv_b, _) = f
            .db
            .create_conversation_with_participants(
                ConversationKind::Group,
                Some("other"),
                None,
                None,
                ("u1", None),
                &[("u3".to_string(), None)],
                Utc::now(),
            )
            .unwrap();

        let u1 = Actor::new("u1");
        let parent = send_message(&mut f.db, &u1, text(conv_a, "root")).unwrap();

        let mut cross = text(conv_b.id, "reply");
        cross.reply_to_id = Some(parent.id);
        assert!(matches!(
            send_message(&mut f.db, &u1, cross),
            Err(ServiceError::Validation(_))
        ));

        let mut ok = text(conv_a, "reply");
        ok.reply_to_id = Some(parent.id);
        let reply = send_message(&mut f.db, &u1, ok).unwrap();
        assert_eq!(reply.reply_to_id, Some(parent.id));
    }

    #[test]
    fn unread_math_and_mark_as_read() {
        let mut f = fixture();
        let conv = seeded_direct(&mut f);
        let u2 = Actor::new("u2");

        for i in 0..3 {
            send_message(&mut f.db, &u2, text(conv, &format!("m{i}"))).unwrap();
        }
        assert_eq!(get_unread_count(&f.db, "u1").unwrap(), 3);

        mark_as_read(&f.db, "u1", conv).unwrap();
        assert_eq!(get_unread_count(&f.db, "u1").unwrap(), 0);

        // Idempotent: a second mark does not resurrect anything.
        mark_as_read(&f.db, "u1", conv).unwrap();
        assert_eq!(get_unread_count(&f.db, "u1").unwrap(), 0);

        send_message(&mut f.db, &u2, text(conv, "m3")).unwrap();
        assert_eq!(get_unread_count(&f.db, "u1").unwrap(), 1);

        // A self-send never counts against the sender.
        send_message(&mut f.db, &Actor::new("u1"), text(conv, "mine")).unwrap();
        assert_eq!(get_unread_count(&f.db, "u1").unwrap(), 1);
    }

    #[test]
    fn listing_enriches_and_paginates() {
        let mut f = fixture();
        let conv = seeded_direct(&mut f);
        let u2 = Actor::new("u2");
        send_message(&mut f.db, &u2, text(conv, "latest")).unwrap();

        f.presence.set_online("u2", Some("t1"));

        let (page, total_unread) =
            get_conversations(&f.db, &f.presence, "u1", 20, None).unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
        assert_eq!(total_unread, 1);

        let view = &page.items[0];
        assert_eq!(view.unread_count, 1);
        let last = view.last_message.as_ref().unwrap();
        assert_eq!(last.content, "latest");
        // Unsynced sender falls back to "Unknown".
        assert_eq!(last.sender.display_name, "Unknown");
        let peer = view
            .participants
            .iter()
            .find(|p| p.user_id == "u2")
            .unwrap();
        assert!(peer.is_online);
    }

    #[test]
    fn message_page_round_trips_fields() {
        let mut f = fixture();
        let conv = seeded_direct(&mut f);
        let u1 = Actor::new("u1");

        let sent = send_message(&mut f.db, &u1, text(conv, "hello there")).unwrap();
        let page = get_messages(&f.db, "u1", conv, 50, None).unwrap();
        assert_eq!(page.items.len(), 1);
        let got = &page.items[0];
        assert_eq!(got.id, sent.id);
        assert_eq!(got.content, "hello there");
        assert_eq!(got.kind, MessageKind::Text);

        // Single-message fetch agrees.
        let single = get_message(&f.db, "u1", conv, sent.id).unwrap();
        assert_eq!(single.id, sent.id);

        // Outsiders see nothing.
        assert!(matches!(
            get_messages(&f.db, "intruder", conv, 50, None),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn participants_listing_requires_membership() {
        let mut f = fixture();
        let conv = seeded_direct(&mut f);

        let views = get_participants(&f.db, &f.presence, "u1", conv).unwrap();
        assert_eq!(views.len(), 2);

        assert!(matches!(
            get_participants(&f.db, &f.presence, "outsider", conv),
            Err(ServiceError::NotFound(_))
        ));
    }
}
