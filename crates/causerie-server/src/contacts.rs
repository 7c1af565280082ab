//! Contact requests and blocks.
//!
//! A contact request is the consent artifact that unlocks cross-tenant
//! messaging when a rule demands approval. Blocks are a hard veto the
//! permission engine consults before anything else.

use chrono::Utc;
use uuid::Uuid;

use causerie_shared::constants::{CONTACT_REQUEST_TTL_DAYS, MAX_NOTE_LEN};
use causerie_shared::types::{Actor, BlockView, ContactRequestView, RequestStatus};
use causerie_store::{BlockedUser, ContactRequest, Database, StoreError};

use crate::error::ServiceError;
use crate::permissions::PermissionEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Accept,
    Decline,
}

impl RequestAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(Self::Accept),
            "decline" => Some(Self::Decline),
            _ => None,
        }
    }
}

pub fn list_received(db: &Database, user_id: &str) -> Result<Vec<ContactRequestView>, ServiceError> {
    Ok(db
        .requests_received(user_id)?
        .into_iter()
        .map(to_view)
        .collect())
}

pub fn list_sent(db: &Database, user_id: &str) -> Result<Vec<ContactRequestView>, ServiceError> {
    Ok(db
        .requests_sent(user_id)?
        .into_iter()
        .map(to_view)
        .collect())
}

/// File a contact request toward `to_user_id`.
///
/// Only meaningful when the permission engine says a matched rule wants
/// approval: an already-permitted pair gets a conflict, a hard denial
/// stays a denial.
pub fn create_request(
    db: &mut Database,
    engine: &PermissionEngine,
    actor: &Actor,
    to_user_id: &str,
    message: Option<String>,
) -> Result<ContactRequestView, ServiceError> {
    if to_user_id == actor.user_id {
        return Err(ServiceError::Validation(
            "cannot send a contact request to yourself".into(),
        ));
    }
    if let Some(ref note) = message {
        if note.chars().count() > MAX_NOTE_LEN {
            return Err(ServiceError::Validation(format!(
                "message exceeds {MAX_NOTE_LEN} characters"
            )));
        }
    }

    let recipient = PermissionEngine::resolve_recipient(db, to_user_id)?;
    let decision = engine.can_send_message(db, actor, &recipient)?;

    if decision.allowed {
        return Err(ServiceError::Conflict(
            "messaging this user is already permitted".into(),
        ));
    }
    let Some(rule_id) = decision.matched_rule else {
        // Blocked, or no rule matched: a request cannot help.
        return Err(ServiceError::PermissionDenied(decision.reason));
    };
    if !decision.requires_approval {
        return Err(ServiceError::PermissionDenied(decision.reason));
    }

    let now = Utc::now();
    let request = ContactRequest {
        id: Uuid::new_v4(),
        from_user_id: actor.user_id.clone(),
        from_tenant_id: actor.tenant_id.clone(),
        to_user_id: to_user_id.to_string(),
        to_tenant_id: recipient.tenant_id.clone(),
        rule_id,
        message,
        status: RequestStatus::Pending,
        created_at: now,
        responded_at: None,
        expires_at: now + chrono::Duration::days(CONTACT_REQUEST_TTL_DAYS),
    };

    if !db.create_contact_request(&request)? {
        return Err(ServiceError::Conflict(
            "a pending contact request already exists".into(),
        ));
    }

    tracing::info!(
        from = %actor.user_id,
        to = to_user_id,
        rule = %request.rule_id,
        "contact request created"
    );
    Ok(to_view(request))
}

/// Accept or decline a request addressed to the caller.
pub fn respond(
    db: &Database,
    actor: &Actor,
    request_id: Uuid,
    action: RequestAction,
) -> Result<ContactRequestView, ServiceError> {
    let request = match db.get_contact_request(request_id) {
        Ok(r) => r,
        Err(StoreError::NotFound) => return Err(ServiceError::NotFound("contact request")),
        Err(e) => return Err(e.into()),
    };

    if request.to_user_id != actor.user_id {
        return Err(ServiceError::PermissionDenied(
            "only the recipient can respond to a contact request".into(),
        ));
    }

    let now = Utc::now();
    if request.effective_status(now) != RequestStatus::Pending {
        return Err(ServiceError::Conflict(
            "contact request is no longer pending".into(),
        ));
    }

    let status = match action {
        RequestAction::Accept => RequestStatus::Accepted,
        RequestAction::Decline => RequestStatus::Declined,
    };
    db.respond_contact_request(request_id, status, now)?;

    tracing::info!(request = %request_id, ?status, "contact request resolved");
    Ok(to_view(ContactRequest {
        status,
        responded_at: Some(now),
        ..request
    }))
}

pub fn block_user(
    db: &Database,
    actor: &Actor,
    user_id: &str,
    reason: Option<String>,
) -> Result<BlockView, ServiceError> {
    if user_id == actor.user_id {
        return Err(ServiceError::Conflict("cannot block yourself".into()));
    }
    if let Some(ref note) = reason {
        if note.chars().count() > MAX_NOTE_LEN {
            return Err(ServiceError::Validation(format!(
                "reason exceeds {MAX_NOTE_LEN} characters"
            )));
        }
    }

    let block = BlockedUser {
        user_id: actor.user_id.clone(),
        blocked_user_id: user_id.to_string(),
        reason,
        created_at: Utc::now(),
    };

    match db.insert_block(&block) {
        Ok(()) => {}
        Err(e) if e.is_unique_violation() => {
            return Err(ServiceError::Conflict("user is already blocked".into()))
        }
        Err(e) => return Err(e.into()),
    }

    tracing::info!(by = %actor.user_id, blocked = user_id, "user blocked");
    Ok(BlockView {
        user_id: block.user_id,
        blocked_user_id: block.blocked_user_id,
        reason: block.reason,
        created_at: block.created_at,
    })
}

pub fn unblock_user(db: &Database, actor: &Actor, user_id: &str) -> Result<(), ServiceError> {
    if !db.remove_block(&actor.user_id, user_id)? {
        return Err(ServiceError::NotFound("block"));
    }
    tracing::info!(by = %actor.user_id, unblocked = user_id, "user unblocked");
    Ok(())
}

pub fn list_blocks(db: &Database, user_id: &str) -> Result<Vec<BlockView>, ServiceError> {
    Ok(db
        .blocks_of(user_id)?
        .into_iter()
        .map(|b| BlockView {
            user_id: b.user_id,
            blocked_user_id: b.blocked_user_id,
            reason: b.reason,
            created_at: b.created_at,
        })
        .collect())
}

fn to_view(request: ContactRequest) -> ContactRequestView {
    let status = request.effective_status(Utc::now());
    ContactRequestView {
        id: request.id,
        from_user_id: request.from_user_id,
        from_tenant_id: request.from_tenant_id,
        to_user_id: request.to_user_id,
        to_tenant_id: request.to_tenant_id,
        rule_id: request.rule_id,
        message: request.message,
        status,
        created_at: request.created_at,
        responded_at: request.responded_at,
        expires_at: request.expires_at,
    }
}
