//! The messaging permission engine.
//!
//! `can_send_message` resolves who may message whom from declarative
//! rules, short-circuited by blocks, tenant co-membership and accepted
//! contacts. The engine is pure with respect to the store: it only reads,
//! never retries, and store errors propagate untouched.

use chrono::{DateTime, NaiveTime, Utc};

use causerie_shared::types::{Actor, ConversationKind};
use causerie_store::{Database, MessagingRule, StoreError};

use crate::config::RuleWindow;

#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    pub requires_approval: bool,
    pub matched_rule: Option<String>,
    /// On a creation denial, the participant the check tripped over.
    pub target_user_id: Option<String>,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            requires_approval: false,
            matched_rule: None,
            target_user_id: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_approval: false,
            matched_rule: None,
            target_user_id: None,
        }
    }

    fn with_rule(mut self, rule_id: &str) -> Self {
        self.matched_rule = Some(rule_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PermissionEngine {
    window: RuleWindow,
}

impl PermissionEngine {
    pub fn new(window: RuleWindow) -> Self {
        Self { window }
    }

    /// Resolve a recipient's org membership from the user cache. An
    /// unsynced user simply has no tenant and no roles, which matches no
    /// rule clause.
    pub fn resolve_recipient(db: &Database, user_id: &str) -> Result<Actor, StoreError> {
        Ok(match db.user_cache_get(user_id)? {
            Some(entry) => Actor {
                user_id: entry.id,
                tenant_id: entry.tenant_id,
                tenant_role: entry.tenant_role,
                platform_role: entry.platform_role,
                email: entry.email,
                display_name: None,
            },
            None => Actor::new(user_id),
        })
    }

    /// Evaluate whether `sender` may message `recipient`. The checks run
    /// in a fixed order; the first conclusive outcome wins.
    pub fn can_send_message(
        &self,
        db: &Database,
        sender: &Actor,
        recipient: &Actor,
    ) -> Result<Decision, StoreError> {
        // 1. Self-messaging (notes to self) is always fine.
        if sender.user_id == recipient.user_id {
            return Ok(Decision::allow("Self messaging"));
        }

        // 2. A block in either direction vetoes everything below.
        if db.block_exists_between(&sender.user_id, &recipient.user_id)? {
            return Ok(Decision::deny("blocked"));
        }

        // 3. Same tenant talks freely.
        if sender.tenant_id.is_some() && sender.tenant_id == recipient.tenant_id {
            return Ok(Decision::allow("Same tenant"));
        }

        // 4. An accepted contact request (either direction) opens the door.
        if db.accepted_request_between(&sender.user_id, &recipient.user_id)? {
            return Ok(Decision::allow("Approved contact"));
        }

        // 5. Walk the active rules, highest priority first.
        for rule in db.active_rules()? {
            if !matches(&rule, sender, recipient) {
                continue;
            }

            if rule.require_approval {
                let pending = db.pending_request_between(
                    &sender.user_id,
                    &recipient.user_id,
                    Utc::now(),
                )?;
                let mut decision = if pending.is_some() {
                    Decision::deny("pending")
                } else {
                    Decision::deny("request-required")
                };
                decision.requires_approval = true;
                return Ok(decision.with_rule(&rule.id));
            }

            if let Some(limit) = rule.max_messages_per_day {
                let sent = self.sent_today(db, sender, recipient)?;
                if sent >= limit {
                    return Ok(Decision::deny("rate-limit").with_rule(&rule.id));
                }
            }

            return Ok(Decision::allow(rule.name.clone()).with_rule(&rule.id));
        }

        // 6. Nothing matched.
        Ok(Decision::deny("no rule"))
    }

    /// Conversation-creation policy. `SUPPORT` bypasses the rules,
    /// `ANNOUNCEMENT` is reserved, `DIRECT` and `GROUP` reduce to
    /// per-recipient send checks.
    pub fn can_create_conversation(
        &self,
        db: &Database,
        creator: &Actor,
        participant_ids: &[String],
        kind: ConversationKind,
    ) -> Result<Decision, StoreError> {
        match kind {
            ConversationKind::Support => Ok(Decision::allow("Support conversation")),
            ConversationKind::Announcement => Ok(Decision::deny(
                "announcement conversations are reserved for administrators",
            )),
            ConversationKind::Direct | ConversationKind::Group => {
                for user_id in participant_ids {
                    let recipient = Self::resolve_recipient(db, user_id)?;
                    let decision = self.can_send_message(db, creator, &recipient)?;
                    if !decision.allowed {
                        return Ok(Decision {
                            reason: format!("{} ({user_id})", decision.reason),
                            target_user_id: Some(user_id.clone()),
                            ..decision
                        });
                    }
                }
                Ok(Decision::allow("All participants reachable"))
            }
        }
    }

    /// Messages the sender already sent to this recipient inside the
    /// daily-limit window. Counted in the pair's DIRECT conversation; no
    /// conversation yet means nothing sent.
    fn sent_today(&self, db: &Database, sender: &Actor, recipient: &Actor) -> Result<i64, StoreError> {
        let Some(conversation) =
            db.find_direct_conversation(&sender.user_id, &recipient.user_id)?
        else {
            return Ok(0);
        };
        let since = self.window_start(Utc::now());
        db.count_messages_since(conversation.id, &sender.user_id, since)
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.window {
            RuleWindow::Rolling24h => now - chrono::Duration::hours(24),
            RuleWindow::UtcDay => now.date_naive().and_time(NaiveTime::MIN).and_utc(),
        }
    }
}

/// Does a rule's source/target clause pair cover this sender/recipient?
fn matches(rule: &MessagingRule, sender: &Actor, recipient: &Actor) -> bool {
    use causerie_shared::types::RuleScope;

    let source_ok = match rule.source_scope {
        RuleScope::Tenant => {
            sender.tenant_id.is_some() && role_in(&sender.tenant_role, &rule.source_roles)
        }
        RuleScope::Platform => {
            role_in(&sender.tenant_role, &rule.source_roles)
                || role_in(&sender.platform_role, &rule.source_roles)
        }
    };
    if !source_ok {
        return false;
    }

    match rule.target_scope {
        RuleScope::Tenant => {
            sender.tenant_id.is_some()
                && sender.tenant_id == recipient.tenant_id
                && role_in(&recipient.tenant_role, &rule.target_roles)
        }
        RuleScope::Platform => {
            role_in(&recipient.tenant_role, &rule.target_roles)
                || role_in(&recipient.platform_role, &rule.target_roles)
        }
    }
}

fn role_in(role: &Option<String>, roles: &[String]) -> bool {
    role.as_ref()
        .map(|r| roles.iter().any(|candidate| candidate == r))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_shared::types::RequestStatus;
    use causerie_store::{BlockedUser, ContactRequest, Message};
    use uuid::Uuid;

    fn engine() -> PermissionEngine {
        PermissionEngine::new(RuleWindow::Rolling24h)
    }

    fn seeded_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.seed_default_rules().unwrap();
        db
    }

    fn owner(user: &str, tenant: &str) -> Actor {
        Actor::in_tenant(user, tenant, "owner")
    }

    #[test]
    fn self_messaging_always_allowed() {
        let db = seeded_db();
        let u1 = Actor::new("u1");
        let decision = engine().can_send_message(&db, &u1, &u1).unwrap();
        assert!(decision.allowed);
    }

    #[test]
    fn same_tenant_free_send() {
        let db = seeded_db();
        let decision = engine()
            .can_send_message(&db, &owner("u1", "t1"), &Actor::in_tenant("u2", "t1", "member"))
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reason, "Same tenant");
    }

    #[test]
    fn block_trumps_everything() {
        let db = seeded_db();
        // u2 blocked u1, and u1 is the one trying to send.
        db.insert_block(&BlockedUser {
            user_id: "u2".into(),
            blocked_user_id: "u1".into(),
            reason: None,
            created_at: Utc::now(),
        })
        .unwrap();

        let decision = engine()
            .can_send_message(&db, &owner("u1", "t1"), &Actor::in_tenant("u2", "t1", "member"))
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "blocked");
    }

    #[test]
    fn cross_tenant_owners_need_approval() {
        let db = seeded_db();
        let u1 = owner("u1", "t1");
        let u2 = owner("u2", "t2");

        let decision = engine().can_send_message(&db, &u1, &u2).unwrap();
        assert!(!decision.allowed);
        assert!(decision.requires_approval);
        assert_eq!(decision.reason, "request-required");
        assert_eq!(decision.matched_rule.as_deref(), Some("cross-org-managers"));

        // With a pending request outstanding, the reason changes.
        let mut db = db;
        db.create_contact_request(&ContactRequest {
            id: Uuid::new_v4(),
            from_user_id: "u1".into(),
            from_tenant_id: Some("t1".into()),
            to_user_id: "u2".into(),
            to_tenant_id: Some("t2".into()),
            rule_id: "cross-org-managers".into(),
            message: None,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
            expires_at: Utc::now() + chrono::Duration::days(7),
        })
        .unwrap();

        let decision = engine().can_send_message(&db, &u1, &u2).unwrap();
        assert!(!decision.allowed);
        assert!(decision.requires_approval);
        assert_eq!(decision.reason, "pending");

        // Acceptance unlocks messaging before the rules are even consulted.
        let pending = db.pending_request_between("u1", "u2", Utc::now()).unwrap().unwrap();
        db.respond_contact_request(pending.id, RequestStatus::Accepted, Utc::now())
            .unwrap();

        let decision = engine().can_send_message(&db, &u1, &u2).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reason, "Approved contact");
    }

    #[test]
    fn member_to_platform_support_is_free() {
        let db = seeded_db();
        let member = Actor::in_tenant("u1", "t1", "member");
        let support = Actor {
            platform_role: Some("platform_support".into()),
            ..Actor::new("helpdesk")
        };

        let decision = engine().can_send_message(&db, &member, &support).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.matched_rule.as_deref(), Some("support-channel"));
    }

    #[test]
    fn cross_tenant_member_has_no_rule() {
        let db = seeded_db();
        let decision = engine()
            .can_send_message(
                &db,
                &Actor::in_tenant("u1", "t1", "member"),
                &Actor::in_tenant("u2", "t2", "member"),
            )
            .unwrap();
        assert!(!decision.allowed);
        assert!(!decision.requires_approval);
        assert_eq!(decision.reason, "no rule");
    }

    #[test]
    fn daily_limit_denies_the_eleventh_send() {
        let mut db = seeded_db();
        let u1 = owner("u1", "t1");
        let u2 = owner("u2", "t2");

        // Approved contact would bypass the rule, so link them through an
        // accepted request's *absence*: make the rule allow by clearing
        // require_approval on the seeded cross-org rule.
        db.conn()
            .execute(
                "UPDATE messaging_rules SET require_approval = 0 WHERE id = 'cross-org-managers'",
                [],
            )
            .unwrap();

        let decision = engine().can_send_message(&db, &u1, &u2).unwrap();
        assert!(decision.allowed, "under the limit the rule allows");

        let (conversation, _) = db
            .create_conversation_with_participants(
                ConversationKind::Direct,
                None,
                None,
                None,
                ("u1", Some("t1")),
                &[("u2".to_string(), Some("t2".to_string()))],
                Utc::now(),
            )
            .unwrap();

        for i in 0..10 {
            db.record_message(&Message {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                sender_id: "u1".into(),
                content: format!("m{i}"),
                kind: causerie_shared::types::MessageKind::Text,
                attachment_url: None,
                attachment_type: None,
                attachment_name: None,
                reply_to_id: None,
                created_at: Utc::now(),
                edited_at: None,
                deleted_at: None,
            })
            .unwrap();
        }

        let decision = engine().can_send_message(&db, &u1, &u2).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "rate-limit");
        assert_eq!(decision.matched_rule.as_deref(), Some("cross-org-managers"));

        // The recipient's own counter is untouched.
        let reverse = engine().can_send_message(&db, &u2, &u1).unwrap();
        assert!(reverse.allowed);
    }

    #[test]
    fn priority_order_decides_first_match() {
        let db = Database::open_in_memory().unwrap();
        let roles = vec!["member".to_string()];
        for (id, priority, approval) in
            [("low-open", 10, false), ("high-gated", 90, true)]
        {
            db.insert_rule(&MessagingRule {
                id: id.into(),
                name: id.into(),
                source_scope: causerie_shared::types::RuleScope::Platform,
                source_roles: roles.clone(),
                target_scope: causerie_shared::types::RuleScope::Platform,
                target_roles: roles.clone(),
                require_approval: approval,
                max_messages_per_day: None,
                is_active: true,
                priority,
            })
            .unwrap();
        }

        let decision = engine()
            .can_send_message(
                &db,
                &Actor::in_tenant("u1", "t1", "member"),
                &Actor::in_tenant("u2", "t2", "member"),
            )
            .unwrap();
        // The gated rule wins on priority even though an open one exists.
        assert!(!decision.allowed);
        assert_eq!(decision.matched_rule.as_deref(), Some("high-gated"));
    }

    #[test]
    fn announcement_creation_is_rejected() {
        let db = seeded_db();
        let decision = engine()
            .can_create_conversation(
                &db,
                &owner("u1", "t1"),
                &["u2".to_string()],
                ConversationKind::Announcement,
            )
            .unwrap();
        assert!(!decision.allowed);

        let support = engine()
            .can_create_conversation(&db, &owner("u1", "t1"), &[], ConversationKind::Support)
            .unwrap();
        assert!(support.allowed);
    }

    #[test]
    fn group_denial_names_the_offender() {
        let db = seeded_db();
        db.user_cache_upsert(&causerie_store::UserCacheEntry {
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
        // u3 is unknown to the cache: no tenant, no roles, no rule.

        let decision = engine()
            .can_create_conversation(
                &db,
                &owner("u1", "t1"),
                &["u2".to_string(), "u3".to_string()],
                ConversationKind::Group,
            )
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.contains("u3"), "reason was {}", decision.reason);
    }

    #[test]
    fn tenant_scope_requires_shared_tenant() {
        let rule = MessagingRule {
            id: "r".into(),
            name: "r".into(),
            source_scope: causerie_shared::types::RuleScope::Tenant,
            source_roles: vec!["member".into()],
            target_scope: causerie_shared::types::RuleScope::Tenant,
            target_roles: vec!["member".into()],
            require_approval: false,
            max_messages_per_day: None,
            is_active: true,
            priority: 1,
        };

        let a = Actor::in_tenant("a", "t1", "member");
        let b_same = Actor::in_tenant("b", "t1", "member");
        let b_other = Actor::in_tenant("b", "t2", "member");
        let b_no_tenant = Actor::new("b");

        assert!(matches(&rule, &a, &b_same));
        assert!(!matches(&rule, &a, &b_other));
        assert!(!matches(&rule, &a, &b_no_tenant));
        assert!(!matches(&rule, &Actor::new("a"), &b_same));
    }

    #[test]
    fn platform_scope_accepts_either_role_kind() {
        let rule = MessagingRule {
            id: "r".into(),
            name: "r".into(),
            source_scope: causerie_shared::types::RuleScope::Platform,
            source_roles: vec!["owner".into()],
            target_scope: causerie_shared::types::RuleScope::Platform,
            target_roles: vec!["platform_support".into()],
            require_approval: false,
            max_messages_per_day: None,
            is_active: true,
            priority: 1,
        };

        let sender_tenant_role = Actor::in_tenant("a", "t1", "owner");
        let sender_platform_role = Actor {
            platform_role: Some("owner".into()),
            ..Actor::new("a")
        };
        let support = Actor {
            platform_role: Some("platform_support".into()),
            ..Actor::new("s")
        };

        assert!(matches(&rule, &sender_tenant_role, &support));
        assert!(matches(&rule, &sender_platform_role, &support));
        assert!(!matches(&rule, &sender_tenant_role, &Actor::new("x")));
    }

    #[test]
    fn utc_day_window_starts_at_midnight() {
        let engine = PermissionEngine::new(RuleWindow::UtcDay);
        let now = Utc::now();
        let start = engine.window_start(now);
        assert_eq!(start.date_naive(), now.date_naive());
        assert_eq!(start.time(), NaiveTime::MIN);

        let rolling = PermissionEngine::new(RuleWindow::Rolling24h);
        assert_eq!(rolling.window_start(now), now - chrono::Duration::hours(24));
    }
}
