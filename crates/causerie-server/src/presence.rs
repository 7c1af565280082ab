//! Presence and typing, layered on the bus's ephemeral state.
//!
//! A user is online in exactly one scope per session: their tenant when
//! they have one, the global scope otherwise. Typing entries decay after
//! five seconds and the whole per-conversation key is dropped after ten
//! seconds without a keystroke.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::bus::Bus;
use crate::mesh::BusFrame;

#[derive(Clone)]
pub struct Presence {
    bus: Arc<Bus>,
}

impl Presence {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    pub fn set_online(&self, user_id: &str, tenant_id: Option<&str>) {
        let scope = Bus::scope_of(tenant_id);
        let now = Utc::now().timestamp_millis();

        self.bus.set_add(&scope, user_id);
        self.bus.touch_last_seen(user_id, now);
        self.bus.forward(BusFrame::PresenceOnline {
            scope,
            user_id: user_id.to_string(),
            at_ms: now,
        });
    }

    pub fn set_offline(&self, user_id: &str, tenant_id: Option<&str>) {
        let scope = Bus::scope_of(tenant_id);
        let now = Utc::now().timestamp_millis();

        self.bus.set_remove(&scope, user_id);
        self.bus.touch_last_seen(user_id, now);
        self.bus.forward(BusFrame::PresenceOffline {
            scope,
            user_id: user_id.to_string(),
            at_ms: now,
        });
    }

    pub fn is_online(&self, user_id: &str, tenant_id: Option<&str>) -> bool {
        self.bus.set_contains(&Bus::scope_of(tenant_id), user_id)
    }

    pub fn online_users(&self, tenant_id: Option<&str>) -> Vec<String> {
        self.bus.set_members(&Bus::scope_of(tenant_id))
    }

    /// Millisecond timestamp of the user's last connect/disconnect.
    pub fn last_seen(&self, user_id: &str) -> Option<i64> {
        self.bus.last_seen(user_id)
    }

    pub fn set_typing(&self, conversation_id: Uuid, user_id: &str, is_typing: bool) {
        if is_typing {
            self.bus
                .typing_put(conversation_id, user_id, Utc::now().timestamp_millis());
        } else {
            self.bus.typing_remove(conversation_id, user_id);
        }
    }

    pub fn typing_users(&self, conversation_id: Uuid) -> Vec<String> {
        self.bus
            .typing_members(conversation_id, Utc::now().timestamp_millis())
    }

    /// Drop typing keys past their TTL. Runs on an interval task.
    pub fn purge_typing(&self) -> usize {
        self.bus.purge_typing(Utc::now().timestamp_millis())
    }
}
