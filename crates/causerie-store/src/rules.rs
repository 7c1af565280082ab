use rusqlite::params;

use causerie_shared::types::RuleScope;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::mapping::enum_col;
use crate::models::MessagingRule;

const RULE_COLS: &str = "id, name, source_scope, source_roles, target_scope, target_roles, \
     require_approval, max_messages_per_day, is_active, priority";

impl Database {
    pub fn insert_rule(&self, rule: &MessagingRule) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messaging_rules (id, name, source_scope, source_roles, target_scope,
                 target_roles, require_approval, max_messages_per_day, is_active, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rule.id,
                rule.name,
                rule.source_scope.as_str(),
                rule.source_roles.join(","),
                rule.target_scope.as_str(),
                rule.target_roles.join(","),
                rule.require_approval,
                rule.max_messages_per_day,
                rule.is_active,
                rule.priority,
            ],
        )?;
        Ok(())
    }

    /// Active rules, highest priority first. The first match wins, so the
    /// order here is the evaluation order.
    pub fn active_rules(&self) -> Result<Vec<MessagingRule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {RULE_COLS} FROM messaging_rules
             WHERE is_active = 1
             ORDER BY priority DESC"
        ))?;
        let rows = stmt.query_map([], row_to_rule)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn rules_count(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messaging_rules", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Seed the default policy when the rule table is empty. Returns how
    /// many rules were inserted (zero when the table already had rows).
    pub fn seed_default_rules(&self) -> Result<usize> {
        if self.rules_count()? > 0 {
            return Ok(0);
        }

        let defaults = default_rules();
        for rule in &defaults {
            self.insert_rule(rule)?;
        }
        tracing::info!(count = defaults.len(), "seeded default messaging rules");
        Ok(defaults.len())
    }
}

/// The factory policy set.
pub fn default_rules() -> Vec<MessagingRule> {
    let roles = |s: &str| s.split(',').map(str::to_string).collect::<Vec<_>>();

    vec![
        MessagingRule {
            id: "team-internal".into(),
            name: "Team internal messaging".into(),
            source_scope: RuleScope::Tenant,
            source_roles: roles("owner,admin,member"),
            target_scope: RuleScope::Tenant,
            target_roles: roles("owner,admin,member"),
            require_approval: false,
            max_messages_per_day: None,
            is_active: true,
            priority: 100,
        },
        MessagingRule {
            id: "support-channel".into(),
            name: "Anyone to platform support".into(),
            source_scope: RuleScope::Platform,
            source_roles: roles("owner,admin,member"),
            target_scope: RuleScope::Platform,
            target_roles: roles("platform_support"),
            require_approval: false,
            max_messages_per_day: None,
            is_active: true,
            priority: 90,
        },
        MessagingRule {
            id: "platform-announcements".into(),
            name: "Platform admins to everyone".into(),
            source_scope: RuleScope::Platform,
            source_roles: roles("platform_admin"),
            target_scope: RuleScope::Platform,
            target_roles: roles("owner,admin,member"),
            require_approval: false,
            max_messages_per_day: None,
            is_active: true,
            priority: 80,
        },
        MessagingRule {
            id: "cross-org-managers".into(),
            name: "Cross-organization managers".into(),
            source_scope: RuleScope::Platform,
            source_roles: roles("owner,admin"),
            target_scope: RuleScope::Platform,
            target_roles: roles("owner,admin"),
            require_approval: true,
            max_messages_per_day: Some(10),
            is_active: true,
            priority: 50,
        },
    ]
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessagingRule> {
    let source_scope: String = row.get(2)?;
    let source_roles: String = row.get(3)?;
    let target_scope: String = row.get(4)?;
    let target_roles: String = row.get(5)?;

    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect()
    };

    Ok(MessagingRule {
        id: row.get(0)?,
        name: row.get(1)?,
        source_scope: enum_col(2, &source_scope, RuleScope::parse)?,
        source_roles: split(&source_roles),
        target_scope: enum_col(4, &target_scope, RuleScope::parse)?,
        target_roles: split(&target_roles),
        require_approval: row.get(6)?,
        max_messages_per_day: row.get(7)?,
        is_active: row.get(8)?,
        priority: row.get(9)?,
    })
}
